//! Spend guardrail decisions against a scripted billing collaborator.

mod common;

use chrono::{TimeZone, Utc};
use common::{ScriptedBillingClient, TestHarness, SHOP};
use rust_decimal::Decimal;
use std::str::FromStr;
use usage_billing_service::services::{BlockCode, SpendDecision};

async fn decide(gift: i64, mtd: i64, cap_cents: i64, consent: bool, cost: i64) -> SpendDecision {
    let h = TestHarness::new(ScriptedBillingClient::with_balances(
        gift, mtd, cap_cents, consent,
    ));
    h.guardrail()
        .check_billable_action_allowed(SHOP, cost)
        .await
        .unwrap()
}

#[tokio::test]
async fn free_actions_skip_the_collaborator() {
    let h = TestHarness::new(ScriptedBillingClient::with_balances(0, 0, 0, false));

    let decision = h
        .guardrail()
        .check_billable_action_allowed(SHOP, 0)
        .await
        .unwrap();

    assert!(decision.is_allowed());
    assert_eq!(h.billing.summary_calls(), 0);
    assert_eq!(h.billing.settings_calls(), 0);
}

#[tokio::test]
async fn gift_balance_covering_cost_always_allows() {
    for (gift, cost) in [(500, 500), (1_000, 500), (50, 1)] {
        // No consent and a zero cap would block anything that reached those checks.
        let decision = decide(gift, 99_999, 0, false, cost).await;
        assert!(decision.is_allowed(), "gift={gift} cost={cost}");
    }
}

#[tokio::test]
async fn gift_covered_cost_does_not_read_settings() {
    let h = TestHarness::new(ScriptedBillingClient::with_balances(500, 0, 0, false));
    h.guardrail()
        .check_billable_action_allowed(SHOP, 500)
        .await
        .unwrap();
    assert_eq!(h.billing.settings_calls(), 0);
}

#[tokio::test]
async fn consent_required_regardless_of_cap() {
    for cap_cents in [0, 1_000, i64::MAX] {
        let decision = decide(10, 0, cap_cents, false, 40).await;
        assert_eq!(
            decision.block_code(),
            Some(BlockCode::ConsentRequired),
            "cap_cents={cap_cents}"
        );
    }
}

#[tokio::test]
async fn cap_boundary() {
    // $10.00 cap, $9.96 already used, no gift credit.
    let blocked = decide(0, 9_960, 1_000, true, 50).await;
    assert_eq!(blocked.block_code(), Some(BlockCode::CapExceeded));

    let allowed = decide(0, 9_960, 1_000, true, 39).await;
    assert!(allowed.is_allowed());

    let exactly_at_cap = decide(0, 9_960, 1_000, true, 40).await;
    assert!(exactly_at_cap.is_allowed());

    let already_at_cap = decide(0, 10_000, 1_000, true, 1).await;
    assert_eq!(already_at_cap.block_code(), Some(BlockCode::CapExceeded));
}

#[tokio::test]
async fn only_the_uncovered_part_counts_against_the_cap() {
    // 30 of the 50 mills come from gift credit; 9_960 + 20 stays under 10_000.
    let decision = decide(30, 9_960, 1_000, true, 50).await;
    assert!(decision.is_allowed());
}

#[tokio::test]
async fn negative_gift_balance_counts_as_zero() {
    let decision = decide(-100, 9_960, 1_000, true, 39).await;
    assert!(decision.is_allowed());

    let decision = decide(-100, 9_960, 1_000, true, 41).await;
    assert_eq!(decision.block_code(), Some(BlockCode::CapExceeded));
}

#[tokio::test]
async fn cap_block_carries_display_details() {
    let decision = decide(0, 9_960, 1_000, true, 50).await;

    match decision {
        SpendDecision::Blocked {
            code,
            message,
            details,
        } => {
            assert_eq!(code, BlockCode::CapExceeded);
            let details = details.expect("cap block has details");
            assert_eq!(details.monthly_cap_usd, Decimal::from_str("10.000").unwrap());
            assert_eq!(details.month_to_date_usd, Decimal::from_str("9.960").unwrap());
            assert_eq!(details.action_cost_usd, Decimal::from_str("0.050").unwrap());
            assert_eq!(
                details.resets_at,
                Utc.with_ymd_and_hms(2026, 11, 1, 0, 0, 0).unwrap()
            );
            assert_eq!(details.resets_at_display, "November 1, 2026");
            assert!(message.contains("$10.00"), "{message}");
            assert!(message.contains("November 1, 2026"), "{message}");
        }
        SpendDecision::Allowed => panic!("expected a cap block"),
    }
}

#[tokio::test]
async fn consent_block_has_no_details() {
    let decision = decide(0, 0, 1_000, false, 40).await;
    match decision {
        SpendDecision::Blocked { code, details, .. } => {
            assert_eq!(code, BlockCode::ConsentRequired);
            assert!(details.is_none());
        }
        SpendDecision::Allowed => panic!("expected a consent block"),
    }
}
