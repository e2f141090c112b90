//! Spend guardrail: approve or block a prospective cost before any paid
//! provider call is made.
//!
//! Checks run in a fixed order and stop at the first that decides:
//! free action, gift balance covers it, paid-usage consent, monthly cap.

use crate::clock::Clock;
use crate::money::{
    cents_to_mills, format_reset_date, format_usd, mills_to_usd, next_month_reset,
};
use crate::services::billing_client::BillingClient;
use crate::services::metrics::record_guardrail_decision;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument};

/// Machine-readable block reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockCode {
    ConsentRequired,
    CapExceeded,
}

impl BlockCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockCode::ConsentRequired => "consent_required",
            BlockCode::CapExceeded => "cap_exceeded",
        }
    }
}

/// Context attached to a `cap_exceeded` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapExceededDetails {
    pub monthly_cap_usd: Decimal,
    pub month_to_date_usd: Decimal,
    pub action_cost_usd: Decimal,
    /// e.g. `November 1, 2026`
    pub resets_at_display: String,
    pub resets_at: DateTime<Utc>,
}

/// Guardrail outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum SpendDecision {
    Allowed,
    Blocked {
        code: BlockCode,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<CapExceededDetails>,
    },
}

impl SpendDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, SpendDecision::Allowed)
    }

    pub fn block_code(&self) -> Option<BlockCode> {
        match self {
            SpendDecision::Allowed => None,
            SpendDecision::Blocked { code, .. } => Some(*code),
        }
    }
}

/// Pure decision over externally supplied balances and settings.
#[derive(Clone)]
pub struct SpendGuardrail {
    billing: Arc<dyn BillingClient>,
    clock: Arc<dyn Clock>,
}

impl SpendGuardrail {
    pub fn new(billing: Arc<dyn BillingClient>, clock: Arc<dyn Clock>) -> Self {
        Self { billing, clock }
    }

    /// May the shop spend `cost_mills` right now?
    ///
    /// Reads the ledger summary only for positive costs and the consent
    /// settings only when gift credit falls short. Collaborator errors
    /// propagate.
    #[instrument(skip(self))]
    pub async fn check_billable_action_allowed(
        &self,
        shop_id: &str,
        cost_mills: i64,
    ) -> Result<SpendDecision, AppError> {
        if cost_mills <= 0 {
            record_guardrail_decision("allowed_free");
            return Ok(SpendDecision::Allowed);
        }

        let summary = self.billing.get_usage_ledger_summary(shop_id).await?;
        if summary.gift_balance_mills >= cost_mills {
            record_guardrail_decision("allowed_gift");
            return Ok(SpendDecision::Allowed);
        }

        let settings = self.billing.get_spend_safety_settings(shop_id).await?;
        if settings.paid_usage_consent_at.is_none() {
            info!(
                gift_balance_mills = summary.gift_balance_mills,
                "Paid usage blocked: consent required"
            );
            record_guardrail_decision(BlockCode::ConsentRequired.as_str());
            return Ok(SpendDecision::Blocked {
                code: BlockCode::ConsentRequired,
                message: "Your gift balance does not cover this action. Approve paid usage in billing settings to continue.".to_string(),
                details: None,
            });
        }

        let overflow_mills = cost_mills
            .saturating_sub(summary.gift_balance_mills.max(0))
            .max(0);
        let monthly_cap_mills = cents_to_mills(settings.monthly_cap_cents);
        let projected_mills = summary
            .paid_usage_month_to_date_mills
            .saturating_add(overflow_mills);

        if projected_mills > monthly_cap_mills {
            let resets_at = next_month_reset(self.clock.now());
            let details = CapExceededDetails {
                monthly_cap_usd: mills_to_usd(monthly_cap_mills),
                month_to_date_usd: mills_to_usd(summary.paid_usage_month_to_date_mills),
                action_cost_usd: mills_to_usd(cost_mills),
                resets_at_display: format_reset_date(resets_at),
                resets_at,
            };
            let message = format!(
                "This action ({}) would exceed your monthly spending cap of {} ({} used so far). The cap resets on {}.",
                format_usd(details.action_cost_usd),
                format_usd(details.monthly_cap_usd),
                format_usd(details.month_to_date_usd),
                details.resets_at_display,
            );

            info!(
                monthly_cap_mills,
                month_to_date_mills = summary.paid_usage_month_to_date_mills,
                overflow_mills,
                "Paid usage blocked: monthly cap exceeded"
            );
            record_guardrail_decision(BlockCode::CapExceeded.as_str());
            return Ok(SpendDecision::Blocked {
                code: BlockCode::CapExceeded,
                message,
                details: Some(details),
            });
        }

        record_guardrail_decision("allowed_paid");
        Ok(SpendDecision::Allowed)
    }
}
