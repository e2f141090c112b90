//! Read models and commands exchanged with the billing collaborator.
//!
//! This service never computes or mutates these balances; it only reads them
//! and delegates charging.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Point-in-time gift and paid-usage totals for a shop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLedgerSummary {
    pub gift_grant_total_mills: i64,
    pub gift_balance_mills: i64,
    pub paid_usage_month_to_date_mills: i64,
}

/// Merchant-configured spend safety settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendSafetySettings {
    pub monthly_cap_cents: i64,
    /// Unset until the merchant consents to paid usage beyond gift credit.
    pub paid_usage_consent_at: Option<DateTime<Utc>>,
}

/// Charge request. The collaborator must apply at most one charge per
/// `idempotency_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordUsageCharge {
    pub shop_id: String,
    pub total_cost_usd: Decimal,
    pub idempotency_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// How a charge was split between gift credit and paid usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageChargeResult {
    /// False when the key had already been charged.
    pub created: bool,
    pub gift_applied_mills: i64,
    pub paid_usage_mills: i64,
}
