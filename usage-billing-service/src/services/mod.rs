pub mod billing_client;
pub mod database;
pub mod guardrail;
pub mod ledger;
pub mod metrics;
pub mod quota;
pub mod store;

pub use billing_client::{BillingClient, HttpBillingClient};
pub use database::Database;
pub use guardrail::{BlockCode, CapExceededDetails, SpendDecision, SpendGuardrail};
pub use ledger::{
    charge_idempotency_key, workflow_event_key, BillableEventLedger, ConfirmAndChargeOutcome,
    ConfirmEventOutcome, CreateEventOutcome, FailEventOutcome,
};
pub use metrics::{get_metrics, init_metrics};
pub use quota::{
    AttemptDecision, AttemptEvaluation, GenerationLimitStatus, ProductLimitStatus, QuotaLimiter,
};
pub use store::{BillableEventStore, GenerationAttemptStore, HealthProbe, ShopLimitsSource};
