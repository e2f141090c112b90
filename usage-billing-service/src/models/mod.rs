//! Domain models for usage-billing-service.

mod billable_event;
mod billing;
mod generation_attempt;

pub use billable_event::{
    BillableEvent, BillableEventStatus, BillableEventType, CreateBillableEvent,
    ListBillableEventsFilter, UnknownVariant,
};
pub use billing::{RecordUsageCharge, SpendSafetySettings, UsageChargeResult, UsageLedgerSummary};
pub use generation_attempt::{
    AttemptKey, GenerationAttempt, LimitReason, ShopGenerationLimits, DEFAULT_PER_PRODUCT_LIMIT,
    DEFAULT_PER_SESSION_LIMIT, DEFAULT_RESET_WINDOW_MINUTES,
};
