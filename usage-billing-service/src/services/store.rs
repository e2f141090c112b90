//! Storage seams for the ledger and the quota limiter.
//!
//! `Database` implements these against PostgreSQL. Every method is scoped by
//! shop id; no query reads across tenants.

use crate::models::{
    AttemptKey, BillableEvent, BillableEventStatus, CreateBillableEvent, GenerationAttempt,
    ListBillableEventsFilter, ShopGenerationLimits,
};
use crate::services::quota::AttemptEvaluation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use uuid::Uuid;

#[async_trait]
pub trait BillableEventStore: Send + Sync {
    /// Insert a pending event. A duplicate `(shop_id, idempotency_key)` must
    /// surface as `AppError::Conflict`.
    async fn insert_event(&self, input: &CreateBillableEvent) -> Result<BillableEvent, AppError>;

    async fn find_event_by_key(
        &self,
        shop_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<BillableEvent>, AppError>;

    /// Move a pending event to `to`. Returns false, leaving the row untouched,
    /// when the event is no longer pending.
    async fn transition_event(
        &self,
        shop_id: &str,
        event_id: Uuid,
        to: BillableEventStatus,
        error_message: Option<&str>,
    ) -> Result<bool, AppError>;

    async fn list_events(
        &self,
        shop_id: &str,
        filter: &ListBillableEventsFilter,
    ) -> Result<Vec<BillableEvent>, AppError>;
}

#[async_trait]
pub trait GenerationAttemptStore: Send + Sync {
    async fn get_attempt(&self, key: &AttemptKey) -> Result<Option<GenerationAttempt>, AppError>;

    /// Every counter row for the session, across products.
    async fn list_session_attempts(
        &self,
        shop_id: &str,
        session_id: &str,
    ) -> Result<Vec<GenerationAttempt>, AppError>;

    /// Read the product row and the session rows, evaluate them with
    /// [`crate::services::quota::evaluate_attempt`], and persist the increment
    /// if allowed, all inside one serializable transaction. A serialization
    /// failure must surface as `AppError::TransactionConflict`.
    async fn record_attempt(
        &self,
        key: &AttemptKey,
        limits: &ShopGenerationLimits,
        now: DateTime<Utc>,
    ) -> Result<AttemptEvaluation, AppError>;
}

#[async_trait]
pub trait ShopLimitsSource: Send + Sync {
    /// Per-shop limits, falling back to the defaults when none are configured.
    async fn get_shop_generation_limits(
        &self,
        shop_id: &str,
    ) -> Result<ShopGenerationLimits, AppError>;
}

/// Dependency ping behind `/health` and `/ready`.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;
}
