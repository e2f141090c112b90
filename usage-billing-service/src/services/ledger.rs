//! Billable event ledger: exactly-once bookkeeping of paid attempts under
//! at-least-once delivery of the calling workflow.
//!
//! Idempotency rests on the unique `(shop_id, idempotency_key)` constraint and
//! on `pending` being the only mutable state. Nothing here fails open.

use crate::models::{
    BillableEvent, BillableEventStatus, BillableEventType, CreateBillableEvent,
    ListBillableEventsFilter, RecordUsageCharge, UsageChargeResult,
};
use crate::services::billing_client::BillingClient;
use crate::services::metrics::record_billable_event;
use crate::services::store::BillableEventStore;
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const KEY_PREFIX: &str = "billable_event";

/// Key for an event created by a workflow step:
/// `billable_event:<event_type>:<source_id>`.
pub fn workflow_event_key(event_type: BillableEventType, source_id: &str) -> String {
    format!("{}:{}:{}", KEY_PREFIX, event_type.as_str(), source_id)
}

/// Key handed to the charge collaborator for an event: `billable_event:<id>`.
pub fn charge_idempotency_key(event_id: Uuid) -> String {
    format!("{}:{}", KEY_PREFIX, event_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CreateEventOutcome {
    /// False when the key already existed; `status` is then the stored one.
    pub created: bool,
    pub event_id: Uuid,
    pub status: BillableEventStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConfirmEventOutcome {
    /// False when the event was already out of `pending`.
    pub confirmed: bool,
    pub event_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FailEventOutcome {
    pub updated: bool,
    pub event_id: Uuid,
    /// Status of the event after the call.
    pub status: BillableEventStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConfirmAndChargeOutcome {
    pub confirmed: bool,
    pub event_id: Uuid,
    /// None when the event was already processed and no charge was attempted.
    pub charge: Option<UsageChargeResult>,
}

#[derive(Clone)]
pub struct BillableEventLedger {
    store: Arc<dyn BillableEventStore>,
    billing: Arc<dyn BillingClient>,
}

fn not_found(shop_id: &str, idempotency_key: &str) -> AppError {
    AppError::NotFound(anyhow::anyhow!(
        "No billable event for shop '{}' with idempotency key '{}'",
        shop_id,
        idempotency_key
    ))
}

fn validate_scope(shop_id: &str, idempotency_key: &str) -> Result<(), AppError> {
    if shop_id.trim().is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("shop_id is required")));
    }
    if idempotency_key.trim().is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "idempotency_key is required"
        )));
    }
    Ok(())
}

impl BillableEventLedger {
    pub fn new(store: Arc<dyn BillableEventStore>, billing: Arc<dyn BillingClient>) -> Self {
        Self { store, billing }
    }

    /// Record a pending attempt. A duplicate delivery returns the existing
    /// event with `created = false`; its amount is left as first recorded.
    #[instrument(skip(self, input), fields(shop_id = %input.shop_id, idempotency_key = %input.idempotency_key, event_type = %input.event_type))]
    pub async fn create_event(
        &self,
        input: &CreateBillableEvent,
    ) -> Result<CreateEventOutcome, AppError> {
        validate_scope(&input.shop_id, &input.idempotency_key)?;
        if input.amount_mills < 0 {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "amount_mills must not be negative"
            )));
        }

        match self.store.insert_event(input).await {
            Ok(event) => {
                info!(event_id = %event.id, amount_mills = event.amount_mills, "Billable event created");
                record_billable_event("create", "created");
                Ok(CreateEventOutcome {
                    created: true,
                    event_id: event.id,
                    status: event.status,
                })
            }
            Err(AppError::Conflict(_)) => {
                let existing = self
                    .store
                    .find_event_by_key(&input.shop_id, &input.idempotency_key)
                    .await?
                    .ok_or_else(|| {
                        AppError::InternalError(anyhow::anyhow!(
                            "Idempotency key '{}' conflicted but no event was found",
                            input.idempotency_key
                        ))
                    })?;

                info!(event_id = %existing.id, status = %existing.status, "Duplicate billable event delivery");
                record_billable_event("create", "duplicate");
                Ok(CreateEventOutcome {
                    created: false,
                    event_id: existing.id,
                    status: existing.status,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Mark the event confirmed once the provider result is durably stored.
    #[instrument(skip(self))]
    pub async fn confirm_event(
        &self,
        shop_id: &str,
        idempotency_key: &str,
    ) -> Result<ConfirmEventOutcome, AppError> {
        validate_scope(shop_id, idempotency_key)?;
        let event = self.require_event(shop_id, idempotency_key).await?;

        let confirmed = self
            .transition(&event, BillableEventStatus::Confirmed, None, "confirm")
            .await?;

        Ok(ConfirmEventOutcome {
            confirmed,
            event_id: event.id,
        })
    }

    /// Close the event without charging. `waived` marks that provider cost
    /// may already have been incurred, so the row is kept for reconciliation.
    #[instrument(skip(self, error_message))]
    pub async fn fail_event(
        &self,
        shop_id: &str,
        idempotency_key: &str,
        error_message: Option<&str>,
        waived: bool,
    ) -> Result<FailEventOutcome, AppError> {
        validate_scope(shop_id, idempotency_key)?;
        let event = self.require_event(shop_id, idempotency_key).await?;

        let target = if waived {
            BillableEventStatus::Waived
        } else {
            BillableEventStatus::Failed
        };
        let updated = self
            .transition(&event, target, error_message, "fail")
            .await?;

        let status = if updated {
            target
        } else {
            self.current_status(shop_id, idempotency_key, event.status)
                .await?
        };

        Ok(FailEventOutcome {
            updated,
            event_id: event.id,
            status,
        })
    }

    /// Charge, then confirm.
    ///
    /// The charge key is derived from the event id, so re-running this after
    /// a crash between the two steps repeats an idempotent charge instead of
    /// adding a second one. Once confirmed, re-runs return without charging.
    #[instrument(skip(self, description))]
    pub async fn confirm_and_charge(
        &self,
        shop_id: &str,
        idempotency_key: &str,
        total_cost_usd: Decimal,
        description: Option<&str>,
    ) -> Result<ConfirmAndChargeOutcome, AppError> {
        validate_scope(shop_id, idempotency_key)?;
        if total_cost_usd.is_sign_negative() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "total_cost_usd must not be negative"
            )));
        }

        let event = self.require_event(shop_id, idempotency_key).await?;
        if !event
            .status
            .can_transition_to(BillableEventStatus::Confirmed)
        {
            info!(event_id = %event.id, status = %event.status, "Billable event already processed, skipping charge");
            record_billable_event("confirm_and_charge", "already_processed");
            return Ok(ConfirmAndChargeOutcome {
                confirmed: false,
                event_id: event.id,
                charge: None,
            });
        }

        let charge = self
            .billing
            .record_usage_charge(&RecordUsageCharge {
                shop_id: shop_id.to_string(),
                total_cost_usd,
                idempotency_key: charge_idempotency_key(event.id),
                description: description
                    .map(str::to_string)
                    .or_else(|| event.description.clone()),
            })
            .await?;

        info!(
            event_id = %event.id,
            charge_created = charge.created,
            gift_applied_mills = charge.gift_applied_mills,
            paid_usage_mills = charge.paid_usage_mills,
            "Usage charge recorded"
        );

        let confirmed = self
            .transition(&event, BillableEventStatus::Confirmed, None, "confirm_and_charge")
            .await?;

        if !confirmed {
            let status = self
                .current_status(shop_id, idempotency_key, event.status)
                .await?;
            if status != BillableEventStatus::Confirmed {
                error!(
                    event_id = %event.id,
                    status = %status,
                    charge_idempotency_key = %charge_idempotency_key(event.id),
                    charge_created = charge.created,
                    gift_applied_mills = charge.gift_applied_mills,
                    paid_usage_mills = charge.paid_usage_mills,
                    "Usage charged but billable event was closed without confirmation; needs reconciliation"
                );
                record_billable_event("confirm_and_charge", "charged_not_confirmed");
            }
        }

        Ok(ConfirmAndChargeOutcome {
            confirmed,
            event_id: event.id,
            charge: Some(charge),
        })
    }

    #[instrument(skip(self))]
    pub async fn get_event_by_idempotency_key(
        &self,
        shop_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<BillableEvent>, AppError> {
        validate_scope(shop_id, idempotency_key)?;
        self.store.find_event_by_key(shop_id, idempotency_key).await
    }

    /// Paginated listing for operator views.
    #[instrument(skip(self, filter))]
    pub async fn list_events(
        &self,
        shop_id: &str,
        filter: &ListBillableEventsFilter,
    ) -> Result<Vec<BillableEvent>, AppError> {
        if shop_id.trim().is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!("shop_id is required")));
        }
        self.store.list_events(shop_id, filter).await
    }

    async fn require_event(
        &self,
        shop_id: &str,
        idempotency_key: &str,
    ) -> Result<BillableEvent, AppError> {
        self.store
            .find_event_by_key(shop_id, idempotency_key)
            .await?
            .ok_or_else(|| not_found(shop_id, idempotency_key))
    }

    async fn current_status(
        &self,
        shop_id: &str,
        idempotency_key: &str,
        fallback: BillableEventStatus,
    ) -> Result<BillableEventStatus, AppError> {
        Ok(self
            .store
            .find_event_by_key(shop_id, idempotency_key)
            .await?
            .map(|e| e.status)
            .unwrap_or(fallback))
    }

    /// Apply `to` if the state machine allows it. The store re-checks
    /// `pending` atomically, so a concurrent winner turns this into a no-op.
    async fn transition(
        &self,
        event: &BillableEvent,
        to: BillableEventStatus,
        error_message: Option<&str>,
        operation: &'static str,
    ) -> Result<bool, AppError> {
        if !event.status.can_transition_to(to) {
            info!(event_id = %event.id, status = %event.status, target = %to, "Billable event already processed");
            record_billable_event(operation, "already_processed");
            return Ok(false);
        }

        let applied = self
            .store
            .transition_event(&event.shop_id, event.id, to, error_message)
            .await?;

        if applied {
            info!(event_id = %event.id, status = %to, "Billable event transitioned");
            record_billable_event(operation, to.as_str());
        } else {
            warn!(event_id = %event.id, target = %to, "Billable event already moved out of pending by a concurrent call");
            record_billable_event(operation, "lost_race");
        }
        Ok(applied)
    }
}
