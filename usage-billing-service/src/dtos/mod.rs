//! Request and response bodies of the internal HTTP API.

use crate::models::{BillableEvent, BillableEventStatus, BillableEventType};
use crate::services::{BlockCode, CapExceededDetails, SpendDecision};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_PAGE_SIZE: i32 = 50;

/// Either `idempotency_key` or `source_id` must be set; without an explicit
/// key one is derived from the event type and source.
#[derive(Debug, Deserialize)]
pub struct CreateBillableEventRequest {
    pub event_type: BillableEventType,
    pub amount_mills: i64,
    pub idempotency_key: Option<String>,
    pub source_id: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateBillableEventResponse {
    pub created: bool,
    pub event_id: Uuid,
    pub idempotency_key: String,
    pub status: BillableEventStatus,
}

#[derive(Debug, Default, Deserialize)]
pub struct FailBillableEventRequest {
    pub error_message: Option<String>,
    #[serde(default)]
    pub waived: bool,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmAndChargeRequest {
    pub total_cost_usd: Decimal,
    pub description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListBillableEventsQuery {
    pub status: Option<BillableEventStatus>,
    pub event_type: Option<BillableEventType>,
    pub page_size: Option<i32>,
    pub page_token: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct BillableEventListResponse {
    pub events: Vec<BillableEvent>,
    /// Pass back as `page_token` to fetch the next page.
    pub next_page_token: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct SpendCheckRequest {
    pub cost_mills: i64,
}

#[derive(Debug, Serialize)]
pub struct SpendCheckResponse {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<BlockCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<CapExceededDetails>,
}

impl From<SpendDecision> for SpendCheckResponse {
    fn from(decision: SpendDecision) -> Self {
        match decision {
            SpendDecision::Allowed => Self {
                allowed: true,
                code: None,
                message: None,
                details: None,
            },
            SpendDecision::Blocked {
                code,
                message,
                details,
            } => Self {
                allowed: false,
                code: Some(code),
                message: Some(message),
                details,
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitStatusQuery {
    pub product_id: Option<String>,
}
