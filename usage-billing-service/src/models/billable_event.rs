//! Billable event model: one attempted paid action.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// A stored or requested enum value that does not name a known variant.
#[derive(Debug, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// What kind of paid action the event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillableEventType {
    Generation,
    RemoveBg,
    Regeneration,
    OrderFee,
}

impl BillableEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillableEventType::Generation => "generation",
            BillableEventType::RemoveBg => "remove_bg",
            BillableEventType::Regeneration => "regeneration",
            BillableEventType::OrderFee => "order_fee",
        }
    }
}

impl FromStr for BillableEventType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generation" => Ok(BillableEventType::Generation),
            "remove_bg" => Ok(BillableEventType::RemoveBg),
            "regeneration" => Ok(BillableEventType::Regeneration),
            "order_fee" => Ok(BillableEventType::OrderFee),
            other => Err(UnknownVariant {
                kind: "event type",
                value: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for BillableEventType {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl std::fmt::Display for BillableEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a billable event.
///
/// `Pending` is the only non-terminal state. `Waived` means provider cost may
/// have been incurred but the merchant is not charged; such rows are kept for
/// reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillableEventStatus {
    Pending,
    Confirmed,
    Failed,
    Waived,
}

impl BillableEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillableEventStatus::Pending => "pending",
            BillableEventStatus::Confirmed => "confirmed",
            BillableEventStatus::Failed => "failed",
            BillableEventStatus::Waived => "waived",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BillableEventStatus::Pending)
    }

    /// The only legal moves are `pending -> confirmed | failed | waived`.
    pub fn can_transition_to(&self, next: BillableEventStatus) -> bool {
        matches!(
            (self, next),
            (
                BillableEventStatus::Pending,
                BillableEventStatus::Confirmed
                    | BillableEventStatus::Failed
                    | BillableEventStatus::Waived
            )
        )
    }
}

impl FromStr for BillableEventStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BillableEventStatus::Pending),
            "confirmed" => Ok(BillableEventStatus::Confirmed),
            "failed" => Ok(BillableEventStatus::Failed),
            "waived" => Ok(BillableEventStatus::Waived),
            other => Err(UnknownVariant {
                kind: "event status",
                value: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for BillableEventStatus {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl std::fmt::Display for BillableEventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Billable event row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BillableEvent {
    pub id: Uuid,
    pub shop_id: String,
    #[sqlx(try_from = "String")]
    pub event_type: BillableEventType,
    #[sqlx(try_from = "String")]
    pub status: BillableEventStatus,
    /// Estimated cost at creation time.
    pub amount_mills: i64,
    pub currency_code: String,
    pub idempotency_key: String,
    pub description: Option<String>,
    /// Job or session that created the event.
    pub source_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a pending billable event.
#[derive(Debug, Clone)]
pub struct CreateBillableEvent {
    pub shop_id: String,
    pub event_type: BillableEventType,
    pub amount_mills: i64,
    pub idempotency_key: String,
    pub description: Option<String>,
    pub source_id: Option<String>,
}

/// Filter parameters for listing billable events, newest first.
#[derive(Debug, Clone, Default)]
pub struct ListBillableEventsFilter {
    pub status: Option<BillableEventStatus>,
    pub event_type: Option<BillableEventType>,
    pub page_size: i32,
    /// Id of the last event on the previous page.
    pub page_token: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [BillableEventStatus; 4] = [
        BillableEventStatus::Pending,
        BillableEventStatus::Confirmed,
        BillableEventStatus::Failed,
        BillableEventStatus::Waived,
    ];

    #[test]
    fn only_pending_can_move() {
        for from in ALL {
            for to in ALL {
                let expected = from == BillableEventStatus::Pending
                    && to != BillableEventStatus::Pending;
                assert_eq!(from.can_transition_to(to), expected, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn status_strings_parse_back() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<BillableEventStatus>().unwrap(), status);
        }
        assert!("refunded".parse::<BillableEventStatus>().is_err());
    }

    #[test]
    fn event_type_matches_stored_names() {
        assert_eq!(BillableEventType::RemoveBg.as_str(), "remove_bg");
        assert_eq!(
            serde_json::to_string(&BillableEventType::OrderFee).unwrap(),
            "\"order_fee\""
        );
        assert_eq!(
            BillableEventType::try_from("regeneration".to_string()).unwrap(),
            BillableEventType::Regeneration
        );
    }
}
