//! Billable event handlers. Every route is scoped by the shop in the path.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;

use crate::{
    dtos::{
        BillableEventListResponse, ConfirmAndChargeRequest, CreateBillableEventRequest,
        CreateBillableEventResponse, FailBillableEventRequest, ListBillableEventsQuery,
        DEFAULT_PAGE_SIZE,
    },
    models::{BillableEvent, CreateBillableEvent, ListBillableEventsFilter},
    services::{workflow_event_key, ConfirmAndChargeOutcome, ConfirmEventOutcome, FailEventOutcome},
    startup::AppState,
};

/// Create a pending event. 201 when new, 200 for a duplicate delivery.
pub async fn create_billable_event(
    State(state): State<AppState>,
    Path(shop_id): Path<String>,
    Json(payload): Json<CreateBillableEventRequest>,
) -> Result<(StatusCode, Json<CreateBillableEventResponse>), AppError> {
    let idempotency_key = match (payload.idempotency_key, payload.source_id.as_deref()) {
        (Some(key), _) => key,
        (None, Some(source_id)) => workflow_event_key(payload.event_type, source_id),
        (None, None) => {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "idempotency_key or source_id is required"
            )))
        }
    };

    let input = CreateBillableEvent {
        shop_id,
        event_type: payload.event_type,
        amount_mills: payload.amount_mills,
        idempotency_key,
        description: payload.description,
        source_id: payload.source_id,
    };
    let outcome = state.ledger.create_event(&input).await?;

    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(CreateBillableEventResponse {
            created: outcome.created,
            event_id: outcome.event_id,
            idempotency_key: input.idempotency_key,
            status: outcome.status,
        }),
    ))
}

pub async fn get_billable_event(
    State(state): State<AppState>,
    Path((shop_id, idempotency_key)): Path<(String, String)>,
) -> Result<Json<BillableEvent>, AppError> {
    let event = state
        .ledger
        .get_event_by_idempotency_key(&shop_id, &idempotency_key)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Billable event not found")))?;

    Ok(Json(event))
}

pub async fn list_billable_events(
    State(state): State<AppState>,
    Path(shop_id): Path<String>,
    Query(query): Query<ListBillableEventsQuery>,
) -> Result<Json<BillableEventListResponse>, AppError> {
    let page_size = query.page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, 100);
    let filter = ListBillableEventsFilter {
        status: query.status,
        event_type: query.event_type,
        page_size,
        page_token: query.page_token,
    };

    let events = state.ledger.list_events(&shop_id, &filter).await?;
    let next_page_token = if events.len() == page_size as usize {
        events.last().map(|e| e.id)
    } else {
        None
    };

    Ok(Json(BillableEventListResponse {
        events,
        next_page_token,
    }))
}

pub async fn confirm_billable_event(
    State(state): State<AppState>,
    Path((shop_id, idempotency_key)): Path<(String, String)>,
) -> Result<Json<ConfirmEventOutcome>, AppError> {
    let outcome = state
        .ledger
        .confirm_event(&shop_id, &idempotency_key)
        .await?;
    Ok(Json(outcome))
}

/// The body is optional; an empty request marks the event `failed`. A
/// non-empty body must decode, whatever its content type.
pub async fn fail_billable_event(
    State(state): State<AppState>,
    Path((shop_id, idempotency_key)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<FailEventOutcome>, AppError> {
    let payload = parse_fail_request(&body)?;
    let outcome = state
        .ledger
        .fail_event(
            &shop_id,
            &idempotency_key,
            payload.error_message.as_deref(),
            payload.waived,
        )
        .await?;
    Ok(Json(outcome))
}

pub async fn confirm_and_charge_billable_event(
    State(state): State<AppState>,
    Path((shop_id, idempotency_key)): Path<(String, String)>,
    Json(payload): Json<ConfirmAndChargeRequest>,
) -> Result<Json<ConfirmAndChargeOutcome>, AppError> {
    let outcome = state
        .ledger
        .confirm_and_charge(
            &shop_id,
            &idempotency_key,
            payload.total_cost_usd,
            payload.description.as_deref(),
        )
        .await?;
    Ok(Json(outcome))
}

fn parse_fail_request(body: &[u8]) -> Result<FailBillableEventRequest, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(FailBillableEventRequest::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!("invalid fail request body: {}", e)))
}
