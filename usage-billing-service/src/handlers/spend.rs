use axum::{
    extract::{Path, State},
    Json,
};
use service_core::error::AppError;

use crate::{
    dtos::{SpendCheckRequest, SpendCheckResponse},
    startup::AppState,
};

/// Guardrail pre-check before a paid provider call. A block is a normal
/// 200 response with `allowed = false`.
pub async fn check_spend(
    State(state): State<AppState>,
    Path(shop_id): Path<String>,
    Json(payload): Json<SpendCheckRequest>,
) -> Result<Json<SpendCheckResponse>, AppError> {
    if shop_id.trim().is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("shop_id is required")));
    }

    let decision = state
        .guardrail
        .check_billable_action_allowed(&shop_id, payload.cost_mills)
        .await?;

    Ok(Json(SpendCheckResponse::from(decision)))
}
