//! Generation quota handlers for buyer sessions.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use service_core::error::AppError;

use crate::{
    dtos::LimitStatusQuery,
    models::AttemptKey,
    services::{AttemptDecision, GenerationLimitStatus},
    startup::AppState,
};

pub async fn check_generation_limits(
    State(state): State<AppState>,
    Path((shop_id, session_id, product_id)): Path<(String, String, String)>,
) -> Result<Json<AttemptDecision>, AppError> {
    let key = AttemptKey::new(shop_id, session_id, product_id);
    let decision = state.quota.check_generation_limits(&key).await?;
    Ok(Json(decision))
}

/// Consume one attempt. Storage trouble yields an allowed decision with
/// `fail_open = true` rather than an error.
pub async fn record_generation_attempt(
    State(state): State<AppState>,
    Path((shop_id, session_id, product_id)): Path<(String, String, String)>,
) -> Result<Json<AttemptDecision>, AppError> {
    let key = AttemptKey::new(shop_id, session_id, product_id);
    let decision = state
        .quota
        .check_and_increment_generation_attempt(&key)
        .await?;
    Ok(Json(decision))
}

pub async fn get_generation_limit_status(
    State(state): State<AppState>,
    Path((shop_id, session_id)): Path<(String, String)>,
    Query(query): Query<LimitStatusQuery>,
) -> Result<Json<GenerationLimitStatus>, AppError> {
    let status = state
        .quota
        .get_generation_limit_status(&shop_id, &session_id, query.product_id.as_deref())
        .await?;
    Ok(Json(status))
}
