//! Sliding-window generation attempt quotas.
//!
//! Two nested caps apply to a buyer session: attempts per product and
//! attempts across all products. Counters reset lazily: a row whose window has
//! elapsed since its last attempt simply stops counting, no sweeper runs.
//!
//! Check-and-increment runs in one serializable transaction. A serialization
//! conflict is retried once; after that, or on any other failure, the limiter
//! fails open so a storage fault never blocks paid generation.

use crate::clock::Clock;
use crate::models::{AttemptKey, GenerationAttempt, LimitReason, ShopGenerationLimits};
use crate::services::metrics::{record_quota_decision, record_quota_retry};
use crate::services::store::{GenerationAttemptStore, ShopLimitsSource};
use chrono::{DateTime, Utc};
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Result of asking whether a session may generate again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<LimitReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Remaining attempts for this product.
    pub tries_remaining: i32,
    /// Remaining attempts for the session across products.
    pub session_tries_remaining: i32,
    pub resets_at: Option<DateTime<Utc>>,
    pub reset_in_minutes: Option<i64>,
    /// Set when the decision was not backed by storage.
    pub fail_open: bool,
}

impl AttemptDecision {
    fn fail_open(limits: &ShopGenerationLimits) -> Self {
        Self {
            allowed: true,
            reason: None,
            message: None,
            tries_remaining: limits.per_product_limit,
            session_tries_remaining: limits.per_session_limit,
            resets_at: None,
            reset_in_minutes: None,
            fail_open: true,
        }
    }
}

/// Decision plus the row to persist when the attempt is allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptEvaluation {
    pub decision: AttemptDecision,
    pub write: Option<GenerationAttempt>,
}

/// Attempts in the session that still fall inside their row's window.
pub fn session_total(rows: &[GenerationAttempt], now: DateTime<Utc>) -> i32 {
    rows.iter().map(|row| row.effective_count(now)).sum()
}

/// Earliest moment an active row in the session stops counting.
fn session_resets_at(rows: &[GenerationAttempt], now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    rows.iter()
        .filter(|row| !row.is_expired(now))
        .map(GenerationAttempt::resets_at)
        .min()
}

fn minutes_until(at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let secs = (at - now).num_seconds().max(0);
    (secs + 59) / 60
}

fn blocked(
    reason: LimitReason,
    limit: i32,
    tries_remaining: i32,
    session_tries_remaining: i32,
    resets_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> AttemptDecision {
    let reset_in_minutes = resets_at.map(|at| minutes_until(at, now));
    let scope = match reason {
        LimitReason::PerProductLimit => "this product",
        LimitReason::PerSessionLimit => "this session",
    };
    let message = match reset_in_minutes {
        Some(m) => format!(
            "You've reached the limit of {} generations for {}. Try again in {} minute{}.",
            limit,
            scope,
            m,
            if m == 1 { "" } else { "s" }
        ),
        None => format!("You've reached the limit of {} generations for {}.", limit, scope),
    };

    AttemptDecision {
        allowed: false,
        reason: Some(reason),
        message: Some(message),
        tries_remaining: tries_remaining.max(0),
        session_tries_remaining: session_tries_remaining.max(0),
        resets_at,
        reset_in_minutes,
        fail_open: false,
    }
}

/// Decide whether one more attempt is allowed for `key`.
///
/// `existing` is the product row, if any; `session_rows` are all rows for the
/// session, the product row included. Pure: callers persist `write`.
pub fn evaluate_attempt(
    key: &AttemptKey,
    existing: Option<&GenerationAttempt>,
    session_rows: &[GenerationAttempt],
    limits: &ShopGenerationLimits,
    now: DateTime<Utc>,
) -> AttemptEvaluation {
    let session_used = session_total(session_rows, now);

    let write = match existing {
        None => {
            // No product row to reset, so only the session cap can refuse.
            if session_used >= limits.per_session_limit {
                return AttemptEvaluation {
                    decision: blocked(
                        LimitReason::PerSessionLimit,
                        limits.per_session_limit,
                        limits.per_product_limit,
                        limits.per_session_limit - session_used,
                        session_resets_at(session_rows, now),
                        now,
                    ),
                    write: None,
                };
            }

            GenerationAttempt {
                shop_id: key.shop_id.clone(),
                session_id: key.session_id.clone(),
                product_id: key.product_id.clone(),
                attempt_count: 1,
                first_attempt_at: now,
                last_attempt_at: now,
                reset_window_minutes: limits.reset_window_minutes,
            }
        }
        Some(row) => {
            let effective = row.effective_count(now);

            if effective >= limits.per_product_limit {
                return AttemptEvaluation {
                    decision: blocked(
                        LimitReason::PerProductLimit,
                        limits.per_product_limit,
                        limits.per_product_limit - effective,
                        limits.per_session_limit - session_used,
                        Some(row.resets_at()),
                        now,
                    ),
                    write: None,
                };
            }

            if session_used >= limits.per_session_limit {
                return AttemptEvaluation {
                    decision: blocked(
                        LimitReason::PerSessionLimit,
                        limits.per_session_limit,
                        limits.per_product_limit - effective,
                        limits.per_session_limit - session_used,
                        session_resets_at(session_rows, now),
                        now,
                    ),
                    write: None,
                };
            }

            let expired = row.is_expired(now);
            GenerationAttempt {
                attempt_count: effective + 1,
                first_attempt_at: if expired { now } else { row.first_attempt_at },
                last_attempt_at: now,
                ..row.clone()
            }
        }
    };

    let resets_at = write.resets_at();
    AttemptEvaluation {
        decision: AttemptDecision {
            allowed: true,
            reason: None,
            message: None,
            tries_remaining: (limits.per_product_limit - write.attempt_count).max(0),
            session_tries_remaining: (limits.per_session_limit - session_used - 1).max(0),
            resets_at: Some(resets_at),
            reset_in_minutes: Some(minutes_until(resets_at, now)),
            fail_open: false,
        },
        write: Some(write),
    }
}

/// Non-mutating view of whether the next attempt would be allowed, with the
/// remaining figures as they stand now (before any attempt is consumed).
pub fn preview_attempt(
    key: &AttemptKey,
    existing: Option<&GenerationAttempt>,
    session_rows: &[GenerationAttempt],
    limits: &ShopGenerationLimits,
    now: DateTime<Utc>,
) -> AttemptDecision {
    let evaluation = evaluate_attempt(key, existing, session_rows, limits, now);
    if !evaluation.decision.allowed {
        return evaluation.decision;
    }

    let active = existing.filter(|row| !row.is_expired(now));
    let used = active.map(|row| row.attempt_count).unwrap_or(0);
    let resets_at = active.map(GenerationAttempt::resets_at);

    AttemptDecision {
        allowed: true,
        reason: None,
        message: None,
        tries_remaining: (limits.per_product_limit - used).max(0),
        session_tries_remaining: (limits.per_session_limit - session_total(session_rows, now))
            .max(0),
        resets_at,
        reset_in_minutes: resets_at.map(|at| minutes_until(at, now)),
        fail_open: false,
    }
}

/// Per-product part of a limit status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductLimitStatus {
    pub product_id: String,
    pub attempts_used: i32,
    pub tries_remaining: i32,
    pub resets_at: Option<DateTime<Utc>>,
}

/// Read-only usage summary for a session, for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationLimitStatus {
    pub limits: ShopGenerationLimits,
    pub session_attempts_used: i32,
    pub session_tries_remaining: i32,
    pub session_resets_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<ProductLimitStatus>,
    pub can_generate: bool,
}

/// Quota limiter over a counter store and a per-shop limits source.
#[derive(Clone)]
pub struct QuotaLimiter {
    store: Arc<dyn GenerationAttemptStore>,
    limits: Arc<dyn ShopLimitsSource>,
    clock: Arc<dyn Clock>,
}

fn validate_key(key: &AttemptKey) -> Result<(), AppError> {
    if key.shop_id.trim().is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("shop_id is required")));
    }
    if key.session_id.trim().is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("session_id is required")));
    }
    if key.product_id.trim().is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("product_id is required")));
    }
    Ok(())
}

impl QuotaLimiter {
    pub fn new(
        store: Arc<dyn GenerationAttemptStore>,
        limits: Arc<dyn ShopLimitsSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            limits,
            clock,
        }
    }

    /// Whether the next attempt would be allowed, without consuming it.
    #[instrument(skip(self), fields(shop_id = %key.shop_id, session_id = %key.session_id, product_id = %key.product_id))]
    pub async fn check_generation_limits(
        &self,
        key: &AttemptKey,
    ) -> Result<AttemptDecision, AppError> {
        validate_key(key)?;

        let limits = self.limits.get_shop_generation_limits(&key.shop_id).await?;
        let existing = self.store.get_attempt(key).await?;
        let session_rows = self
            .store
            .list_session_attempts(&key.shop_id, &key.session_id)
            .await?;

        Ok(preview_attempt(
            key,
            existing.as_ref(),
            &session_rows,
            &limits,
            self.clock.now(),
        ))
    }

    /// Consume one attempt if both caps allow it.
    ///
    /// Storage failures never surface: after one retry on a serialization
    /// conflict, or immediately on any other error, the attempt is allowed and
    /// the configured limits are reported as remaining. Only invalid input is
    /// returned as an error.
    #[instrument(skip(self), fields(shop_id = %key.shop_id, session_id = %key.session_id, product_id = %key.product_id))]
    pub async fn check_and_increment_generation_attempt(
        &self,
        key: &AttemptKey,
    ) -> Result<AttemptDecision, AppError> {
        validate_key(key)?;

        let limits = match self.limits.get_shop_generation_limits(&key.shop_id).await {
            Ok(limits) => limits,
            Err(e) => {
                error!(error = %e, "Failed to load shop generation limits, failing open");
                record_quota_decision("fail_open");
                return Ok(AttemptDecision::fail_open(&ShopGenerationLimits::default()));
            }
        };

        let result = match self.store.record_attempt(key, &limits, self.clock.now()).await {
            Err(e) if e.is_transaction_conflict() => {
                warn!(error = %e, "Serialization conflict on attempt increment, retrying once");
                let retry = self.store.record_attempt(key, &limits, self.clock.now()).await;
                record_quota_retry(if retry.is_ok() { "recovered" } else { "exhausted" });
                retry
            }
            other => other,
        };

        match result {
            Ok(evaluation) => {
                let decision = evaluation.decision;
                match decision.reason {
                    Some(reason) => {
                        info!(
                            reason = reason.as_str(),
                            reset_in_minutes = ?decision.reset_in_minutes,
                            "Generation attempt blocked"
                        );
                        record_quota_decision(reason.as_str());
                    }
                    None => record_quota_decision("allowed"),
                }
                Ok(decision)
            }
            Err(e) => {
                error!(error = %e, "Generation attempt check failed, failing open");
                record_quota_decision("fail_open");
                Ok(AttemptDecision::fail_open(&limits))
            }
        }
    }

    /// Usage summary for a session, optionally focused on one product.
    #[instrument(skip(self))]
    pub async fn get_generation_limit_status(
        &self,
        shop_id: &str,
        session_id: &str,
        product_id: Option<&str>,
    ) -> Result<GenerationLimitStatus, AppError> {
        if shop_id.trim().is_empty() || session_id.trim().is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "shop_id and session_id are required"
            )));
        }

        let now = self.clock.now();
        let limits = self.limits.get_shop_generation_limits(shop_id).await?;
        let session_rows = self.store.list_session_attempts(shop_id, session_id).await?;

        let session_used = session_total(&session_rows, now);
        let session_remaining = (limits.per_session_limit - session_used).max(0);

        let product = product_id.map(|product_id| {
            let active = session_rows
                .iter()
                .find(|row| row.product_id == product_id)
                .filter(|row| !row.is_expired(now));
            let used = active.map(|row| row.attempt_count).unwrap_or(0);
            ProductLimitStatus {
                product_id: product_id.to_string(),
                attempts_used: used,
                tries_remaining: (limits.per_product_limit - used).max(0),
                resets_at: active.map(GenerationAttempt::resets_at),
            }
        });

        let can_generate = session_remaining > 0
            && product
                .as_ref()
                .map(|p| p.tries_remaining > 0)
                .unwrap_or(true);

        Ok(GenerationLimitStatus {
            limits,
            session_attempts_used: session_used,
            session_tries_remaining: session_remaining,
            session_resets_at: session_resets_at(&session_rows, now),
            product,
            can_generate,
        })
    }
}
