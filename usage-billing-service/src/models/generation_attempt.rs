//! Generation attempt counters and per-shop limits.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub const DEFAULT_PER_PRODUCT_LIMIT: i32 = 5;
pub const DEFAULT_PER_SESSION_LIMIT: i32 = 15;
pub const DEFAULT_RESET_WINDOW_MINUTES: i32 = 30;

/// Per-shop attempt caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ShopGenerationLimits {
    pub per_product_limit: i32,
    pub per_session_limit: i32,
    pub reset_window_minutes: i32,
}

impl Default for ShopGenerationLimits {
    fn default() -> Self {
        Self {
            per_product_limit: DEFAULT_PER_PRODUCT_LIMIT,
            per_session_limit: DEFAULT_PER_SESSION_LIMIT,
            reset_window_minutes: DEFAULT_RESET_WINDOW_MINUTES,
        }
    }
}

/// Identity of one counter row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttemptKey {
    pub shop_id: String,
    pub session_id: String,
    pub product_id: String,
}

impl AttemptKey {
    pub fn new(
        shop_id: impl Into<String>,
        session_id: impl Into<String>,
        product_id: impl Into<String>,
    ) -> Self {
        Self {
            shop_id: shop_id.into(),
            session_id: session_id.into(),
            product_id: product_id.into(),
        }
    }
}

/// Attempt counter for one (shop, session, product).
///
/// The stored count is stale once the window since `last_attempt_at` has
/// elapsed; readers must go through [`GenerationAttempt::effective_count`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct GenerationAttempt {
    pub shop_id: String,
    pub session_id: String,
    pub product_id: String,
    pub attempt_count: i32,
    pub first_attempt_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    /// Copied from shop limits when the row is created.
    pub reset_window_minutes: i32,
}

impl GenerationAttempt {
    pub fn window(&self) -> Duration {
        Duration::minutes(i64::from(self.reset_window_minutes))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.last_attempt_at >= self.window()
    }

    pub fn effective_count(&self, now: DateTime<Utc>) -> i32 {
        if self.is_expired(now) {
            0
        } else {
            self.attempt_count
        }
    }

    pub fn resets_at(&self) -> DateTime<Utc> {
        self.last_attempt_at + self.window()
    }
}

/// Why an attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitReason {
    PerProductLimit,
    PerSessionLimit,
}

impl LimitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitReason::PerProductLimit => "per_product_limit",
            LimitReason::PerSessionLimit => "per_session_limit",
        }
    }
}
