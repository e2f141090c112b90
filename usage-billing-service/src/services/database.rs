//! Database service for usage-billing-service.

use crate::models::{
    AttemptKey, BillableEvent, BillableEventStatus, CreateBillableEvent, GenerationAttempt,
    ListBillableEventsFilter, ShopGenerationLimits,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::quota::{evaluate_attempt, AttemptEvaluation};
use crate::services::store::{
    BillableEventStore, GenerationAttemptStore, HealthProbe, ShopLimitsSource,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Serialization failures and deadlocks become `TransactionConflict` so the
/// caller can retry; everything else is a plain database error.
fn map_tx_error(context: &str, e: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(ref db_err) = e {
        if matches!(db_err.code().as_deref(), Some("40001") | Some("40P01")) {
            return AppError::TransactionConflict(anyhow::anyhow!("{}: {}", context, e));
        }
    }
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "usage-billing-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Set per-shop generation limits. Used by operators and tests; shops
    /// without a row get the defaults.
    #[instrument(skip(self))]
    pub async fn upsert_shop_generation_limits(
        &self,
        shop_id: &str,
        limits: &ShopGenerationLimits,
    ) -> Result<(), AppError> {
        if limits.per_product_limit < 1
            || limits.per_session_limit < 1
            || limits.reset_window_minutes < 1
        {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Generation limits must be positive"
            )));
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_shop_generation_limits"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO shop_generation_settings (shop_id, per_product_limit, per_session_limit, reset_window_minutes)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (shop_id) DO UPDATE
            SET per_product_limit = EXCLUDED.per_product_limit,
                per_session_limit = EXCLUDED.per_session_limit,
                reset_window_minutes = EXCLUDED.reset_window_minutes,
                updated_at = NOW()
            "#,
        )
        .bind(shop_id)
        .bind(limits.per_product_limit)
        .bind(limits.per_session_limit)
        .bind(limits.reset_window_minutes)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to save generation limits: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }

    async fn fetch_attempt<'e, E>(
        executor: E,
        key: &AttemptKey,
    ) -> Result<Option<GenerationAttempt>, sqlx::Error>
    where
        E: sqlx::PgExecutor<'e>,
    {
        sqlx::query_as::<_, GenerationAttempt>(
            r#"
            SELECT shop_id, session_id, product_id, attempt_count, first_attempt_at, last_attempt_at, reset_window_minutes
            FROM generation_attempts
            WHERE shop_id = $1 AND session_id = $2 AND product_id = $3
            "#,
        )
        .bind(&key.shop_id)
        .bind(&key.session_id)
        .bind(&key.product_id)
        .fetch_optional(executor)
        .await
    }

    async fn fetch_session_attempts<'e, E>(
        executor: E,
        shop_id: &str,
        session_id: &str,
    ) -> Result<Vec<GenerationAttempt>, sqlx::Error>
    where
        E: sqlx::PgExecutor<'e>,
    {
        sqlx::query_as::<_, GenerationAttempt>(
            r#"
            SELECT shop_id, session_id, product_id, attempt_count, first_attempt_at, last_attempt_at, reset_window_minutes
            FROM generation_attempts
            WHERE shop_id = $1 AND session_id = $2
            ORDER BY product_id
            "#,
        )
        .bind(shop_id)
        .bind(session_id)
        .fetch_all(executor)
        .await
    }
}

#[async_trait]
impl BillableEventStore for Database {
    #[instrument(skip(self, input), fields(shop_id = %input.shop_id, idempotency_key = %input.idempotency_key))]
    async fn insert_event(&self, input: &CreateBillableEvent) -> Result<BillableEvent, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_billable_event"])
            .start_timer();

        let event = sqlx::query_as::<_, BillableEvent>(
            r#"
            INSERT INTO billable_events (id, shop_id, event_type, status, amount_mills, currency_code, idempotency_key, description, source_id)
            VALUES ($1, $2, $3, 'pending', $4, 'USD', $5, $6, $7)
            RETURNING id, shop_id, event_type, status, amount_mills, currency_code, idempotency_key, description, source_id, error_message, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&input.shop_id)
        .bind(input.event_type.as_str())
        .bind(input.amount_mills)
        .bind(&input.idempotency_key)
        .bind(&input.description)
        .bind(&input.source_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!(
                    "Billable event with idempotency key '{}' already exists",
                    input.idempotency_key
                ))
            }
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to create billable event: {}", e)),
        })?;

        timer.observe_duration();
        Ok(event)
    }

    #[instrument(skip(self))]
    async fn find_event_by_key(
        &self,
        shop_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<BillableEvent>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_billable_event"])
            .start_timer();

        let event = sqlx::query_as::<_, BillableEvent>(
            r#"
            SELECT id, shop_id, event_type, status, amount_mills, currency_code, idempotency_key, description, source_id, error_message, created_at, updated_at
            FROM billable_events
            WHERE shop_id = $1 AND idempotency_key = $2
            "#,
        )
        .bind(shop_id)
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get billable event: {}", e))
        })?;

        timer.observe_duration();
        Ok(event)
    }

    #[instrument(skip(self, error_message))]
    async fn transition_event(
        &self,
        shop_id: &str,
        event_id: Uuid,
        to: BillableEventStatus,
        error_message: Option<&str>,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["transition_billable_event"])
            .start_timer();

        // The status guard makes concurrent transitions race on one row update.
        let result = sqlx::query(
            r#"
            UPDATE billable_events
            SET status = $3,
                error_message = COALESCE($4, error_message),
                updated_at = NOW()
            WHERE shop_id = $1 AND id = $2 AND status = 'pending'
            "#,
        )
        .bind(shop_id)
        .bind(event_id)
        .bind(to.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update billable event: {}", e))
        })?;

        timer.observe_duration();
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, filter))]
    async fn list_events(
        &self,
        shop_id: &str,
        filter: &ListBillableEventsFilter,
    ) -> Result<Vec<BillableEvent>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_billable_events"])
            .start_timer();

        let limit = filter.page_size.clamp(1, 100) as i64;

        let events = sqlx::query_as::<_, BillableEvent>(
            r#"
            SELECT id, shop_id, event_type, status, amount_mills, currency_code, idempotency_key, description, source_id, error_message, created_at, updated_at
            FROM billable_events
            WHERE shop_id = $1
              AND ($2::varchar IS NULL OR status = $2)
              AND ($3::varchar IS NULL OR event_type = $3)
              AND ($4::uuid IS NULL OR (created_at, id) < (
                    SELECT created_at, id FROM billable_events WHERE shop_id = $1 AND id = $4
                  ))
            ORDER BY created_at DESC, id DESC
            LIMIT $5
            "#,
        )
        .bind(shop_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.event_type.map(|t| t.as_str()))
        .bind(filter.page_token)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list billable events: {}", e))
        })?;

        timer.observe_duration();
        Ok(events)
    }
}

#[async_trait]
impl GenerationAttemptStore for Database {
    #[instrument(skip(self))]
    async fn get_attempt(&self, key: &AttemptKey) -> Result<Option<GenerationAttempt>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_generation_attempt"])
            .start_timer();

        let attempt = Self::fetch_attempt(&self.pool, key).await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get generation attempt: {}", e))
        })?;

        timer.observe_duration();
        Ok(attempt)
    }

    #[instrument(skip(self))]
    async fn list_session_attempts(
        &self,
        shop_id: &str,
        session_id: &str,
    ) -> Result<Vec<GenerationAttempt>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_session_attempts"])
            .start_timer();

        let rows = Self::fetch_session_attempts(&self.pool, shop_id, session_id)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to list session attempts: {}", e))
            })?;

        timer.observe_duration();
        Ok(rows)
    }

    #[instrument(skip(self, limits))]
    async fn record_attempt(
        &self,
        key: &AttemptKey,
        limits: &ShopGenerationLimits,
        now: DateTime<Utc>,
    ) -> Result<AttemptEvaluation, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_generation_attempt"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_tx_error("Failed to begin transaction", e))?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_tx_error("Failed to set isolation level", e))?;

        let existing = Self::fetch_attempt(&mut *tx, key)
            .await
            .map_err(|e| map_tx_error("Failed to read generation attempt", e))?;
        let session_rows = Self::fetch_session_attempts(&mut *tx, &key.shop_id, &key.session_id)
            .await
            .map_err(|e| map_tx_error("Failed to read session attempts", e))?;

        let evaluation = evaluate_attempt(key, existing.as_ref(), &session_rows, limits, now);

        if let Some(write) = &evaluation.write {
            sqlx::query(
                r#"
                INSERT INTO generation_attempts (shop_id, session_id, product_id, attempt_count, first_attempt_at, last_attempt_at, reset_window_minutes)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (shop_id, session_id, product_id) DO UPDATE
                SET attempt_count = EXCLUDED.attempt_count,
                    first_attempt_at = EXCLUDED.first_attempt_at,
                    last_attempt_at = EXCLUDED.last_attempt_at,
                    reset_window_minutes = EXCLUDED.reset_window_minutes
                "#,
            )
            .bind(&write.shop_id)
            .bind(&write.session_id)
            .bind(&write.product_id)
            .bind(write.attempt_count)
            .bind(write.first_attempt_at)
            .bind(write.last_attempt_at)
            .bind(write.reset_window_minutes)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_tx_error("Failed to save generation attempt", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_tx_error("Failed to commit generation attempt", e))?;

        timer.observe_duration();

        debug!(
            allowed = evaluation.decision.allowed,
            tries_remaining = evaluation.decision.tries_remaining,
            "Generation attempt evaluated"
        );

        Ok(evaluation)
    }
}

#[async_trait]
impl ShopLimitsSource for Database {
    #[instrument(skip(self))]
    async fn get_shop_generation_limits(
        &self,
        shop_id: &str,
    ) -> Result<ShopGenerationLimits, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_shop_generation_limits"])
            .start_timer();

        let limits = sqlx::query_as::<_, ShopGenerationLimits>(
            r#"
            SELECT per_product_limit, per_session_limit, reset_window_minutes
            FROM shop_generation_settings
            WHERE shop_id = $1
            "#,
        )
        .bind(shop_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get generation limits: {}", e))
        })?;

        timer.observe_duration();
        Ok(limits.unwrap_or_default())
    }
}

#[async_trait]
impl HealthProbe for Database {
    async fn health_check(&self) -> Result<(), AppError> {
        Database::health_check(self).await
    }
}
