//! Application startup and lifecycle management.

use crate::clock::{Clock, SystemClock};
use crate::config::UsageBillingConfig;
use crate::handlers::{attempts, billable_events, health, spend};
use crate::services::{
    init_metrics, BillableEventLedger, BillingClient, Database, HealthProbe, HttpBillingClient,
    QuotaLimiter, SpendGuardrail,
};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::{metrics_middleware, request_id_middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub ledger: BillableEventLedger,
    pub guardrail: SpendGuardrail,
    pub quota: QuotaLimiter,
    pub health: Arc<dyn HealthProbe>,
}

impl AppState {
    /// Wire the services over one database and one billing collaborator.
    pub fn new(db: Arc<Database>, billing: Arc<dyn BillingClient>, clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger: BillableEventLedger::new(db.clone(), billing.clone()),
            guardrail: SpendGuardrail::new(billing, clock.clone()),
            quota: QuotaLimiter::new(db.clone(), db.clone(), clock),
            health: db,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    init_metrics();

    let shop_routes = Router::new()
        .route(
            "/billable-events",
            post(billable_events::create_billable_event).get(billable_events::list_billable_events),
        )
        .route(
            "/billable-events/:idempotency_key",
            get(billable_events::get_billable_event),
        )
        .route(
            "/billable-events/:idempotency_key/confirm",
            post(billable_events::confirm_billable_event),
        )
        .route(
            "/billable-events/:idempotency_key/fail",
            post(billable_events::fail_billable_event),
        )
        .route(
            "/billable-events/:idempotency_key/confirm-and-charge",
            post(billable_events::confirm_and_charge_billable_event),
        )
        .route("/spend/check", post(spend::check_spend))
        .route(
            "/sessions/:session_id/products/:product_id/limits",
            get(attempts::check_generation_limits),
        )
        .route(
            "/sessions/:session_id/products/:product_id/attempts",
            post(attempts::record_generation_attempt),
        )
        .route(
            "/sessions/:session_id/limit-status",
            get(attempts::get_generation_limit_status),
        );

    Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/metrics", get(health::metrics_handler))
        .nest("/v1/shops/:shop_id", shop_routes)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    db: Arc<Database>,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: UsageBillingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: UsageBillingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(
        config: UsageBillingConfig,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let db = Arc::new(db);

        let billing: Arc<dyn BillingClient> = Arc::new(HttpBillingClient::new(
            &config.billing_service.url,
            config.billing_service.timeout(),
            config.billing_service.retry_budget(),
        )?);

        let state = AppState::new(db.clone(), billing, Arc::new(SystemClock));

        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Usage billing service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            db,
            state,
        })
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = build_router(self.state);

        tracing::info!(
            service = "usage-billing-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        axum::serve(self.http_listener, router).await.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
