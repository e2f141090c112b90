//! Common test utilities for usage-billing-service integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use usage_billing_service::clock::Clock;
use usage_billing_service::config::{BillingServiceConfig, DatabaseConfig, UsageBillingConfig};
use usage_billing_service::models::{
    AttemptKey, BillableEvent, BillableEventStatus, CreateBillableEvent, GenerationAttempt,
    ListBillableEventsFilter, RecordUsageCharge, ShopGenerationLimits, SpendSafetySettings,
    UsageChargeResult, UsageLedgerSummary,
};
use usage_billing_service::money::usd_to_mills;
use usage_billing_service::services::quota::{evaluate_attempt, AttemptEvaluation};
use usage_billing_service::services::{
    BillableEventLedger, BillableEventStore, BillingClient, GenerationAttemptStore, HealthProbe,
    QuotaLimiter, ShopLimitsSource, SpendGuardrail,
};
use usage_billing_service::startup::AppState;
use uuid::Uuid;

pub const SHOP: &str = "demo-shop.myshopify.com";

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,usage_billing_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap()
}

// -----------------------------------------------------------------------------
// Clock
// -----------------------------------------------------------------------------

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// -----------------------------------------------------------------------------
// Billable event store
// -----------------------------------------------------------------------------

/// Mirrors the unique `(shop_id, idempotency_key)` constraint and the
/// `status = 'pending'` guard of the Postgres store.
#[derive(Default)]
pub struct InMemoryEventStore {
    events: Mutex<Vec<BillableEvent>>,
    close_before_next_transition: Mutex<Option<BillableEventStatus>>,
}

impl InMemoryEventStore {
    /// The next `transition_event` finds the row already moved to `status`,
    /// as if another delivery got there first.
    pub fn close_before_next_transition(&self, status: BillableEventStatus) {
        *self.close_before_next_transition.lock().unwrap() = Some(status);
    }

    pub fn status_of(&self, shop_id: &str, idempotency_key: &str) -> Option<BillableEventStatus> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.shop_id == shop_id && e.idempotency_key == idempotency_key)
            .map(|e| e.status)
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

#[async_trait]
impl BillableEventStore for InMemoryEventStore {
    async fn insert_event(&self, input: &CreateBillableEvent) -> Result<BillableEvent, AppError> {
        let mut events = self.events.lock().unwrap();
        if events
            .iter()
            .any(|e| e.shop_id == input.shop_id && e.idempotency_key == input.idempotency_key)
        {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "duplicate idempotency key"
            )));
        }

        // Strictly increasing timestamps keep listing order deterministic.
        let created_at = fixed_now() + Duration::milliseconds(events.len() as i64);
        let event = BillableEvent {
            id: Uuid::new_v4(),
            shop_id: input.shop_id.clone(),
            event_type: input.event_type,
            status: BillableEventStatus::Pending,
            amount_mills: input.amount_mills,
            currency_code: "USD".to_string(),
            idempotency_key: input.idempotency_key.clone(),
            description: input.description.clone(),
            source_id: input.source_id.clone(),
            error_message: None,
            created_at,
            updated_at: created_at,
        };
        events.push(event.clone());
        Ok(event)
    }

    async fn find_event_by_key(
        &self,
        shop_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<BillableEvent>, AppError> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.shop_id == shop_id && e.idempotency_key == idempotency_key)
            .cloned())
    }

    async fn transition_event(
        &self,
        shop_id: &str,
        event_id: Uuid,
        to: BillableEventStatus,
        error_message: Option<&str>,
    ) -> Result<bool, AppError> {
        let mut events = self.events.lock().unwrap();
        if let Some(status) = self.close_before_next_transition.lock().unwrap().take() {
            if let Some(event) = events.iter_mut().find(|e| e.id == event_id) {
                event.status = status;
            }
        }
        match events.iter_mut().find(|e| {
            e.shop_id == shop_id && e.id == event_id && e.status == BillableEventStatus::Pending
        }) {
            Some(event) => {
                event.status = to;
                if let Some(message) = error_message {
                    event.error_message = Some(message.to_string());
                }
                event.updated_at = event.created_at + Duration::seconds(1);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_events(
        &self,
        shop_id: &str,
        filter: &ListBillableEventsFilter,
    ) -> Result<Vec<BillableEvent>, AppError> {
        let events = self.events.lock().unwrap();
        let cursor = filter
            .page_token
            .and_then(|id| events.iter().find(|e| e.id == id && e.shop_id == shop_id))
            .map(|e| (e.created_at, e.id));

        let mut matching: Vec<BillableEvent> = events
            .iter()
            .filter(|e| e.shop_id == shop_id)
            .filter(|e| filter.status.map_or(true, |s| e.status == s))
            .filter(|e| filter.event_type.map_or(true, |t| e.event_type == t))
            .filter(|e| cursor.map_or(true, |c| (e.created_at, e.id) < c))
            .cloned()
            .collect();
        matching.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        matching.truncate(filter.page_size.clamp(1, 100) as usize);
        Ok(matching)
    }
}

// -----------------------------------------------------------------------------
// Generation attempt store
// -----------------------------------------------------------------------------

/// Serializes `record_attempt` behind one lock, which stands in for the
/// serializable transaction. Can be told to fail or to conflict.
#[derive(Default)]
pub struct InMemoryAttemptStore {
    rows: Mutex<HashMap<AttemptKey, GenerationAttempt>>,
    conflicts_remaining: AtomicUsize,
    fail_always: AtomicBool,
    record_calls: AtomicUsize,
}

impl InMemoryAttemptStore {
    pub fn conflict_times(&self, n: usize) {
        self.conflicts_remaining.store(n, Ordering::SeqCst);
    }

    pub fn fail_always(&self) {
        self.fail_always.store(true, Ordering::SeqCst);
    }

    pub fn record_calls(&self) -> usize {
        self.record_calls.load(Ordering::SeqCst)
    }

    pub fn row(&self, key: &AttemptKey) -> Option<GenerationAttempt> {
        self.rows.lock().unwrap().get(key).cloned()
    }

    fn check_failure(&self) -> Result<(), AppError> {
        if self.fail_always.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "connection refused"
            )));
        }
        Ok(())
    }

    fn session_rows(
        rows: &HashMap<AttemptKey, GenerationAttempt>,
        shop_id: &str,
        session_id: &str,
    ) -> Vec<GenerationAttempt> {
        rows.values()
            .filter(|r| r.shop_id == shop_id && r.session_id == session_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl GenerationAttemptStore for InMemoryAttemptStore {
    async fn get_attempt(&self, key: &AttemptKey) -> Result<Option<GenerationAttempt>, AppError> {
        self.check_failure()?;
        Ok(self.row(key))
    }

    async fn list_session_attempts(
        &self,
        shop_id: &str,
        session_id: &str,
    ) -> Result<Vec<GenerationAttempt>, AppError> {
        self.check_failure()?;
        let rows = self.rows.lock().unwrap();
        Ok(Self::session_rows(&rows, shop_id, session_id))
    }

    async fn record_attempt(
        &self,
        key: &AttemptKey,
        limits: &ShopGenerationLimits,
        now: DateTime<Utc>,
    ) -> Result<AttemptEvaluation, AppError> {
        self.record_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;

        let pending_conflicts = self.conflicts_remaining.load(Ordering::SeqCst);
        if pending_conflicts > 0 {
            self.conflicts_remaining
                .store(pending_conflicts - 1, Ordering::SeqCst);
            return Err(AppError::TransactionConflict(anyhow::anyhow!(
                "could not serialize access due to concurrent update"
            )));
        }

        let mut rows = self.rows.lock().unwrap();
        let existing = rows.get(key).cloned();
        let session = Self::session_rows(&rows, &key.shop_id, &key.session_id);
        let evaluation = evaluate_attempt(key, existing.as_ref(), &session, limits, now);
        if let Some(write) = &evaluation.write {
            rows.insert(key.clone(), write.clone());
        }
        Ok(evaluation)
    }
}

// -----------------------------------------------------------------------------
// Limits source
// -----------------------------------------------------------------------------

pub struct StaticLimits {
    limits: ShopGenerationLimits,
    fail: bool,
}

impl StaticLimits {
    pub fn new(limits: ShopGenerationLimits) -> Self {
        Self {
            limits,
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            limits: ShopGenerationLimits::default(),
            fail: true,
        }
    }
}

#[async_trait]
impl ShopLimitsSource for StaticLimits {
    async fn get_shop_generation_limits(
        &self,
        _shop_id: &str,
    ) -> Result<ShopGenerationLimits, AppError> {
        if self.fail {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "connection refused"
            )));
        }
        Ok(self.limits)
    }
}

// -----------------------------------------------------------------------------
// Billing collaborator
// -----------------------------------------------------------------------------

/// Billing collaborator that applies gift credit first and dedupes charges
/// by idempotency key.
pub struct ScriptedBillingClient {
    summary: Mutex<UsageLedgerSummary>,
    settings: Mutex<SpendSafetySettings>,
    charges: Mutex<HashMap<String, UsageChargeResult>>,
    charge_calls: AtomicUsize,
    summary_calls: AtomicUsize,
    settings_calls: AtomicUsize,
    fail_charges: AtomicBool,
}

impl ScriptedBillingClient {
    pub fn new(summary: UsageLedgerSummary, settings: SpendSafetySettings) -> Self {
        Self {
            summary: Mutex::new(summary),
            settings: Mutex::new(settings),
            charges: Mutex::new(HashMap::new()),
            charge_calls: AtomicUsize::new(0),
            summary_calls: AtomicUsize::new(0),
            settings_calls: AtomicUsize::new(0),
            fail_charges: AtomicBool::new(false),
        }
    }

    /// Gift balance and paid-usage MTD in mills; consent on when
    /// `consent` is true; cap in cents.
    pub fn with_balances(gift_mills: i64, mtd_mills: i64, cap_cents: i64, consent: bool) -> Self {
        Self::new(
            UsageLedgerSummary {
                gift_grant_total_mills: gift_mills.max(0),
                gift_balance_mills: gift_mills,
                paid_usage_month_to_date_mills: mtd_mills,
            },
            SpendSafetySettings {
                monthly_cap_cents: cap_cents,
                paid_usage_consent_at: consent.then(|| fixed_now() - Duration::days(3)),
            },
        )
    }

    pub fn set_fail_charges(&self, fail: bool) {
        self.fail_charges.store(fail, Ordering::SeqCst);
    }

    pub fn charge_calls(&self) -> usize {
        self.charge_calls.load(Ordering::SeqCst)
    }

    pub fn distinct_charges(&self) -> usize {
        self.charges.lock().unwrap().len()
    }

    pub fn summary_calls(&self) -> usize {
        self.summary_calls.load(Ordering::SeqCst)
    }

    pub fn settings_calls(&self) -> usize {
        self.settings_calls.load(Ordering::SeqCst)
    }

    pub fn summary(&self) -> UsageLedgerSummary {
        *self.summary.lock().unwrap()
    }
}

#[async_trait]
impl BillingClient for ScriptedBillingClient {
    async fn get_usage_ledger_summary(
        &self,
        _shop_id: &str,
    ) -> Result<UsageLedgerSummary, AppError> {
        self.summary_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.summary())
    }

    async fn get_spend_safety_settings(
        &self,
        _shop_id: &str,
    ) -> Result<SpendSafetySettings, AppError> {
        self.settings_calls.fetch_add(1, Ordering::SeqCst);
        Ok(*self.settings.lock().unwrap())
    }

    async fn record_usage_charge(
        &self,
        charge: &RecordUsageCharge,
    ) -> Result<UsageChargeResult, AppError> {
        self.charge_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_charges.load(Ordering::SeqCst) {
            return Err(AppError::BadGateway("billing service unavailable".to_string()));
        }

        let mut charges = self.charges.lock().unwrap();
        if let Some(existing) = charges.get(&charge.idempotency_key) {
            return Ok(UsageChargeResult {
                created: false,
                ..*existing
            });
        }

        let cost_mills = usd_to_mills(charge.total_cost_usd);
        let mut summary = self.summary.lock().unwrap();
        let gift_applied_mills = summary.gift_balance_mills.max(0).min(cost_mills);
        let paid_usage_mills = cost_mills - gift_applied_mills;
        summary.gift_balance_mills -= gift_applied_mills;
        summary.paid_usage_month_to_date_mills += paid_usage_mills;

        let result = UsageChargeResult {
            created: true,
            gift_applied_mills,
            paid_usage_mills,
        };
        charges.insert(charge.idempotency_key.clone(), result);
        Ok(result)
    }
}

// -----------------------------------------------------------------------------
// Wiring
// -----------------------------------------------------------------------------

pub struct AlwaysHealthy;

#[async_trait]
impl HealthProbe for AlwaysHealthy {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}

/// Services over in-memory doubles, plus handles to inspect them.
pub struct TestHarness {
    pub events: Arc<InMemoryEventStore>,
    pub attempts: Arc<InMemoryAttemptStore>,
    pub billing: Arc<ScriptedBillingClient>,
    pub clock: Arc<ManualClock>,
    pub state: AppState,
}

impl TestHarness {
    pub fn new(billing: ScriptedBillingClient) -> Self {
        Self::with_limits(billing, StaticLimits::new(ShopGenerationLimits::default()))
    }

    pub fn with_limits(billing: ScriptedBillingClient, limits: StaticLimits) -> Self {
        init_tracing();

        let events = Arc::new(InMemoryEventStore::default());
        let attempts = Arc::new(InMemoryAttemptStore::default());
        let billing = Arc::new(billing);
        let clock = Arc::new(ManualClock::new(fixed_now()));

        let state = AppState {
            ledger: BillableEventLedger::new(events.clone(), billing.clone()),
            guardrail: SpendGuardrail::new(billing.clone(), clock.clone()),
            quota: QuotaLimiter::new(attempts.clone(), Arc::new(limits), clock.clone()),
            health: Arc::new(AlwaysHealthy),
        };

        Self {
            events,
            attempts,
            billing,
            clock,
            state,
        }
    }

    pub fn ledger(&self) -> &BillableEventLedger {
        &self.state.ledger
    }

    pub fn guardrail(&self) -> &SpendGuardrail {
        &self.state.guardrail
    }

    pub fn quota(&self) -> &QuotaLimiter {
        &self.state.quota
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new(ScriptedBillingClient::with_balances(1_000, 0, 1_000, true))
    }
}

/// Configuration for a server backed by the test database.
pub fn test_config(database_url: String, billing_url: String) -> UsageBillingConfig {
    UsageBillingConfig {
        common: service_core::config::Config { port: 0 },
        service_name: "usage-billing-service-test".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: database_url,
            max_connections: 4,
            min_connections: 1,
        },
        billing_service: BillingServiceConfig {
            url: billing_url,
            timeout_ms: 1_000,
            retry_budget_ms: 500,
        },
    }
}
