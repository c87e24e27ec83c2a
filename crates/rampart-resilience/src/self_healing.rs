//! ---
//! rampart_section: "02-resilience-core"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Failure detection and strategy-driven recovery."
//! rampart_version: "v0.1.0"
//! rampart_owner: "tbd"
//! ---
//! Self-healing supervisor.
//!
//! Failures are recorded by [`SelfHealer::detect_failure`] and recovered by
//! [`SelfHealer::heal`] using a [`RecoveryStrategy`] resolved per component,
//! then per category, then from the configured default. Concurrent heals of
//! the same failure share one execution; heals of different failures queue
//! behind a FIFO semaphore of `max_concurrent_recoveries` slots. Each heal is
//! bounded by `recovery_timeout`, queue time included. Escalations never wait
//! for a slot.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use rampart_common::time::{duration_to_millis, duration_to_millis_f64, now_utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::circuit_breaker::CircuitState;
use crate::error::{ResilienceError, Result};
use crate::events::{EventBus, EventKind, ListenerId, ResilienceEvent};
use crate::health::{ComponentRole, HealthMonitor, HealthStatus};
use crate::manager::CircuitBreakerManager;
use crate::metrics::ResilienceMetrics;

/// Failure classification. Unknown labels are kept as [`FailureCategory::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FailureCategory {
    Network,
    Database,
    Service,
    Resource,
    Dependency,
    Timeout,
    Unknown,
    Custom(String),
}

impl FailureCategory {
    pub fn as_str(&self) -> &str {
        match self {
            FailureCategory::Network => "network",
            FailureCategory::Database => "database",
            FailureCategory::Service => "service",
            FailureCategory::Resource => "resource",
            FailureCategory::Dependency => "dependency",
            FailureCategory::Timeout => "timeout",
            FailureCategory::Unknown => "unknown",
            FailureCategory::Custom(label) => label,
        }
    }
}

impl From<&str> for FailureCategory {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "network" => FailureCategory::Network,
            "database" => FailureCategory::Database,
            "service" => FailureCategory::Service,
            "resource" => FailureCategory::Resource,
            "dependency" => FailureCategory::Dependency,
            "timeout" => FailureCategory::Timeout,
            "unknown" => FailureCategory::Unknown,
            _ => FailureCategory::Custom(value.trim().to_owned()),
        }
    }
}

impl From<String> for FailureCategory {
    fn from(value: String) -> Self {
        FailureCategory::from(value.as_str())
    }
}

impl From<FailureCategory> for String {
    fn from(value: FailureCategory) -> Self {
        value.as_str().to_owned()
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Escalation level used when a failure escalates without an explicit level.
    pub fn escalation_level(&self) -> u8 {
        match self {
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 3,
            Severity::Critical => 4,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(ResilienceError::config(format!("unknown severity '{other}'"))),
        }
    }
}

/// Immutable record of a detected failure.
#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    pub id: String,
    pub category: FailureCategory,
    pub component: String,
    pub error: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

/// What happens when a retry, fallback or restore strategy runs out of options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnExhausted {
    #[default]
    Escalate,
    Fail,
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Closed set of recovery policies.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RecoveryStrategy {
    Retry {
        max_attempts: u32,
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        initial_delay: Duration,
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        max_delay: Duration,
        #[serde(default = "default_backoff_multiplier")]
        backoff_multiplier: f64,
        #[serde(default)]
        on_exhausted: OnExhausted,
    },
    /// Runs the fallback action registered under `fallback`.
    Fallback {
        fallback: String,
        #[serde(default)]
        on_exhausted: OnExhausted,
    },
    Restore {
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        checkpoint_interval: Duration,
        #[serde(default)]
        on_exhausted: OnExhausted,
    },
    Escalate {
        escalation_level: u8,
        #[serde(default)]
        notification_channels: Vec<String>,
        #[serde(default)]
        requires_manual_intervention: bool,
    },
}

impl RecoveryStrategy {
    pub fn retry(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        RecoveryStrategy::Retry {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_multiplier: default_backoff_multiplier(),
            on_exhausted: OnExhausted::Escalate,
        }
    }

    pub fn fallback(name: impl Into<String>) -> Self {
        RecoveryStrategy::Fallback {
            fallback: name.into(),
            on_exhausted: OnExhausted::Escalate,
        }
    }

    pub fn restore(checkpoint_interval: Duration) -> Self {
        RecoveryStrategy::Restore {
            checkpoint_interval,
            on_exhausted: OnExhausted::Escalate,
        }
    }

    pub fn escalate(escalation_level: u8) -> Self {
        RecoveryStrategy::Escalate {
            escalation_level,
            notification_channels: Vec::new(),
            requires_manual_intervention: false,
        }
    }

    /// Replace `on_exhausted`; no effect on the escalate strategy.
    pub fn with_on_exhausted(mut self, policy: OnExhausted) -> Self {
        match &mut self {
            RecoveryStrategy::Retry { on_exhausted, .. }
            | RecoveryStrategy::Fallback { on_exhausted, .. }
            | RecoveryStrategy::Restore { on_exhausted, .. } => *on_exhausted = policy,
            RecoveryStrategy::Escalate { .. } => {}
        }
        self
    }

    pub fn name(&self) -> &'static str {
        match self {
            RecoveryStrategy::Retry { .. } => "retry",
            RecoveryStrategy::Fallback { .. } => "fallback",
            RecoveryStrategy::Restore { .. } => "restore",
            RecoveryStrategy::Escalate { .. } => "escalate",
        }
    }

    pub fn on_exhausted(&self) -> OnExhausted {
        match self {
            RecoveryStrategy::Retry { on_exhausted, .. }
            | RecoveryStrategy::Fallback { on_exhausted, .. }
            | RecoveryStrategy::Restore { on_exhausted, .. } => *on_exhausted,
            RecoveryStrategy::Escalate { .. } => OnExhausted::Escalate,
        }
    }

    /// Delay after the zero-based `attempt` failed: `initial * multiplier^attempt`, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        match self {
            RecoveryStrategy::Retry {
                initial_delay,
                max_delay,
                backoff_multiplier,
                ..
            } => {
                let factor = backoff_multiplier.max(1.0).powi(attempt.min(64) as i32);
                let scaled = initial_delay.as_secs_f64() * factor;
                if !scaled.is_finite() || scaled >= max_delay.as_secs_f64() {
                    *max_delay
                } else {
                    Duration::from_secs_f64(scaled)
                }
            }
            _ => Duration::ZERO,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            RecoveryStrategy::Retry {
                max_attempts,
                backoff_multiplier,
                ..
            } => {
                if *max_attempts == 0 {
                    return Err(ResilienceError::config("retry.max_attempts must be at least 1"));
                }
                if !backoff_multiplier.is_finite() || *backoff_multiplier < 1.0 {
                    return Err(ResilienceError::config(
                        "retry.backoff_multiplier must be a finite value >= 1.0",
                    ));
                }
            }
            RecoveryStrategy::Fallback { fallback, .. } if fallback.trim().is_empty() => {
                return Err(ResilienceError::config("fallback strategy needs a fallback name"));
            }
            _ => {}
        }
        Ok(())
    }
}

/// One executed step of a recovery.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptOutcome {
    pub attempt: usize,
    pub step: &'static str,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: f64,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryState {
    Recovered,
    Escalated,
    Failed,
}

impl RecoveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryState::Recovered => "recovered",
            RecoveryState::Escalated => "escalated",
            RecoveryState::Failed => "failed",
        }
    }
}

/// Why a recovery did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RecoveryFault {
    Timeout { timeout_ms: u64 },
    Exhausted { attempts: usize, last_error: String },
    Escalated { level: u8, reason: String },
    Aborted { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryResult {
    pub failure_id: String,
    pub component: String,
    pub strategy: String,
    pub attempts: Vec<AttemptOutcome>,
    pub final_state: RecoveryState,
    pub success: bool,
    pub total_duration_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RecoveryFault>,
    pub completed_at: DateTime<Utc>,
}

impl RecoveryResult {
    /// Error equivalent of an unsuccessful result.
    pub fn to_error(&self) -> Option<ResilienceError> {
        let failure_id = self.failure_id.clone();
        self.error.as_ref().map(|fault| match fault {
            RecoveryFault::Timeout { timeout_ms } => ResilienceError::RecoveryTimeout {
                failure_id,
                timeout_ms: *timeout_ms,
            },
            RecoveryFault::Exhausted {
                attempts,
                last_error,
            } => ResilienceError::RecoveryExhausted {
                failure_id,
                attempts: *attempts,
                last_error: last_error.clone(),
            },
            RecoveryFault::Escalated { level, .. } => ResilienceError::Escalated {
                failure_id,
                component: self.component.clone(),
                level: *level,
            },
            RecoveryFault::Aborted { reason } => ResilienceError::RecoveryExhausted {
                failure_id,
                attempts: self.attempts.len(),
                last_error: reason.clone(),
            },
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealerStatistics {
    pub total_failures: u64,
    pub total_recoveries: u64,
    pub successful_recoveries: u64,
    pub failed_recoveries: u64,
    pub active_recoveries: usize,
    pub success_rate: f64,
    pub avg_recovery_time_ms: f64,
}

/// JSON snapshot used by the restore strategy.
#[derive(Debug, Clone, Serialize)]
pub struct Checkpoint {
    pub component: String,
    pub state: serde_json::Value,
    pub taken_at: DateTime<Utc>,
    #[serde(skip)]
    taken: Instant,
}

/// Async action run during recovery: component retries, fallbacks and restores.
pub type RecoveryAction = Arc<dyn Fn(Failure) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`RecoveryAction`].
pub fn recovery_action<F, Fut>(action: F) -> RecoveryAction
where
    F: Fn(Failure) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |failure| action(failure).boxed())
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent() -> usize {
    3
}

fn default_recovery_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_escalation_threshold() -> u32 {
    5
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_auto_recover_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_history_limit() -> usize {
    1_000
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfHealerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub auto_recover: bool,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_recoveries: usize,
    #[serde(default = "default_recovery_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub recovery_timeout: Duration,
    /// Required.
    #[serde(default)]
    pub default_strategy: Option<RecoveryStrategy>,
    #[serde(default)]
    pub strategy_map: IndexMap<FailureCategory, RecoveryStrategy>,
    /// Unsuccessful recoveries per component after which heals escalate directly. 0 disables.
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: u32,
    #[serde(default = "default_health_check_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub health_check_interval: Duration,
    #[serde(default = "default_auto_recover_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub auto_recover_delay: Duration,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl SelfHealerConfig {
    pub fn new(default_strategy: RecoveryStrategy) -> Self {
        Self {
            default_strategy: Some(default_strategy),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let default = self
            .default_strategy
            .as_ref()
            .ok_or_else(|| ResilienceError::config("self_healer.default_strategy is required"))?;
        default.validate()?;
        for strategy in self.strategy_map.values() {
            strategy.validate()?;
        }
        if self.max_concurrent_recoveries == 0 {
            return Err(ResilienceError::config(
                "self_healer.max_concurrent_recoveries must be at least 1",
            ));
        }
        if self.recovery_timeout.is_zero() {
            return Err(ResilienceError::config(
                "self_healer.recovery_timeout must be greater than zero",
            ));
        }
        if self.health_check_interval.is_zero() {
            return Err(ResilienceError::config(
                "self_healer.health_check_interval must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for SelfHealerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_recover: true,
            max_concurrent_recoveries: default_max_concurrent(),
            recovery_timeout: default_recovery_timeout(),
            default_strategy: None,
            strategy_map: IndexMap::new(),
            escalation_threshold: default_escalation_threshold(),
            health_check_interval: default_health_check_interval(),
            auto_recover_delay: default_auto_recover_delay(),
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Attempt,
    Verify,
}

#[derive(Debug, Clone)]
struct Escalation {
    level: u8,
    notification_channels: Vec<String>,
    requires_manual_intervention: bool,
    reason: String,
}

enum StrategyOutcome<T> {
    Recovered(T),
    Exhausted { last_error: String },
    Escalated(Escalation),
    TimedOut,
}

#[derive(Default)]
struct AttemptLog(Mutex<Vec<AttemptOutcome>>);

impl AttemptLog {
    async fn timed<T, Fut>(&self, step: &'static str, future: Fut) -> anyhow::Result<T>
    where
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let started_at = now_utc();
        let started = Instant::now();
        let result = future.await;
        let mut entries = self.0.lock();
        let attempt = entries.len() + 1;
        entries.push(AttemptOutcome {
            attempt,
            step,
            success: result.is_ok(),
            error: result.as_ref().err().map(|err| format!("{err:#}")),
            duration_ms: duration_to_millis_f64(started.elapsed()),
            started_at,
        });
        result
    }

    fn snapshot(&self) -> Vec<AttemptOutcome> {
        self.0.lock().clone()
    }
}

#[derive(Default)]
struct RecoveryLedger {
    history: VecDeque<RecoveryResult>,
    total_failures: u64,
    total: u64,
    successful: u64,
    failed: u64,
    total_duration_ms: f64,
    unsuccessful_by_component: HashMap<String, u32>,
    finished: HashSet<String>,
}

type InFlight = Shared<BoxFuture<'static, RecoveryResult>>;

struct HealerInner {
    config: SelfHealerConfig,
    default_strategy: RecoveryStrategy,
    running: AtomicBool,
    loop_generation: AtomicU64,
    /// Token of the health loop that `stop` has not yet cancelled.
    active_loop: Mutex<Option<u64>>,
    failures: RwLock<IndexMap<String, Failure>>,
    ledger: Mutex<RecoveryLedger>,
    component_strategies: RwLock<IndexMap<String, RecoveryStrategy>>,
    recovery_actions: RwLock<HashMap<String, RecoveryAction>>,
    fallbacks: RwLock<HashMap<String, RecoveryAction>>,
    restore_actions: RwLock<HashMap<String, RecoveryAction>>,
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    slots: Semaphore,
    active: AtomicUsize,
    breakers: RwLock<Option<Arc<CircuitBreakerManager>>>,
    health: RwLock<Option<HealthMonitor>>,
    events: EventBus,
    metrics: Option<ResilienceMetrics>,
    shutdown: broadcast::Sender<()>,
}

/// Shared handle to the self-healer.
#[derive(Clone)]
pub struct SelfHealer {
    inner: Arc<HealerInner>,
}

impl SelfHealer {
    /// Fails with [`ResilienceError::Config`] when no default strategy is configured.
    pub fn new(config: SelfHealerConfig, metrics: Option<ResilienceMetrics>) -> Result<Self> {
        config.validate()?;
        let default_strategy = config
            .default_strategy
            .clone()
            .ok_or_else(|| ResilienceError::config("self_healer.default_strategy is required"))?;
        let (shutdown, _) = broadcast::channel(4);
        Ok(Self {
            inner: Arc::new(HealerInner {
                slots: Semaphore::new(config.max_concurrent_recoveries),
                running: AtomicBool::new(config.enabled),
                config,
                default_strategy,
                loop_generation: AtomicU64::new(0),
                active_loop: Mutex::new(None),
                failures: RwLock::new(IndexMap::new()),
                ledger: Mutex::new(RecoveryLedger::default()),
                component_strategies: RwLock::new(IndexMap::new()),
                recovery_actions: RwLock::new(HashMap::new()),
                fallbacks: RwLock::new(HashMap::new()),
                restore_actions: RwLock::new(HashMap::new()),
                checkpoints: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                active: AtomicUsize::new(0),
                breakers: RwLock::new(None),
                health: RwLock::new(None),
                events: EventBus::new("self-healer"),
                metrics,
                shutdown,
            }),
        })
    }

    pub fn config(&self) -> &SelfHealerConfig {
        &self.inner.config
    }

    pub fn set_circuit_breakers(&self, manager: Arc<CircuitBreakerManager>) {
        *self.inner.breakers.write() = Some(manager);
    }

    pub fn set_health_monitor(&self, monitor: HealthMonitor) {
        *self.inner.health.write() = Some(monitor);
    }

    /// Per-component strategy override, taking precedence over the category map.
    pub fn register_strategy(&self, component: impl Into<String>, strategy: RecoveryStrategy) -> Result<()> {
        strategy.validate()?;
        self.inner
            .component_strategies
            .write()
            .insert(component.into(), strategy);
        Ok(())
    }

    /// Action invoked on every retry attempt for `component`.
    pub fn register_recovery_action(&self, component: impl Into<String>, action: RecoveryAction) {
        self.inner
            .recovery_actions
            .write()
            .insert(component.into(), action);
    }

    /// Named action referenced by fallback strategies.
    pub fn register_fallback(&self, name: impl Into<String>, action: RecoveryAction) {
        self.inner.fallbacks.write().insert(name.into(), action);
    }

    pub fn register_restore_action(&self, component: impl Into<String>, action: RecoveryAction) {
        self.inner
            .restore_actions
            .write()
            .insert(component.into(), action);
    }

    /// Record a state snapshot for `component`, replacing the previous one.
    pub fn checkpoint(&self, component: impl Into<String>, state: serde_json::Value) {
        let component = component.into();
        debug!(
            target: "rampart::resilience::self_healing",
            component = %component,
            "checkpoint recorded",
        );
        self.inner.checkpoints.write().insert(
            component.clone(),
            Checkpoint {
                component,
                state,
                taken_at: now_utc(),
                taken: Instant::now(),
            },
        );
    }

    pub fn latest_checkpoint(&self, component: &str) -> Option<Checkpoint> {
        self.inner.checkpoints.read().get(component).cloned()
    }

    /// Whether `component` lacks a checkpoint younger than its restore interval.
    pub fn needs_checkpoint(&self, component: &str) -> bool {
        let Some(taken) = self
            .inner
            .checkpoints
            .read()
            .get(component)
            .map(|checkpoint| checkpoint.taken)
        else {
            return true;
        };
        match self.checkpoint_interval_for(component) {
            Some(interval) => taken.elapsed() >= interval,
            None => false,
        }
    }

    fn checkpoint_interval_for(&self, component: &str) -> Option<Duration> {
        let restore_interval = |strategy: &RecoveryStrategy| match strategy {
            RecoveryStrategy::Restore {
                checkpoint_interval,
                ..
            } => Some(*checkpoint_interval),
            _ => None,
        };
        if let Some(interval) = self
            .inner
            .component_strategies
            .read()
            .get(component)
            .and_then(restore_interval)
        {
            return Some(interval);
        }
        restore_interval(&self.inner.default_strategy).or_else(|| {
            self.inner
                .config
                .strategy_map
                .values()
                .find_map(restore_interval)
        })
    }

    /// Component override, then category mapping, then the default strategy.
    pub fn resolve_strategy(&self, component: &str, category: &FailureCategory) -> RecoveryStrategy {
        if let Some(strategy) = self.inner.component_strategies.read().get(component) {
            return strategy.clone();
        }
        self.inner
            .config
            .strategy_map
            .get(category)
            .unwrap_or(&self.inner.default_strategy)
            .clone()
    }

    /// Record a failure and, when auto-recovery is active, schedule a heal for it.
    ///
    /// Never waits on the recovery. Scheduling needs a Tokio runtime; without
    /// one the failure is only recorded.
    pub fn detect_failure(
        &self,
        category: impl Into<FailureCategory>,
        component: &str,
        error: impl fmt::Display,
        severity: Severity,
    ) -> Failure {
        let failure = self.record_failure(category.into(), component, format!("{error:#}"), severity);
        if self.inner.config.auto_recover && self.is_enabled() {
            self.schedule_recovery(&failure);
        }
        failure
    }

    fn record_failure(
        &self,
        category: FailureCategory,
        component: &str,
        error: String,
        severity: Severity,
    ) -> Failure {
        let failure = Failure {
            id: Uuid::new_v4().to_string(),
            category,
            component: component.to_owned(),
            error,
            severity,
            timestamp: now_utc(),
        };
        let evicted: Vec<String> = {
            let mut failures = self.inner.failures.write();
            failures.insert(failure.id.clone(), failure.clone());
            let mut evicted = Vec::new();
            while failures.len() > self.inner.config.history_limit.max(1) {
                if let Some((id, _)) = failures.shift_remove_index(0) {
                    evicted.push(id);
                }
            }
            evicted
        };
        {
            let mut ledger = self.inner.ledger.lock();
            ledger.total_failures += 1;
            for id in &evicted {
                ledger.finished.remove(id);
            }
        }
        if let Some(metrics) = &self.inner.metrics {
            metrics.inc_failure_detected(failure.category.as_str(), failure.severity.as_str());
        }
        warn!(
            target: "rampart::resilience::self_healing",
            failure_id = %failure.id,
            component = %failure.component,
            category = %failure.category,
            severity = %failure.severity,
            error = %failure.error,
            "failure detected",
        );
        self.inner.events.emit(
            &ResilienceEvent::new(EventKind::FailureDetected)
                .with_component(failure.component.clone())
                .with_details(serde_json::json!({
                    "failure_id": failure.id,
                    "category": failure.category,
                    "severity": failure.severity,
                    "error": failure.error,
                })),
        );
        failure
    }

    fn schedule_recovery(&self, failure: &Failure) {
        let Ok(handle) = Handle::try_current() else {
            debug!(
                target: "rampart::resilience::self_healing",
                failure_id = %failure.id,
                "no async runtime; automatic recovery not scheduled",
            );
            return;
        };
        let healer = self.clone();
        let failure_id = failure.id.clone();
        let delay = self.inner.config.auto_recover_delay;
        let mut shutdown = self.inner.shutdown.subscribe();
        handle.spawn(async move {
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.recv() => {
                    debug!(
                        target: "rampart::resilience::self_healing",
                        failure_id = %failure_id,
                        "scheduled recovery cancelled",
                    );
                    return;
                }
            }
            match healer.heal_scheduled(&failure_id) {
                Some(execution) => {
                    execution.await;
                }
                None => debug!(
                    target: "rampart::resilience::self_healing",
                    failure_id = %failure_id,
                    "scheduled recovery skipped; failure already handled or cleared",
                ),
            }
        });
    }

    /// Recover the failure with id `failure_id`.
    ///
    /// Concurrent calls for the same id share one execution and result.
    /// Only an unknown id is an error; unsuccessful recoveries are reported
    /// through the returned [`RecoveryResult`].
    pub async fn heal(&self, failure_id: &str) -> Result<RecoveryResult> {
        let failure = self
            .get_failure(failure_id)
            .ok_or_else(|| ResilienceError::UnknownFailure(failure_id.to_owned()))?;
        let execution = {
            let mut in_flight = self.inner.in_flight.lock();
            self.join_or_spawn(&mut in_flight, failure)
        };
        Ok(execution.await)
    }

    /// Automatic counterpart of [`SelfHealer::heal`]: joins an in-flight
    /// recovery but never starts a second one for a failure that already has a
    /// result, nor one for a failure that has been cleared.
    /// The finished-set is written before the in-flight entry is removed, so a
    /// missing entry under this lock means the recovery either never ran or has
    /// been recorded.
    fn heal_scheduled(&self, failure_id: &str) -> Option<InFlight> {
        let failure = self.get_failure(failure_id)?;
        let mut in_flight = self.inner.in_flight.lock();
        if !in_flight.contains_key(failure_id) && self.inner.ledger.lock().finished.contains(failure_id)
        {
            return None;
        }
        Some(self.join_or_spawn(&mut in_flight, failure))
    }

    fn join_or_spawn(&self, in_flight: &mut HashMap<String, InFlight>, failure: Failure) -> InFlight {
        if let Some(existing) = in_flight.get(&failure.id) {
            debug!(
                target: "rampart::resilience::self_healing",
                failure_id = %failure.id,
                "joining in-flight recovery",
            );
            return existing.clone();
        }
        let failure_id = failure.id.clone();
        let execution = self.spawn_recovery(failure);
        in_flight.insert(failure_id, execution.clone());
        execution
    }

    fn spawn_recovery(&self, failure: Failure) -> InFlight {
        let healer = self.clone();
        let task_failure = failure.clone();
        let task = tokio::spawn(async move {
            let _entry = InFlightEntry {
                inner: &healer.inner,
                failure_id: task_failure.id.clone(),
            };
            let probe_healer = healer.clone();
            let probe_failure = task_failure.clone();
            let probe = move |stage: Stage| {
                let healer = probe_healer.clone();
                let failure = probe_failure.clone();
                async move { healer.recovery_step(&failure, stage).await }
            };
            let strategy = healer.resolve_strategy(&task_failure.component, &task_failure.category);
            healer.execute_recovery(&task_failure, strategy, probe).await.0
        });
        let healer = self.clone();
        async move {
            match task.await {
                Ok(result) => result,
                Err(join_error) => {
                    error!(
                        target: "rampart::resilience::self_healing",
                        failure_id = %failure.id,
                        error = %join_error,
                        "recovery task aborted",
                    );
                    let result = RecoveryResult {
                        failure_id: failure.id.clone(),
                        component: failure.component.clone(),
                        strategy: "aborted".into(),
                        attempts: Vec::new(),
                        final_state: RecoveryState::Failed,
                        success: false,
                        total_duration_ms: 0.0,
                        error: Some(RecoveryFault::Aborted {
                            reason: join_error.to_string(),
                        }),
                        completed_at: now_utc(),
                    };
                    healer.finish(&result);
                    result
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn recovery_step(&self, failure: &Failure, stage: Stage) -> anyhow::Result<()> {
        if stage == Stage::Attempt {
            let action = self
                .inner
                .recovery_actions
                .read()
                .get(&failure.component)
                .cloned();
            if let Some(action) = action {
                return action(failure.clone()).await;
            }
        }
        self.probe_component(&failure.component).await
    }

    async fn probe_component(&self, component: &str) -> anyhow::Result<()> {
        let monitor = self.inner.health.read().clone();
        let Some(monitor) = monitor else {
            return Ok(());
        };
        match monitor.check_component(component).await {
            Some(result) if result.status == HealthStatus::Unhealthy => Err(anyhow!(
                "component '{}' is still unhealthy: {}",
                component,
                result.error.unwrap_or_else(|| "no detail".into())
            )),
            _ => Ok(()),
        }
    }

    /// Run `operation`; on failure record it and apply the resolved strategy inline.
    ///
    /// Retries re-invoke `operation`; fallback and restore run their action and
    /// then invoke `operation` once more. Returns the first successful value or
    /// the error equivalent of the unsuccessful recovery.
    pub async fn execute_with_healing<T, F, Fut>(
        &self,
        component: &str,
        category: impl Into<FailureCategory>,
        severity: Severity,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let failure = self.record_failure(category.into(), component, format!("{err:#}"), severity);
        let strategy = self.resolve_strategy(component, &failure.category);
        let (result, value) = self
            .execute_recovery(&failure, strategy, |_stage| operation())
            .await;
        match value {
            Some(value) => Ok(value),
            None => Err(result.to_error().unwrap_or(ResilienceError::Operation(err))),
        }
    }

    async fn execute_recovery<T, P, Fut>(
        &self,
        failure: &Failure,
        strategy: RecoveryStrategy,
        probe: P,
    ) -> (RecoveryResult, Option<T>)
    where
        P: FnMut(Stage) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let inner = &self.inner;
        let over_threshold = inner.config.escalation_threshold > 0
            && inner
                .ledger
                .lock()
                .unsuccessful_by_component
                .get(&failure.component)
                .copied()
                .unwrap_or(0)
                >= inner.config.escalation_threshold;
        let strategy_name = if over_threshold {
            "escalate"
        } else {
            strategy.name()
        };

        info!(
            target: "rampart::resilience::self_healing",
            failure_id = %failure.id,
            component = %failure.component,
            strategy = strategy_name,
            "recovery started",
        );
        inner.events.emit(
            &ResilienceEvent::new(EventKind::RecoveryStarted)
                .with_component(failure.component.clone())
                .with_details(serde_json::json!({
                    "failure_id": failure.id,
                    "strategy": strategy_name,
                })),
        );

        let log = AttemptLog::default();
        let started = Instant::now();
        let outcome = if over_threshold {
            StrategyOutcome::Escalated(Escalation {
                level: failure.severity.escalation_level(),
                notification_channels: Vec::new(),
                requires_manual_intervention: true,
                reason: format!(
                    "escalation threshold of {} unsuccessful recoveries reached",
                    inner.config.escalation_threshold
                ),
            })
        } else if matches!(strategy, RecoveryStrategy::Escalate { .. }) {
            self.drive(failure, &strategy, &log, probe).await
        } else {
            let bounded = async {
                let _permit = match inner.slots.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return StrategyOutcome::Exhausted {
                            last_error: "recovery slots closed".into(),
                        }
                    }
                };
                let _active = ActiveRecovery::enter(inner);
                self.drive(failure, &strategy, &log, probe).await
            };
            match tokio::time::timeout(inner.config.recovery_timeout, bounded).await {
                Ok(outcome) => outcome,
                Err(_) => StrategyOutcome::TimedOut,
            }
        };
        let elapsed = started.elapsed();
        let attempts = log.snapshot();

        let (final_state, fault, value) = match outcome {
            StrategyOutcome::Recovered(value) => (RecoveryState::Recovered, None, Some(value)),
            StrategyOutcome::TimedOut => (
                RecoveryState::Failed,
                Some(RecoveryFault::Timeout {
                    timeout_ms: duration_to_millis(inner.config.recovery_timeout),
                }),
                None,
            ),
            StrategyOutcome::Escalated(escalation) => {
                self.escalate(failure, &escalation);
                (
                    RecoveryState::Escalated,
                    Some(RecoveryFault::Escalated {
                        level: escalation.level,
                        reason: escalation.reason,
                    }),
                    None,
                )
            }
            StrategyOutcome::Exhausted { last_error } => match strategy.on_exhausted() {
                OnExhausted::Fail => (
                    RecoveryState::Failed,
                    Some(RecoveryFault::Exhausted {
                        attempts: attempts.len(),
                        last_error,
                    }),
                    None,
                ),
                OnExhausted::Escalate => {
                    let escalation = Escalation {
                        level: failure.severity.escalation_level(),
                        notification_channels: Vec::new(),
                        requires_manual_intervention: false,
                        reason: format!("{} strategy exhausted: {}", strategy.name(), last_error),
                    };
                    self.escalate(failure, &escalation);
                    (
                        RecoveryState::Escalated,
                        Some(RecoveryFault::Escalated {
                            level: escalation.level,
                            reason: escalation.reason,
                        }),
                        None,
                    )
                }
            },
        };

        let result = RecoveryResult {
            failure_id: failure.id.clone(),
            component: failure.component.clone(),
            strategy: strategy_name.to_owned(),
            attempts,
            final_state,
            success: final_state == RecoveryState::Recovered,
            total_duration_ms: duration_to_millis_f64(elapsed),
            error: fault,
            completed_at: now_utc(),
        };
        self.finish(&result);
        if result.success {
            self.reset_breaker(&failure.component);
        }
        (result, value)
    }

    async fn drive<T, P, Fut>(
        &self,
        failure: &Failure,
        strategy: &RecoveryStrategy,
        log: &AttemptLog,
        mut probe: P,
    ) -> StrategyOutcome<T>
    where
        P: FnMut(Stage) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        match strategy {
            RecoveryStrategy::Retry { max_attempts, .. } => {
                let max_attempts = (*max_attempts).max(1);
                let mut last_error = String::new();
                for attempt in 0..max_attempts {
                    match log.timed("retry", probe(Stage::Attempt)).await {
                        Ok(value) => return StrategyOutcome::Recovered(value),
                        Err(err) => {
                            last_error = format!("{err:#}");
                            debug!(
                                target: "rampart::resilience::self_healing",
                                failure_id = %failure.id,
                                attempt = attempt + 1,
                                max_attempts,
                                error = %last_error,
                                "recovery attempt failed",
                            );
                            if attempt + 1 < max_attempts {
                                sleep(strategy.backoff_delay(attempt)).await;
                            }
                        }
                    }
                }
                StrategyOutcome::Exhausted { last_error }
            }
            RecoveryStrategy::Fallback { fallback, .. } => {
                let action = self.inner.fallbacks.read().get(fallback).cloned();
                let applied = match action {
                    Some(action) => log.timed("fallback", action(failure.clone())).await,
                    None => {
                        log.timed("fallback", async {
                            Err::<(), _>(anyhow!("no fallback registered under '{fallback}'"))
                        })
                        .await
                    }
                };
                if let Err(err) = applied {
                    return StrategyOutcome::Exhausted {
                        last_error: format!("{err:#}"),
                    };
                }
                match log.timed("verify", probe(Stage::Verify)).await {
                    Ok(value) => StrategyOutcome::Recovered(value),
                    Err(err) => StrategyOutcome::Exhausted {
                        last_error: format!("{err:#}"),
                    },
                }
            }
            RecoveryStrategy::Restore { .. } => {
                let action = self
                    .inner
                    .restore_actions
                    .read()
                    .get(&failure.component)
                    .cloned();
                let restored = match action {
                    Some(action) => log.timed("restore", action(failure.clone())).await,
                    None => {
                        let checkpoint = self.latest_checkpoint(&failure.component);
                        log.timed("restore", async {
                            match checkpoint {
                                Some(_) => Ok(()),
                                None => Err(anyhow!(
                                    "no checkpoint recorded for '{}'",
                                    failure.component
                                )),
                            }
                        })
                        .await
                    }
                };
                if let Err(err) = restored {
                    return StrategyOutcome::Exhausted {
                        last_error: format!("{err:#}"),
                    };
                }
                match log.timed("verify", probe(Stage::Verify)).await {
                    Ok(value) => StrategyOutcome::Recovered(value),
                    Err(err) => StrategyOutcome::Exhausted {
                        last_error: format!("{err:#}"),
                    },
                }
            }
            RecoveryStrategy::Escalate {
                escalation_level,
                notification_channels,
                requires_manual_intervention,
            } => StrategyOutcome::Escalated(Escalation {
                level: *escalation_level,
                notification_channels: notification_channels.clone(),
                requires_manual_intervention: *requires_manual_intervention,
                reason: "escalate strategy selected".into(),
            }),
        }
    }

    fn escalate(&self, failure: &Failure, escalation: &Escalation) {
        warn!(
            target: "rampart::resilience::self_healing",
            failure_id = %failure.id,
            component = %failure.component,
            level = escalation.level,
            manual = escalation.requires_manual_intervention,
            reason = %escalation.reason,
            "failure escalated",
        );
        self.inner.events.emit(
            &ResilienceEvent::new(EventKind::EscalationTriggered)
                .with_component(failure.component.clone())
                .with_details(serde_json::json!({
                    "failure_id": failure.id,
                    "level": escalation.level,
                    "notification_channels": escalation.notification_channels,
                    "requires_manual_intervention": escalation.requires_manual_intervention,
                    "reason": escalation.reason,
                })),
        );
    }

    fn finish(&self, result: &RecoveryResult) {
        let inner = &self.inner;
        {
            let mut ledger = inner.ledger.lock();
            ledger.total += 1;
            ledger.total_duration_ms += result.total_duration_ms;
            ledger.finished.insert(result.failure_id.clone());
            if result.success {
                ledger.successful += 1;
                ledger.unsuccessful_by_component.remove(&result.component);
            } else {
                ledger.failed += 1;
                *ledger
                    .unsuccessful_by_component
                    .entry(result.component.clone())
                    .or_insert(0) += 1;
            }
            ledger.history.push_back(result.clone());
            while ledger.history.len() > inner.config.history_limit.max(1) {
                ledger.history.pop_front();
            }
        }
        if let Some(metrics) = &inner.metrics {
            metrics.record_recovery(
                &result.strategy,
                result.final_state.as_str(),
                Duration::from_secs_f64(result.total_duration_ms / 1_000.0),
            );
        }
        if result.success {
            info!(
                target: "rampart::resilience::self_healing",
                failure_id = %result.failure_id,
                component = %result.component,
                strategy = %result.strategy,
                attempts = result.attempts.len(),
                "recovery succeeded",
            );
        } else {
            warn!(
                target: "rampart::resilience::self_healing",
                failure_id = %result.failure_id,
                component = %result.component,
                strategy = %result.strategy,
                final_state = result.final_state.as_str(),
                "recovery unsuccessful",
            );
        }
        inner.events.emit(
            &ResilienceEvent::new(EventKind::RecoveryCompleted)
                .with_component(result.component.clone())
                .with_details(serde_json::json!({
                    "failure_id": result.failure_id,
                    "strategy": result.strategy,
                    "final_state": result.final_state,
                    "success": result.success,
                    "total_duration_ms": result.total_duration_ms,
                })),
        );
    }

    fn reset_breaker(&self, component: &str) {
        let manager = self.inner.breakers.read().clone();
        if let Some(breaker) = manager.and_then(|manager| manager.get(component)) {
            if breaker.current_state() != CircuitState::Closed {
                info!(
                    target: "rampart::resilience::self_healing",
                    component,
                    "resetting circuit breaker after recovery",
                );
                breaker.reset();
            }
        }
    }

    /// Check every monitored component and record a failure for each unhealthy one.
    pub async fn perform_health_check(&self) -> Vec<Failure> {
        let monitor = self.inner.health.read().clone();
        let Some(monitor) = monitor else {
            return Vec::new();
        };
        let mut detected = Vec::new();
        for result in monitor.check_all().await {
            if result.status != HealthStatus::Unhealthy {
                continue;
            }
            let error = result
                .error
                .clone()
                .unwrap_or_else(|| "health check reported unhealthy".into());
            let category = if error.contains("timed out") {
                FailureCategory::Timeout
            } else {
                FailureCategory::Service
            };
            let severity = match monitor.descriptor(&result.component).map(|d| d.role) {
                Some(ComponentRole::Critical) => Severity::High,
                _ => Severity::Medium,
            };
            detected.push(self.detect_failure(category, &result.component, error, severity));
        }
        detected
    }

    pub fn get_failure(&self, failure_id: &str) -> Option<Failure> {
        self.inner.failures.read().get(failure_id).cloned()
    }

    /// Recorded failures, oldest first, optionally for one component.
    pub fn get_failure_history(&self, component: Option<&str>) -> Vec<Failure> {
        self.inner
            .failures
            .read()
            .values()
            .filter(|failure| component.map_or(true, |name| failure.component == name))
            .cloned()
            .collect()
    }

    pub fn get_recovery_history(&self) -> Vec<RecoveryResult> {
        self.inner.ledger.lock().history.iter().cloned().collect()
    }

    pub fn get_statistics(&self) -> HealerStatistics {
        let ledger = self.inner.ledger.lock();
        let (success_rate, avg_recovery_time_ms) = if ledger.total == 0 {
            (0.0, 0.0)
        } else {
            (
                ledger.successful as f64 / ledger.total as f64,
                ledger.total_duration_ms / ledger.total as f64,
            )
        };
        HealerStatistics {
            total_failures: ledger.total_failures,
            total_recoveries: ledger.total,
            successful_recoveries: ledger.successful,
            failed_recoveries: ledger.failed,
            active_recoveries: self.inner.active.load(Ordering::SeqCst),
            success_rate,
            avg_recovery_time_ms,
        }
    }

    /// Drop failure and recovery records older than `before`, or all of them.
    pub fn clear_history(&self, before: Option<DateTime<Utc>>) {
        match before {
            Some(cutoff) => {
                let mut dropped = Vec::new();
                self.inner.failures.write().retain(|id, failure| {
                    let keep = failure.timestamp >= cutoff;
                    if !keep {
                        dropped.push(id.clone());
                    }
                    keep
                });
                let mut ledger = self.inner.ledger.lock();
                for id in &dropped {
                    ledger.finished.remove(id);
                }
                ledger.history.retain(|result| result.completed_at >= cutoff);
            }
            None => {
                self.inner.failures.write().clear();
                let mut ledger = self.inner.ledger.lock();
                ledger.history.clear();
                ledger.finished.clear();
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Enable auto-recovery and start the periodic health poll.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        if !self.inner.config.enabled {
            return None;
        }
        self.inner.running.store(true, Ordering::SeqCst);
        let token = {
            let mut active = self.inner.active_loop.lock();
            if active.is_some() {
                return None;
            }
            let token = self.inner.loop_generation.fetch_add(1, Ordering::SeqCst) + 1;
            *active = Some(token);
            token
        };
        let healer = self.clone();
        let period = self.inner.config.health_check_interval;
        let mut shutdown = self.inner.shutdown.subscribe();
        info!(
            target: "rampart::resilience::self_healing",
            interval_ms = duration_to_millis(period),
            "self-healer started",
        );
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        healer.perform_health_check().await;
                    }
                    _ = shutdown.recv() => break,
                }
            }
            let mut active = healer.inner.active_loop.lock();
            if *active == Some(token) {
                *active = None;
            }
        }))
    }

    /// Stop scheduling recoveries and cancel pending ones. In-flight recoveries finish.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.active_loop.lock().take();
        let _ = self.inner.shutdown.send(());
        info!(target: "rampart::resilience::self_healing", "self-healer stopped");
    }

    pub fn on_event<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ResilienceEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.events.unsubscribe(id)
    }
}

impl fmt::Debug for SelfHealer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfHealer")
            .field("enabled", &self.is_enabled())
            .field("statistics", &self.get_statistics())
            .finish_non_exhaustive()
    }
}

/// Counts a recovery holding a slot for as long as it lives.
struct ActiveRecovery<'a> {
    inner: &'a HealerInner,
}

impl<'a> ActiveRecovery<'a> {
    fn enter(inner: &'a HealerInner) -> Self {
        let active = inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(metrics) = &inner.metrics {
            metrics.set_active_recoveries(active);
        }
        Self { inner }
    }
}

impl Drop for ActiveRecovery<'_> {
    fn drop(&mut self) {
        let active = self.inner.active.fetch_sub(1, Ordering::SeqCst) - 1;
        if let Some(metrics) = &self.inner.metrics {
            metrics.set_active_recoveries(active);
        }
    }
}

/// Removes the coalescing entry when the recovery task ends, including on panic.
struct InFlightEntry<'a> {
    inner: &'a HealerInner,
    failure_id: String,
}

impl Drop for InFlightEntry<'_> {
    fn drop(&mut self) {
        self.inner.in_flight.lock().remove(&self.failure_id);
    }
}
