//! ---
//! rampart_section: "02-resilience-core"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Component health checks and aggregate system health."
//! rampart_version: "v0.1.0"
//! rampart_owner: "tbd"
//! ---
//! Health monitoring for named components.
//!
//! The monitor keeps the latest [`HealthCheckResult`] per component plus a
//! bounded history, derives a [`SystemHealth`] aggregate and maps the system
//! score onto a [`DegradationLevel`] band. Thresholds are configuration only:
//! graceful degradation and the self-healer act on them, the monitor never does.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use rampart_common::time::{duration_to_millis, duration_to_millis_f64, now_utc, retention_window};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::degradation::DegradationLevel;
use crate::error::{ResilienceError, Result};
use crate::events::{EventBus, EventKind, ListenerId, ResilienceEvent};
use crate::metrics::ResilienceMetrics;

/// Reported status of a component or of the whole system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    /// Score contribution of a component in this status.
    pub fn weight(&self) -> f64 {
        match self {
            HealthStatus::Healthy => 100.0,
            HealthStatus::Degraded => 50.0,
            HealthStatus::Unhealthy => 0.0,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single health check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub component: String,
    pub status: HealthStatus,
    pub last_checked: DateTime<Utc>,
    pub response_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate over the latest result of every checked component.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub overall: HealthStatus,
    pub score: f64,
    pub components: IndexMap<String, HealthCheckResult>,
}

impl SystemHealth {
    pub fn unhealthy_count(&self) -> usize {
        self.count(HealthStatus::Unhealthy)
    }

    pub fn degraded_count(&self) -> usize {
        self.count(HealthStatus::Degraded)
    }

    fn count(&self, status: HealthStatus) -> usize {
        self.components
            .values()
            .filter(|result| result.status == status)
            .count()
    }

    fn from_latest(components: IndexMap<String, HealthCheckResult>) -> Self {
        if components.is_empty() {
            return Self {
                overall: HealthStatus::Healthy,
                score: 100.0,
                components,
            };
        }
        let mut any_unhealthy = false;
        let mut all_healthy = true;
        let mut total = 0.0;
        for result in components.values() {
            total += result.status.weight();
            match result.status {
                HealthStatus::Healthy => {}
                HealthStatus::Degraded => all_healthy = false,
                HealthStatus::Unhealthy => {
                    all_healthy = false;
                    any_unhealthy = true;
                }
            }
        }
        let overall = if any_unhealthy {
            HealthStatus::Unhealthy
        } else if all_healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        let score = total / components.len() as f64;
        Self {
            overall,
            score,
            components,
        }
    }
}

/// Asynchronous check returning the component's status.
pub type HealthCheckFn =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<HealthStatus>> + Send + Sync>;

/// Wrap an async closure as a [`HealthCheckFn`].
pub fn health_check<F, Fut>(check: F) -> HealthCheckFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<HealthStatus>> + Send + 'static,
{
    Arc::new(move || check().boxed())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentRole {
    Critical,
    #[default]
    Optional,
}

/// Registration record for a monitored component.
#[derive(Clone, Default)]
pub struct ComponentDescriptor {
    pub check: Option<HealthCheckFn>,
    pub check_name: Option<String>,
    pub required_for: Vec<String>,
    pub role: ComponentRole,
    pub metadata: IndexMap<String, serde_json::Value>,
}

impl ComponentDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_check(mut self, check: HealthCheckFn) -> Self {
        self.check = Some(check);
        self
    }

    pub fn with_check_name(mut self, name: impl Into<String>) -> Self {
        self.check_name = Some(name.into());
        self
    }

    pub fn required_for<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_for = features.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_role(mut self, role: ComponentRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

impl fmt::Debug for ComponentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentDescriptor")
            .field("has_check", &self.check.is_some())
            .field("check_name", &self.check_name)
            .field("required_for", &self.required_for)
            .field("role", &self.role)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Score ceilings for each degradation band; a score below a ceiling enters that band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationThresholds {
    pub reduced: f64,
    pub minimal: f64,
    pub emergency: f64,
}

impl DegradationThresholds {
    pub fn level_for(&self, score: f64) -> DegradationLevel {
        if score < self.emergency {
            DegradationLevel::Emergency
        } else if score < self.minimal {
            DegradationLevel::Minimal
        } else if score < self.reduced {
            DegradationLevel::Reduced
        } else {
            DegradationLevel::Full
        }
    }
}

impl Default for DegradationThresholds {
    fn default() -> Self {
        Self {
            reduced: 80.0,
            minimal: 50.0,
            emergency: 25.0,
        }
    }
}

/// Per-metric alert levels. Values at or above a level classify into it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricThreshold {
    pub warning: f64,
    pub critical: f64,
    pub fatal: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdLevel {
    Normal,
    Warning,
    Critical,
    Fatal,
}

impl MetricThreshold {
    pub fn classify(&self, value: f64) -> ThresholdLevel {
        if value >= self.fatal {
            ThresholdLevel::Fatal
        } else if value >= self.critical {
            ThresholdLevel::Critical
        } else if value >= self.warning {
            ThresholdLevel::Warning
        } else {
            ThresholdLevel::Normal
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_check_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_retention_days() -> u32 {
    7
}

fn default_max_history() -> usize {
    100
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_check_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub check_interval: Duration,
    #[serde(default = "default_check_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub check_timeout: Duration,
    /// Components registered at construction without a check function.
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub degradation_thresholds: DegradationThresholds,
    #[serde(default)]
    pub thresholds: IndexMap<String, MetricThreshold>,
    #[serde(default = "default_true")]
    pub alert_on_degradation: bool,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_max_history")]
    pub max_history_per_component: usize,
}

impl HealthMonitorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.check_interval.is_zero() {
            return Err(ResilienceError::config(
                "health.check_interval must be greater than zero",
            ));
        }
        let bands = &self.degradation_thresholds;
        if !(bands.emergency <= bands.minimal && bands.minimal <= bands.reduced) {
            return Err(ResilienceError::config(
                "health.degradation_thresholds must satisfy emergency <= minimal <= reduced",
            ));
        }
        for (metric, threshold) in &self.thresholds {
            if !(threshold.warning <= threshold.critical && threshold.critical <= threshold.fatal) {
                return Err(ResilienceError::config(format!(
                    "health.thresholds.{metric} must satisfy warning <= critical <= fatal"
                )));
            }
        }
        Ok(())
    }
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: default_check_interval(),
            check_timeout: default_check_timeout(),
            components: Vec::new(),
            degradation_thresholds: DegradationThresholds::default(),
            thresholds: IndexMap::new(),
            alert_on_degradation: true,
            retention_days: default_retention_days(),
            max_history_per_component: default_max_history(),
        }
    }
}

struct MonitorInner {
    config: HealthMonitorConfig,
    components: RwLock<IndexMap<String, ComponentDescriptor>>,
    latest: RwLock<IndexMap<String, HealthCheckResult>>,
    history: Mutex<IndexMap<String, VecDeque<HealthCheckResult>>>,
    band: Mutex<DegradationLevel>,
    events: EventBus,
    metrics: Option<ResilienceMetrics>,
    shutdown: Mutex<Option<broadcast::Sender<()>>>,
}

/// Shared handle to the health monitor.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
}

impl HealthMonitor {
    pub fn new(config: HealthMonitorConfig, metrics: Option<ResilienceMetrics>) -> Result<Self> {
        config.validate()?;
        let components = config
            .components
            .iter()
            .map(|name| (name.clone(), ComponentDescriptor::default()))
            .collect();
        Ok(Self {
            inner: Arc::new(MonitorInner {
                config,
                components: RwLock::new(components),
                latest: RwLock::new(IndexMap::new()),
                history: Mutex::new(IndexMap::new()),
                band: Mutex::new(DegradationLevel::Full),
                events: EventBus::new("health-monitor"),
                metrics,
                shutdown: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &HealthMonitorConfig {
        &self.inner.config
    }

    /// Register or replace a component.
    pub fn register_component(&self, name: impl Into<String>, descriptor: ComponentDescriptor) {
        let name = name.into();
        debug!(
            target: "rampart::resilience::health",
            component = %name,
            has_check = descriptor.check.is_some(),
            "component registered",
        );
        self.inner.components.write().insert(name, descriptor);
    }

    /// Forget a component together with its latest result and history.
    pub fn unregister_component(&self, name: &str) -> bool {
        let removed = self.inner.components.write().shift_remove(name).is_some();
        self.inner.latest.write().shift_remove(name);
        self.inner.history.lock().shift_remove(name);
        removed
    }

    pub fn components(&self) -> Vec<String> {
        self.inner.components.read().keys().cloned().collect()
    }

    pub fn descriptor(&self, name: &str) -> Option<ComponentDescriptor> {
        self.inner.components.read().get(name).cloned()
    }

    /// Run `check` for `component`, record the result and return it.
    ///
    /// A check that errors or exceeds `check_timeout` is recorded as unhealthy
    /// with `error` set; nothing is propagated to the caller.
    pub async fn perform_health_check<F, Fut>(&self, component: &str, check: F) -> HealthCheckResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<HealthStatus>>,
    {
        let timeout = self.inner.config.check_timeout;
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, check()).await;
        let elapsed = started.elapsed();
        let (status, error) = match outcome {
            Ok(Ok(status)) => (status, None),
            Ok(Err(err)) => (HealthStatus::Unhealthy, Some(format!("{err:#}"))),
            Err(_) => (
                HealthStatus::Unhealthy,
                Some(format!(
                    "health check timed out after {}ms",
                    duration_to_millis(timeout)
                )),
            ),
        };
        let name = self
            .inner
            .components
            .read()
            .get(component)
            .and_then(|descriptor| descriptor.check_name.clone())
            .unwrap_or_else(|| component.to_owned());
        let result = HealthCheckResult {
            name,
            component: component.to_owned(),
            status,
            last_checked: now_utc(),
            response_time_ms: duration_to_millis_f64(elapsed),
            error,
        };
        self.record(result.clone());
        result
    }

    /// Check one registered component with its own check function.
    ///
    /// Returns `None` when the component is unknown or has no check.
    pub async fn check_component(&self, name: &str) -> Option<HealthCheckResult> {
        let check = self
            .inner
            .components
            .read()
            .get(name)
            .and_then(|descriptor| descriptor.check.clone())?;
        Some(self.perform_health_check(name, move || check()).await)
    }

    /// Check every registered component that carries a check function, in registration order.
    pub async fn check_all(&self) -> Vec<HealthCheckResult> {
        let checks: Vec<(String, HealthCheckFn)> = self
            .inner
            .components
            .read()
            .iter()
            .filter_map(|(name, descriptor)| {
                descriptor.check.clone().map(|check| (name.clone(), check))
            })
            .collect();
        let mut results = Vec::with_capacity(checks.len());
        for (name, check) in checks {
            results.push(self.perform_health_check(&name, move || check()).await);
        }
        results
    }

    fn record(&self, result: HealthCheckResult) {
        let inner = &self.inner;
        if result.status != HealthStatus::Healthy {
            warn!(
                target: "rampart::resilience::health",
                component = %result.component,
                status = %result.status,
                error = result.error.as_deref().unwrap_or(""),
                "component reported not healthy",
            );
        }
        if let Some(metrics) = &inner.metrics {
            metrics.record_health_check(&result.component, result.status.as_str());
        }
        let (system, previous, level) = {
            let mut latest = inner.latest.write();
            latest.insert(result.component.clone(), result.clone());
            let system = SystemHealth::from_latest(latest.clone());
            let level = inner.config.degradation_thresholds.level_for(system.score);
            let previous = std::mem::replace(&mut *inner.band.lock(), level);
            (system, previous, level)
        };
        {
            let cutoff = result.last_checked - retention_window(inner.config.retention_days);
            let cap = inner.config.max_history_per_component.max(1);
            let mut history = inner.history.lock();
            let entries = history.entry(result.component.clone()).or_default();
            entries.push_back(result.clone());
            while entries.len() > cap
                || entries
                    .front()
                    .is_some_and(|oldest| oldest.last_checked < cutoff)
            {
                entries.pop_front();
            }
        }

        inner.events.emit(
            &ResilienceEvent::new(EventKind::HealthCheckCompleted)
                .with_component(result.component.clone())
                .with_details(serde_json::json!({
                    "status": result.status,
                    "response_time_ms": result.response_time_ms,
                    "error": result.error,
                })),
        );

        if let Some(metrics) = &inner.metrics {
            metrics.set_health_score(system.score);
        }
        if previous != level {
            info!(
                target: "rampart::resilience::health",
                from = %previous,
                to = %level,
                score = system.score,
                "system health crossed a degradation threshold",
            );
            if inner.config.alert_on_degradation {
                inner.events.emit(
                    &ResilienceEvent::new(EventKind::HealthThresholdCrossed).with_details(
                        serde_json::json!({
                            "from": previous.as_str(),
                            "to": level.as_str(),
                            "score": system.score,
                            "overall": system.overall,
                        }),
                    ),
                );
            }
        }
    }

    pub fn get_system_health(&self) -> SystemHealth {
        SystemHealth::from_latest(self.inner.latest.read().clone())
    }

    pub fn get_component_health(&self, component: &str) -> Option<HealthCheckResult> {
        self.inner.latest.read().get(component).cloned()
    }

    /// Retained results for `component`, oldest first.
    pub fn get_history(&self, component: &str) -> Vec<HealthCheckResult> {
        self.inner
            .history
            .lock()
            .get(component)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Band the current system score falls in.
    pub fn degradation_band(&self) -> DegradationLevel {
        *self.inner.band.lock()
    }

    pub fn thresholds(&self) -> &IndexMap<String, MetricThreshold> {
        &self.inner.config.thresholds
    }

    /// Classify `value` against the configured thresholds for `metric`.
    pub fn classify_metric(&self, metric: &str, value: f64) -> Option<ThresholdLevel> {
        self.inner
            .config
            .thresholds
            .get(metric)
            .map(|threshold| threshold.classify(value))
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

    /// Start periodic checks every `check_interval`.
    ///
    /// Returns `None` when monitoring is disabled or the loop is already running.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        if !self.inner.config.enabled {
            return None;
        }
        let mut slot = self.inner.shutdown.lock();
        if slot.is_some() {
            return None;
        }
        let (tx, mut rx) = broadcast::channel(1);
        *slot = Some(tx);
        drop(slot);

        let monitor = self.clone();
        let period = self.inner.config.check_interval;
        info!(
            target: "rampart::resilience::health",
            interval_ms = duration_to_millis(period),
            "health monitor started",
        );
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.check_all().await;
                    }
                    _ = rx.recv() => {
                        debug!(target: "rampart::resilience::health", "health monitor loop stopping");
                        break;
                    }
                }
            }
        }))
    }

    pub fn stop(&self) {
        if let Some(tx) = self.inner.shutdown.lock().take() {
            let _ = tx.send(());
            info!(target: "rampart::resilience::health", "health monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.shutdown.lock().is_some()
    }
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("components", &self.components())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::anyhow;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(
            HealthMonitorConfig {
                check_timeout: Duration::from_millis(50),
                check_interval: Duration::from_millis(20),
                ..HealthMonitorConfig::default()
            },
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn failing_check_is_recorded_as_unhealthy() {
        let monitor = monitor();
        let result = monitor
            .perform_health_check("db", || async { Err(anyhow!("connection refused")) })
            .await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert!(result.error.unwrap().contains("connection refused"));
        assert_eq!(
            monitor.get_component_health("db").unwrap().status,
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn slow_check_times_out() {
        let monitor = monitor();
        let result = monitor
            .perform_health_check("slow", || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(HealthStatus::Healthy)
            })
            .await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn system_health_aggregates_latest_results() {
        let monitor = monitor();
        assert_eq!(monitor.get_system_health().overall, HealthStatus::Healthy);
        assert_eq!(monitor.get_system_health().score, 100.0);

        monitor
            .perform_health_check("a", || async { Ok(HealthStatus::Healthy) })
            .await;
        monitor
            .perform_health_check("b", || async { Ok(HealthStatus::Degraded) })
            .await;
        let health = monitor.get_system_health();
        assert_eq!(health.overall, HealthStatus::Degraded);
        assert_eq!(health.score, 75.0);

        monitor
            .perform_health_check("c", || async { Ok(HealthStatus::Unhealthy) })
            .await;
        let health = monitor.get_system_health();
        assert_eq!(health.overall, HealthStatus::Unhealthy);
        assert_eq!(health.score, 50.0);
        assert_eq!(health.unhealthy_count(), 1);
        assert_eq!(health.degraded_count(), 1);
    }

    #[tokio::test]
    async fn history_is_capped_per_component() {
        let monitor = HealthMonitor::new(
            HealthMonitorConfig {
                max_history_per_component: 3,
                ..HealthMonitorConfig::default()
            },
            None,
        )
        .unwrap();
        for _ in 0..5 {
            monitor
                .perform_health_check("api", || async { Ok(HealthStatus::Healthy) })
                .await;
        }
        assert_eq!(monitor.get_history("api").len(), 3);
        assert!(monitor.get_history("other").is_empty());
    }

    #[tokio::test]
    async fn check_all_uses_registered_checks() {
        let monitor = monitor();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        monitor.register_component(
            "cache",
            ComponentDescriptor::new()
                .with_check(health_check(move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(HealthStatus::Healthy)
                    }
                }))
                .with_check_name("cache-ping")
                .with_role(ComponentRole::Critical),
        );
        monitor.register_component("passive", ComponentDescriptor::new());
        let results = monitor.check_all().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "cache-ping");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(monitor.check_component("passive").await.is_none());
        assert!(monitor.check_component("cache").await.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(monitor.unregister_component("cache"));
        assert!(monitor.get_component_health("cache").is_none());
    }

    #[tokio::test]
    async fn emits_threshold_crossing_events() {
        let monitor = monitor();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        monitor.on_event(move |event| sink.lock().push(event.kind));
        monitor
            .perform_health_check("db", || async { Ok(HealthStatus::Unhealthy) })
            .await;
        assert_eq!(monitor.degradation_band(), DegradationLevel::Emergency);
        assert_eq!(
            *seen.lock(),
            vec![
                EventKind::HealthCheckCompleted,
                EventKind::HealthThresholdCrossed
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn band_tracks_latest_results_under_concurrent_checks() {
        let monitor = monitor();
        let mut workers = Vec::new();
        for worker in 0..6 {
            let monitor = monitor.clone();
            workers.push(tokio::spawn(async move {
                let component = format!("svc-{worker}");
                for round in 0..40 {
                    let status = if round % 2 == 0 {
                        HealthStatus::Unhealthy
                    } else {
                        HealthStatus::Healthy
                    };
                    monitor
                        .perform_health_check(&component, move || async move { Ok(status) })
                        .await;
                    tokio::task::yield_now().await;
                }
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }
        let system = monitor.get_system_health();
        assert_eq!(system.overall, HealthStatus::Healthy);
        assert_eq!(monitor.degradation_band(), DegradationLevel::Full);
        assert_eq!(
            monitor.degradation_band(),
            DegradationThresholds::default().level_for(system.score)
        );
    }

    #[tokio::test]
    async fn background_loop_runs_until_stopped() {
        let monitor = monitor();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        monitor.register_component(
            "svc",
            ComponentDescriptor::new().with_check(health_check(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(HealthStatus::Healthy)
                }
            })),
        );
        let handle = monitor.start().unwrap();
        assert!(monitor.start().is_none());
        tokio::time::sleep(Duration::from_millis(70)).await;
        monitor.stop();
        handle.await.unwrap();
        assert!(calls.load(Ordering::SeqCst) >= 2);
        assert!(!monitor.is_running());
    }

    #[test]
    fn classify_metric_uses_configured_levels() {
        let mut config = HealthMonitorConfig::default();
        config.thresholds.insert(
            "cpu".into(),
            MetricThreshold {
                warning: 70.0,
                critical: 85.0,
                fatal: 95.0,
            },
        );
        let monitor = HealthMonitor::new(config, None).unwrap();
        assert_eq!(monitor.classify_metric("cpu", 10.0), Some(ThresholdLevel::Normal));
        assert_eq!(monitor.classify_metric("cpu", 90.0), Some(ThresholdLevel::Critical));
        assert_eq!(monitor.classify_metric("cpu", 99.0), Some(ThresholdLevel::Fatal));
        assert_eq!(monitor.classify_metric("memory", 99.0), None);
    }

    #[test]
    fn inverted_bands_are_rejected() {
        let config = HealthMonitorConfig {
            degradation_thresholds: DegradationThresholds {
                reduced: 40.0,
                minimal: 60.0,
                emergency: 10.0,
            },
            ..HealthMonitorConfig::default()
        };
        assert!(matches!(
            HealthMonitor::new(config, None),
            Err(ResilienceError::Config(_))
        ));
    }
}
