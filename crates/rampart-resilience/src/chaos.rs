//! ---
//! rampart_section: "02-resilience-core"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Bounded fault-injection experiments against wired components."
//! rampart_version: "v0.1.0"
//! rampart_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use rampart_common::time::{duration_to_millis, now_utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::degradation::{DegradationLevel, GracefulDegradation};
use crate::error::{ResilienceError, Result};
use crate::events::{EventBus, EventKind, ListenerId, ResilienceEvent};
use crate::manager::CircuitBreakerManager;
use crate::metrics::ResilienceMetrics;
use crate::self_healing::{FailureCategory, SelfHealer, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultType {
    Latency,
    Error,
    ServiceUnavailable,
    ResourceExhaustion,
    NetworkPartition,
}

impl FaultType {
    pub const ALL: [FaultType; 5] = [
        FaultType::Latency,
        FaultType::Error,
        FaultType::ServiceUnavailable,
        FaultType::ResourceExhaustion,
        FaultType::NetworkPartition,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FaultType::Latency => "latency",
            FaultType::Error => "error",
            FaultType::ServiceUnavailable => "service-unavailable",
            FaultType::ResourceExhaustion => "resource-exhaustion",
            FaultType::NetworkPartition => "network-partition",
        }
    }

    /// Category reported to the self-healer for probe failures.
    pub fn failure_category(&self) -> FailureCategory {
        match self {
            FaultType::Latency => FailureCategory::Timeout,
            FaultType::Error | FaultType::ServiceUnavailable => FailureCategory::Service,
            FaultType::ResourceExhaustion => FailureCategory::Resource,
            FaultType::NetworkPartition => FailureCategory::Network,
        }
    }
}

impl fmt::Display for FaultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FaultType {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        FaultType::ALL
            .into_iter()
            .find(|fault| fault.as_str() == wanted)
            .ok_or_else(|| ResilienceError::config(format!("unknown fault type '{s}'")))
    }
}

fn default_latency_ms() -> u64 {
    100
}

fn default_error_rate() -> f64 {
    0.5
}

/// Fault parameters. Which fields matter depends on the [`FaultType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Added delay for latency and resource-exhaustion probes.
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u64,
    /// Probability in `[0, 1]` that an error or resource-exhaustion probe fails.
    #[serde(default = "default_error_rate")]
    pub error_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl FaultConfig {
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = duration_to_millis(latency);
        self
    }

    pub fn with_error_rate(mut self, error_rate: f64) -> Self {
        self.error_rate = error_rate;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.error_rate) {
            return Err(ResilienceError::config(format!(
                "fault error_rate must be within [0, 1], got {}",
                self.error_rate
            )));
        }
        Ok(())
    }
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            latency_ms: default_latency_ms(),
            error_rate: default_error_rate(),
            message: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_allowed_faults() -> Vec<FaultType> {
    vec![FaultType::Latency, FaultType::Error]
}

fn default_max_concurrent() -> usize {
    1
}

fn default_duration() -> Duration {
    Duration::from_secs(10)
}

fn default_sample_interval() -> Duration {
    Duration::from_millis(100)
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaosConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// When set, only `allowed_faults` may be injected.
    #[serde(default = "default_true")]
    pub safe_mode: bool,
    #[serde(default = "default_allowed_faults")]
    pub allowed_faults: Vec<FaultType>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_experiments: usize,
    #[serde(default = "default_duration")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub default_duration: Duration,
    #[serde(default)]
    pub require_approval: bool,
    /// Period of probe calls and state samples.
    #[serde(default = "default_sample_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub sample_interval: Duration,
    /// Fixed seed for reproducible probabilistic faults.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl ChaosConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_experiments == 0 {
            return Err(ResilienceError::config(
                "chaos.max_concurrent_experiments must be at least 1",
            ));
        }
        if self.default_duration.is_zero() {
            return Err(ResilienceError::config("chaos.default_duration must be greater than zero"));
        }
        if self.sample_interval.is_zero() {
            return Err(ResilienceError::config("chaos.sample_interval must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            safe_mode: true,
            allowed_faults: default_allowed_faults(),
            max_concurrent_experiments: default_max_concurrent(),
            default_duration: default_duration(),
            require_approval: false,
            sample_interval: default_sample_interval(),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    Running,
    Completed,
    Aborted,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Running => "running",
            ExperimentStatus::Completed => "completed",
            ExperimentStatus::Aborted => "aborted",
        }
    }
}

/// State of the wired components at one point of an experiment.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentSample {
    pub elapsed_ms: u64,
    pub breaker_state: CircuitState,
    pub degradation_level: DegradationLevel,
    pub active_recoveries: usize,
}

/// Observed reactions of the wired components.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExperimentResults {
    pub probes: u64,
    pub probe_failures: u64,
    pub probe_rejections: u64,
    pub circuit_tripped: bool,
    pub degradation_activated: bool,
    pub peak_degradation: Option<DegradationLevel>,
    pub failures_reported: u64,
    pub recoveries_triggered: u64,
    pub samples: Vec<ExperimentSample>,
}

#[serde_as]
#[derive(Debug, Clone, Serialize)]
pub struct ChaosExperiment {
    pub id: String,
    pub name: String,
    pub fault_type: FaultType,
    pub target: String,
    pub fault_config: FaultConfig,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub duration: Duration,
    pub status: ExperimentStatus,
    pub results: ExperimentResults,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// What an approver is asked to sign off.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentRequest {
    pub name: String,
    pub fault_type: FaultType,
    pub target: String,
    pub fault_config: FaultConfig,
    pub duration: Duration,
}

pub type Approver = Arc<dyn Fn(&ExperimentRequest) -> bool + Send + Sync>;

#[derive(Clone)]
struct Components {
    breakers: Arc<CircuitBreakerManager>,
    degradation: GracefulDegradation,
    healer: SelfHealer,
}

enum ProbeOutcome {
    Passed,
    Failed,
    Rejected,
}

struct ChaosInner {
    config: ChaosConfig,
    components: RwLock<Option<Components>>,
    approver: RwLock<Option<Approver>>,
    experiments: RwLock<IndexMap<String, ChaosExperiment>>,
    running: Mutex<HashMap<String, watch::Sender<bool>>>,
    rng: Mutex<StdRng>,
    events: EventBus,
    metrics: Option<ResilienceMetrics>,
}

/// Runs chaos experiments. Cheap to clone.
#[derive(Clone)]
pub struct ChaosEngineering {
    inner: Arc<ChaosInner>,
}

impl ChaosEngineering {
    pub fn new(config: ChaosConfig, metrics: Option<ResilienceMetrics>) -> Result<Self> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            inner: Arc::new(ChaosInner {
                config,
                components: RwLock::new(None),
                approver: RwLock::new(None),
                experiments: RwLock::new(IndexMap::new()),
                running: Mutex::new(HashMap::new()),
                rng: Mutex::new(rng),
                events: EventBus::new("chaos-engineering"),
                metrics,
            }),
        })
    }

    pub fn config(&self) -> &ChaosConfig {
        &self.inner.config
    }

    /// Wire the components whose reactions experiments observe.
    pub fn set_components(
        &self,
        breakers: Arc<CircuitBreakerManager>,
        degradation: GracefulDegradation,
        healer: SelfHealer,
    ) {
        *self.inner.components.write() = Some(Components {
            breakers,
            degradation,
            healer,
        });
    }

    pub fn set_approver<F>(&self, approver: F)
    where
        F: Fn(&ExperimentRequest) -> bool + Send + Sync + 'static,
    {
        *self.inner.approver.write() = Some(Arc::new(approver));
    }

    /// Inject `fault_type` against `target` for `duration` (or the default duration).
    ///
    /// Probe calls go through the target's circuit breaker every
    /// `sample_interval`; failed probes are reported to the self-healer.
    /// Returns the finished experiment, `completed` or `aborted`.
    pub async fn run_experiment(
        &self,
        name: &str,
        fault_type: FaultType,
        target: &str,
        fault_config: FaultConfig,
        duration: Option<Duration>,
    ) -> Result<ChaosExperiment> {
        let inner = &self.inner;
        let config = &inner.config;
        let duration = duration.unwrap_or(config.default_duration);
        if !config.enabled {
            return Err(ResilienceError::ExperimentRejected(
                "chaos engineering is disabled".into(),
            ));
        }
        if config.safe_mode && !config.allowed_faults.contains(&fault_type) {
            return Err(ResilienceError::ExperimentRejected(format!(
                "fault '{fault_type}' is not allowed in safe mode"
            )));
        }
        fault_config.validate()?;
        let components = inner.components.read().clone().ok_or_else(|| {
            ResilienceError::ExperimentRejected("components have not been wired".into())
        })?;
        if config.require_approval {
            let request = ExperimentRequest {
                name: name.to_owned(),
                fault_type,
                target: target.to_owned(),
                fault_config: fault_config.clone(),
                duration,
            };
            let approver = inner.approver.read().clone();
            let approved = approver.map_or(false, |approve| approve(&request));
            if !approved {
                return Err(ResilienceError::ExperimentRejected(format!(
                    "experiment '{name}' was not approved"
                )));
            }
        }

        let id = Uuid::new_v4().to_string();
        let mut abort = {
            let mut running = inner.running.lock();
            if running.len() >= config.max_concurrent_experiments {
                return Err(ResilienceError::ExperimentRejected(format!(
                    "{} experiment(s) already running",
                    running.len()
                )));
            }
            let (tx, rx) = watch::channel(false);
            running.insert(id.clone(), tx);
            rx
        };
        let _slot = ExperimentSlot { inner, id: &id };

        let experiment = ChaosExperiment {
            id: id.clone(),
            name: name.to_owned(),
            fault_type,
            target: target.to_owned(),
            fault_config: fault_config.clone(),
            duration,
            status: ExperimentStatus::Running,
            results: ExperimentResults::default(),
            started_at: now_utc(),
            finished_at: None,
        };
        let started_at = experiment.started_at;
        inner.experiments.write().insert(id.clone(), experiment);
        warn!(
            target: "rampart::resilience::chaos",
            experiment = %id,
            name,
            fault = fault_type.as_str(),
            target_component = target,
            duration_ms = duration_to_millis(duration),
            "chaos experiment started",
        );
        inner.events.emit(
            &ResilienceEvent::new(EventKind::ExperimentStarted)
                .with_component(target.to_owned())
                .with_details(serde_json::json!({
                    "experiment_id": id,
                    "name": name,
                    "fault_type": fault_type,
                    "duration_ms": duration_to_millis(duration),
                })),
        );

        let breaker = components.breakers.get_or_create(target, None)?;
        let recoveries_before = components.healer.get_statistics().total_recoveries;
        let degradation_before = components.degradation.get_level();
        let clock = Instant::now();
        let deadline = tokio::time::Instant::now() + duration;
        let mut results = ExperimentResults::default();
        results
            .samples
            .push(sample(&components, &breaker, clock.elapsed()));

        let mut ticker = tokio::time::interval(config.sample_interval);
        let mut aborted = false;
        loop {
            let step = async {
                ticker.tick().await;
                self.probe(&breaker, fault_type, &fault_config).await
            };
            tokio::select! {
                outcome = step => {
                    results.probes += 1;
                    match outcome {
                        ProbeOutcome::Passed => {}
                        ProbeOutcome::Rejected => results.probe_rejections += 1,
                        ProbeOutcome::Failed => {
                            results.probe_failures += 1;
                            components.healer.detect_failure(
                                fault_type.failure_category(),
                                target,
                                format!("chaos probe failed under {fault_type} fault"),
                                Severity::Medium,
                            );
                            results.failures_reported += 1;
                        }
                    }
                    results.samples.push(sample(&components, &breaker, clock.elapsed()));
                }
                _ = sleep_until(deadline) => break,
                changed = abort.changed() => {
                    if changed.is_err() || *abort.borrow() {
                        aborted = true;
                        break;
                    }
                }
            }
        }
        results
            .samples
            .push(sample(&components, &breaker, clock.elapsed()));

        results.circuit_tripped = breaker
            .get_state_history()
            .iter()
            .any(|t| t.to == CircuitState::Open && t.timestamp >= started_at);
        let peak = results
            .samples
            .iter()
            .map(|s| s.degradation_level)
            .max()
            .unwrap_or(degradation_before);
        results.peak_degradation = Some(peak);
        results.degradation_activated = peak > degradation_before;
        results.recoveries_triggered = components
            .healer
            .get_statistics()
            .total_recoveries
            .saturating_sub(recoveries_before);

        let status = if aborted {
            ExperimentStatus::Aborted
        } else {
            ExperimentStatus::Completed
        };
        let finished = {
            let mut experiments = inner.experiments.write();
            let Some(experiment) = experiments.get_mut(&id) else {
                return Err(ResilienceError::UnknownExperiment(id.clone()));
            };
            experiment.status = status;
            experiment.results = results;
            experiment.finished_at = Some(now_utc());
            experiment.clone()
        };
        if let Some(metrics) = &inner.metrics {
            metrics.record_experiment(fault_type.as_str(), status.as_str());
        }
        info!(
            target: "rampart::resilience::chaos",
            experiment = %id,
            status = status.as_str(),
            probes = finished.results.probes,
            probe_failures = finished.results.probe_failures,
            circuit_tripped = finished.results.circuit_tripped,
            recoveries = finished.results.recoveries_triggered,
            "chaos experiment finished",
        );
        inner.events.emit(
            &ResilienceEvent::new(EventKind::ExperimentCompleted)
                .with_component(target.to_owned())
                .with_details(serde_json::json!({
                    "experiment_id": id,
                    "status": status,
                    "circuit_tripped": finished.results.circuit_tripped,
                    "degradation_activated": finished.results.degradation_activated,
                    "recoveries_triggered": finished.results.recoveries_triggered,
                })),
        );
        Ok(finished)
    }

    async fn probe(
        &self,
        breaker: &CircuitBreaker,
        fault_type: FaultType,
        fault: &FaultConfig,
    ) -> ProbeOutcome {
        let latency = Duration::from_millis(fault.latency_ms);
        let (delay, fail) = {
            let mut rng = self.inner.rng.lock();
            match fault_type {
                FaultType::Latency => (latency, false),
                FaultType::Error => (Duration::ZERO, rng.gen_bool(fault.error_rate)),
                FaultType::ServiceUnavailable | FaultType::NetworkPartition => {
                    (Duration::ZERO, true)
                }
                FaultType::ResourceExhaustion => (latency, rng.gen_bool(fault.error_rate)),
            }
        };
        let message = fault
            .message
            .clone()
            .unwrap_or_else(|| format!("injected {fault_type} fault"));
        let outcome = breaker
            .execute(|| async move {
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                if fail {
                    Err(anyhow!(message))
                } else {
                    Ok(())
                }
            })
            .await;
        match outcome {
            Ok(()) => ProbeOutcome::Passed,
            Err(err) if err.is_circuit_open() => ProbeOutcome::Rejected,
            Err(err) => {
                debug!(
                    target: "rampart::resilience::chaos",
                    breaker = breaker.name(),
                    error = %err,
                    "probe failed",
                );
                ProbeOutcome::Failed
            }
        }
    }

    /// Signal a running experiment to stop. `Ok(false)` if it already finished.
    pub fn abort_experiment(&self, id: &str) -> Result<bool> {
        if let Some(sender) = self.inner.running.lock().get(id) {
            let _ = sender.send(true);
            info!(target: "rampart::resilience::chaos", experiment = id, "abort requested");
            return Ok(true);
        }
        if self.inner.experiments.read().contains_key(id) {
            Ok(false)
        } else {
            Err(ResilienceError::UnknownExperiment(id.to_owned()))
        }
    }

    pub fn get_experiment(&self, id: &str) -> Option<ChaosExperiment> {
        self.inner.experiments.read().get(id).cloned()
    }

    pub fn list_experiments(&self) -> Vec<ChaosExperiment> {
        self.inner.experiments.read().values().cloned().collect()
    }

    pub fn active_experiments(&self) -> Vec<ChaosExperiment> {
        self.inner
            .experiments
            .read()
            .values()
            .filter(|e| e.status == ExperimentStatus::Running)
            .cloned()
            .collect()
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

impl fmt::Debug for ChaosEngineering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChaosEngineering")
            .field("config", &self.inner.config)
            .field("running", &self.inner.running.lock().len())
            .finish_non_exhaustive()
    }
}

fn sample(components: &Components, breaker: &CircuitBreaker, elapsed: Duration) -> ExperimentSample {
    ExperimentSample {
        elapsed_ms: duration_to_millis(elapsed),
        breaker_state: breaker.current_state(),
        degradation_level: components.degradation.get_level(),
        active_recoveries: components.healer.get_statistics().active_recoveries,
    }
}

/// Frees the concurrency slot; a dropped experiment is recorded as aborted.
struct ExperimentSlot<'a> {
    inner: &'a ChaosInner,
    id: &'a str,
}

impl Drop for ExperimentSlot<'_> {
    fn drop(&mut self) {
        self.inner.running.lock().remove(self.id);
        if let Some(experiment) = self.inner.experiments.write().get_mut(self.id) {
            if experiment.status == ExperimentStatus::Running {
                experiment.status = ExperimentStatus::Aborted;
                experiment.finished_at = Some(now_utc());
            }
        }
    }
}
