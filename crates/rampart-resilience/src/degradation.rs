//! ---
//! rampart_section: "02-resilience-core"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Feature gating by degradation level."
//! rampart_version: "v0.1.0"
//! rampart_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use rampart_common::time::{duration_to_millis, now_utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ResilienceError, Result};
use crate::events::{EventBus, EventKind, ListenerId, ResilienceEvent};
use crate::health::{HealthMonitor, SystemHealth};
use crate::metrics::ResilienceMetrics;

/// Degradation ladder. Ordering follows severity: `Full < Reduced < Minimal < Emergency`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradationLevel {
    Full,
    Reduced,
    Minimal,
    Emergency,
}

impl DegradationLevel {
    /// Represent the level as a static label for metrics and status payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradationLevel::Full => "full",
            DegradationLevel::Reduced => "reduced",
            DegradationLevel::Minimal => "minimal",
            DegradationLevel::Emergency => "emergency",
        }
    }

    /// 0 for full service up to 3 for emergency.
    pub fn severity(&self) -> u8 {
        match self {
            DegradationLevel::Full => 0,
            DegradationLevel::Reduced => 1,
            DegradationLevel::Minimal => 2,
            DegradationLevel::Emergency => 3,
        }
    }
}

impl fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DegradationLevel {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(DegradationLevel::Full),
            "reduced" => Ok(DegradationLevel::Reduced),
            "minimal" => Ok(DegradationLevel::Minimal),
            "emergency" => Ok(DegradationLevel::Emergency),
            other => Err(ResilienceError::config(format!(
                "unknown degradation level '{other}'"
            ))),
        }
    }
}

/// Who asked for a level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradationTrigger {
    Manual,
    Automatic,
}

impl DegradationTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradationTrigger::Manual => "manual",
            DegradationTrigger::Automatic => "automatic",
        }
    }
}

fn default_true() -> bool {
    true
}

/// A gated capability. Higher `priority` means more essential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    pub priority: u32,
    /// Levels at which this feature is switched off.
    #[serde(default)]
    pub degradation_levels: Vec<DegradationLevel>,
    #[serde(default = "default_true")]
    pub base_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Feature {
    pub fn new(
        name: impl Into<String>,
        priority: u32,
        degradation_levels: impl IntoIterator<Item = DegradationLevel>,
    ) -> Self {
        Self {
            name: name.into(),
            priority,
            degradation_levels: degradation_levels.into_iter().collect(),
            base_enabled: true,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Effective enablement at `level`.
    pub fn enabled_at(&self, level: DegradationLevel) -> bool {
        self.base_enabled && !self.degradation_levels.contains(&level)
    }
}

/// Feature view including its computed state.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureStatus {
    pub name: String,
    pub priority: u32,
    pub enabled: bool,
    pub base_enabled: bool,
    pub degradation_levels: Vec<DegradationLevel>,
}

/// Health figure a rule compares against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleMetric {
    #[default]
    HealthScore,
    UnhealthyComponents,
    DegradedComponents,
}

impl RuleMetric {
    fn read(&self, health: &SystemHealth) -> f64 {
        match self {
            RuleMetric::HealthScore => health.score,
            RuleMetric::UnhealthyComponents => health.unhealthy_count() as f64,
            RuleMetric::DegradedComponents => health.degraded_count() as f64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonOperator {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
}

impl ComparisonOperator {
    fn holds(&self, observed: f64, expected: f64) -> bool {
        match self {
            ComparisonOperator::Lt => observed < expected,
            ComparisonOperator::Lte => observed <= expected,
            ComparisonOperator::Gt => observed > expected,
            ComparisonOperator::Gte => observed >= expected,
            ComparisonOperator::Eq => (observed - expected).abs() < f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    #[serde(default)]
    pub metric: RuleMetric,
    pub operator: ComparisonOperator,
    pub value: f64,
}

impl RuleCondition {
    pub fn matches(&self, health: &SystemHealth) -> bool {
        self.operator.holds(self.metric.read(health), self.value)
    }
}

/// Automatic degradation rule. `affected_features` is informational; enablement
/// always follows each feature's own `degradation_levels`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationRule {
    pub name: String,
    pub condition: RuleCondition,
    pub target_level: DegradationLevel,
    #[serde(default)]
    pub affected_features: Vec<String>,
}

fn default_recovery_check_interval() -> Duration {
    Duration::from_secs(30)
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub auto_degrade: bool,
    /// Evaluated in order; the first matching rule wins.
    #[serde(default)]
    pub rules: Vec<DegradationRule>,
    pub features: Vec<Feature>,
    #[serde(default = "default_recovery_check_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub recovery_check_interval: Duration,
}

impl DegradationConfig {
    pub fn new(features: Vec<Feature>) -> Self {
        Self {
            enabled: true,
            auto_degrade: true,
            rules: Vec::new(),
            features,
            recovery_check_interval: default_recovery_check_interval(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.features.is_empty() {
            return Err(ResilienceError::config(
                "degradation.features must list at least one feature",
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for feature in &self.features {
            if feature.name.trim().is_empty() {
                return Err(ResilienceError::config("degradation feature name is required"));
            }
            if !seen.insert(feature.name.as_str()) {
                return Err(ResilienceError::config(format!(
                    "degradation feature '{}' is declared twice",
                    feature.name
                )));
            }
        }
        if self.recovery_check_interval.is_zero() {
            return Err(ResilienceError::config(
                "degradation.recovery_check_interval must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Entry in the level-change log.
#[derive(Debug, Clone, Serialize)]
pub struct LevelChange {
    pub from: DegradationLevel,
    pub to: DegradationLevel,
    pub reason: String,
    pub trigger: DegradationTrigger,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DegradationStatistics {
    pub current_level: DegradationLevel,
    pub is_degraded: bool,
    pub total_features: usize,
    pub enabled_features: usize,
    pub disabled_features: usize,
    pub level_changes: usize,
    pub last_change: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct LevelState {
    level: DegradationLevel,
    trigger: DegradationTrigger,
    sequence: u64,
    features: IndexMap<String, Feature>,
    history: Vec<LevelChange>,
}

struct DegradationInner {
    config: DegradationConfig,
    state: Mutex<LevelState>,
    health: RwLock<Option<HealthMonitor>>,
    events: EventBus,
    metrics: Option<ResilienceMetrics>,
    shutdown: Mutex<Option<broadcast::Sender<()>>>,
}

/// Shared handle to the degradation controller.
///
/// Level changes are last-write-wins in sequence order. An automatic
/// evaluation is discarded when another change committed after it started.
#[derive(Clone)]
pub struct GracefulDegradation {
    inner: Arc<DegradationInner>,
}

impl GracefulDegradation {
    pub fn new(config: DegradationConfig, metrics: Option<ResilienceMetrics>) -> Result<Self> {
        config.validate()?;
        let features = config
            .features
            .iter()
            .map(|feature| (feature.name.clone(), feature.clone()))
            .collect();
        if let Some(metrics) = &metrics {
            metrics.record_degradation(DegradationLevel::Full);
        }
        Ok(Self {
            inner: Arc::new(DegradationInner {
                config,
                state: Mutex::new(LevelState {
                    level: DegradationLevel::Full,
                    trigger: DegradationTrigger::Manual,
                    sequence: 0,
                    features,
                    history: Vec::new(),
                }),
                health: RwLock::new(None),
                events: EventBus::new("graceful-degradation"),
                metrics,
                shutdown: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &DegradationConfig {
        &self.inner.config
    }

    pub fn set_health_monitor(&self, monitor: HealthMonitor) {
        *self.inner.health.write() = Some(monitor);
    }

    /// Move to `level`. Returns `true` when the level actually changed.
    pub fn degrade(
        &self,
        level: DegradationLevel,
        reason: impl Into<String>,
        trigger: DegradationTrigger,
    ) -> bool {
        self.commit(level, reason.into(), trigger, None)
    }

    /// Return to full service.
    pub fn recover(&self, reason: impl Into<String>) -> bool {
        self.degrade(DegradationLevel::Full, reason, DegradationTrigger::Manual)
    }

    fn commit(
        &self,
        level: DegradationLevel,
        reason: String,
        trigger: DegradationTrigger,
        expected_sequence: Option<u64>,
    ) -> bool {
        let (change, disabled) = {
            let mut state = self.inner.state.lock();
            if expected_sequence.is_some_and(|expected| expected != state.sequence) {
                debug!(
                    target: "rampart::resilience::degradation",
                    requested = %level,
                    "discarding stale automatic evaluation",
                );
                return false;
            }
            if state.level == level {
                return false;
            }
            state.sequence += 1;
            state.trigger = trigger;
            let change = LevelChange {
                from: state.level,
                to: level,
                reason,
                trigger,
                sequence: state.sequence,
                timestamp: now_utc(),
            };
            state.level = level;
            state.history.push(change.clone());
            let disabled: Vec<String> = state
                .features
                .values()
                .filter(|feature| !feature.enabled_at(level))
                .map(|feature| feature.name.clone())
                .collect();
            (change, disabled)
        };

        if change.to > change.from {
            warn!(
                target: "rampart::resilience::degradation",
                from = %change.from,
                to = %change.to,
                trigger = change.trigger.as_str(),
                reason = %change.reason,
                disabled = disabled.len(),
                "degradation level raised",
            );
        } else {
            info!(
                target: "rampart::resilience::degradation",
                from = %change.from,
                to = %change.to,
                trigger = change.trigger.as_str(),
                reason = %change.reason,
                "degradation level lowered",
            );
        }
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_degradation(change.to);
        }
        self.inner.events.emit(
            &ResilienceEvent::new(EventKind::DegradationLevelChanged).with_details(
                serde_json::json!({
                    "from": change.from,
                    "to": change.to,
                    "reason": change.reason,
                    "trigger": change.trigger,
                    "sequence": change.sequence,
                    "disabled_features": disabled,
                }),
            ),
        );
        true
    }

    /// Apply the configured rules against the wired health monitor.
    ///
    /// Returns the level that was committed, if any.
    pub fn evaluate_rules(&self) -> Option<DegradationLevel> {
        if !self.inner.config.enabled || !self.inner.config.auto_degrade {
            return None;
        }
        let monitor = self.inner.health.read().clone()?;
        let (sequence, current, trigger) = {
            let state = self.inner.state.lock();
            (state.sequence, state.level, state.trigger)
        };
        let health = monitor.get_system_health();
        let matched = self
            .inner
            .config
            .rules
            .iter()
            .find(|rule| rule.condition.matches(&health));
        let (target, reason) = match matched {
            Some(rule) => (
                rule.target_level,
                format!("rule '{}' matched (score {:.1})", rule.name, health.score),
            ),
            None if trigger == DegradationTrigger::Automatic && current != DegradationLevel::Full => (
                DegradationLevel::Full,
                format!("no degradation rule matches (score {:.1})", health.score),
            ),
            None => return None,
        };
        if target == current {
            return None;
        }
        self.commit(target, reason, DegradationTrigger::Automatic, Some(sequence))
            .then_some(target)
    }

    pub fn is_feature_enabled(&self, name: &str) -> bool {
        let state = self.inner.state.lock();
        state
            .features
            .get(name)
            .is_some_and(|feature| feature.enabled_at(state.level))
    }

    pub fn is_degraded(&self) -> bool {
        self.get_level() != DegradationLevel::Full
    }

    pub fn get_level(&self) -> DegradationLevel {
        self.inner.state.lock().level
    }

    /// Register or replace a feature.
    pub fn register_feature(&self, feature: Feature) {
        self.inner
            .state
            .lock()
            .features
            .insert(feature.name.clone(), feature);
    }

    /// Change a feature's base enablement. Returns `false` for unknown features.
    pub fn set_feature_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut state = self.inner.state.lock();
        match state.features.get_mut(name) {
            Some(feature) => {
                feature.base_enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn get_features(&self) -> Vec<FeatureStatus> {
        let state = self.inner.state.lock();
        state
            .features
            .values()
            .map(|feature| FeatureStatus {
                name: feature.name.clone(),
                priority: feature.priority,
                enabled: feature.enabled_at(state.level),
                base_enabled: feature.base_enabled,
                degradation_levels: feature.degradation_levels.clone(),
            })
            .collect()
    }

    pub fn get_history(&self) -> Vec<LevelChange> {
        self.inner.state.lock().history.clone()
    }

    pub fn get_statistics(&self) -> DegradationStatistics {
        let state = self.inner.state.lock();
        let enabled = state
            .features
            .values()
            .filter(|feature| feature.enabled_at(state.level))
            .count();
        DegradationStatistics {
            current_level: state.level,
            is_degraded: state.level != DegradationLevel::Full,
            total_features: state.features.len(),
            enabled_features: enabled,
            disabled_features: state.features.len() - enabled,
            level_changes: state.history.len(),
            last_change: state.history.last().map(|change| change.timestamp),
        }
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

    /// Evaluate rules every `recovery_check_interval` until stopped.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        if !self.inner.config.enabled || !self.inner.config.auto_degrade {
            return None;
        }
        let mut slot = self.inner.shutdown.lock();
        if slot.is_some() {
            return None;
        }
        let (tx, mut rx) = broadcast::channel(1);
        *slot = Some(tx);
        drop(slot);

        let controller = self.clone();
        let period = self.inner.config.recovery_check_interval;
        info!(
            target: "rampart::resilience::degradation",
            interval_ms = duration_to_millis(period),
            "auto-degradation started",
        );
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        controller.evaluate_rules();
                    }
                    _ = rx.recv() => break,
                }
            }
        }))
    }

    pub fn stop(&self) {
        if let Some(tx) = self.inner.shutdown.lock().take() {
            let _ = tx.send(());
            info!(target: "rampart::resilience::degradation", "auto-degradation stopped");
        }
    }
}

impl fmt::Debug for GracefulDegradation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GracefulDegradation")
            .field("level", &self.get_level())
            .finish_non_exhaustive()
    }
}
