//! ---
//! rampart_section: "02-resilience-core"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Prometheus metric family for the resilience core."
//! rampart_version: "v0.1.0"
//! rampart_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Result;
use prometheus::{self, Gauge, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts};
use rampart_metrics::SharedRegistry;

use crate::degradation::DegradationLevel;

/// Metrics published by the resilience components.
#[derive(Clone)]
pub struct ResilienceMetrics {
    registry: SharedRegistry,
    circuit_transitions_total: IntCounterVec,
    circuit_rejections_total: IntCounterVec,
    circuit_call_seconds: HistogramVec,
    failures_detected_total: IntCounterVec,
    recoveries_total: IntCounterVec,
    recovery_seconds: HistogramVec,
    active_recoveries: IntGauge,
    health_checks_total: IntCounterVec,
    health_score: Gauge,
    degradations_total: IntCounterVec,
    degradation_level: IntGauge,
    chaos_experiments_total: IntCounterVec,
}

impl ResilienceMetrics {
    /// Register the resilience metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let circuit_transitions_total = IntCounterVec::new(
            Opts::new(
                "rampart_circuit_transitions_total",
                "Circuit breaker state transitions by target state",
            ),
            &["breaker", "state"],
        )?;
        registry.register(Box::new(circuit_transitions_total.clone()))?;

        let circuit_rejections_total = IntCounterVec::new(
            Opts::new(
                "rampart_circuit_rejections_total",
                "Calls rejected without execution because the breaker was open",
            ),
            &["breaker"],
        )?;
        registry.register(Box::new(circuit_rejections_total.clone()))?;

        let circuit_call_seconds = HistogramVec::new(
            HistogramOpts::new(
                "rampart_circuit_call_seconds",
                "Latency of operations executed through a circuit breaker",
            )
            .buckets(prometheus::exponential_buckets(0.001, 2.0, 16)?),
            &["breaker", "outcome"],
        )?;
        registry.register(Box::new(circuit_call_seconds.clone()))?;

        let failures_detected_total = IntCounterVec::new(
            Opts::new(
                "rampart_failures_detected_total",
                "Failures recorded by the self-healer",
            ),
            &["category", "severity"],
        )?;
        registry.register(Box::new(failures_detected_total.clone()))?;

        let recoveries_total = IntCounterVec::new(
            Opts::new(
                "rampart_recoveries_total",
                "Completed recoveries by strategy and final state",
            ),
            &["strategy", "final_state"],
        )?;
        registry.register(Box::new(recoveries_total.clone()))?;

        let recovery_seconds = HistogramVec::new(
            HistogramOpts::new(
                "rampart_recovery_seconds",
                "Wall-clock duration of recovery executions",
            )
            .buckets(prometheus::exponential_buckets(0.001, 2.0, 16)?),
            &["strategy"],
        )?;
        registry.register(Box::new(recovery_seconds.clone()))?;

        let active_recoveries = IntGauge::with_opts(Opts::new(
            "rampart_active_recoveries",
            "Recoveries currently holding a concurrency slot",
        ))?;
        registry.register(Box::new(active_recoveries.clone()))?;

        let health_checks_total = IntCounterVec::new(
            Opts::new(
                "rampart_health_checks_total",
                "Health checks executed by component and resulting status",
            ),
            &["component", "status"],
        )?;
        registry.register(Box::new(health_checks_total.clone()))?;

        let health_score = Gauge::with_opts(Opts::new(
            "rampart_health_score",
            "Aggregate system health score (0-100)",
        ))?;
        registry.register(Box::new(health_score.clone()))?;

        let degradations_total = IntCounterVec::new(
            Opts::new(
                "rampart_degradations_total",
                "Count of degradation level transitions",
            ),
            &["level"],
        )?;
        registry.register(Box::new(degradations_total.clone()))?;

        let degradation_level = IntGauge::with_opts(Opts::new(
            "rampart_degradation_level",
            "Current degradation level (0 = full, 3 = emergency)",
        ))?;
        registry.register(Box::new(degradation_level.clone()))?;

        let chaos_experiments_total = IntCounterVec::new(
            Opts::new(
                "rampart_chaos_experiments_total",
                "Chaos experiments finished by fault type and status",
            ),
            &["fault", "status"],
        )?;
        registry.register(Box::new(chaos_experiments_total.clone()))?;

        Ok(Self {
            registry,
            circuit_transitions_total,
            circuit_rejections_total,
            circuit_call_seconds,
            failures_detected_total,
            recoveries_total,
            recovery_seconds,
            active_recoveries,
            health_checks_total,
            health_score,
            degradations_total,
            degradation_level,
            chaos_experiments_total,
        })
    }

    /// Expose the underlying shared registry for convenience.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_circuit_transition(&self, breaker: &str, state: &str) {
        self.circuit_transitions_total
            .with_label_values(&[breaker, state])
            .inc();
    }

    pub fn inc_circuit_rejection(&self, breaker: &str) {
        self.circuit_rejections_total
            .with_label_values(&[breaker])
            .inc();
    }

    pub fn observe_call(&self, breaker: &str, outcome: &str, duration: Duration) {
        self.circuit_call_seconds
            .with_label_values(&[breaker, outcome])
            .observe(duration.as_secs_f64());
    }

    pub fn inc_failure_detected(&self, category: &str, severity: &str) {
        self.failures_detected_total
            .with_label_values(&[category, severity])
            .inc();
    }

    /// Register a finished recovery for observability.
    pub fn record_recovery(&self, strategy: &str, final_state: &str, duration: Duration) {
        self.recoveries_total
            .with_label_values(&[strategy, final_state])
            .inc();
        self.recovery_seconds
            .with_label_values(&[strategy])
            .observe(duration.as_secs_f64());
    }

    pub fn set_active_recoveries(&self, active: usize) {
        self.active_recoveries.set(active as i64);
    }

    pub fn record_health_check(&self, component: &str, status: &str) {
        self.health_checks_total
            .with_label_values(&[component, status])
            .inc();
    }

    pub fn set_health_score(&self, score: f64) {
        self.health_score.set(score);
    }

    /// Track a transition into a new degradation level.
    pub fn record_degradation(&self, level: DegradationLevel) {
        self.degradations_total
            .with_label_values(&[level.as_str()])
            .inc();
        self.degradation_level.set(level.severity() as i64);
    }

    pub fn record_experiment(&self, fault: &str, status: &str) {
        self.chaos_experiments_total
            .with_label_values(&[fault, status])
            .inc();
    }
}

impl std::fmt::Debug for ResilienceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceMetrics").finish_non_exhaustive()
    }
}
