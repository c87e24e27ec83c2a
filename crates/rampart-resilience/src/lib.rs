//! ---
//! rampart_section: "02-resilience-core"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Resilience orchestration core."
//! rampart_version: "v0.1.0"
//! rampart_owner: "tbd"
//! ---
//! Circuit breakers, health monitoring, self-healing, graceful degradation
//! and chaos experiments for a long-running service process.
//!
//! Components are plain owned values wired together explicitly, see
//! [`Resilience::from_config`].

pub mod chaos;
pub mod circuit_breaker;
pub mod config;
pub mod degradation;
pub mod error;
pub mod events;
pub mod health;
pub mod manager;
pub mod metrics;
pub mod runtime;
pub mod self_healing;

pub use chaos::{
    ChaosConfig, ChaosEngineering, ChaosExperiment, ExperimentRequest, ExperimentResults,
    ExperimentStatus, FaultConfig, FaultType,
};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerPatch,
    CircuitBreakerState, CircuitState, StateTransition,
};
pub use config::{CircuitBreakersSection, ResilienceConfig};
pub use degradation::{
    DegradationConfig, DegradationLevel, DegradationRule, DegradationStatistics,
    DegradationTrigger, Feature, GracefulDegradation,
};
pub use error::{ResilienceError, Result};
pub use events::{EventBus, EventKind, ListenerId, ResilienceEvent};
pub use health::{
    health_check, ComponentDescriptor, ComponentRole, HealthCheckResult, HealthMonitor,
    HealthMonitorConfig, HealthStatus, SystemHealth,
};
pub use manager::{CircuitBreakerManager, NamedMetrics, StateCount};
pub use metrics::ResilienceMetrics;
pub use runtime::{Resilience, ResilienceSnapshot};
pub use self_healing::{
    recovery_action, Failure, FailureCategory, HealerStatistics, OnExhausted, RecoveryResult,
    RecoveryState, RecoveryStrategy, SelfHealer, SelfHealerConfig, Severity,
};

/// Crate prelude collecting the types most call sites need.
pub mod prelude {
    pub use super::chaos::{ChaosEngineering, FaultConfig, FaultType};
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerPatch, CircuitState};
    pub use super::degradation::{DegradationLevel, Feature, GracefulDegradation};
    pub use super::error::{ResilienceError, Result};
    pub use super::health::{health_check, ComponentDescriptor, HealthMonitor, HealthStatus};
    pub use super::manager::CircuitBreakerManager;
    pub use super::runtime::Resilience;
    pub use super::self_healing::{recovery_action, RecoveryStrategy, SelfHealer, Severity};
}
