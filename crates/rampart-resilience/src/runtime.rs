//! ---
//! rampart_section: "02-resilience-core"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Constructs and wires the resilience components from configuration."
//! rampart_version: "v0.1.0"
//! rampart_owner: "tbd"
//! ---
//! Explicitly owned bundle of the five resilience components.
//!
//! Nothing here is global: every [`Resilience`] value has its own registries,
//! so independent instances (one per test, say) never share state.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::info;

use crate::chaos::{ChaosEngineering, ChaosExperiment};
use crate::config::ResilienceConfig;
use crate::degradation::{DegradationStatistics, GracefulDegradation};
use crate::error::Result;
use crate::health::{HealthMonitor, SystemHealth};
use crate::manager::{CircuitBreakerManager, NamedMetrics, StateCount};
use crate::metrics::ResilienceMetrics;
use crate::self_healing::{HealerStatistics, SelfHealer};

/// Point-in-time view of every component, as printed by `rampartd status`.
#[derive(Debug, Clone, Serialize)]
pub struct ResilienceSnapshot {
    pub breakers: Vec<NamedMetrics>,
    pub breaker_states: StateCount,
    pub breaker_health: f64,
    pub system_health: SystemHealth,
    pub self_healer: HealerStatistics,
    pub degradation: DegradationStatistics,
    pub experiments: Vec<ChaosExperiment>,
}

pub struct Resilience {
    pub breakers: Arc<CircuitBreakerManager>,
    pub health: HealthMonitor,
    pub healer: SelfHealer,
    pub degradation: GracefulDegradation,
    pub chaos: ChaosEngineering,
}

impl Resilience {
    /// Build every component, pre-create the declared breakers and wire the
    /// cross-component dependencies.
    pub fn from_config(config: &ResilienceConfig, metrics: Option<ResilienceMetrics>) -> Result<Self> {
        let breakers = Arc::new(CircuitBreakerManager::new(
            config.circuit_breakers.defaults.clone(),
            metrics.clone(),
        ));
        for (name, patch) in &config.circuit_breakers.breakers {
            breakers.get_or_create(name, Some(patch))?;
        }
        let health = HealthMonitor::new(config.health.clone(), metrics.clone())?;
        let healer = SelfHealer::new(config.self_healer.clone(), metrics.clone())?;
        let degradation = GracefulDegradation::new(config.degradation.clone(), metrics.clone())?;
        let chaos = ChaosEngineering::new(config.chaos.clone(), metrics)?;

        healer.set_circuit_breakers(breakers.clone());
        healer.set_health_monitor(health.clone());
        degradation.set_health_monitor(health.clone());
        chaos.set_components(breakers.clone(), degradation.clone(), healer.clone());

        info!(
            target: "rampart::resilience::runtime",
            breakers = breakers.names().len(),
            components = health.components().len(),
            features = degradation.get_features().len(),
            "resilience components wired",
        );
        Ok(Self {
            breakers,
            health,
            healer,
            degradation,
            chaos,
        })
    }

    /// Start the background loops of the health monitor, self-healer and degradation.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        [
            self.health.start(),
            self.healer.start(),
            self.degradation.start(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    pub fn stop(&self) {
        self.health.stop();
        self.healer.stop();
        self.degradation.stop();
    }

    pub fn snapshot(&self) -> ResilienceSnapshot {
        ResilienceSnapshot {
            breakers: self.breakers.get_all_metrics(),
            breaker_states: self.breakers.get_state_count(),
            breaker_health: self.breakers.get_overall_health(),
            system_health: self.health.get_system_health(),
            self_healer: self.healer.get_statistics(),
            degradation: self.degradation.get_statistics(),
            experiments: self.chaos.list_experiments(),
        }
    }
}

impl std::fmt::Debug for Resilience {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resilience")
            .field("breakers", &self.breakers)
            .field("healer", &self.healer)
            .field("chaos", &self.chaos)
            .finish_non_exhaustive()
    }
}
