//! ---
//! rampart_section: "02-resilience-core"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Aggregate configuration document for the resilience core."
//! rampart_version: "v0.1.0"
//! rampart_owner: "tbd"
//! ---
use indexmap::IndexMap;
use rampart_common::Validate;
use serde::{Deserialize, Serialize};

use crate::chaos::ChaosConfig;
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPatch};
use crate::degradation::DegradationConfig;
use crate::health::HealthMonitorConfig;
use crate::self_healing::SelfHealerConfig;

/// `[circuit_breakers]` section: manager defaults plus breakers created up front.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakersSection {
    #[serde(default)]
    pub defaults: CircuitBreakerConfig,
    #[serde(default)]
    pub breakers: IndexMap<String, CircuitBreakerPatch>,
}

impl CircuitBreakersSection {
    /// Effective configuration of a pre-declared breaker.
    pub fn resolve(&self, name: &str) -> CircuitBreakerConfig {
        let mut config = self.defaults.clone();
        config.name = name.to_owned();
        if let Some(patch) = self.breakers.get(name) {
            patch.apply_to(&mut config);
        }
        config
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub circuit_breakers: CircuitBreakersSection,
    #[serde(default)]
    pub health: HealthMonitorConfig,
    pub self_healer: SelfHealerConfig,
    pub degradation: DegradationConfig,
    #[serde(default)]
    pub chaos: ChaosConfig,
}

impl Validate for ResilienceConfig {
    fn validate(&self) -> anyhow::Result<()> {
        self.circuit_breakers.resolve("defaults").validate()?;
        for name in self.circuit_breakers.breakers.keys() {
            self.circuit_breakers.resolve(name).validate()?;
        }
        self.health.validate()?;
        self.self_healer.validate()?;
        self.degradation.validate()?;
        self.chaos.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::chaos::FaultType;

    const DOCUMENT: &str = r#"
        [circuit_breakers.defaults]
        failure_threshold = 4
        timeout = 5000

        [circuit_breakers.breakers.payments]
        failure_threshold = 2
        allowed_errors = ["validation"]

        [health]
        check_interval = 10000
        components = ["payments", "search"]

        [self_healer]
        max_concurrent_recoveries = 2

        [self_healer.default_strategy]
        type = "retry"
        max_attempts = 3
        initial_delay = 100
        max_delay = 2000

        [[degradation.features]]
        name = "recommendations"
        priority = 20
        degradation_levels = ["reduced", "minimal", "emergency"]

        [[degradation.rules]]
        name = "low-health"
        target_level = "minimal"
        condition = { metric = "health-score", operator = "lt", value = 40.0 }

        [chaos]
        safe_mode = true
        allowed_faults = ["latency", "error", "service-unavailable"]
    "#;

    #[test]
    fn full_document_parses_and_validates() {
        let config: ResilienceConfig = toml::from_str(DOCUMENT).unwrap();
        config.validate().unwrap();
        let payments = config.circuit_breakers.resolve("payments");
        assert_eq!(payments.failure_threshold, 2);
        assert_eq!(payments.timeout, Duration::from_secs(5));
        assert_eq!(payments.allowed_errors, vec!["validation".to_string()]);
        assert_eq!(config.health.components.len(), 2);
        assert_eq!(config.self_healer.max_concurrent_recoveries, 2);
        assert!(config.chaos.allowed_faults.contains(&FaultType::ServiceUnavailable));
    }

    #[test]
    fn missing_default_strategy_is_rejected() {
        let document = DOCUMENT.replace(
            "[self_healer.default_strategy]\n        type = \"retry\"",
            "[self_healer.unused]\n        type = \"retry\"",
        );
        let config: ResilienceConfig = toml::from_str(&document).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("default_strategy"));
    }

    #[test]
    fn degradation_section_is_required() {
        let document = r#"
            [self_healer.default_strategy]
            type = "escalate"
            escalation_level = 1
        "#;
        assert!(toml::from_str::<ResilienceConfig>(document).is_err());
    }
}
