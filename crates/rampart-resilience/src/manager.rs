//! ---
//! rampart_section: "02-resilience-core"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Named registry of circuit breakers."
//! rampart_version: "v0.1.0"
//! rampart_owner: "tbd"
//! ---
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerPatch, CircuitState,
};
use crate::error::Result;
use crate::events::{EventBus, ListenerId, ResilienceEvent};
use crate::metrics::ResilienceMetrics;

/// Per-breaker metrics tagged with the breaker name.
#[derive(Debug, Clone, Serialize)]
pub struct NamedMetrics {
    pub name: String,
    #[serde(flatten)]
    pub metrics: CircuitBreakerMetrics,
}

/// Number of registered breakers in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCount {
    pub closed: usize,
    pub open: usize,
    #[serde(rename = "half-open")]
    pub half_open: usize,
}

/// Registry handing out one shared breaker per name.
pub struct CircuitBreakerManager {
    default_config: RwLock<CircuitBreakerConfig>,
    breakers: RwLock<IndexMap<String, Arc<CircuitBreaker>>>,
    events: Arc<EventBus>,
    metrics: Option<ResilienceMetrics>,
}

impl CircuitBreakerManager {
    /// Create a manager whose new breakers start from `default_config`.
    ///
    /// The name carried by `default_config` is ignored.
    pub fn new(default_config: CircuitBreakerConfig, metrics: Option<ResilienceMetrics>) -> Self {
        Self {
            default_config: RwLock::new(default_config),
            breakers: RwLock::new(IndexMap::new()),
            events: Arc::new(EventBus::new("circuit-breaker-manager")),
            metrics,
        }
    }

    /// Return the breaker registered under `name`, creating it on first use.
    ///
    /// `overrides` only apply when the breaker is created by this call.
    pub fn get_or_create(
        &self,
        name: &str,
        overrides: Option<&CircuitBreakerPatch>,
    ) -> Result<Arc<CircuitBreaker>> {
        if let Some(existing) = self.breakers.read().get(name) {
            return Ok(existing.clone());
        }
        let mut breakers = self.breakers.write();
        if let Some(existing) = breakers.get(name) {
            return Ok(existing.clone());
        }
        let mut config = self.default_config.read().clone();
        config.name = name.to_owned();
        if let Some(patch) = overrides {
            patch.apply_to(&mut config);
        }
        let breaker = Arc::new(CircuitBreaker::new(config)?.with_metrics(self.metrics.clone()));
        let forward = self.events.clone();
        breaker.on_event(move |event| forward.emit(event));
        breakers.insert(name.to_owned(), breaker.clone());
        info!(
            target: "rampart::resilience::manager",
            breaker = %name,
            "circuit breaker registered",
        );
        Ok(breaker)
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    /// All breakers in registration order.
    pub fn get_all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.read().values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.breakers.read().keys().cloned().collect()
    }

    /// Drop the breaker from the registry. Holders of the `Arc` keep a working,
    /// detached breaker.
    pub fn remove(&self, name: &str) -> bool {
        self.breakers.write().shift_remove(name).is_some()
    }

    pub fn clear(&self) {
        self.breakers.write().clear();
    }

    pub fn get_all_metrics(&self) -> Vec<NamedMetrics> {
        self.get_all()
            .into_iter()
            .map(|breaker| NamedMetrics {
                name: breaker.name().to_owned(),
                metrics: breaker.get_metrics(),
            })
            .collect()
    }

    /// Mean breaker health score; 100 with no breakers registered.
    pub fn get_overall_health(&self) -> f64 {
        let breakers = self.get_all();
        if breakers.is_empty() {
            return 100.0;
        }
        let total: f64 = breakers.iter().map(|b| b.get_health_score()).sum();
        total / breakers.len() as f64
    }

    pub fn get_state_count(&self) -> StateCount {
        self.get_all()
            .iter()
            .fold(StateCount::default(), |mut count, breaker| {
                match breaker.current_state() {
                    CircuitState::Closed => count.closed += 1,
                    CircuitState::Open => count.open += 1,
                    CircuitState::HalfOpen => count.half_open += 1,
                }
                count
            })
    }

    pub fn reset_all(&self) {
        for breaker in self.get_all() {
            breaker.reset();
        }
    }

    /// Change the configuration used for breakers created from now on.
    pub fn set_default_config(&self, patch: &CircuitBreakerPatch) -> Result<()> {
        let mut config = self.default_config.read().clone();
        patch.apply_to(&mut config);
        let mut probe = config.clone();
        probe.name = "default".into();
        probe.validate()?;
        *self.default_config.write() = config;
        Ok(())
    }

    pub fn default_config(&self) -> CircuitBreakerConfig {
        self.default_config.read().clone()
    }

    /// Subscribe to events from every breaker owned by this manager.
    pub fn on_event<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ResilienceEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.events.unsubscribe(id)
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default(), None)
    }
}

impl std::fmt::Debug for CircuitBreakerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerManager")
            .field("breakers", &self.names())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use anyhow::anyhow;
    use parking_lot::Mutex;

    use crate::events::EventKind;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_get_or_create_yields_one_instance() {
        let manager = Arc::new(CircuitBreakerManager::default());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.get_or_create("db", None).unwrap()
            }));
        }
        let mut instances = Vec::new();
        for handle in handles {
            instances.push(handle.await.unwrap());
        }
        let first = instances[0].clone();
        assert!(instances.iter().all(|b| Arc::ptr_eq(b, &first)));
        assert_eq!(manager.get_all().len(), 1);
    }

    #[tokio::test]
    async fn overrides_apply_only_on_creation() {
        let manager = CircuitBreakerManager::default();
        let patch = CircuitBreakerPatch::default().with_failure_threshold(1);
        let created = manager.get_or_create("api", Some(&patch)).unwrap();
        assert_eq!(created.get_config().failure_threshold, 1);
        let again = manager
            .get_or_create(
                "api",
                Some(&CircuitBreakerPatch::default().with_failure_threshold(9)),
            )
            .unwrap();
        assert!(Arc::ptr_eq(&created, &again));
        assert_eq!(again.get_config().failure_threshold, 1);
    }

    #[tokio::test]
    async fn aggregates_reflect_breaker_states() {
        let manager = CircuitBreakerManager::default();
        assert_eq!(manager.get_overall_health(), 100.0);
        let patch = CircuitBreakerPatch::default()
            .with_failure_threshold(1)
            .with_timeout(Duration::from_secs(60));
        let a = manager.get_or_create("a", Some(&patch)).unwrap();
        manager.get_or_create("b", Some(&patch)).unwrap();
        a.execute(|| async { Err::<(), _>(anyhow!("down")) })
            .await
            .unwrap_err();
        assert_eq!(
            manager.get_state_count(),
            StateCount {
                closed: 1,
                open: 1,
                half_open: 0
            }
        );
        assert_eq!(manager.get_overall_health(), 50.0);
        let metrics = manager.get_all_metrics();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].name, "a");
        assert_eq!(metrics[0].metrics.total_failures, 1);

        manager.reset_all();
        assert_eq!(manager.get_state_count().closed, 2);
        assert_eq!(manager.get_overall_health(), 100.0);
    }

    #[tokio::test]
    async fn remove_detaches_breaker() {
        let manager = CircuitBreakerManager::default();
        let held = manager.get_or_create("cache", None).unwrap();
        assert!(manager.remove("cache"));
        assert!(!manager.remove("cache"));
        assert!(manager.get("cache").is_none());
        assert_eq!(held.execute(|| async { Ok(1) }).await.unwrap(), 1);
        let fresh = manager.get_or_create("cache", None).unwrap();
        assert!(!Arc::ptr_eq(&held, &fresh));
        manager.clear();
        assert!(manager.get_all().is_empty());
    }

    #[tokio::test]
    async fn manager_forwards_breaker_events() {
        let manager = CircuitBreakerManager::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager.on_event(move |event| {
            sink.lock()
                .push((event.kind, event.component.clone().unwrap_or_default()))
        });
        let breaker = manager
            .get_or_create(
                "queue",
                Some(&CircuitBreakerPatch::default().with_failure_threshold(1)),
            )
            .unwrap();
        breaker
            .execute(|| async { Err::<(), _>(anyhow!("nack")) })
            .await
            .unwrap_err();
        assert_eq!(
            *seen.lock(),
            vec![(EventKind::CircuitOpened, "queue".to_string())]
        );
    }

    #[test]
    fn default_config_changes_affect_new_breakers() {
        let manager = CircuitBreakerManager::default();
        let before = manager.get_or_create("old", None).unwrap();
        manager
            .set_default_config(&CircuitBreakerPatch::default().with_success_threshold(4))
            .unwrap();
        let after = manager.get_or_create("new", None).unwrap();
        assert_eq!(before.get_config().success_threshold, 2);
        assert_eq!(after.get_config().success_threshold, 4);
        assert!(manager
            .set_default_config(&CircuitBreakerPatch::default().with_half_open_requests(0))
            .is_err());
    }
}
