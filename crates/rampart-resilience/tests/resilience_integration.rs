//! ---
//! rampart_section: "02-resilience-core"
//! rampart_subsection: "tests"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "End-to-end behaviour of the wired resilience components."
//! rampart_version: "v0.1.0"
//! rampart_owner: "tbd"
//! ---
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use parking_lot::Mutex;
use rampart_common::config::from_path;
use rampart_metrics::{encode_text, new_registry};
use rampart_resilience::prelude::*;
use rampart_resilience::{
    CircuitBreakerConfig, DegradationConfig, EventKind, FailureCategory, RecoveryState,
    ResilienceConfig, ResilienceMetrics, SelfHealerConfig, StateCount,
};

const CONFIG: &str = r#"
[circuit_breakers.defaults]
failure_threshold = 2
timeout = 60000

[circuit_breakers.breakers.inventory]
failure_threshold = 1

[health]
check_interval = 50
check_timeout = 100

[self_healer]
auto_recover_delay = 10

[self_healer.default_strategy]
type = "retry"
max_attempts = 2
initial_delay = 1
max_delay = 5

[degradation]
recovery_check_interval = 50

[[degradation.features]]
name = "recommendations"
priority = 20
degradation_levels = ["reduced", "minimal", "emergency"]

[[degradation.features]]
name = "checkout"
priority = 90
degradation_levels = ["emergency"]

[[degradation.rules]]
name = "unhealthy-dependency"
target_level = "minimal"
condition = { metric = "unhealthy-components", operator = "gte", value = 1.0 }

[chaos]
sample_interval = 10
seed = 11
"#;

fn load_config() -> ResilienceConfig {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();
    from_path(file.path()).unwrap()
}

#[tokio::test]
async fn open_breaker_rejects_without_invoking_operation() {
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 3,
        success_threshold: 2,
        timeout: Duration::from_millis(1000),
        ..CircuitBreakerConfig::new("svc")
    })
    .unwrap();
    for _ in 0..3 {
        breaker
            .execute(|| async { Err::<(), _>(anyhow!("boom")) })
            .await
            .unwrap_err();
    }
    assert_eq!(breaker.current_state(), CircuitState::Open);

    let invoked = Arc::new(AtomicUsize::new(0));
    let counter = invoked.clone();
    let err = breaker
        .execute(|| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(err.is_circuit_open());
    assert!(err.to_string().contains("'svc'"));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(1050)).await;
    for _ in 0..2 {
        breaker.execute(|| async { Ok(()) }).await.unwrap();
    }
    let state = breaker.get_state();
    assert_eq!(state.state, CircuitState::Closed);
    assert_eq!(state.consecutive_failures, 0);
    assert_eq!(
        state.total_requests,
        state.total_successes + state.total_failures
    );
}

#[test]
fn minimal_level_disables_only_features_that_list_it() {
    let degradation = GracefulDegradation::new(
        DegradationConfig::new(vec![
            Feature::new(
                "telemetry",
                40,
                [
                    DegradationLevel::Emergency,
                    DegradationLevel::Minimal,
                    DegradationLevel::Reduced,
                ],
            ),
            Feature::new("feature-b", 80, [DegradationLevel::Emergency]),
        ]),
        None,
    )
    .unwrap();
    degradation.degrade(
        DegradationLevel::Minimal,
        "load shedding drill",
        rampart_resilience::DegradationTrigger::Manual,
    );
    assert!(!degradation.is_feature_enabled("telemetry"));
    assert!(degradation.is_feature_enabled("feature-b"));
}

#[test]
fn detected_failure_is_listed_for_its_component() {
    let healer = SelfHealer::new(
        SelfHealerConfig::new(RecoveryStrategy::escalate(1)),
        None,
    )
    .unwrap();
    healer.detect_failure("network", "api-service", anyhow!("connection refused"), Severity::Medium);
    let history = healer.get_failure_history(Some("api-service"));
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].category, FailureCategory::Network);
}

#[tokio::test]
async fn manager_counts_breakers_per_state() {
    let manager = CircuitBreakerManager::default();
    manager.get_or_create("A", None).unwrap();
    let b = manager
        .get_or_create("B", Some(&CircuitBreakerPatch::default().with_failure_threshold(1)))
        .unwrap();
    b.execute(|| async { Err::<(), _>(anyhow!("tripped")) })
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
    let json = serde_json::to_value(manager.get_state_count()).unwrap();
    assert_eq!(json["half-open"], 0);
}

#[tokio::test]
async fn wired_components_react_to_a_failing_dependency() {
    let registry = new_registry();
    let metrics = ResilienceMetrics::new(registry.clone()).unwrap();
    let resilience = Resilience::from_config(&load_config(), Some(metrics)).unwrap();

    let inventory_up = Arc::new(Mutex::new(false));
    let probe_state = inventory_up.clone();
    resilience.health.register_component(
        "inventory",
        ComponentDescriptor::new()
            .with_check(health_check(move || {
                let up = *probe_state.lock();
                async move {
                    Ok(if up {
                        HealthStatus::Healthy
                    } else {
                        HealthStatus::Unhealthy
                    })
                }
            }))
            .required_for(["checkout"]),
    );
    let restore_flag = inventory_up.clone();
    resilience.healer.register_recovery_action(
        "inventory",
        recovery_action(move |_failure| {
            let flag = restore_flag.clone();
            async move {
                *flag.lock() = true;
                Ok(())
            }
        }),
    );

    let escalations = Arc::new(AtomicUsize::new(0));
    let level_changes = Arc::new(Mutex::new(Vec::new()));
    let counter = escalations.clone();
    resilience.healer.on_event(move |event| {
        if event.kind == EventKind::EscalationTriggered {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    let sink = level_changes.clone();
    resilience.degradation.on_event(move |event| {
        if event.kind == EventKind::DegradationLevelChanged {
            sink.lock().push(event.details.clone());
        }
    });

    let breaker = resilience.breakers.get("inventory").unwrap();
    breaker
        .execute(|| async { Err::<(), _>(anyhow!("inventory unreachable")) })
        .await
        .unwrap_err();
    assert_eq!(breaker.current_state(), CircuitState::Open);

    resilience.health.check_all().await;
    assert_eq!(
        resilience.degradation.evaluate_rules(),
        Some(DegradationLevel::Minimal)
    );
    assert!(!resilience.degradation.is_feature_enabled("recommendations"));
    assert!(resilience.degradation.is_feature_enabled("checkout"));

    let detected = resilience.healer.perform_health_check().await;
    assert_eq!(detected.len(), 1);
    let result = resilience.healer.heal(&detected[0].id).await.unwrap();
    assert_eq!(result.final_state, RecoveryState::Recovered);
    assert_eq!(breaker.current_state(), CircuitState::Closed);

    resilience.health.check_all().await;
    assert_eq!(
        resilience.degradation.evaluate_rules(),
        Some(DegradationLevel::Full)
    );
    assert!(resilience.degradation.is_feature_enabled("recommendations"));
    assert_eq!(level_changes.lock().len(), 2);
    assert_eq!(escalations.load(Ordering::SeqCst), 0);

    resilience.stop();
    let text = encode_text(&registry).unwrap();
    for family in [
        "rampart_circuit_transitions_total",
        "rampart_failures_detected_total",
        "rampart_recoveries_total",
        "rampart_health_checks_total",
        "rampart_degradation_level",
    ] {
        assert!(text.contains(family), "missing metric family {family}");
    }
}

#[tokio::test]
async fn chaos_experiment_observes_breaker_and_healer() {
    let resilience = Resilience::from_config(&load_config(), None).unwrap();
    let experiment = resilience
        .chaos
        .run_experiment(
            "checkout-errors",
            FaultType::Error,
            "checkout",
            FaultConfig::default().with_error_rate(1.0),
            Some(Duration::from_millis(150)),
        )
        .await
        .unwrap();
    assert_eq!(experiment.status, rampart_resilience::ExperimentStatus::Completed);
    assert!(experiment.results.circuit_tripped);
    // Automatic recoveries reset the breaker, so the fault trips it again.
    assert!(experiment.results.failures_reported >= 2);
    assert!(experiment.results.recoveries_triggered >= 1);
    assert_eq!(
        resilience
            .healer
            .get_failure_history(Some("checkout"))
            .len() as u64,
        experiment.results.failures_reported
    );

    let snapshot = resilience.snapshot();
    assert_eq!(snapshot.experiments.len(), 1);
    assert!(snapshot.breakers.iter().any(|b| b.name == "checkout"));
}
