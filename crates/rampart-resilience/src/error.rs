//! ---
//! rampart_section: "02-resilience-core"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Error taxonomy shared by the resilience components."
//! rampart_version: "v0.1.0"
//! rampart_owner: "tbd"
//! ---
use thiserror::Error;

/// Convenience alias used by every fallible resilience operation.
pub type Result<T> = std::result::Result<T, ResilienceError>;

/// Errors raised by the resilience core.
#[derive(Debug, Error)]
pub enum ResilienceError {
    /// The wrapped operation itself failed; the original error is preserved.
    #[error(transparent)]
    Operation(#[from] anyhow::Error),
    /// A call was rejected without running because the breaker is open
    /// (or its half-open trial budget is exhausted).
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen { name: String },
    /// Every recovery attempt failed and the strategy is configured to fail.
    #[error("recovery of failure {failure_id} exhausted after {attempts} attempt(s): {last_error}")]
    RecoveryExhausted {
        failure_id: String,
        attempts: usize,
        last_error: String,
    },
    /// Recovery did not finish before the hard deadline.
    #[error("recovery of failure {failure_id} timed out after {timeout_ms}ms")]
    RecoveryTimeout { failure_id: String, timeout_ms: u64 },
    /// Recovery was handed over to the escalation path.
    #[error("failure {failure_id} on '{component}' escalated (level {level})")]
    Escalated {
        failure_id: String,
        component: String,
        level: u8,
    },
    /// `heal` was called with an id absent from the failure history.
    #[error("unknown failure id {0}")]
    UnknownFailure(String),
    /// Construction or update was attempted with an invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A chaos experiment was refused before any fault was injected.
    #[error("chaos experiment rejected: {0}")]
    ExperimentRejected(String),
    /// No experiment exists with the requested id.
    #[error("unknown chaos experiment {0}")]
    UnknownExperiment(String),
}

impl ResilienceError {
    /// Whether this error represents a breaker rejection rather than an execution failure.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. })
    }

    /// Whether this error came from the recovery deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ResilienceError::RecoveryTimeout { .. })
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        ResilienceError::Config(message.into())
    }
}
