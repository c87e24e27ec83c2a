//! ---
//! rampart_section: "02-resilience-core"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Per-dependency circuit breaker state machine."
//! rampart_version: "v0.1.0"
//! rampart_owner: "tbd"
//! ---
//! Circuit breaker guarding calls to a single dependency.
//!
//! The breaker starts closed, opens once `failure_threshold` consecutive
//! counted failures are observed, and lazily moves to half-open on the first
//! call made after `timeout` has elapsed. While half-open at most
//! `half_open_requests` trial calls are in flight; `success_threshold`
//! consecutive successes close it again and any failure re-opens it.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rampart_common::time::duration_to_millis_f64;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::{debug, info, warn};

use crate::error::{ResilienceError, Result};
use crate::events::{EventBus, EventKind, ListenerId, ResilienceEvent};
use crate::metrics::ResilienceMetrics;

const MAX_LATENCY_SAMPLES: usize = 256;

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_monitor_window() -> Duration {
    Duration::from_secs(60)
}

fn default_half_open_requests() -> u32 {
    3
}

/// Static configuration of a breaker. Changing it at runtime resets the breaker.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default)]
    pub name: String,
    /// Consecutive counted failures that open a closed breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the breaker.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Time an open breaker waits before admitting a trial call.
    #[serde(default = "default_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout: Duration,
    /// Window used for latency averages and recent failure ratios.
    #[serde(default = "default_monitor_window")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub monitor_window: Duration,
    /// Maximum trial calls in flight while half-open.
    #[serde(default = "default_half_open_requests")]
    pub half_open_requests: u32,
    /// Error patterns that are returned to the caller but never counted as failures.
    /// A pattern matches when any error in the chain contains it.
    #[serde(default)]
    pub allowed_errors: Vec<String>,
}

impl CircuitBreakerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ResilienceError::config("circuit breaker name is required"));
        }
        if self.failure_threshold == 0 {
            return Err(ResilienceError::config(format!(
                "breaker '{}': failure_threshold must be at least 1",
                self.name
            )));
        }
        if self.success_threshold == 0 {
            return Err(ResilienceError::config(format!(
                "breaker '{}': success_threshold must be at least 1",
                self.name
            )));
        }
        if self.half_open_requests == 0 {
            return Err(ResilienceError::config(format!(
                "breaker '{}': half_open_requests must be at least 1",
                self.name
            )));
        }
        Ok(())
    }

    fn allows(&self, error: &anyhow::Error) -> bool {
        self.allowed_errors.iter().any(|pattern| {
            error
                .chain()
                .any(|cause| cause.to_string().contains(pattern.as_str()))
        })
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout: default_timeout(),
            monitor_window: default_monitor_window(),
            half_open_requests: default_half_open_requests(),
            allowed_errors: Vec::new(),
        }
    }
}

/// Partial configuration merged over an existing [`CircuitBreakerConfig`].
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerPatch {
    #[serde(default)]
    pub failure_threshold: Option<u32>,
    #[serde(default)]
    pub success_threshold: Option<u32>,
    #[serde(default)]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub monitor_window: Option<Duration>,
    #[serde(default)]
    pub half_open_requests: Option<u32>,
    #[serde(default)]
    pub allowed_errors: Option<Vec<String>>,
}

impl CircuitBreakerPatch {
    pub fn with_failure_threshold(mut self, value: u32) -> Self {
        self.failure_threshold = Some(value);
        self
    }

    pub fn with_success_threshold(mut self, value: u32) -> Self {
        self.success_threshold = Some(value);
        self
    }

    pub fn with_timeout(mut self, value: Duration) -> Self {
        self.timeout = Some(value);
        self
    }

    pub fn with_half_open_requests(mut self, value: u32) -> Self {
        self.half_open_requests = Some(value);
        self
    }

    pub fn with_allowed_errors<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_errors = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    /// Overwrite every field of `config` that this patch sets.
    pub fn apply_to(&self, config: &mut CircuitBreakerConfig) {
        if let Some(value) = self.failure_threshold {
            config.failure_threshold = value;
        }
        if let Some(value) = self.success_threshold {
            config.success_threshold = value;
        }
        if let Some(value) = self.timeout {
            config.timeout = value;
        }
        if let Some(value) = self.monitor_window {
            config.monitor_window = value;
        }
        if let Some(value) = self.half_open_requests {
            config.half_open_requests = value;
        }
        if let Some(value) = &self.allowed_errors {
            config.allowed_errors = value.clone();
        }
    }
}

/// Breaker state machine positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }

    fn event_kind(&self) -> EventKind {
        match self {
            CircuitState::Closed => EventKind::CircuitClosed,
            CircuitState::Open => EventKind::CircuitOpened,
            CircuitState::HalfOpen => EventKind::CircuitHalfOpen,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the append-only transition log.
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot of a breaker's runtime counters.
///
/// `total_requests == total_successes + total_failures` always holds.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failures: u64,
    pub successes: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub half_open_attempts: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub state_history: Vec<StateTransition>,
}

impl CircuitBreakerState {
    fn initial() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_requests: 0,
            total_successes: 0,
            total_failures: 0,
            half_open_attempts: 0,
            opened_at: None,
            state_history: Vec::new(),
        }
    }
}

/// Derived rates and latency figures.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub consecutive_failures: u32,
    pub recent_failures: u64,
    pub rejected_requests: u64,
    pub avg_response_time_ms: f64,
}

/// Whether an open breaker may admit a trial call at `now`.
pub fn trial_due(
    state: CircuitState,
    opened_at: Option<Instant>,
    now: Instant,
    timeout: Duration,
) -> bool {
    state == CircuitState::Open
        && opened_at.map_or(true, |at| now.saturating_duration_since(at) >= timeout)
}

#[derive(Debug, Clone, Copy)]
struct CallSample {
    at: Instant,
    latency: Duration,
    failed: bool,
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Success,
    Allowed,
    Failure,
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Allowed => "allowed",
            Outcome::Failure => "failure",
        }
    }
}

/// Admission token handed out by `admit`; `trial_epoch` is set for half-open trials.
#[derive(Debug, Clone, Copy)]
struct Ticket {
    generation: u64,
    trial_epoch: Option<u64>,
}

#[derive(Debug)]
struct BreakerInner {
    config: CircuitBreakerConfig,
    state: CircuitBreakerState,
    opened_instant: Option<Instant>,
    generation: u64,
    trial_epoch: u64,
    rejected: u64,
    samples: VecDeque<CallSample>,
}

impl BreakerInner {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitBreakerState::initial(),
            opened_instant: None,
            generation: 0,
            trial_epoch: 0,
            rejected: 0,
            samples: VecDeque::new(),
        }
    }

    fn transition(
        &mut self,
        to: CircuitState,
        reason: impl Into<String>,
        pending: &mut Vec<ResilienceEvent>,
    ) {
        let from = self.state.state;
        if from == to {
            return;
        }
        let reason = reason.into();
        let now = Utc::now();
        self.state.state = to;
        match to {
            CircuitState::Open => {
                self.state.opened_at = Some(now);
                self.opened_instant = Some(Instant::now());
                self.state.half_open_attempts = 0;
                self.state.consecutive_successes = 0;
            }
            CircuitState::HalfOpen => {
                self.trial_epoch += 1;
                self.state.half_open_attempts = 0;
                self.state.consecutive_successes = 0;
            }
            CircuitState::Closed => {
                self.state.failures = 0;
                self.state.successes = 0;
                self.state.consecutive_failures = 0;
                self.state.consecutive_successes = 0;
                self.state.half_open_attempts = 0;
                self.state.opened_at = None;
                self.opened_instant = None;
            }
        }
        self.state.state_history.push(StateTransition {
            from,
            to,
            reason: reason.clone(),
            timestamp: now,
        });
        pending.push(
            ResilienceEvent::new(to.event_kind())
                .with_component(self.config.name.clone())
                .with_details(serde_json::json!({
                    "from": from.as_str(),
                    "to": to.as_str(),
                    "reason": reason,
                })),
        );
    }

    fn release_trial(&mut self, ticket: &Ticket) {
        let Some(epoch) = ticket.trial_epoch else {
            return;
        };
        if ticket.generation == self.generation
            && epoch == self.trial_epoch
            && self.state.state == CircuitState::HalfOpen
        {
            self.state.half_open_attempts = self.state.half_open_attempts.saturating_sub(1);
        }
    }

    fn push_sample(&mut self, sample: CallSample) {
        let window = self.config.monitor_window;
        while let Some(front) = self.samples.front() {
            if sample.at.saturating_duration_since(front.at) > window
                || self.samples.len() >= MAX_LATENCY_SAMPLES
            {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        self.samples.push_back(sample);
    }

    fn recent_samples(&self, now: Instant) -> impl Iterator<Item = &CallSample> {
        let window = self.config.monitor_window;
        self.samples
            .iter()
            .filter(move |sample| now.saturating_duration_since(sample.at) <= window)
    }

    fn record(&mut self, outcome: Outcome, latency: Duration, pending: &mut Vec<ResilienceEvent>) {
        let now = Instant::now();
        self.state.total_requests += 1;
        self.push_sample(CallSample {
            at: now,
            latency,
            failed: matches!(outcome, Outcome::Failure),
        });
        match outcome {
            Outcome::Allowed => {
                self.state.total_successes += 1;
            }
            Outcome::Success => {
                self.state.total_successes += 1;
                self.state.successes += 1;
                self.state.consecutive_successes += 1;
                self.state.consecutive_failures = 0;
                if self.state.state == CircuitState::HalfOpen
                    && self.state.consecutive_successes >= self.config.success_threshold
                {
                    let reason = format!(
                        "success threshold reached in half-open ({}/{})",
                        self.state.consecutive_successes, self.config.success_threshold
                    );
                    self.transition(CircuitState::Closed, reason, pending);
                }
            }
            Outcome::Failure => {
                self.state.total_failures += 1;
                self.state.failures += 1;
                self.state.consecutive_failures += 1;
                self.state.consecutive_successes = 0;
                match self.state.state {
                    CircuitState::HalfOpen => {
                        self.transition(
                            CircuitState::Open,
                            "trial call failed while half-open",
                            pending,
                        );
                    }
                    CircuitState::Closed
                        if self.state.consecutive_failures >= self.config.failure_threshold =>
                    {
                        let reason = format!(
                            "failure threshold reached ({}/{})",
                            self.state.consecutive_failures, self.config.failure_threshold
                        );
                        self.transition(CircuitState::Open, reason, pending);
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Events waiting for delivery, in the order their transitions were recorded.
#[derive(Default)]
struct Outbox {
    queue: VecDeque<ResilienceEvent>,
    draining: bool,
}

/// Circuit breaker wrapping calls to one protected dependency.
pub struct CircuitBreaker {
    name: String,
    inner: Mutex<BreakerInner>,
    outbox: Mutex<Outbox>,
    events: EventBus,
    metrics: Option<ResilienceMetrics>,
}

impl CircuitBreaker {
    /// Build a breaker from a validated configuration.
    pub fn new(config: CircuitBreakerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: config.name.clone(),
            inner: Mutex::new(BreakerInner::new(config)),
            outbox: Mutex::new(Outbox::default()),
            events: EventBus::new("circuit-breaker"),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Option<ResilienceMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_config(&self) -> CircuitBreakerConfig {
        self.inner.lock().config.clone()
    }

    /// Run `operation` through the breaker.
    ///
    /// Returns [`ResilienceError::CircuitOpen`] without invoking the operation
    /// when the breaker is open or the half-open trial budget is in use.
    /// Operation errors are returned as [`ResilienceError::Operation`].
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let ticket = self.admit()?;
        let permit = TrialPermit {
            breaker: self,
            ticket,
            settled: false,
        };
        let started = Instant::now();
        let result = operation().await;
        let elapsed = started.elapsed();
        match result {
            Ok(value) => {
                permit.settle(None, elapsed);
                Ok(value)
            }
            Err(err) => {
                permit.settle(Some(&err), elapsed);
                Err(ResilienceError::Operation(err))
            }
        }
    }

    fn admit(&self) -> Result<Ticket> {
        let mut pending = Vec::new();
        let decision = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            if trial_due(
                inner.state.state,
                inner.opened_instant,
                now,
                inner.config.timeout,
            ) {
                inner.transition(CircuitState::HalfOpen, "reset timeout elapsed", &mut pending);
            }
            let decision = match inner.state.state {
                CircuitState::Closed => Ok(Ticket {
                    generation: inner.generation,
                    trial_epoch: None,
                }),
                CircuitState::HalfOpen
                    if inner.state.half_open_attempts < inner.config.half_open_requests =>
                {
                    inner.state.half_open_attempts += 1;
                    Ok(Ticket {
                        generation: inner.generation,
                        trial_epoch: Some(inner.trial_epoch),
                    })
                }
                state => {
                    inner.rejected += 1;
                    pending.push(
                        ResilienceEvent::new(EventKind::CircuitRejected)
                            .with_component(self.name.clone())
                            .with_details(serde_json::json!({ "state": state.as_str() })),
                    );
                    Err(state)
                }
            };
            self.enqueue(pending);
            decision
        };
        self.drain();
        decision.map_err(|state| {
            debug!(
                target: "rampart::resilience::circuit_breaker",
                breaker = %self.name,
                %state,
                "call rejected by open breaker",
            );
            if let Some(metrics) = &self.metrics {
                metrics.inc_circuit_rejection(&self.name);
            }
            ResilienceError::CircuitOpen {
                name: self.name.clone(),
            }
        })
    }

    fn complete(&self, ticket: &Ticket, error: Option<&anyhow::Error>, latency: Duration) {
        let mut pending = Vec::new();
        let outcome = {
            let mut inner = self.inner.lock();
            inner.release_trial(ticket);
            if ticket.generation != inner.generation {
                debug!(
                    target: "rampart::resilience::circuit_breaker",
                    breaker = %self.name,
                    "discarding outcome of call started before reset",
                );
                return;
            }
            let outcome = match error {
                None => Outcome::Success,
                Some(err) if inner.config.allows(err) => Outcome::Allowed,
                Some(_) => Outcome::Failure,
            };
            inner.record(outcome, latency, &mut pending);
            self.enqueue(pending);
            outcome
        };
        if let Some(metrics) = &self.metrics {
            metrics.observe_call(&self.name, outcome.label(), latency);
        }
        self.drain();
    }

    fn release_abandoned(&self, ticket: &Ticket) {
        self.inner.lock().release_trial(ticket);
    }

    /// Queue events in transition order. Called with the state lock held.
    fn enqueue(&self, pending: Vec<ResilienceEvent>) {
        if !pending.is_empty() {
            self.outbox.lock().queue.extend(pending);
        }
    }

    /// Deliver queued events in order. A single caller drains at a time; the
    /// others leave their events to it, including re-entrant calls from listeners.
    fn drain(&self) {
        {
            let mut outbox = self.outbox.lock();
            if outbox.draining || outbox.queue.is_empty() {
                return;
            }
            outbox.draining = true;
        }
        loop {
            let event = {
                let mut outbox = self.outbox.lock();
                match outbox.queue.pop_front() {
                    Some(event) => event,
                    None => {
                        outbox.draining = false;
                        return;
                    }
                }
            };
            self.deliver(&event);
        }
    }

    fn deliver(&self, event: &ResilienceEvent) {
        match event.kind {
            EventKind::CircuitOpened => warn!(
                target: "rampart::resilience::circuit_breaker",
                breaker = %self.name,
                details = %event.details,
                "circuit opened",
            ),
            EventKind::CircuitClosed | EventKind::CircuitHalfOpen => info!(
                target: "rampart::resilience::circuit_breaker",
                breaker = %self.name,
                event = %event.kind,
                details = %event.details,
                "circuit state changed",
            ),
            _ => {}
        }
        if let Some(metrics) = &self.metrics {
            let to = match event.kind {
                EventKind::CircuitOpened => Some(CircuitState::Open),
                EventKind::CircuitClosed => Some(CircuitState::Closed),
                EventKind::CircuitHalfOpen => Some(CircuitState::HalfOpen),
                _ => None,
            };
            if let Some(to) = to {
                metrics.record_circuit_transition(&self.name, to.as_str());
            }
        }
        self.events.emit(event);
    }

    pub fn get_state(&self) -> CircuitBreakerState {
        self.inner.lock().state.clone()
    }

    /// Current state without cloning the transition history.
    pub fn current_state(&self) -> CircuitState {
        self.inner.lock().state.state
    }

    pub fn get_state_history(&self) -> Vec<StateTransition> {
        self.inner.lock().state.state_history.clone()
    }

    pub fn get_metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        let now = Instant::now();
        let state = &inner.state;
        let (success_rate, failure_rate) = if state.total_requests == 0 {
            (1.0, 0.0)
        } else {
            let total = state.total_requests as f64;
            (
                state.total_successes as f64 / total,
                state.total_failures as f64 / total,
            )
        };
        let mut sampled = 0u64;
        let mut recent_failures = 0u64;
        let mut latency_total = Duration::ZERO;
        for sample in inner.recent_samples(now) {
            sampled += 1;
            latency_total += sample.latency;
            if sample.failed {
                recent_failures += 1;
            }
        }
        let avg_response_time_ms = if sampled == 0 {
            0.0
        } else {
            duration_to_millis_f64(latency_total) / sampled as f64
        };
        CircuitBreakerMetrics {
            state: state.state,
            success_rate,
            failure_rate,
            total_requests: state.total_requests,
            total_successes: state.total_successes,
            total_failures: state.total_failures,
            consecutive_failures: state.consecutive_failures,
            recent_failures,
            rejected_requests: inner.rejected,
            avg_response_time_ms,
        }
    }

    /// Health on a 0-100 scale: open is 0, half-open stays below 50, closed is
    /// 100 minus half the recent failure ratio.
    pub fn get_health_score(&self) -> f64 {
        let inner = self.inner.lock();
        match inner.state.state {
            CircuitState::Open => 0.0,
            CircuitState::HalfOpen => {
                let progress = f64::from(inner.state.consecutive_successes)
                    / f64::from(inner.config.success_threshold.max(1));
                25.0 + 25.0 * progress.min(0.99)
            }
            CircuitState::Closed => {
                let now = Instant::now();
                let (total, failed) = inner
                    .recent_samples(now)
                    .fold((0u64, 0u64), |(total, failed), sample| {
                        (total + 1, failed + u64::from(sample.failed))
                    });
                if total == 0 {
                    100.0
                } else {
                    100.0 - 50.0 * (failed as f64 / total as f64)
                }
            }
        }
    }

    /// Force the breaker closed and zero every counter.
    pub fn reset(&self) {
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            inner.transition(CircuitState::Closed, "manual reset", &mut pending);
            let history = std::mem::take(&mut inner.state.state_history);
            inner.state = CircuitBreakerState::initial();
            inner.state.state_history = history;
            inner.opened_instant = None;
            inner.rejected = 0;
            inner.samples.clear();
            pending.push(ResilienceEvent::new(EventKind::CircuitReset).with_component(self.name.clone()));
            self.enqueue(pending);
        }
        info!(
            target: "rampart::resilience::circuit_breaker",
            breaker = %self.name,
            "circuit breaker reset",
        );
        self.drain();
    }

    /// Open the breaker immediately; the reset timeout restarts from now.
    pub fn force_open(&self) {
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.state.state == CircuitState::Open {
                inner.state.opened_at = Some(Utc::now());
                inner.opened_instant = Some(Instant::now());
            } else {
                inner.transition(CircuitState::Open, "forced open", &mut pending);
            }
            self.enqueue(pending);
        }
        self.drain();
    }

    /// Merge `patch` into the configuration and reset the breaker.
    pub fn update_config(&self, patch: &CircuitBreakerPatch) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            let mut config = inner.config.clone();
            patch.apply_to(&mut config);
            config.validate()?;
            inner.config = config;
        }
        self.reset();
        Ok(())
    }

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

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

/// Releases a half-open trial slot if the call future is dropped mid-flight.
struct TrialPermit<'a> {
    breaker: &'a CircuitBreaker,
    ticket: Ticket,
    settled: bool,
}

impl TrialPermit<'_> {
    fn settle(mut self, error: Option<&anyhow::Error>, latency: Duration) {
        self.settled = true;
        self.breaker.complete(&self.ticket, error, latency);
    }
}

impl Drop for TrialPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release_abandoned(&self.ticket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use anyhow::anyhow;
    use tokio::time::sleep;

    fn breaker(failure: u32, success: u32, timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            name: "svc".into(),
            failure_threshold: failure,
            success_threshold: success,
            timeout: Duration::from_millis(timeout_ms),
            ..CircuitBreakerConfig::default()
        })
        .unwrap()
    }

    async fn fail(cb: &CircuitBreaker) -> Result<()> {
        cb.execute(|| async { Err::<(), _>(anyhow!("boom")) }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<u32> {
        cb.execute(|| async { Ok(7) }).await
    }

    #[tokio::test]
    async fn opens_exactly_at_threshold() {
        let cb = breaker(3, 2, 1_000);
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.current_state(), CircuitState::Closed);
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.current_state(), CircuitState::Open);
        let history = cb.get_state_history();
        assert_eq!(history.len(), 1);
        assert!(history[0].reason.contains("threshold"));
    }

    #[tokio::test]
    async fn open_breaker_rejects_without_invoking() {
        let cb = breaker(3, 2, 1_000);
        for _ in 0..3 {
            fail(&cb).await.unwrap_err();
        }
        let before = cb.get_state();
        let invoked = AtomicUsize::new(0);
        let err = cb
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(err.is_circuit_open());
        assert!(err.to_string().contains("'svc'"));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        let after = cb.get_state();
        assert_eq!(before.failures, after.failures);
        assert_eq!(before.successes, after.successes);
        assert_eq!(before.total_requests, after.total_requests);
    }

    #[tokio::test]
    async fn recovers_through_half_open() {
        let cb = breaker(3, 2, 40);
        for _ in 0..3 {
            fail(&cb).await.unwrap_err();
        }
        sleep(Duration::from_millis(60)).await;
        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert_eq!(cb.current_state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        let state = cb.get_state();
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.failures, 0);
        assert_eq!(state.successes, 0);
        let path: Vec<_> = state.state_history.iter().map(|t| t.to).collect();
        assert_eq!(
            path,
            vec![CircuitState::Open, CircuitState::HalfOpen, CircuitState::Closed]
        );
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let cb = breaker(1, 3, 30);
        fail(&cb).await.unwrap_err();
        sleep(Duration::from_millis(45)).await;
        succeed(&cb).await.unwrap();
        assert_eq!(cb.current_state(), CircuitState::HalfOpen);
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.current_state(), CircuitState::Open);
        assert!(succeed(&cb).await.unwrap_err().is_circuit_open());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn half_open_admission_is_bounded() {
        let cb = Arc::new(
            CircuitBreaker::new(CircuitBreakerConfig {
                name: "bounded".into(),
                failure_threshold: 1,
                success_threshold: 10,
                timeout: Duration::from_millis(20),
                half_open_requests: 2,
                ..CircuitBreakerConfig::default()
            })
            .unwrap(),
        );
        cb.execute(|| async { Err::<(), _>(anyhow!("down")) })
            .await
            .unwrap_err();
        sleep(Duration::from_millis(30)).await;

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..12 {
            let cb = cb.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                cb.execute(|| async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(30)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                admitted += 1;
            }
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(admitted <= 2);
        assert!(cb.get_state().half_open_attempts <= 2);
    }

    #[tokio::test]
    async fn dropped_trial_releases_its_slot() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            name: "dropped".into(),
            failure_threshold: 1,
            timeout: Duration::from_millis(10),
            half_open_requests: 1,
            ..CircuitBreakerConfig::default()
        })
        .unwrap();
        fail(&cb).await.unwrap_err();
        sleep(Duration::from_millis(20)).await;
        let slow = cb.execute(|| async {
            sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(20), slow).await;
        assert!(timed_out.is_err());
        assert_eq!(cb.get_state().half_open_attempts, 0);
        assert!(succeed(&cb).await.is_ok());
    }

    #[tokio::test]
    async fn allowed_errors_are_returned_but_not_counted() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            name: "validation".into(),
            failure_threshold: 1,
            allowed_errors: vec!["NotFound".into()],
            ..CircuitBreakerConfig::default()
        })
        .unwrap();
        let err = cb
            .execute(|| async { Err::<(), _>(anyhow!("NotFound: user 42")) })
            .await
            .unwrap_err();
        assert!(!err.is_circuit_open());
        let state = cb.get_state();
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.total_failures, 0);
        assert_eq!(state.total_requests, state.total_successes + state.total_failures);
    }

    #[tokio::test]
    async fn metrics_rates_are_complementary() {
        let cb = breaker(10, 2, 1_000);
        let fresh = cb.get_metrics();
        assert_eq!(fresh.total_requests, 0);
        for _ in 0..3 {
            succeed(&cb).await.unwrap();
        }
        fail(&cb).await.unwrap_err();
        let metrics = cb.get_metrics();
        assert_eq!(metrics.total_requests, 4);
        assert_eq!(
            metrics.total_requests,
            metrics.total_successes + metrics.total_failures
        );
        assert!((metrics.success_rate + metrics.failure_rate - 1.0).abs() < 1e-9);
        assert!((metrics.failure_rate - 0.25).abs() < 1e-9);
        assert_eq!(metrics.recent_failures, 1);
    }

    #[tokio::test]
    async fn health_score_orders_states() {
        let cb = breaker(2, 2, 20);
        assert_eq!(cb.get_health_score(), 100.0);
        fail(&cb).await.unwrap_err();
        let closed_with_failures = cb.get_health_score();
        assert!(closed_with_failures < 100.0 && closed_with_failures >= 50.0);
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.get_health_score(), 0.0);
        sleep(Duration::from_millis(30)).await;
        succeed(&cb).await.unwrap();
        let half_open = cb.get_health_score();
        assert!(half_open > 0.0 && half_open < 50.0);
    }

    #[tokio::test]
    async fn reset_and_force_open() {
        let cb = breaker(1, 1, 60_000);
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.current_state(), CircuitState::Open);
        cb.reset();
        let state = cb.get_state();
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.failures, 0);
        assert_eq!(state.successes, 0);
        assert_eq!(state.total_requests, 0);

        cb.force_open();
        assert_eq!(cb.current_state(), CircuitState::Open);
        assert!(cb.get_state().opened_at.is_some());
        cb.reset();
        assert_eq!(cb.current_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn update_config_merges_and_resets() {
        let cb = breaker(5, 2, 1_000);
        fail(&cb).await.unwrap_err();
        cb.update_config(&CircuitBreakerPatch::default().with_failure_threshold(1))
            .unwrap();
        assert_eq!(cb.get_config().failure_threshold, 1);
        assert_eq!(cb.get_config().success_threshold, 2);
        assert_eq!(cb.get_state().total_requests, 0);
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.current_state(), CircuitState::Open);

        let invalid = CircuitBreakerPatch::default().with_failure_threshold(0);
        assert!(matches!(
            cb.update_config(&invalid),
            Err(ResilienceError::Config(_))
        ));
    }

    #[tokio::test]
    async fn listeners_observe_transitions_in_order() {
        let cb = breaker(1, 1, 10);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        cb.on_event(move |event| sink.lock().push(event.kind));
        cb.on_event(|_| panic!("misbehaving listener"));
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        sleep(Duration::from_millis(20)).await;
        succeed(&cb).await.unwrap();
        assert_eq!(
            *seen.lock(),
            vec![
                EventKind::CircuitOpened,
                EventKind::CircuitRejected,
                EventKind::CircuitHalfOpen,
                EventKind::CircuitClosed,
            ]
        );
        assert_eq!(cb.current_state(), CircuitState::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn listeners_observe_transitions_in_history_order() {
        let cb = Arc::new(
            CircuitBreaker::new(CircuitBreakerConfig {
                name: "ordered".into(),
                failure_threshold: 1,
                success_threshold: 1,
                half_open_requests: 4,
                timeout: Duration::from_millis(1),
                ..CircuitBreakerConfig::default()
            })
            .unwrap(),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        cb.on_event(move |event| {
            if matches!(
                event.kind,
                EventKind::CircuitOpened | EventKind::CircuitClosed | EventKind::CircuitHalfOpen
            ) {
                sink.lock().push(event.kind);
            }
        });

        let mut tasks = Vec::new();
        for worker in 0..8usize {
            let cb = cb.clone();
            tasks.push(tokio::spawn(async move {
                for round in 0..50usize {
                    if (worker + round) % 3 == 0 {
                        let _ = cb.execute(|| async { Err::<(), _>(anyhow!("flaky")) }).await;
                    } else {
                        let _ = cb.execute(|| async { Ok(()) }).await;
                    }
                    if round % 10 == 0 {
                        cb.reset();
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let expected: Vec<EventKind> = cb
            .get_state_history()
            .iter()
            .map(|transition| transition.to.event_kind())
            .collect();
        assert!(!expected.is_empty());
        assert_eq!(*seen.lock(), expected);
    }

    #[test]
    fn trial_due_is_pure() {
        let opened = Instant::now();
        let timeout = Duration::from_millis(100);
        assert!(!trial_due(CircuitState::Open, Some(opened), opened, timeout));
        assert!(trial_due(
            CircuitState::Open,
            Some(opened),
            opened + Duration::from_millis(100),
            timeout
        ));
        assert!(!trial_due(
            CircuitState::Closed,
            Some(opened),
            opened + Duration::from_secs(1),
            timeout
        ));
    }

    #[test]
    fn config_requires_name() {
        assert!(CircuitBreaker::new(CircuitBreakerConfig::default()).is_err());
    }
}
