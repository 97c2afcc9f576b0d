//! Per-resource circuit breaker
//!
//! Type-safe state machine for breaker lifecycle using the state-machines
//! crate in dynamic dispatch mode, wrapped in a per-breaker lock so every
//! transition is serialized. `allow()` and `report()` never do I/O.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use state_machines::state_machine;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::Error;

state_machine! {
    name: BreakerMachine,
    dynamic: true,
    initial: Closed,
    states: [Closed, Open, HalfOpen],
    events {
        trip {
            transition: { from: [Closed, HalfOpen], to: Open }
        }
        probe {
            transition: { from: Open, to: HalfOpen }
        }
        close {
            transition: { from: HalfOpen, to: Closed }
        }
    }
}

/// Breaker state for external use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_machine(s: &str) -> Self {
        match s {
            "Open" => CircuitState::Open,
            "HalfOpen" => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Breaker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Cooldown after the first open, in seconds
    #[serde(default = "default_cooldown")]
    pub cooldown: u64,

    /// Upper bound for the exponential cooldown, in seconds
    #[serde(default = "default_cooldown_cap")]
    pub cooldown_cap: u64,

    /// Trial calls allowed in half-open; this many successes close it
    #[serde(default = "default_trial_budget")]
    pub trial_budget: u32,

    /// Deadline for guarded calls, in milliseconds
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown() -> u64 {
    30
}

fn default_cooldown_cap() -> u64 {
    300
}

fn default_trial_budget() -> u32 {
    2
}

fn default_call_timeout_ms() -> u64 {
    5000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown: default_cooldown(),
            cooldown_cap: default_cooldown_cap(),
            trial_budget: default_trial_budget(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl BreakerConfig {
    pub fn cooldown_duration(&self) -> Duration {
        Duration::from_secs(self.cooldown)
    }

    pub fn cooldown_cap_duration(&self) -> Duration {
        Duration::from_secs(self.cooldown_cap)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Cooldown for the n-th consecutive open (1-based)
    fn cooldown_for(&self, opens: u32) -> Duration {
        let shift = opens.saturating_sub(1).min(16);
        self.cooldown_duration()
            .saturating_mul(1u32 << shift)
            .min(self.cooldown_cap_duration().max(self.cooldown_duration()))
    }
}

/// Mutable breaker state, only touched under the breaker lock
struct BreakerInner {
    machine: DynamicBreakerMachine<()>,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    cooldown: Duration,
    /// Opens since the breaker last closed
    opens: u32,
    /// Admission instants of trials still awaiting an outcome
    trials: VecDeque<Instant>,
    trial_successes: u32,
    last_transition: DateTime<Utc>,
}

impl BreakerInner {
    fn state(&self) -> CircuitState {
        CircuitState::from_machine(self.machine.current_state())
    }
}

/// Circuit breaker for a single resource
pub struct CircuitBreaker {
    resource: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(resource: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            resource: resource.into(),
            config,
            inner: Mutex::new(BreakerInner {
                machine: BreakerMachine::new(()).into_dynamic(),
                consecutive_failures: 0,
                opened_at: None,
                cooldown: Duration::ZERO,
                opens: 0,
                trials: VecDeque::new(),
                trial_successes: 0,
                last_transition: Utc::now(),
            }),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Current state (no timeout-driven transition)
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state()
    }

    /// Gate a call on the hot path
    pub fn allow(&self) -> crate::error::Result<()> {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&self, now: Instant) -> crate::error::Result<()> {
        let mut inner = self.inner.lock();
        self.expire_trials(&mut inner, now);

        if inner.state() == CircuitState::Open {
            let reopen_at = inner.opened_at.map(|t| t + inner.cooldown).unwrap_or(now);
            if now < reopen_at {
                return Err(self.rejection(reopen_at - now));
            }
            self.fire(&mut inner, BreakerMachineEvent::Probe);
            inner.trials.clear();
            inner.trial_successes = 0;
            info!(resource = %self.resource, "circuit half-open, admitting trial calls");
        }

        match inner.state() {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => {
                if (inner.trials.len() as u32) < self.config.trial_budget.max(1) {
                    inner.trials.push_back(now);
                    Ok(())
                } else {
                    // Budget frees up when a trial reports or hits its deadline
                    let oldest = inner.trials.front().copied().unwrap_or(now);
                    let expires = (oldest + self.config.call_timeout()).saturating_duration_since(now);
                    Err(self.rejection(expires))
                }
            }
            CircuitState::Open => Err(self.rejection(inner.cooldown)),
        }
    }

    /// Record the outcome of a call that `allow()` admitted
    pub fn report(&self, success: bool) {
        self.report_at(success, Instant::now())
    }

    pub fn report_at(&self, success: bool, now: Instant) {
        let mut inner = self.inner.lock();
        self.expire_trials(&mut inner, now);

        match (inner.state(), success) {
            (CircuitState::Closed, true) => inner.consecutive_failures = 0,
            (CircuitState::Closed, false) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold.max(1) {
                    warn!(
                        resource = %self.resource,
                        failures = inner.consecutive_failures,
                        "circuit opening due to failures"
                    );
                    self.open(&mut inner, now);
                }
            }
            (CircuitState::HalfOpen, true) => {
                inner.trials.pop_front();
                inner.trial_successes += 1;
                if inner.trial_successes >= self.config.trial_budget.max(1) {
                    info!(
                        resource = %self.resource,
                        successes = inner.trial_successes,
                        "circuit closing after successful trials"
                    );
                    self.fire(&mut inner, BreakerMachineEvent::Close);
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                    inner.opens = 0;
                    inner.cooldown = Duration::ZERO;
                    inner.trials.clear();
                    inner.trial_successes = 0;
                }
            }
            (CircuitState::HalfOpen, false) => {
                inner.consecutive_failures += 1;
                warn!(resource = %self.resource, "trial call failed, circuit re-opening");
                self.open(&mut inner, now);
            }
            (CircuitState::Open, _) => {
                debug!(resource = %self.resource, success, "late outcome while circuit open");
            }
        }
    }

    /// Open the breaker on an external verdict (detector, cancellation)
    ///
    /// No-op when already open, so repeated verdicts don't stretch the
    /// cooldown.
    pub fn trip(&self, reason: &str) {
        self.trip_at(reason, Instant::now())
    }

    pub fn trip_at(&self, reason: &str, now: Instant) {
        let mut inner = self.inner.lock();
        if inner.state() == CircuitState::Open {
            return;
        }
        warn!(resource = %self.resource, reason, "circuit tripped");
        self.open(&mut inner, now);
    }

    pub fn stats(&self) -> BreakerStats {
        self.stats_at(Instant::now())
    }

    pub fn stats_at(&self, now: Instant) -> BreakerStats {
        let inner = self.inner.lock();
        let retry_after = match (inner.state(), inner.opened_at) {
            (CircuitState::Open, Some(at)) => (at + inner.cooldown).saturating_duration_since(now),
            _ => Duration::ZERO,
        };
        BreakerStats {
            resource: self.resource.clone(),
            state: inner.state(),
            consecutive_failures: inner.consecutive_failures,
            opens: inner.opens,
            cooldown_ms: inner.cooldown.as_millis() as u64,
            retry_after_ms: retry_after.as_millis() as u64,
            trials_in_flight: inner.trials.len() as u32,
            trial_budget: self.config.trial_budget,
            last_transition: inner.last_transition,
        }
    }

    fn open(&self, inner: &mut BreakerInner, now: Instant) {
        self.fire(inner, BreakerMachineEvent::Trip);
        inner.opens = inner.opens.saturating_add(1);
        let next = self.config.cooldown_for(inner.opens);
        // Re-opens never shorten the cooldown
        inner.cooldown = next.max(inner.cooldown);
        inner.opened_at = Some(now);
        inner.trials.clear();
        inner.trial_successes = 0;
    }

    /// A trial that outlives the call deadline counts as a failed trial
    fn expire_trials(&self, inner: &mut BreakerInner, now: Instant) {
        if inner.state() != CircuitState::HalfOpen {
            return;
        }
        let deadline = self.config.call_timeout();
        let overdue = inner
            .trials
            .front()
            .is_some_and(|admitted| now.saturating_duration_since(*admitted) >= deadline);
        if overdue {
            inner.consecutive_failures += 1;
            warn!(
                resource = %self.resource,
                deadline_ms = deadline.as_millis() as u64,
                "trial call never reported, circuit re-opening"
            );
            self.open(inner, now);
        }
    }

    fn fire(&self, inner: &mut BreakerInner, event: BreakerMachineEvent) {
        let from = inner.state();
        match inner.machine.handle(event) {
            Ok(()) => {
                inner.last_transition = Utc::now();
                debug!(resource = %self.resource, %from, to = %inner.state(), "circuit transition");
            }
            Err(e) => {
                debug!(resource = %self.resource, %from, error = ?e, "circuit transition rejected");
            }
        }
    }

    fn rejection(&self, retry_after: Duration) -> Error {
        Error::CircuitOpen {
            resource: self.resource.clone(),
            retry_after_ms: retry_after.as_millis() as u64,
        }
    }
}

/// Queryable snapshot of a breaker
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub resource: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opens: u32,
    pub cooldown_ms: u64,
    pub retry_after_ms: u64,
    pub trials_in_flight: u32,
    pub trial_budget: u32,
    pub last_transition: DateTime<Utc>,
}
