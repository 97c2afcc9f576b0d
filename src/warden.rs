//! The Warden - recovery executor
//!
//! Runs the strategy chosen for each accepted problem on its own task:
//! - At most one active attempt per (resource, kind); duplicates coalesce
//! - Failed actions are re-submitted with exponential backoff
//! - An exhausted budget escalates and latches the key
//! - A sufficiently severe new problem preempts the active attempt

pub mod attempt;
pub mod handler;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bulkhead::BreakerBoard;
use crate::error::Error;
use crate::flare::{AlertEvent, Flare, Transition};
use crate::sickbay::detector::ProblemDetector;
use crate::sickbay::problem::{Problem, ProblemKind};
use crate::sickbay::recovery::{RecoveryConfig, RecoveryStrategy, RetryPolicy, StrategySelector};

use attempt::{AttemptKey, AttemptStatus, RecoveryAttempt};
use handler::{HandlerRole, RecoveryHandler};

/// What `handle()` did with a problem
#[derive(Debug, Clone)]
pub enum Dispatch {
    /// A new attempt was registered and its task spawned
    Started(RecoveryAttempt),
    /// An attempt for the same key is already active
    Coalesced { active: Uuid },
    /// The key is latched after an escalation
    Suppressed { key: AttemptKey },
    /// Auto-recovery is off, the warden is shut down, or there is no
    /// runtime to run recoveries on
    Disabled,
}

impl Dispatch {
    pub fn attempt(&self) -> Option<&RecoveryAttempt> {
        match self {
            Dispatch::Started(attempt) => Some(attempt),
            _ => None,
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self, Dispatch::Started(_))
    }
}

/// Registry slot of an active attempt
struct ActiveEntry {
    attempt: RecoveryAttempt,
    abort: Option<AbortHandle>,
    /// Set by the canceller; the task must not start another action
    cancelled: bool,
}

type Slot = Arc<Mutex<ActiveEntry>>;

struct Shared {
    config: RecoveryConfig,
    selector: StrategySelector,
    detector: Arc<ProblemDetector>,
    breakers: Arc<BreakerBoard>,
    flare: Flare,
    /// Runtime captured at construction, so synchronous callers can dispatch
    runtime: Option<Handle>,
    enabled: AtomicBool,
    closed: AtomicBool,
    restart: DashMap<String, Arc<dyn RecoveryHandler>>,
    fallback: DashMap<String, Arc<dyn RecoveryHandler>>,
    active: DashMap<AttemptKey, Slot>,
    archive: DashMap<AttemptKey, VecDeque<RecoveryAttempt>>,
    latches: DashMap<AttemptKey, DateTime<Utc>>,
}

/// Recovery executor; cheap to clone
#[derive(Clone)]
pub struct Warden {
    shared: Arc<Shared>,
}

impl Warden {
    pub fn new(
        config: RecoveryConfig,
        detector: Arc<ProblemDetector>,
        breakers: Arc<BreakerBoard>,
        flare: Flare,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                selector: StrategySelector::new(config.clone()),
                config,
                detector,
                breakers,
                flare,
                runtime: Handle::try_current().ok(),
                enabled: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                restart: DashMap::new(),
                fallback: DashMap::new(),
                active: DashMap::new(),
                archive: DashMap::new(),
                latches: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.shared.config
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    /// Register the handler for a component (restart) or dependency (fallback)
    pub fn register(&self, role: HandlerRole, target: &str, handler: Arc<dyn RecoveryHandler>) {
        let registry = match role {
            HandlerRole::Restart => &self.shared.restart,
            HandlerRole::Fallback => &self.shared.fallback,
        };
        registry.insert(target.to_string(), handler);
        debug!(role = %role, handler_target = target, "recovery handler registered");
    }

    /// Accept a problem for remediation
    pub fn handle(&self, problem: Problem) -> Dispatch {
        let s = &self.shared;
        if !self.is_enabled() || s.closed.load(Ordering::SeqCst) {
            return Dispatch::Disabled;
        }

        let Some(runtime) = self.runtime() else {
            warn!(
                resource = %problem.resource,
                kind = %problem.kind,
                "no tokio runtime available, recovery not dispatched"
            );
            return Dispatch::Disabled;
        };

        let key = AttemptKey::new(problem.resource.clone(), problem.kind);
        if self.latched(&key) {
            debug!(key = %key, "problem suppressed by escalation latch");
            return Dispatch::Suppressed { key };
        }

        let problem = Arc::new(problem);
        let mut may_preempt = true;

        loop {
            let strategy = s
                .selector
                .select(&problem, &self.history(&key), Utc::now());
            let attempt = RecoveryAttempt::new(Arc::clone(&problem), strategy);

            let claimed = match s.active.entry(key.clone()) {
                Entry::Vacant(vacant) => {
                    let slot = Arc::new(Mutex::new(ActiveEntry {
                        attempt: attempt.clone(),
                        abort: None,
                        cancelled: false,
                    }));
                    vacant.insert(Arc::clone(&slot));
                    Ok(slot)
                }
                Entry::Occupied(occupied) => {
                    let entry = occupied.get().lock();
                    Err((entry.attempt.id, entry.attempt.severity))
                }
            };

            match claimed {
                Ok(slot) => {
                    info!(
                        key = %key,
                        attempt = %attempt.id,
                        strategy = %attempt.strategy.kind(),
                        severity = problem.severity,
                        "recovery accepted"
                    );
                    s.flare.emit(AlertEvent::recovery(Transition::Accepted, &attempt));
                    self.launch(&runtime, slot);
                    return Dispatch::Started(attempt);
                }
                Err((active, active_severity)) => {
                    let preempts = problem.severity > active_severity
                        && problem.severity >= s.config.escalation_threshold;
                    if may_preempt && preempts {
                        warn!(
                            key = %key,
                            active = %active,
                            severity = problem.severity,
                            "preempting active recovery"
                        );
                        self.cancel(&key, active, "preempted", true);
                        may_preempt = false;
                        continue;
                    }
                    debug!(key = %key, active = %active, "problem coalesced into active recovery");
                    return Dispatch::Coalesced { active };
                }
            }
        }
    }

    fn runtime(&self) -> Option<Handle> {
        self.shared
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok())
    }

    fn launch(&self, runtime: &Handle, slot: Slot) {
        let warden = self.clone();
        let task_slot = Arc::clone(&slot);
        // Held until the abort handle is stored; `drive` starts by taking it
        let mut entry = slot.lock();
        let task = runtime.spawn(async move { warden.drive(task_slot).await });
        entry.abort = Some(task.abort_handle());
    }

    async fn drive(self, slot: Slot) {
        let attempt = {
            let mut entry = slot.lock();
            if entry.cancelled {
                return;
            }
            entry.attempt.status = AttemptStatus::Running;
            entry.attempt.clone()
        };
        self.shared
            .flare
            .emit(AlertEvent::recovery(Transition::Started, &attempt));

        let (status, note) = match &attempt.strategy {
            RecoveryStrategy::CircuitBreaker { recheck_after_ms } => {
                if !bump(&slot) {
                    return;
                }
                self.shared.breakers.trip(&attempt.resource, "recovery");
                self.schedule_recheck(&attempt.resource, Duration::from_millis(*recheck_after_ms));
                (AttemptStatus::Succeeded, Some("breaker opened".to_string()))
            }
            RecoveryStrategy::Retry { policy } => self.retry(&slot, &attempt, policy).await,
            RecoveryStrategy::Restart { component, policy } => {
                self.remediate(&slot, &attempt, HandlerRole::Restart, component, policy)
                    .await
            }
            RecoveryStrategy::Fallback { dependency, policy } => {
                self.remediate(&slot, &attempt, HandlerRole::Fallback, dependency, policy)
                    .await
            }
            RecoveryStrategy::Escalate { reason } => (AttemptStatus::Escalated, Some(reason.clone())),
        };

        self.finalize(&slot, status, note);
    }

    /// Wait out the backoff and re-verify until the evidence is gone
    async fn retry(
        &self,
        slot: &Slot,
        attempt: &RecoveryAttempt,
        policy: &RetryPolicy,
    ) -> (AttemptStatus, Option<String>) {
        let max = attempt.strategy.max_attempts();
        for n in 1..=max {
            tokio::time::sleep(policy.delay_after(n)).await;
            if !bump(slot) {
                return cancelled();
            }
            if self
                .shared
                .detector
                .evaluate_kind(&attempt.resource, attempt.kind)
                .is_none()
            {
                return (
                    AttemptStatus::Succeeded,
                    Some(format!("resolved after {} tries", n)),
                );
            }
            debug!(resource = %attempt.resource, try_number = n, "problem persists");
        }

        let e = Error::EscalationRequired {
            resource: attempt.resource.clone(),
            kind: attempt.kind.to_string(),
            reason: format!("still present after {} retries", max),
        };
        (AttemptStatus::Escalated, Some(e.to_string()))
    }

    /// Run a registered handler with per-action deadline and backoff
    async fn remediate(
        &self,
        slot: &Slot,
        attempt: &RecoveryAttempt,
        role: HandlerRole,
        target: &str,
        policy: &RetryPolicy,
    ) -> (AttemptStatus, Option<String>) {
        let registry = match role {
            HandlerRole::Restart => &self.shared.restart,
            HandlerRole::Fallback => &self.shared.fallback,
        };
        let Some(handler) = registry.get(target).map(|h| Arc::clone(h.value())) else {
            let e = Error::NoHandler {
                role: role.to_string(),
                target: target.to_string(),
            };
            warn!(error = %e, "recovery cannot run");
            return (AttemptStatus::Failed, Some(e.to_string()));
        };

        let deadline = self.shared.config.action_timeout_duration();
        let max = attempt.strategy.max_attempts();
        let mut last_error = String::new();

        for n in 1..=max {
            if !bump(slot) {
                return cancelled();
            }
            let result = match tokio::time::timeout(deadline, handler.recover(target, deadline)).await {
                Ok(result) => result,
                Err(_) => Err(Error::RecoveryTimeout(deadline.as_millis() as u64)),
            };

            match result {
                Ok(()) => {
                    return (
                        AttemptStatus::Succeeded,
                        Some(format!("{} succeeded on try {}", role, n)),
                    );
                }
                Err(e) => {
                    warn!(handler_target = target, role = %role, try_number = n, error = %e, "recovery action failed");
                    last_error = e.to_string();
                    if n < max {
                        tokio::time::sleep(policy.delay_after(n)).await;
                    }
                }
            }
        }

        let e = Error::EscalationRequired {
            resource: attempt.resource.clone(),
            kind: attempt.kind.to_string(),
            reason: format!("{} failed {} times: {}", role, max, last_error),
        };
        (AttemptStatus::Escalated, Some(e.to_string()))
    }

    fn schedule_recheck(&self, resource: &str, after: Duration) {
        let warden = self.clone();
        let resource = resource.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if warden.shared.closed.load(Ordering::SeqCst) {
                return;
            }
            if let Some(breaker) = warden.shared.breakers.get(&resource) {
                let stats = breaker.stats();
                info!(resource = %resource, state = %stats.state, "breaker re-check");
                warden.shared.flare.emit(AlertEvent::recheck(&stats));
            }
        });
    }

    /// Task-side completion; loses quietly to a canceller
    fn finalize(&self, slot: &Slot, status: AttemptStatus, note: Option<String>) {
        let (key, id) = {
            let entry = slot.lock();
            (entry.attempt.key(), entry.attempt.id)
        };
        if self
            .shared
            .active
            .remove_if(&key, |_, s| s.lock().attempt.id == id)
            .is_none()
        {
            return;
        }
        let done = slot.lock().attempt.finish(status, note);
        self.settle(done);
    }

    /// Cancel an active attempt; the registry removal decides who finalizes
    fn cancel(&self, key: &AttemptKey, id: Uuid, note: &str, trip: bool) -> Option<RecoveryAttempt> {
        let (_, slot) = self
            .shared
            .active
            .remove_if(key, |_, s| s.lock().attempt.id == id)?;

        let done = {
            let mut entry = slot.lock();
            entry.cancelled = true;
            if let Some(abort) = entry.abort.take() {
                abort.abort();
            }
            entry
                .attempt
                .finish(AttemptStatus::Failed, Some(note.to_string()))
        };
        if trip {
            self.shared.breakers.trip(&key.resource, note);
        }
        self.settle(done.clone());
        Some(done)
    }

    /// Side effects of a terminal attempt
    fn settle(&self, done: RecoveryAttempt) {
        let s = &self.shared;
        let key = done.key();

        let transition = match done.status {
            AttemptStatus::Succeeded => {
                s.detector.clear(&done.resource, done.kind);
                info!(key = %key, attempt = %done.id, tries = done.attempts_made, "recovery succeeded");
                Transition::Succeeded
            }
            AttemptStatus::Escalated => {
                s.breakers.trip(&done.resource, "escalated");
                s.latches.insert(key.clone(), Utc::now());
                error!(
                    key = %key,
                    attempt = %done.id,
                    note = done.note.as_deref().unwrap_or_default(),
                    "recovery escalated"
                );
                Transition::Escalated
            }
            _ => {
                warn!(
                    key = %key,
                    attempt = %done.id,
                    note = done.note.as_deref().unwrap_or_default(),
                    "recovery failed"
                );
                Transition::Failed
            }
        };

        s.flare.emit(AlertEvent::recovery(transition, &done));

        let mut archive = s.archive.entry(key).or_default();
        archive.push_back(done);
        while archive.len() > s.config.history_per_key.max(1) {
            archive.pop_front();
        }
    }

    fn latched(&self, key: &AttemptKey) -> bool {
        let s = &self.shared;
        let Some(at) = s.latches.get(key).map(|e| *e.value()) else {
            return false;
        };
        let cooloff = chrono::Duration::seconds(s.config.cooloff as i64);
        if s.config.escalation_auto_clear && Utc::now() - at >= cooloff {
            s.latches.remove(key);
            info!(key = %key, "escalation latch expired");
            return false;
        }
        true
    }

    /// Lift an escalation latch by hand; returns whether one was set
    pub fn clear_escalation(&self, resource: &str, kind: ProblemKind) -> bool {
        let cleared = self
            .shared
            .latches
            .remove(&AttemptKey::new(resource, kind))
            .is_some();
        if cleared {
            info!(resource, kind = %kind, "escalation cleared by operator");
        }
        cleared
    }

    pub fn escalations(&self) -> Vec<(AttemptKey, DateTime<Utc>)> {
        let mut latched: Vec<_> = self
            .shared
            .latches
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        latched.sort_by(|a, b| a.1.cmp(&b.1));
        latched
    }

    /// Finished attempts for a key, oldest first
    pub fn history(&self, key: &AttemptKey) -> Vec<RecoveryAttempt> {
        self.shared
            .archive
            .get(key)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Most recently finished attempts across all keys, newest first
    pub fn recent(&self, limit: usize) -> Vec<RecoveryAttempt> {
        let mut all: Vec<RecoveryAttempt> = self
            .shared
            .archive
            .iter()
            .flat_map(|h| h.value().iter().cloned().collect::<Vec<_>>())
            .collect();
        all.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        all.truncate(limit);
        all
    }

    /// Snapshot of active attempts
    pub fn active(&self) -> Vec<RecoveryAttempt> {
        let slots: Vec<Slot> = self
            .shared
            .active
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        let mut active: Vec<RecoveryAttempt> =
            slots.iter().map(|s| s.lock().attempt.clone()).collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        active
    }

    pub fn is_recovering(&self) -> bool {
        !self.shared.active.is_empty()
    }

    /// Stop accepting problems and cancel everything in flight
    pub fn shutdown(&self) -> Vec<RecoveryAttempt> {
        self.shared.closed.store(true, Ordering::SeqCst);
        let running: Vec<(AttemptKey, Uuid)> = self
            .active()
            .into_iter()
            .map(|a| (a.key(), a.id))
            .collect();

        let cancelled: Vec<RecoveryAttempt> = running
            .into_iter()
            .filter_map(|(key, id)| self.cancel(&key, id, "cancelled during shutdown", false))
            .collect();
        info!(cancelled = cancelled.len(), "warden stopped");
        cancelled
    }
}

/// Count a try; false once the attempt has been cancelled
fn bump(slot: &Slot) -> bool {
    let mut entry = slot.lock();
    if entry.cancelled {
        return false;
    }
    entry.attempt.attempts_made = entry.attempt.attempts_made.saturating_add(1);
    true
}

/// Outcome a cancelled task reports; the canceller already finalized it
fn cancelled() -> (AttemptStatus, Option<String>) {
    (AttemptStatus::Failed, Some("cancelled".to_string()))
}
