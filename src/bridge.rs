//! Bridge - the self-healing engine
//!
//! Handles:
//! - The protected-call hot path (breaker gate, outcome reporting)
//! - The periodic pipeline: sample, observe, evaluate, react
//! - Health rollup, bounded health and problem history
//! - Status queries and graceful shutdown

use crate::bell::{Bell, BellRope};
use crate::bulkhead::{BreakerBoard, BreakerStats, CallError};
use crate::error::{Error, Result};
use crate::flare::{AlertEvent, Flare};
use crate::manifest::EngineConfig;
use crate::sickbay::detector::{OperationOutcome, ProblemDetector};
use crate::sickbay::probe::{CommandProbe, Probe};
use crate::sickbay::problem::{Problem, ProblemKind};
use crate::sickbay::sampler::{HealthSampler, HealthSnapshot, HealthStatus, ProbeBinding};
use crate::warden::attempt::{AttemptKey, RecoveryAttempt};
use crate::warden::handler::{CommandAction, HandlerRole, RecoveryHandler};
use crate::warden::{Dispatch, Warden};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Problems and attempts shown by `status()`
const STATUS_RECENT: usize = 10;

/// A problem the engine reacted to, and what the warden did with it
#[derive(Debug, Clone)]
pub struct Detection {
    pub problem: Problem,
    pub dispatch: Dispatch,
}

/// One sampling tick as remembered by the health log
#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    pub at: DateTime<Utc>,
    pub status: HealthStatus,
    pub failed_checks: Vec<String>,
}

#[derive(Default)]
struct HealthLog {
    last: Option<HealthRecord>,
    records: VecDeque<HealthRecord>,
    problems: VecDeque<Problem>,
}

/// Escalation latch as shown in status output
#[derive(Debug, Clone, Serialize)]
pub struct EscalationView {
    pub resource: String,
    pub kind: ProblemKind,
    pub since: DateTime<Utc>,
}

/// Thresholds in effect, for operators reading status output
#[derive(Debug, Clone, Serialize)]
pub struct Thresholds {
    pub failure_threshold: u32,
    pub consecutive_failures: u32,
    pub degradation_multiplier: f64,
    pub memory_slope: f64,
    pub error_rate: f64,
    pub escalation_threshold: f64,
}

/// Serializable engine state
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub healing_enabled: bool,
    pub auto_recovery: bool,
    pub circuit_breaker_enabled: bool,
    pub health: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sample: Option<HealthRecord>,
    pub breakers: Vec<BreakerStats>,
    pub active: Vec<RecoveryAttempt>,
    pub escalations: Vec<EscalationView>,
    pub recent_problems: Vec<Problem>,
    pub recent_attempts: Vec<RecoveryAttempt>,
    pub thresholds: Thresholds,
    pub alerts_dropped: u64,
}

/// The self-healing engine
pub struct Bridge {
    config: EngineConfig,
    sampler: HealthSampler,
    detector: Arc<ProblemDetector>,
    breakers: Arc<BreakerBoard>,
    warden: Warden,
    flare: Flare,
    healing: AtomicBool,
    stopped: AtomicBool,
    rope: Mutex<Option<BellRope>>,
    log: RwLock<HealthLog>,
    /// Last problem alert per key while auto-recovery is off
    noticed: DashMap<AttemptKey, DateTime<Utc>>,
}

impl Bridge {
    /// Engine without probes or handlers
    pub fn new(config: EngineConfig, flare: Flare) -> Self {
        let detector = Arc::new(ProblemDetector::new(config.detector.clone()));
        let breakers = Arc::new(BreakerBoard::new(
            config.breaker.clone(),
            config.engine.circuit_breaker_enabled,
        ));
        let warden = Warden::new(
            config.recovery.clone(),
            Arc::clone(&detector),
            Arc::clone(&breakers),
            flare.clone(),
        );
        warden.set_enabled(config.engine.auto_recovery);

        Self {
            sampler: HealthSampler::new(config.sampler.clone()),
            healing: AtomicBool::new(config.engine.healing_enabled),
            config,
            detector,
            breakers,
            warden,
            flare,
            stopped: AtomicBool::new(false),
            rope: Mutex::new(None),
            log: RwLock::new(HealthLog::default()),
            noticed: DashMap::new(),
        }
    }

    /// Engine with the command probes and handlers the config declares
    pub fn from_config(config: EngineConfig, flare: Flare) -> Self {
        let probes = config.probes.clone();
        let restart = config.restart.clone();
        let fallback = config.fallback.clone();

        let mut bridge = Self::new(config, flare);
        for def in probes {
            bridge = bridge.with_probe(Arc::new(CommandProbe::new(def)));
        }
        for action in restart {
            bridge.register_handler(
                HandlerRole::Restart,
                &action.target,
                Arc::new(CommandAction::new(HandlerRole::Restart, action.command)),
            );
        }
        for action in fallback {
            bridge.register_handler(
                HandlerRole::Fallback,
                &action.target,
                Arc::new(CommandAction::new(HandlerRole::Fallback, action.command)),
            );
        }
        bridge
    }

    /// Register a probe and bind its snapshot key for the detector
    pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.detector.bind(ProbeBinding {
            probe: probe.name().to_string(),
            resource: probe.resource().to_string(),
            signal: probe.signal(),
        });
        self.sampler = self.sampler.with_probe(probe);
        self
    }

    pub fn register_handler(&self, role: HandlerRole, target: &str, handler: Arc<dyn RecoveryHandler>) {
        self.warden.register(role, target, handler);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn detector(&self) -> &ProblemDetector {
        &self.detector
    }

    pub fn breakers(&self) -> &BreakerBoard {
        &self.breakers
    }

    pub fn warden(&self) -> &Warden {
        &self.warden
    }

    pub fn probe_count(&self) -> usize {
        self.sampler.bindings().len()
    }

    pub fn set_healing_enabled(&self, enabled: bool) {
        self.healing.store(enabled, Ordering::SeqCst);
    }

    pub fn set_auto_recovery(&self, enabled: bool) {
        self.warden.set_enabled(enabled);
    }

    // --- hot path ---

    /// Gate a call; `Err(CircuitOpen)` means do not touch the resource
    pub fn allow(&self, resource: &str) -> Result<()> {
        self.breakers.allow(resource)
    }

    /// Record the outcome of an admitted call
    pub fn report(&self, resource: &str, success: bool, latency_ms: f64) -> Option<Detection> {
        self.breakers.report(resource, success);
        self.observe_outcome(&OperationOutcome::new(resource, success, latency_ms))
    }

    /// Run `operation` behind the resource's breaker and call deadline
    pub async fn call<T, E, F>(&self, resource: &str, operation: F) -> std::result::Result<T, CallError<E>>
    where
        F: Future<Output = std::result::Result<T, E>>,
    {
        self.allow(resource).map_err(CallError::Rejected)?;

        let deadline = self.breakers.config().call_timeout();
        let started = Instant::now();
        let outcome = tokio::time::timeout(deadline, operation).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(Ok(value)) => {
                self.report(resource, true, latency_ms);
                Ok(value)
            }
            Ok(Err(e)) => {
                self.report(resource, false, latency_ms);
                Err(CallError::Failed(e))
            }
            Err(_) => {
                self.report(resource, false, latency_ms);
                Err(CallError::TimedOut(Error::CallTimeout {
                    resource: resource.to_string(),
                    timeout_ms: deadline.as_millis() as u64,
                }))
            }
        }
    }

    // --- detection pipeline ---

    /// Feed a traced call outcome and react to what it reveals
    pub fn observe_outcome(&self, outcome: &OperationOutcome) -> Option<Detection> {
        self.detector.observe_outcome(outcome);
        let problem = self.detector.evaluate(&outcome.resource)?;
        self.react(problem)
    }

    /// Feed a health snapshot and react to every resource it touched
    pub fn observe_snapshot(&self, snapshot: &HealthSnapshot) -> Vec<Detection> {
        self.record_health(snapshot);
        self.detector
            .observe_snapshot(snapshot)
            .into_iter()
            .filter_map(|resource| self.detector.evaluate(&resource))
            .filter_map(|problem| self.react(problem))
            .collect()
    }

    /// One sampling tick
    pub async fn tick(&self) -> Vec<Detection> {
        let snapshot = self.sampler.sample().await;
        self.observe_snapshot(&snapshot)
    }

    /// Sample on the configured interval until shut down
    pub async fn run(&self) {
        let (mut bell, rope) = Bell::new(self.sampler.interval());
        *self.rope.lock() = Some(rope.clone());
        if self.stopped.load(Ordering::SeqCst) {
            rope.silence();
        }

        info!(
            probes = self.probe_count(),
            interval_secs = self.sampler.interval().as_secs(),
            "self-healing loop started"
        );
        while bell.tick().await {
            if self.healing.load(Ordering::SeqCst) {
                let detections = self.tick().await;
                if !detections.is_empty() {
                    debug!(count = detections.len(), "tick produced detections");
                }
            }
        }
        info!("self-healing loop stopped");
    }

    fn react(&self, problem: Problem) -> Option<Detection> {
        let key = AttemptKey::new(problem.resource.clone(), problem.kind);

        if problem.kind.trips_breaker() {
            self.breakers.trip(&problem.resource, problem.kind.as_str());
        }

        let dispatch = self.warden.handle(problem.clone());
        let fresh = match &dispatch {
            Dispatch::Started(_) => true,
            Dispatch::Disabled => self.first_notice(&key),
            Dispatch::Coalesced { .. } | Dispatch::Suppressed { .. } => false,
        };
        if !fresh {
            return None;
        }

        warn!(
            resource = %problem.resource,
            kind = %problem.kind,
            severity = problem.severity,
            "{}",
            problem.description()
        );
        self.flare.emit(AlertEvent::problem(&problem));
        self.record_problem(&problem);
        Some(Detection { problem, dispatch })
    }

    /// Rate-limits repeat problem reports while nothing is recovering them
    fn first_notice(&self, key: &AttemptKey) -> bool {
        let now = Utc::now();
        let quiet = chrono::Duration::seconds(self.config.recovery.cooloff as i64);
        let mut fresh = false;
        self.noticed
            .entry(key.clone())
            .and_modify(|at| {
                if now - *at >= quiet {
                    *at = now;
                    fresh = true;
                }
            })
            .or_insert_with(|| {
                fresh = true;
                now
            });
        fresh
    }

    // --- health and history ---

    fn record_health(&self, snapshot: &HealthSnapshot) {
        let record = HealthRecord {
            at: snapshot.timestamp,
            status: snapshot.overall(),
            failed_checks: snapshot
                .failed_checks()
                .into_iter()
                .map(str::to_string)
                .collect(),
        };

        let mut log = self.log.write();
        if log.last.as_ref().map(|r| r.status) != Some(record.status) {
            info!(status = %record.status, failed = record.failed_checks.len(), "health changed");
        }
        log.last = Some(record.clone());
        log.records.push_back(record);
        while log.records.len() > self.config.engine.history_limit {
            log.records.pop_front();
        }
    }

    fn record_problem(&self, problem: &Problem) {
        let mut log = self.log.write();
        log.problems.push_back(problem.clone());
        while log.problems.len() > self.config.engine.history_limit {
            log.problems.pop_front();
        }
    }

    /// Rolled-up system health
    pub fn health(&self) -> HealthStatus {
        if self.warden.is_recovering() {
            return HealthStatus::Recovering;
        }
        self.log
            .read()
            .last
            .as_ref()
            .map(|r| r.status)
            .unwrap_or(HealthStatus::Unknown)
    }

    /// Health records, oldest first
    pub fn health_history(&self) -> Vec<HealthRecord> {
        self.log.read().records.iter().cloned().collect()
    }

    /// Problems the engine reacted to, newest first
    pub fn recent_problems(&self, limit: usize) -> Vec<Problem> {
        self.log
            .read()
            .problems
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn status(&self) -> EngineStatus {
        let d = &self.config.detector;
        EngineStatus {
            healing_enabled: self.healing.load(Ordering::SeqCst),
            auto_recovery: self.warden.is_enabled(),
            circuit_breaker_enabled: self.breakers.is_enabled(),
            health: self.health(),
            last_sample: self.log.read().last.clone(),
            breakers: self.breakers.stats(),
            active: self.warden.active(),
            escalations: self
                .warden
                .escalations()
                .into_iter()
                .map(|(key, since)| EscalationView {
                    resource: key.resource,
                    kind: key.kind,
                    since,
                })
                .collect(),
            recent_problems: self.recent_problems(STATUS_RECENT),
            recent_attempts: self.warden.recent(STATUS_RECENT),
            thresholds: Thresholds {
                failure_threshold: self.config.breaker.failure_threshold,
                consecutive_failures: d.consecutive_failures,
                degradation_multiplier: d.degradation_multiplier,
                memory_slope: d.memory_slope,
                error_rate: d.error_rate_threshold,
                escalation_threshold: self.config.recovery.escalation_threshold,
            },
            alerts_dropped: self.flare.dropped(),
        }
    }

    /// Lift an escalation latch so the key can be recovered again
    pub fn clear_escalation(&self, resource: &str, kind: ProblemKind) -> bool {
        self.warden.clear_escalation(resource, kind)
    }

    /// Stop the sampling loop and cancel active recoveries
    pub fn shutdown(&self) -> Vec<RecoveryAttempt> {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(rope) = self.rope.lock().as_ref() {
            rope.silence();
        }
        let cancelled = self.warden.shutdown();
        if !cancelled.is_empty() {
            warn!(count = cancelled.len(), "recoveries cancelled during shutdown");
        }
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulkhead::CircuitState;
    use crate::flare::AlertConfig;
    use crate::sickbay::probe::{ProbeReading, Signal};
    use async_trait::async_trait;
    use std::time::Duration;

    struct StaticProbe {
        name: String,
        resource: String,
        signal: Signal,
        reading: Mutex<ProbeReading>,
    }

    impl StaticProbe {
        fn new(name: &str, resource: &str, signal: Signal, reading: ProbeReading) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                resource: resource.into(),
                signal,
                reading: Mutex::new(reading),
            })
        }
    }

    #[async_trait]
    impl Probe for StaticProbe {
        fn name(&self) -> &str {
            &self.name
        }

        fn resource(&self) -> &str {
            &self.resource
        }

        fn signal(&self) -> Signal {
            self.signal
        }

        fn timeout(&self) -> Duration {
            Duration::from_secs(1)
        }

        async fn check(&self) -> Result<ProbeReading> {
            Ok(*self.reading.lock())
        }
    }

    fn bridge() -> Bridge {
        let (flare, _rx) = Flare::channel(&AlertConfig::default());
        Bridge::new(EngineConfig::default(), flare)
    }

    #[tokio::test]
    async fn test_guarded_call_passes_value_through() {
        let bridge = bridge();
        let value: std::result::Result<u32, CallError<Error>> =
            bridge.call("cache", async { Ok::<_, Error>(7) }).await;
        assert_eq!(value.unwrap(), 7);
        assert_eq!(bridge.breakers().state("cache"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guarded_call_times_out() {
        let bridge = bridge();
        let result: std::result::Result<(), CallError<Error>> = bridge
            .call("slow-svc", async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert!(matches!(
            result,
            Err(CallError::TimedOut(Error::CallTimeout { timeout_ms: 5000, .. }))
        ));
    }

    #[tokio::test]
    async fn test_open_breaker_rejects_without_running_operation() {
        let bridge = bridge();
        for _ in 0..5 {
            assert!(bridge.allow("db-primary").is_ok());
            bridge.report("db-primary", false, 3.0);
        }

        let ran = AtomicBool::new(false);
        let result: std::result::Result<(), CallError<Error>> = bridge
            .call("db-primary", async {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(result.unwrap_err().is_rejected());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_health_rollup_from_ticks() {
        let bridge = bridge()
            .with_probe(StaticProbe::new("a", "svc-a", Signal::Liveness, ProbeReading::ok(1.0)))
            .with_probe(StaticProbe::new("b", "svc-b", Signal::Liveness, ProbeReading::failed(0.0)));
        assert_eq!(bridge.health(), HealthStatus::Unknown);

        bridge.tick().await;
        assert_eq!(bridge.health(), HealthStatus::Degraded);
        assert_eq!(bridge.health_history().len(), 1);
        assert_eq!(bridge.status().last_sample.unwrap().failed_checks, vec!["b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependency_failure_trips_breaker_and_falls_back() {
        let bridge = bridge().with_probe(StaticProbe::new(
            "vector-ping",
            "vector-store",
            Signal::Dependency,
            ProbeReading::failed(-1.0),
        ));

        assert!(bridge.tick().await.is_empty());
        let detections = bridge.tick().await;
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].problem.kind, ProblemKind::IntegrationFailure);
        assert_eq!(bridge.breakers().state("vector-store"), CircuitState::Open);
        assert!(detections[0].dispatch.is_started());
        assert_eq!(bridge.recent_problems(10).len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_recovery_still_reports_once() {
        let config = EngineConfig {
            engine: crate::manifest::EngineSection {
                auto_recovery: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let bridge = Bridge::new(config, Flare::silent());
        let mut detections = 0;
        for _ in 0..8 {
            if bridge.report("db-primary", false, 1.0).is_some() {
                detections += 1;
            }
        }
        assert_eq!(detections, 1);
        assert!(!bridge.warden().is_recovering());
        assert!(!bridge.status().auto_recovery);
    }

    #[test]
    fn test_report_hook_without_runtime_does_not_panic() {
        let bridge = Bridge::new(EngineConfig::default(), Flare::silent());
        let detections: Vec<Detection> = (0..5)
            .filter_map(|_| {
                bridge.allow("db-primary").ok()?;
                bridge.report("db-primary", false, 2.0)
            })
            .collect();

        assert_eq!(detections.len(), 1);
        assert!(matches!(detections[0].dispatch, Dispatch::Disabled));
        assert_eq!(bridge.breakers().state("db-primary"), CircuitState::Open);
        assert!(bridge.allow("db-primary").unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn test_status_serializes() {
        let bridge = bridge();
        bridge.report("db-primary", true, 4.0);
        let json = serde_json::to_value(bridge.status()).unwrap();
        assert_eq!(json["health"], "unknown");
        assert_eq!(json["thresholds"]["failure_threshold"], 5);
        assert_eq!(json["breakers"][0]["resource"], "db-primary");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_run_loop() {
        let bridge = Arc::new(bridge());
        let runner = Arc::clone(&bridge);
        let task = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_secs(25)).await;
        bridge.shutdown();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bridge.health_history().len(), 3);
    }
}
