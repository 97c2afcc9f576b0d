//! Problem detection over sliding windows
//!
//! Two independent streams feed per-resource windows:
//! - periodic health snapshots (bound to resources through probe bindings)
//! - per-call operation outcomes from the protected-call hook
//!
//! Each resource has its own lock so unrelated resources never contend.
//! Detection keeps no state besides the windows themselves.

use crate::sickbay::problem::{Evidence, Problem, ProblemKind, severity_for};
use crate::sickbay::sampler::{HealthSnapshot, ProbeBinding};
use crate::sickbay::probe::Signal;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};

/// Detection thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Outcomes kept per resource
    #[serde(default = "default_outcome_window")]
    pub outcome_window: usize,

    /// Trailing failed outcomes that make a ConsecutiveFailures problem
    #[serde(default = "default_consecutive_failures")]
    pub consecutive_failures: u32,

    /// Span of a latency window in seconds
    #[serde(default = "default_latency_window_secs")]
    pub latency_window_secs: u64,

    /// Multiple of the baseline p95 above which a window is degraded
    #[serde(default = "default_degradation_multiplier")]
    pub degradation_multiplier: f64,

    /// Consecutive degraded windows needed to report degradation
    #[serde(default = "default_degradation_windows")]
    pub degradation_windows: u32,

    /// Healthy windows averaged into the rolling baseline
    #[serde(default = "default_baseline_windows")]
    pub baseline_windows: usize,

    /// Healthy windows required before a baseline exists
    #[serde(default = "default_min_baseline_windows")]
    pub min_baseline_windows: usize,

    /// Memory samples that must rise monotonically
    #[serde(default = "default_memory_samples")]
    pub memory_samples: usize,

    /// Average growth per sample above which memory is leaking
    #[serde(default = "default_memory_slope")]
    pub memory_slope: f64,

    /// Consecutive failed dependency samples for an IntegrationFailure
    #[serde(default = "default_integration_samples")]
    pub integration_samples: u32,

    /// Error ratio above which an error_rate reading counts as a failure
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
}

fn default_outcome_window() -> usize {
    20
}

fn default_consecutive_failures() -> u32 {
    5
}

fn default_latency_window_secs() -> u64 {
    10
}

fn default_degradation_multiplier() -> f64 {
    3.0
}

fn default_degradation_windows() -> u32 {
    3
}

fn default_baseline_windows() -> usize {
    6
}

fn default_min_baseline_windows() -> usize {
    3
}

fn default_memory_samples() -> usize {
    6
}

fn default_memory_slope() -> f64 {
    0.05
}

fn default_integration_samples() -> u32 {
    2
}

fn default_error_rate_threshold() -> f64 {
    0.1
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            outcome_window: default_outcome_window(),
            consecutive_failures: default_consecutive_failures(),
            latency_window_secs: default_latency_window_secs(),
            degradation_multiplier: default_degradation_multiplier(),
            degradation_windows: default_degradation_windows(),
            baseline_windows: default_baseline_windows(),
            min_baseline_windows: default_min_baseline_windows(),
            memory_samples: default_memory_samples(),
            memory_slope: default_memory_slope(),
            integration_samples: default_integration_samples(),
            error_rate_threshold: default_error_rate_threshold(),
        }
    }
}

impl DetectorConfig {
    fn latency_span(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.latency_window_secs as i64)
    }
}

/// Result of one call to a protected resource
#[derive(Debug, Clone, PartialEq)]
pub struct OperationOutcome {
    pub resource: String,
    pub success: bool,
    pub latency_ms: f64,
    pub at: DateTime<Utc>,
}

impl OperationOutcome {
    pub fn new(resource: impl Into<String>, success: bool, latency_ms: f64) -> Self {
        Self::at(resource, success, latency_ms, Utc::now())
    }

    pub fn at(
        resource: impl Into<String>,
        success: bool,
        latency_ms: f64,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            resource: resource.into(),
            success,
            latency_ms,
            at,
        }
    }
}

/// Latency samples collected for the window currently open
#[derive(Debug)]
struct LatencyBucket {
    started_at: DateTime<Utc>,
    samples: Vec<f64>,
}

/// A closed window whose p95 exceeded the baseline multiple
#[derive(Debug, Clone, Copy)]
struct DegradedWindow {
    p95: f64,
    baseline: f64,
}

/// All evidence windows of one resource
#[derive(Debug, Default)]
struct ResourceWindows {
    /// Call and liveness outcomes, oldest first (true = success)
    outcomes: VecDeque<bool>,
    /// Window currently collecting latency samples
    bucket: Option<LatencyBucket>,
    /// p95 of recent healthy windows
    baseline: VecDeque<f64>,
    /// Most recent degraded windows of the trailing run
    streak: VecDeque<DegradedWindow>,
    /// Length of the trailing run of degraded windows
    degraded_run: u32,
    memory: VecDeque<f64>,
    memory_probe: Option<String>,
    /// Dependency reachability samples (true = reachable)
    dependency: VecDeque<bool>,
    dependency_probe: Option<String>,
}

impl ResourceWindows {
    fn push_outcome(&mut self, success: bool, config: &DetectorConfig) {
        self.outcomes.push_back(success);
        while self.outcomes.len() > config.outcome_window.max(1) {
            self.outcomes.pop_front();
        }
    }

    fn push_latency(&mut self, latency_ms: f64, at: DateTime<Utc>, config: &DetectorConfig) {
        if !latency_ms.is_finite() || latency_ms < 0.0 {
            return;
        }
        self.advance(at, config);
        self.bucket
            .get_or_insert_with(|| LatencyBucket {
                started_at: at,
                samples: Vec::new(),
            })
            .samples
            .push(latency_ms);
    }

    /// Close the open latency window if `now` is past its span.
    /// Returns true when a window closed.
    fn advance(&mut self, now: DateTime<Utc>, config: &DetectorConfig) -> bool {
        let expired = self
            .bucket
            .as_ref()
            .is_some_and(|b| now >= b.started_at + config.latency_span());
        if !expired {
            return false;
        }
        if let Some(bucket) = self.bucket.take() {
            self.close_window(bucket, config);
        }
        true
    }

    fn close_window(&mut self, bucket: LatencyBucket, config: &DetectorConfig) {
        let Some(p95) = percentile_95(bucket.samples) else {
            return;
        };

        let baseline = if self.baseline.len() >= config.min_baseline_windows.max(1) {
            Some(self.baseline.iter().sum::<f64>() / self.baseline.len() as f64)
        } else {
            None
        };

        match baseline {
            Some(baseline) if p95 > baseline * config.degradation_multiplier => {
                trace!(p95, baseline, "latency window degraded");
                self.streak.push_back(DegradedWindow { p95, baseline });
                while self.streak.len() > config.degradation_windows.max(1) as usize {
                    self.streak.pop_front();
                }
                self.degraded_run = self.degraded_run.saturating_add(1);
            }
            _ => {
                self.streak.clear();
                self.degraded_run = 0;
                self.baseline.push_back(p95);
                while self.baseline.len() > config.baseline_windows.max(1) {
                    self.baseline.pop_front();
                }
            }
        }
    }

    fn push_memory(&mut self, probe: &str, value: f64, config: &DetectorConfig) {
        self.memory_probe = Some(probe.to_string());
        self.memory.push_back(value);
        while self.memory.len() > config.memory_samples.max(2) {
            self.memory.pop_front();
        }
    }

    fn push_dependency(&mut self, probe: &str, reachable: bool, config: &DetectorConfig) {
        self.dependency_probe = Some(probe.to_string());
        self.dependency.push_back(reachable);
        let cap = (config.integration_samples as usize).max(1) * 4;
        while self.dependency.len() > cap {
            self.dependency.pop_front();
        }
    }

    fn check(
        &self,
        kind: ProblemKind,
        resource: &str,
        config: &DetectorConfig,
        now: DateTime<Utc>,
    ) -> Option<Problem> {
        match kind {
            ProblemKind::ConsecutiveFailures => {
                let threshold = config.consecutive_failures.max(1);
                let failures = trailing(&self.outcomes, false);
                (failures >= threshold).then(|| {
                    Problem::new(
                        kind,
                        resource,
                        severity_for(failures as f64, threshold as f64),
                        Evidence {
                            window_size: self.outcomes.len(),
                            failure_count: Some(failures),
                            ..Default::default()
                        },
                        now,
                    )
                })
            }
            ProblemKind::IntegrationFailure => {
                let threshold = config.integration_samples.max(1);
                let failed = trailing(&self.dependency, false);
                (failed >= threshold).then(|| {
                    Problem::new(
                        kind,
                        resource,
                        severity_for(failed as f64, threshold as f64),
                        Evidence {
                            window_size: self.dependency.len(),
                            failed_samples: Some(failed),
                            probe: self.dependency_probe.clone(),
                            ..Default::default()
                        },
                        now,
                    )
                })
            }
            ProblemKind::PerformanceDegradation => {
                let needed = config.degradation_windows.max(1) as usize;
                if self.streak.len() < needed {
                    return None;
                }
                let ratio = self.streak.iter().map(|w| w.p95 / w.baseline).sum::<f64>()
                    / self.streak.len() as f64;
                let last = self.streak.back().copied()?;
                Some(Problem::new(
                    kind,
                    resource,
                    severity_for(ratio, config.degradation_multiplier),
                    Evidence {
                        window_size: self.streak.len() + self.baseline.len(),
                        latency_p95: Some(last.p95),
                        baseline_p95: Some(last.baseline),
                        degraded_windows: Some(self.degraded_run),
                        ..Default::default()
                    },
                    now,
                ))
            }
            ProblemKind::MemoryLeak => {
                let needed = config.memory_samples.max(2);
                if self.memory.len() < needed {
                    return None;
                }
                let series: Vec<f64> = self.memory.iter().rev().take(needed).rev().copied().collect();
                let monotonic = series.windows(2).all(|w| w[1] > w[0]);
                let slope = (series[series.len() - 1] - series[0]) / (series.len() - 1) as f64;
                (monotonic && slope > config.memory_slope).then(|| {
                    Problem::new(
                        kind,
                        resource,
                        severity_for(slope, config.memory_slope),
                        Evidence {
                            window_size: series.len(),
                            memory_slope: Some(slope),
                            probe: self.memory_probe.clone(),
                            ..Default::default()
                        },
                        now,
                    )
                })
            }
        }
    }

    fn clear(&mut self, kind: ProblemKind) {
        match kind {
            ProblemKind::ConsecutiveFailures => self.outcomes.clear(),
            ProblemKind::IntegrationFailure => self.dependency.clear(),
            ProblemKind::PerformanceDegradation => {
                self.streak.clear();
                self.degraded_run = 0;
                self.bucket = None;
            }
            ProblemKind::MemoryLeak => self.memory.clear(),
        }
    }
}

/// Length of the trailing run of `value` in a window
fn trailing(window: &VecDeque<bool>, value: bool) -> u32 {
    window.iter().rev().take_while(|v| **v == value).count() as u32
}

/// Nearest-rank 95th percentile
fn percentile_95(mut samples: Vec<f64>) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_by(|a, b| a.total_cmp(b));
    let rank = (0.95 * samples.len() as f64).ceil() as usize;
    Some(samples[rank.saturating_sub(1).min(samples.len() - 1)])
}

/// Classifies resource behavior into problems
pub struct ProblemDetector {
    config: DetectorConfig,
    windows: DashMap<String, Arc<Mutex<ResourceWindows>>>,
    bindings: RwLock<HashMap<String, ProbeBinding>>,
}

impl ProblemDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            bindings: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Tell the detector what a snapshot key means
    pub fn bind(&self, binding: ProbeBinding) {
        self.bindings.write().insert(binding.probe.clone(), binding);
    }

    fn windows_for(&self, resource: &str) -> Arc<Mutex<ResourceWindows>> {
        if let Some(entry) = self.windows.get(resource) {
            return Arc::clone(entry.value());
        }
        Arc::clone(self.windows.entry(resource.to_string()).or_default().value())
    }

    /// Feed a per-call outcome
    pub fn observe_outcome(&self, outcome: &OperationOutcome) {
        let windows = self.windows_for(&outcome.resource);
        let mut w = windows.lock();
        w.push_outcome(outcome.success, &self.config);
        w.push_latency(outcome.latency_ms, outcome.at, &self.config);
    }

    /// Feed a health snapshot
    ///
    /// Returns the resources whose windows changed, in a stable order.
    pub fn observe_snapshot(&self, snapshot: &HealthSnapshot) -> Vec<String> {
        let mut touched: Vec<String> = Vec::new();
        let bindings = self.bindings.read().clone();

        for (name, ok) in &snapshot.checks {
            let Some(binding) = bindings.get(name) else {
                trace!(probe = %name, "snapshot check has no binding");
                continue;
            };
            let value = snapshot.metrics.get(name).copied();
            let windows = self.windows_for(&binding.resource);
            let mut w = windows.lock();

            match binding.signal {
                Signal::Liveness => w.push_outcome(*ok, &self.config),
                Signal::ErrorRate => {
                    let healthy = *ok
                        && value.is_some_and(|v| v <= self.config.error_rate_threshold);
                    w.push_outcome(healthy, &self.config);
                }
                Signal::Latency => {
                    if let (true, Some(v)) = (*ok, value) {
                        w.push_latency(v, snapshot.timestamp, &self.config);
                    }
                }
                Signal::Memory => {
                    if let (true, Some(v)) = (*ok, value) {
                        w.push_memory(name, v, &self.config);
                    }
                }
                Signal::Dependency => w.push_dependency(name, *ok, &self.config),
            }
            drop(w);

            if !touched.contains(&binding.resource) {
                touched.push(binding.resource.clone());
            }
        }

        // Snapshots also move time forward for resources without traffic
        for resource in self.advance(snapshot.timestamp) {
            if !touched.contains(&resource) {
                touched.push(resource);
            }
        }

        touched.sort();
        touched
    }

    /// Close expired latency windows; returns resources where one closed
    pub fn advance(&self, now: DateTime<Utc>) -> Vec<String> {
        let all: Vec<(String, Arc<Mutex<ResourceWindows>>)> = self
            .windows
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        all.into_iter()
            .filter(|(_, windows)| windows.lock().advance(now, &self.config))
            .map(|(resource, _)| resource)
            .collect()
    }

    /// Strongest problem currently evidenced for a resource
    pub fn evaluate(&self, resource: &str) -> Option<Problem> {
        let windows = self.windows.get(resource).map(|e| Arc::clone(e.value()))?;
        let w = windows.lock();
        let now = Utc::now();

        let best = ProblemKind::ALL
            .iter()
            .filter_map(|kind| w.check(*kind, resource, &self.config, now))
            .fold(None::<Problem>, |best, candidate| match best {
                Some(b) if !candidate.outranks(&b) => Some(b),
                _ => Some(candidate),
            });

        if let Some(problem) = &best {
            debug!(
                resource,
                kind = %problem.kind,
                severity = problem.severity,
                "problem evidenced"
            );
        }
        best
    }

    /// Problem of one specific kind, if evidenced
    pub fn evaluate_kind(&self, resource: &str, kind: ProblemKind) -> Option<Problem> {
        let windows = self.windows.get(resource).map(|e| Arc::clone(e.value()))?;
        let w = windows.lock();
        w.check(kind, resource, &self.config, Utc::now())
    }

    /// Drop the evidence that contributed to `kind` on `resource`
    pub fn clear(&self, resource: &str, kind: ProblemKind) {
        if let Some(windows) = self.windows.get(resource).map(|e| Arc::clone(e.value())) {
            windows.lock().clear(kind);
            debug!(resource, kind = %kind, "evidence cleared");
        }
    }

    pub fn resources(&self) -> Vec<String> {
        let mut resources: Vec<String> = self.windows.iter().map(|e| e.key().clone()).collect();
        resources.sort();
        resources
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sickbay::probe::ProbeReading;
    use chrono::Duration as ChronoDuration;

    fn detector() -> ProblemDetector {
        ProblemDetector::new(DetectorConfig::default())
    }

    fn bind(detector: &ProblemDetector, probe: &str, resource: &str, signal: Signal) {
        detector.bind(ProbeBinding {
            probe: probe.to_string(),
            resource: resource.to_string(),
            signal,
        });
    }

    #[test]
    fn test_percentile_95() {
        assert_eq!(percentile_95(vec![]), None);
        assert_eq!(percentile_95(vec![7.0]), Some(7.0));
        let samples: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        assert_eq!(percentile_95(samples), Some(95.0));
        assert_eq!(percentile_95(vec![10.0, 1.0, 5.0]), Some(10.0));
    }

    #[test]
    fn test_consecutive_failures() {
        let d = detector();
        for _ in 0..4 {
            d.observe_outcome(&OperationOutcome::new("db-primary", false, 10.0));
        }
        assert!(d.evaluate("db-primary").is_none());

        d.observe_outcome(&OperationOutcome::new("db-primary", false, 10.0));
        let problem = d.evaluate("db-primary").unwrap();
        assert_eq!(problem.kind, ProblemKind::ConsecutiveFailures);
        assert_eq!(problem.evidence.failure_count, Some(5));
        assert_eq!(problem.severity, 0.5);
    }

    #[test]
    fn test_success_breaks_failure_run() {
        let d = detector();
        for _ in 0..4 {
            d.observe_outcome(&OperationOutcome::new("db", false, 10.0));
        }
        d.observe_outcome(&OperationOutcome::new("db", true, 10.0));
        for _ in 0..4 {
            d.observe_outcome(&OperationOutcome::new("db", false, 10.0));
        }
        assert!(d.evaluate("db").is_none());
    }

    #[test]
    fn test_performance_degradation_needs_sustained_windows() {
        let d = detector();
        let t0 = Utc::now();
        let at = |secs: i64| t0 + ChronoDuration::seconds(secs);

        // Four healthy 10s windows around 100ms
        for window in 0..4 {
            for i in 0..5 {
                d.observe_outcome(&OperationOutcome::at("search-svc", true, 100.0, at(window * 10 + i)));
            }
        }
        // One spike window, then recovery: no problem
        for i in 0..5 {
            d.observe_outcome(&OperationOutcome::at("search-svc", true, 900.0, at(40 + i)));
        }
        for i in 0..5 {
            d.observe_outcome(&OperationOutcome::at("search-svc", true, 100.0, at(50 + i)));
        }
        d.advance(at(60));
        assert!(d.evaluate_kind("search-svc", ProblemKind::PerformanceDegradation).is_none());

        // Three consecutive degraded windows
        for window in 6..9 {
            for i in 0..5 {
                d.observe_outcome(&OperationOutcome::at("search-svc", true, 450.0, at(window * 10 + i)));
            }
        }
        assert!(d.evaluate("search-svc").is_none());
        d.advance(at(90));

        let problem = d.evaluate("search-svc").unwrap();
        assert_eq!(problem.kind, ProblemKind::PerformanceDegradation);
        assert!(problem.severity > 0.0);
        assert_eq!(problem.evidence.degraded_windows, Some(3));
        assert_eq!(problem.evidence.latency_p95, Some(450.0));
    }

    #[test]
    fn test_long_degradation_keeps_bounded_evidence() {
        let d = detector();
        let t0 = Utc::now();
        let at = |secs: i64| t0 + ChronoDuration::seconds(secs);

        for window in 0..203 {
            let latency = if window < 3 { 100.0 } else { 500.0 };
            d.observe_outcome(&OperationOutcome::at("search-svc", true, latency, at(window * 10)));
        }
        d.advance(at(2030));

        let problem = d
            .evaluate_kind("search-svc", ProblemKind::PerformanceDegradation)
            .unwrap();
        assert_eq!(problem.evidence.degraded_windows, Some(200));
        // Three retained degraded windows plus the three-window baseline
        assert_eq!(problem.evidence.window_size, 6);
        assert_eq!(problem.evidence.latency_p95, Some(500.0));
    }

    #[test]
    fn test_memory_leak_from_snapshots() {
        let d = detector();
        bind(&d, "worker-7-rss", "worker-7", Signal::Memory);
        let t0 = Utc::now();

        for (i, value) in [0.40, 0.46, 0.52, 0.58, 0.64].iter().enumerate() {
            let snap = HealthSnapshot::new(t0 + ChronoDuration::seconds(i as i64 * 10))
                .with_reading("worker-7-rss", ProbeReading::ok(*value));
            assert_eq!(d.observe_snapshot(&snap), vec!["worker-7".to_string()]);
        }
        assert!(d.evaluate("worker-7").is_none());

        let snap = HealthSnapshot::new(t0 + ChronoDuration::seconds(50))
            .with_reading("worker-7-rss", ProbeReading::ok(0.70));
        d.observe_snapshot(&snap);

        let problem = d.evaluate("worker-7").unwrap();
        assert_eq!(problem.kind, ProblemKind::MemoryLeak);
        assert_eq!(problem.evidence.probe.as_deref(), Some("worker-7-rss"));
        assert!(problem.evidence.memory_slope.unwrap() > 0.05);
    }

    #[test]
    fn test_flat_memory_is_not_a_leak() {
        let d = detector();
        bind(&d, "rss", "worker-1", Signal::Memory);
        let t0 = Utc::now();
        for (i, value) in [0.4, 0.5, 0.5, 0.6, 0.7, 0.8].iter().enumerate() {
            let snap = HealthSnapshot::new(t0 + ChronoDuration::seconds(i as i64))
                .with_reading("rss", ProbeReading::ok(*value));
            d.observe_snapshot(&snap);
        }
        assert!(d.evaluate("worker-1").is_none());
    }

    #[test]
    fn test_integration_failure_needs_two_samples() {
        let d = detector();
        bind(&d, "vector-store-ping", "vector-store", Signal::Dependency);
        let t0 = Utc::now();

        let failed = |secs| {
            HealthSnapshot::new(t0 + ChronoDuration::seconds(secs))
                .with_reading("vector-store-ping", ProbeReading::failed(-1.0))
        };
        d.observe_snapshot(&failed(0));
        assert!(d.evaluate("vector-store").is_none());
        d.observe_snapshot(&failed(10));

        let problem = d.evaluate("vector-store").unwrap();
        assert_eq!(problem.kind, ProblemKind::IntegrationFailure);
        assert_eq!(problem.evidence.failed_samples, Some(2));
    }

    #[test]
    fn test_error_rate_readings_feed_failures() {
        let d = detector();
        bind(&d, "router-errors", "llm-router", Signal::ErrorRate);
        let t0 = Utc::now();
        for i in 0..5 {
            let snap = HealthSnapshot::new(t0 + ChronoDuration::seconds(i))
                .with_reading("router-errors", ProbeReading::ok(0.35));
            d.observe_snapshot(&snap);
        }
        let problem = d.evaluate("llm-router").unwrap();
        assert_eq!(problem.kind, ProblemKind::ConsecutiveFailures);
    }

    #[test]
    fn test_tie_break_prefers_availability() {
        let d = detector();
        bind(&d, "dep", "cache", Signal::Dependency);
        let t0 = Utc::now();
        // 5 failures at threshold 5 and 2 failed samples at threshold 2: both 0.5
        for _ in 0..5 {
            d.observe_outcome(&OperationOutcome::new("cache", false, 1.0));
        }
        for i in 0..2 {
            let snap = HealthSnapshot::new(t0 + ChronoDuration::seconds(i))
                .with_reading("dep", ProbeReading::failed(-1.0));
            d.observe_snapshot(&snap);
        }
        let problem = d.evaluate("cache").unwrap();
        assert_eq!(problem.severity, 0.5);
        assert_eq!(problem.kind, ProblemKind::ConsecutiveFailures);
    }

    #[test]
    fn test_clear_drops_only_contributing_evidence() {
        let d = detector();
        bind(&d, "dep", "cache", Signal::Dependency);
        for _ in 0..5 {
            d.observe_outcome(&OperationOutcome::new("cache", false, 1.0));
        }
        let t0 = Utc::now();
        for i in 0..2 {
            let snap = HealthSnapshot::new(t0 + ChronoDuration::seconds(i))
                .with_reading("dep", ProbeReading::failed(-1.0));
            d.observe_snapshot(&snap);
        }

        d.clear("cache", ProblemKind::ConsecutiveFailures);
        let problem = d.evaluate("cache").unwrap();
        assert_eq!(problem.kind, ProblemKind::IntegrationFailure);

        d.clear("cache", ProblemKind::IntegrationFailure);
        assert!(d.evaluate("cache").is_none());
    }

    #[test]
    fn test_unbound_checks_are_ignored() {
        let d = detector();
        let snap = HealthSnapshot::new(Utc::now()).with_reading("mystery", ProbeReading::failed(0.0));
        assert!(d.observe_snapshot(&snap).is_empty());
        assert!(d.resources().is_empty());
    }
}
