//! Problem classification records
//!
//! A [`Problem`] is created once by the detector and never mutated; recovery
//! attempts hold it by `Arc` so the record outlives them for audit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of degradations the detector can classify
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemKind {
    /// N consecutive failed outcomes for one resource
    ConsecutiveFailures,
    /// External dependency probe failing across consecutive samples
    IntegrationFailure,
    /// Windowed p95 latency sustained above a multiple of the baseline
    PerformanceDegradation,
    /// Monotonic upward trend in a memory metric
    MemoryLeak,
}

impl ProblemKind {
    /// All kinds, highest priority first
    pub const ALL: [ProblemKind; 4] = [
        ProblemKind::ConsecutiveFailures,
        ProblemKind::IntegrationFailure,
        ProblemKind::PerformanceDegradation,
        ProblemKind::MemoryLeak,
    ];

    /// Tie-break priority (higher wins). Availability problems outrank
    /// soft degradation.
    pub fn priority(&self) -> u8 {
        match self {
            ProblemKind::ConsecutiveFailures => 4,
            ProblemKind::IntegrationFailure => 3,
            ProblemKind::PerformanceDegradation => 2,
            ProblemKind::MemoryLeak => 1,
        }
    }

    /// Whether the detector verdict should trip the resource's breaker
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            ProblemKind::ConsecutiveFailures | ProblemKind::IntegrationFailure
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProblemKind::ConsecutiveFailures => "consecutive_failures",
            ProblemKind::IntegrationFailure => "integration_failure",
            ProblemKind::PerformanceDegradation => "performance_degradation",
            ProblemKind::MemoryLeak => "memory_leak",
        }
    }

    /// Operator-facing advice attached to problem alerts
    pub fn recommendation(&self) -> &'static str {
        match self {
            ProblemKind::ConsecutiveFailures => {
                "Check the resource and its circuit breaker; upstream callers should use their fallback"
            }
            ProblemKind::IntegrationFailure => {
                "Verify connectivity to the dependency; fallback mode is active meanwhile"
            }
            ProblemKind::PerformanceDegradation => {
                "Look for slow queries or saturation and add capacity if needed"
            }
            ProblemKind::MemoryLeak => {
                "Investigate allocations in the component; it will be restarted"
            }
        }
    }
}

impl std::fmt::Display for ProblemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Measurements that justified a detection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// Number of observations the rule looked at
    pub window_size: usize,
    /// Trailing failed outcomes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_count: Option<u32>,
    /// p95 latency of the most recent closed window (ms)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_p95: Option<f64>,
    /// Rolling baseline p95 the window was compared against (ms)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_p95: Option<f64>,
    /// Consecutive degraded windows
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_windows: Option<u32>,
    /// Average memory growth per sample
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_slope: Option<f64>,
    /// Consecutive failed dependency samples
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_samples: Option<u32>,
    /// Probe that produced the signal, when the evidence came from snapshots
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe: Option<String>,
}

/// A classified, severity-scored detection for one resource
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Problem {
    pub id: Uuid,
    pub kind: ProblemKind,
    /// Normalized in [0, 1]
    pub severity: f64,
    pub resource: String,
    pub evidence: Evidence,
    pub detected_at: DateTime<Utc>,
}

impl Problem {
    pub fn new(
        kind: ProblemKind,
        resource: impl Into<String>,
        severity: f64,
        evidence: Evidence,
        detected_at: DateTime<Utc>,
    ) -> Self {
        let severity = if severity.is_nan() {
            0.0
        } else {
            severity.clamp(0.0, 1.0)
        };
        Self {
            id: Uuid::new_v4(),
            kind,
            severity,
            resource: resource.into(),
            evidence,
            detected_at,
        }
    }

    /// Human-readable summary for alerts and logs
    pub fn description(&self) -> String {
        let e = &self.evidence;
        match self.kind {
            ProblemKind::ConsecutiveFailures => format!(
                "{} consecutive failures on '{}'",
                e.failure_count.unwrap_or_default(),
                self.resource
            ),
            ProblemKind::IntegrationFailure => format!(
                "dependency '{}' unreachable for {} samples",
                self.resource,
                e.failed_samples.unwrap_or_default()
            ),
            ProblemKind::PerformanceDegradation => format!(
                "p95 latency on '{}' at {:.0}ms against a {:.0}ms baseline for {} windows",
                self.resource,
                e.latency_p95.unwrap_or_default(),
                e.baseline_p95.unwrap_or_default(),
                e.degraded_windows.unwrap_or_default()
            ),
            ProblemKind::MemoryLeak => format!(
                "memory on '{}' growing {:.3}/sample over {} samples",
                self.resource,
                e.memory_slope.unwrap_or_default(),
                e.window_size
            ),
        }
    }

    /// Ordering used when several kinds qualify for the same resource
    pub fn outranks(&self, other: &Problem) -> bool {
        match self.severity.partial_cmp(&other.severity) {
            Some(std::cmp::Ordering::Greater) => true,
            Some(std::cmp::Ordering::Less) => false,
            _ => self.kind.priority() > other.kind.priority(),
        }
    }
}

/// Severity floor at exactly the threshold
const SEVERITY_FLOOR: f64 = 0.5;

/// Normalized severity for a measurement past its threshold
///
/// Returns 0.5 at the threshold and reaches 1.0 when the observation is
/// twice the threshold.
pub fn severity_for(observed: f64, threshold: f64) -> f64 {
    let overshoot = if threshold <= 0.0 {
        1.0
    } else {
        ((observed - threshold) / threshold).clamp(0.0, 1.0)
    };
    (SEVERITY_FLOOR + (1.0 - SEVERITY_FLOOR) * overshoot).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problem(kind: ProblemKind, severity: f64) -> Problem {
        Problem::new(kind, "svc", severity, Evidence::default(), Utc::now())
    }

    #[test]
    fn test_severity_is_clamped() {
        assert_eq!(problem(ProblemKind::MemoryLeak, 3.0).severity, 1.0);
        assert_eq!(problem(ProblemKind::MemoryLeak, -1.0).severity, 0.0);
        assert_eq!(problem(ProblemKind::MemoryLeak, f64::NAN).severity, 0.0);
    }

    #[test]
    fn test_severity_for() {
        assert_eq!(severity_for(5.0, 5.0), 0.5);
        assert_eq!(severity_for(10.0, 5.0), 1.0);
        assert_eq!(severity_for(50.0, 5.0), 1.0);
        assert!((severity_for(7.5, 5.0) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_outranks_by_severity_then_priority() {
        let cf = problem(ProblemKind::ConsecutiveFailures, 0.6);
        let ml = problem(ProblemKind::MemoryLeak, 0.8);
        assert!(ml.outranks(&cf));

        let cf = problem(ProblemKind::ConsecutiveFailures, 0.7);
        let integ = problem(ProblemKind::IntegrationFailure, 0.7);
        let perf = problem(ProblemKind::PerformanceDegradation, 0.7);
        assert!(cf.outranks(&integ));
        assert!(integ.outranks(&perf));
        assert!(!perf.outranks(&cf));
    }

    #[test]
    fn test_kind_display_and_trips() {
        assert_eq!(ProblemKind::MemoryLeak.to_string(), "memory_leak");
        assert!(ProblemKind::IntegrationFailure.trips_breaker());
        assert!(!ProblemKind::PerformanceDegradation.trips_breaker());
    }
}
