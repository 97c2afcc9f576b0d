//! Periodic health sampling
//!
//! The sampler runs every registered probe concurrently under a hard
//! deadline and folds the readings into an immutable [`HealthSnapshot`].
//! Scheduling lives in [`crate::bell`]; this module never sleeps.

use crate::error::Error;
use crate::sickbay::probe::{Probe, ProbeReading, Signal};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Metric value recorded for probes that errored or timed out
pub const PROBE_SENTINEL: f64 = -1.0;

/// Rolled-up health of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// No failed checks
    Healthy,
    /// One or two failed checks
    Degraded,
    /// Three or more failed checks
    Critical,
    /// At least one recovery attempt in flight
    Recovering,
    /// Nothing sampled yet
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Critical => write!(f, "critical"),
            HealthStatus::Recovering => write!(f, "recovering"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Immutable result of one sampling tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub checks: BTreeMap<String, bool>,
    pub metrics: BTreeMap<String, f64>,
}

impl HealthSnapshot {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            checks: BTreeMap::new(),
            metrics: BTreeMap::new(),
        }
    }

    /// Record a probe reading (builder style, handy for synthetic snapshots)
    pub fn with_reading(mut self, name: &str, reading: ProbeReading) -> Self {
        self.checks.insert(name.to_string(), reading.ok);
        self.metrics.insert(name.to_string(), reading.value);
        self
    }

    pub fn failed_checks(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn overall(&self) -> HealthStatus {
        match self.failed_checks().len() {
            0 => HealthStatus::Healthy,
            1 | 2 => HealthStatus::Degraded,
            _ => HealthStatus::Critical,
        }
    }
}

/// Sampler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SamplerConfig {
    /// Interval between sampling ticks in seconds
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// Share of the interval a tick may take before probes are cancelled
    #[serde(default = "default_deadline_ratio")]
    pub deadline_ratio: f64,
}

fn default_interval() -> u64 {
    10
}

fn default_deadline_ratio() -> f64 {
    0.8
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            deadline_ratio: default_deadline_ratio(),
        }
    }
}

impl SamplerConfig {
    pub fn interval_duration(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    /// Hard deadline for a whole `sample()` call
    pub fn deadline(&self) -> Duration {
        self.interval_duration().mul_f64(self.deadline_ratio)
    }
}

/// Static description of a registered probe, used to bind snapshot keys
/// to detector series
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeBinding {
    pub probe: String,
    pub resource: String,
    pub signal: Signal,
}

/// Runs probes and produces snapshots
pub struct HealthSampler {
    config: SamplerConfig,
    probes: Vec<Arc<dyn Probe>>,
}

impl HealthSampler {
    pub fn new(config: SamplerConfig) -> Self {
        Self {
            config,
            probes: Vec::new(),
        }
    }

    /// Register a probe
    pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probes.push(probe);
        self
    }

    pub fn interval(&self) -> Duration {
        self.config.interval_duration()
    }

    pub fn deadline(&self) -> Duration {
        self.config.deadline()
    }

    pub fn bindings(&self) -> Vec<ProbeBinding> {
        self.probes
            .iter()
            .map(|p| ProbeBinding {
                probe: p.name().to_string(),
                resource: p.resource().to_string(),
                signal: p.signal(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Run all probes once
    ///
    /// Never fails: errors and timeouts become `ok=false` readings with
    /// [`PROBE_SENTINEL`] as the value.
    pub async fn sample(&self) -> HealthSnapshot {
        let deadline = self.deadline();
        let readings = join_all(
            self.probes
                .iter()
                .map(|probe| run_probe(Arc::clone(probe), deadline)),
        )
        .await;

        let mut snapshot = HealthSnapshot::new(Utc::now());
        for (name, reading) in readings {
            snapshot = snapshot.with_reading(&name, reading);
        }

        debug!(
            checks = snapshot.checks.len(),
            failed = snapshot.failed_checks().len(),
            "health snapshot taken"
        );
        snapshot
    }
}

async fn run_probe(probe: Arc<dyn Probe>, deadline: Duration) -> (String, ProbeReading) {
    let name = probe.name().to_string();
    let timeout = probe.timeout().min(deadline);

    let reading = match tokio::time::timeout(timeout, probe.check()).await {
        Ok(Ok(reading)) => reading,
        Ok(Err(e)) => {
            warn!(probe = %name, error = %e, "probe errored");
            ProbeReading::failed(PROBE_SENTINEL)
        }
        Err(_) => {
            let e = Error::ProbeTimeout {
                probe: name.clone(),
                timeout_ms: timeout.as_millis() as u64,
            };
            warn!(probe = %name, error = %e, "probe cancelled");
            ProbeReading::failed(PROBE_SENTINEL)
        }
    };

    (name, reading)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use async_trait::async_trait;

    struct FixedProbe {
        name: String,
        result: std::result::Result<ProbeReading, String>,
        delay: Duration,
    }

    impl FixedProbe {
        fn new(name: &str, result: std::result::Result<ProbeReading, String>) -> Self {
            Self {
                name: name.to_string(),
                result,
                delay: Duration::ZERO,
            }
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl Probe for FixedProbe {
        fn name(&self) -> &str {
            &self.name
        }

        fn resource(&self) -> &str {
            "svc"
        }

        fn signal(&self) -> Signal {
            Signal::Liveness
        }

        fn timeout(&self) -> Duration {
            Duration::from_secs(60)
        }

        async fn check(&self) -> Result<ProbeReading> {
            tokio::time::sleep(self.delay).await;
            self.result.clone().map_err(|message| Error::ProbeFailed {
                probe: self.name.clone(),
                message,
            })
        }
    }

    fn config(interval: u64) -> SamplerConfig {
        SamplerConfig {
            interval,
            deadline_ratio: 0.8,
        }
    }

    #[test]
    fn test_deadline_is_share_of_interval() {
        assert_eq!(config(10).deadline(), Duration::from_secs(8));
    }

    #[test]
    fn test_overall_rollup() {
        let now = Utc::now();
        let healthy = HealthSnapshot::new(now).with_reading("a", ProbeReading::ok(1.0));
        assert_eq!(healthy.overall(), HealthStatus::Healthy);

        let degraded = healthy
            .clone()
            .with_reading("b", ProbeReading::failed(PROBE_SENTINEL));
        assert_eq!(degraded.overall(), HealthStatus::Degraded);

        let critical = degraded
            .with_reading("c", ProbeReading::failed(0.0))
            .with_reading("d", ProbeReading::failed(0.0));
        assert_eq!(critical.overall(), HealthStatus::Critical);
        assert_eq!(critical.failed_checks(), vec!["b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_sample_records_errors_as_failed() {
        let sampler = HealthSampler::new(config(10))
            .with_probe(Arc::new(FixedProbe::new("up", Ok(ProbeReading::ok(3.0)))))
            .with_probe(Arc::new(FixedProbe::new("broken", Err("refused".into()))));

        let snapshot = sampler.sample().await;
        assert!(snapshot.checks["up"]);
        assert_eq!(snapshot.metrics["up"], 3.0);
        assert!(!snapshot.checks["broken"]);
        assert_eq!(snapshot.metrics["broken"], PROBE_SENTINEL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_cancels_probes_past_deadline() {
        let sampler = HealthSampler::new(config(10))
            .with_probe(Arc::new(
                FixedProbe::new("hung", Ok(ProbeReading::ok(1.0))).slow(Duration::from_secs(3600)),
            ))
            .with_probe(Arc::new(FixedProbe::new("fast", Ok(ProbeReading::ok(1.0)))));

        let started = tokio::time::Instant::now();
        let snapshot = sampler.sample().await;

        assert!(started.elapsed() <= Duration::from_secs(8));
        assert!(!snapshot.checks["hung"]);
        assert_eq!(snapshot.metrics["hung"], PROBE_SENTINEL);
        assert!(snapshot.checks["fast"]);
    }

    #[test]
    fn test_bindings() {
        let sampler = HealthSampler::new(config(10))
            .with_probe(Arc::new(FixedProbe::new("up", Ok(ProbeReading::ok(1.0)))));
        let bindings = sampler.bindings();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].probe, "up");
        assert_eq!(bindings[0].resource, "svc");
    }
}
