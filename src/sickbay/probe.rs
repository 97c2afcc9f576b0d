//! Health probe definitions
//!
//! A probe is a named capability that reports `(ok, value)` for one
//! resource. The sampler owns timeouts; probes only need to do the check.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// What a probe's reading means to the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    /// The check result feeds the resource's failure stream
    #[default]
    Liveness,
    /// The value is an error ratio; above threshold counts as a failure
    ErrorRate,
    /// The value is a latency sample in milliseconds
    Latency,
    /// The value feeds the memory trend series
    Memory,
    /// The check reports reachability of an external dependency
    Dependency,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Liveness => write!(f, "liveness"),
            Signal::ErrorRate => write!(f, "error_rate"),
            Signal::Latency => write!(f, "latency"),
            Signal::Memory => write!(f, "memory"),
            Signal::Dependency => write!(f, "dependency"),
        }
    }
}

/// Outcome of a single probe execution
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeReading {
    pub ok: bool,
    pub value: f64,
}

impl ProbeReading {
    pub fn ok(value: f64) -> Self {
        Self { ok: true, value }
    }

    pub fn failed(value: f64) -> Self {
        Self { ok: false, value }
    }
}

/// A named health check bound to a resource
#[async_trait]
pub trait Probe: Send + Sync {
    /// Unique probe name, used as the check and metric key in snapshots
    fn name(&self) -> &str;

    /// Resource (component or dependency) the probe reports on
    fn resource(&self) -> &str;

    fn signal(&self) -> Signal;

    /// Per-probe timeout; the sampler deadline may cut it shorter
    fn timeout(&self) -> Duration;

    async fn check(&self) -> Result<ProbeReading>;
}

/// A probe definition from the config file
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeDef {
    /// Probe name for identification
    pub name: String,

    /// Resource the probe reports on
    pub resource: String,

    /// Role of the reading
    #[serde(default)]
    pub signal: Signal,

    /// Shell command to execute (exit 0 = ok, first stdout token = value)
    pub command: String,

    /// Timeout in seconds
    #[serde(default = "default_probe_timeout")]
    pub timeout: u64,
}

fn default_probe_timeout() -> u64 {
    5
}

#[cfg(test)]
impl ProbeDef {
    pub fn new(name: &str, resource: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            resource: resource.to_string(),
            signal: Signal::Liveness,
            command: command.to_string(),
            timeout: default_probe_timeout(),
        }
    }

    pub fn with_signal(mut self, signal: Signal) -> Self {
        self.signal = signal;
        self
    }
}

/// Probe that runs a shell command on the host
#[derive(Debug, Clone)]
pub struct CommandProbe {
    def: ProbeDef,
}

impl CommandProbe {
    pub fn new(def: ProbeDef) -> Self {
        Self { def }
    }
}

#[async_trait]
impl Probe for CommandProbe {
    fn name(&self) -> &str {
        &self.def.name
    }

    fn resource(&self) -> &str {
        &self.def.resource
    }

    fn signal(&self) -> Signal {
        self.def.signal
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.def.timeout)
    }

    async fn check(&self) -> Result<ProbeReading> {
        // kill_on_drop reaps the child when the sampler cancels us
        let output = Command::new("sh")
            .args(["-c", &self.def.command])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::ProbeFailed {
                probe: self.def.name.clone(),
                message: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let ok = output.status.success();
        let value = parse_value(&stdout).unwrap_or(if ok { 1.0 } else { 0.0 });

        Ok(ProbeReading { ok, value })
    }
}

/// Parse the first whitespace-separated stdout token as a number
fn parse_value(stdout: &str) -> Option<f64> {
    stdout
        .split_whitespace()
        .next()
        .and_then(|token| token.parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("0.42\n"), Some(0.42));
        assert_eq!(parse_value("  128 MB used"), Some(128.0));
        assert_eq!(parse_value("ready"), None);
        assert_eq!(parse_value(""), None);
        assert_eq!(parse_value("NaN"), None);
    }

    #[test]
    fn test_probe_def_deserialize() {
        let toml = r#"
name = "worker-7-rss"
resource = "worker-7"
signal = "memory"
command = "cat /tmp/rss"
"#;
        let def: ProbeDef = toml::from_str(toml).unwrap();
        assert_eq!(def.signal, Signal::Memory);
        assert_eq!(def.timeout, 5);
        assert_eq!(def.resource, "worker-7");
    }

    #[test]
    fn test_signal_defaults_to_liveness() {
        let def: ProbeDef = toml::from_str(
            r#"
name = "ping"
resource = "db-primary"
command = "true"
"#,
        )
        .unwrap();
        assert_eq!(def.signal, Signal::Liveness);
        assert_eq!(def.signal.to_string(), "liveness");
    }

    #[tokio::test]
    async fn test_command_probe_reads_value() {
        let probe = CommandProbe::new(
            ProbeDef::new("echo", "svc", "echo 12.5").with_signal(Signal::Latency),
        );
        let reading = probe.check().await.unwrap();
        assert!(reading.ok);
        assert_eq!(reading.value, 12.5);
        assert_eq!(probe.signal(), Signal::Latency);
    }

    #[tokio::test]
    async fn test_command_probe_failure_exit() {
        let probe = CommandProbe::new(ProbeDef::new("false", "svc", "exit 3"));
        let reading = probe.check().await.unwrap();
        assert!(!reading.ok);
        assert_eq!(reading.value, 0.0);
    }
}
