//! Configuration file parsing for Lazarus
//!
//! Parses `lazarus.toml` configuration files using serde

use crate::bulkhead::BreakerConfig;
use crate::error::{Error, Result};
use crate::flare::AlertConfig;
use crate::sickbay::detector::DetectorConfig;
use crate::sickbay::probe::ProbeDef;
use crate::sickbay::recovery::{RecoveryConfig, RetryPolicy};
use crate::sickbay::sampler::SamplerConfig;
use crate::warden::handler::ActionDef;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Load and validate configuration from a file
pub fn load(path: &Path) -> Result<EngineConfig> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse(&content)
}

/// Parse and validate configuration from TOML text
pub fn parse(content: &str) -> Result<EngineConfig> {
    let config: EngineConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub sampler: SamplerConfig,

    #[serde(default)]
    pub detector: DetectorConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub alerts: AlertConfig,

    /// Health probes
    #[serde(default)]
    pub probes: Vec<ProbeDef>,

    /// Restart commands per component
    #[serde(default)]
    pub restart: Vec<ActionDef>,

    /// Fallback commands per dependency
    #[serde(default)]
    pub fallback: Vec<ActionDef>,
}

/// Feature switches and global limits
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    /// Run the periodic sampling loop
    #[serde(default = "default_true")]
    pub healing_enabled: bool,

    /// Dispatch recovery attempts for detected problems
    #[serde(default = "default_true")]
    pub auto_recovery: bool,

    /// Gate calls and let detector verdicts trip breakers
    #[serde(default = "default_true")]
    pub circuit_breaker_enabled: bool,

    /// Health records and problems kept for status queries
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_true() -> bool {
    true
}

fn default_history_limit() -> usize {
    100
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            healing_enabled: true,
            auto_recovery: true,
            circuit_breaker_enabled: true,
            history_limit: default_history_limit(),
        }
    }
}

impl EngineConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for probe in &self.probes {
            if !names.insert(&probe.name) {
                return Err(Error::ConfigValidation(format!(
                    "Duplicate probe name: {}",
                    probe.name
                )));
            }
            if probe.command.trim().is_empty() {
                return Err(Error::ConfigValidation(format!(
                    "Probe '{}' has an empty command",
                    probe.name
                )));
            }
        }

        for (section, actions) in [("restart", &self.restart), ("fallback", &self.fallback)] {
            let mut targets = HashSet::new();
            for action in actions {
                if !targets.insert(&action.target) {
                    return Err(Error::ConfigValidation(format!(
                        "Duplicate {} target: {}",
                        section, action.target
                    )));
                }
            }
        }

        if self.engine.history_limit == 0 {
            return Err(Error::ConfigValidation("engine.history_limit must be > 0".into()));
        }

        if self.sampler.interval == 0 {
            return Err(Error::ConfigValidation("sampler.interval must be > 0".into()));
        }
        if !(self.sampler.deadline_ratio > 0.0 && self.sampler.deadline_ratio <= 1.0) {
            return Err(Error::ConfigValidation(
                "sampler.deadline_ratio must be in (0, 1]".into(),
            ));
        }

        let d = &self.detector;
        if d.consecutive_failures == 0
            || d.outcome_window == 0
            || d.degradation_windows == 0
            || d.min_baseline_windows == 0
            || d.memory_samples < 2
            || d.integration_samples == 0
            || d.latency_window_secs == 0
        {
            return Err(Error::ConfigValidation(
                "detector windows and thresholds must be > 0 (memory_samples >= 2)".into(),
            ));
        }
        if (d.consecutive_failures as usize) > d.outcome_window {
            return Err(Error::ConfigValidation(
                "detector.consecutive_failures cannot exceed detector.outcome_window".into(),
            ));
        }
        if d.baseline_windows < d.min_baseline_windows {
            return Err(Error::ConfigValidation(
                "detector.baseline_windows must be >= detector.min_baseline_windows".into(),
            ));
        }
        if d.degradation_multiplier <= 1.0 {
            return Err(Error::ConfigValidation(
                "detector.degradation_multiplier must be > 1".into(),
            ));
        }
        if !(d.error_rate_threshold > 0.0 && d.error_rate_threshold <= 1.0) {
            return Err(Error::ConfigValidation(
                "detector.error_rate_threshold must be in (0, 1]".into(),
            ));
        }

        let b = &self.breaker;
        if b.failure_threshold == 0 || b.trial_budget == 0 || b.cooldown == 0 {
            return Err(Error::ConfigValidation(
                "breaker.failure_threshold, trial_budget and cooldown must be > 0".into(),
            ));
        }
        if b.cooldown_cap < b.cooldown {
            return Err(Error::ConfigValidation(
                "breaker.cooldown_cap must be >= breaker.cooldown".into(),
            ));
        }

        let r = &self.recovery;
        if !(0.0..=1.0).contains(&r.escalation_threshold) {
            return Err(Error::ConfigValidation(
                "recovery.escalation_threshold must be in [0, 1]".into(),
            ));
        }
        if r.action_timeout == 0 {
            return Err(Error::ConfigValidation("recovery.action_timeout must be > 0".into()));
        }
        for (name, policy) in [("retry", &r.retry), ("restart", &r.restart), ("fallback", &r.fallback)] {
            validate_policy(name, policy)?;
        }

        if self.alerts.burst < 1.0 || self.alerts.refill_per_sec <= 0.0 {
            return Err(Error::ConfigValidation(
                "alerts.burst must be >= 1 and alerts.refill_per_sec > 0".into(),
            ));
        }

        Ok(())
    }
}

fn validate_policy(name: &str, policy: &RetryPolicy) -> Result<()> {
    if policy.max_attempts == 0 {
        return Err(Error::ConfigValidation(format!(
            "recovery.{}.max_attempts must be > 0",
            name
        )));
    }
    if policy.multiplier <= 1.0 {
        return Err(Error::ConfigValidation(format!(
            "recovery.{}.multiplier must be > 1",
            name
        )));
    }
    if !(0.0..=1.0).contains(&policy.jitter_factor) {
        return Err(Error::ConfigValidation(format!(
            "recovery.{}.jitter_factor must be in [0, 1]",
            name
        )));
    }
    if policy.max_delay_ms < policy.base_delay_ms {
        return Err(Error::ConfigValidation(format!(
            "recovery.{}.max_delay_ms must be >= base_delay_ms",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sickbay::probe::Signal;

    #[test]
    fn test_parse_empty_config() {
        let config = parse("").unwrap();
        assert!(config.engine.healing_enabled);
        assert_eq!(config.engine.history_limit, 100);
        assert_eq!(config.sampler.interval, 10);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.recovery.retry.max_attempts, 3);
        assert!(config.probes.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[engine]
auto_recovery = false
history_limit = 50

[sampler]
interval = 5

[detector]
consecutive_failures = 3
memory_slope = 0.1

[breaker]
failure_threshold = 3
cooldown = 10
cooldown_cap = 60

[recovery]
escalation_threshold = 0.85
escalation_auto_clear = false

[recovery.restart]
max_attempts = 4

[alerts]
burst = 5
refill_per_sec = 0.5
jsonl = "/var/log/lazarus/alerts.jsonl"

[[probes]]
name = "db-ping"
resource = "db-primary"
command = "pg_isready -q"

[[probes]]
name = "worker-7-rss"
resource = "worker-7"
signal = "memory"
command = "ps -o rss= -p $(cat /run/worker-7.pid)"
timeout = 2

[[restart]]
component = "worker-7"
command = "systemctl restart worker@7"

[[fallback]]
dependency = "vector-store"
command = "vector-failover"
"#;
        let config = parse(toml).unwrap();
        assert!(!config.engine.auto_recovery);
        assert_eq!(config.engine.history_limit, 50);
        assert_eq!(config.sampler.interval, 5);
        assert_eq!(config.detector.consecutive_failures, 3);
        assert_eq!(config.detector.outcome_window, 20);
        assert_eq!(config.breaker.cooldown_cap, 60);
        assert!(!config.recovery.escalation_auto_clear);
        assert_eq!(config.recovery.restart.max_attempts, 4);
        assert_eq!(config.recovery.fallback.max_attempts, 2);
        assert_eq!(config.alerts.burst, 5.0);
        assert_eq!(config.probes.len(), 2);
        assert_eq!(config.probes[1].signal, Signal::Memory);
        assert_eq!(config.probes[1].timeout, 2);
        assert_eq!(config.restart[0].target, "worker-7");
        assert_eq!(config.fallback[0].target, "vector-store");
    }

    #[test]
    fn test_duplicate_probe_error() {
        let toml = r#"
[[probes]]
name = "ping"
resource = "db"
command = "true"

[[probes]]
name = "ping"
resource = "cache"
command = "true"
"#;
        let err = parse(toml).unwrap_err();
        assert!(err.to_string().contains("Duplicate probe name: ping"));
    }

    #[test]
    fn test_cooldown_cap_below_cooldown_rejected() {
        let toml = r#"
[breaker]
cooldown = 60
cooldown_cap = 30
"#;
        assert!(matches!(parse(toml), Err(Error::ConfigValidation(_))));
    }

    #[test]
    fn test_bad_ratios_rejected() {
        assert!(parse("[sampler]\ndeadline_ratio = 1.5\n").is_err());
        assert!(parse("[recovery]\nescalation_threshold = 1.2\n").is_err());
        assert!(parse("[detector]\ndegradation_multiplier = 1.0\n").is_err());
        assert!(parse("[recovery.retry]\nmultiplier = 0.5\n").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = load(Path::new("/nonexistent/lazarus.toml")).unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }));
    }
}
