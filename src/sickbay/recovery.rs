//! Recovery strategies and their selection
//!
//! Maps a classified problem to the remediation the warden should run.
//! Selection is pure: same problem, history and clock give the same answer
//! (up to backoff jitter, which is applied by the executor).

use crate::sickbay::problem::{Problem, ProblemKind};
use crate::warden::attempt::{AttemptStatus, RecoveryAttempt};
use chrono::{DateTime, Utc};
use chrono_machines::{BackoffStrategy, ExponentialBackoff};
use rand::rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff schedule for re-submitted recovery actions
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetryPolicy {
    /// Base delay in milliseconds before the second try
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds between tries
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Total tries before the budget is exhausted
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,

    /// Jitter factor (0.0-1.0) to spread concurrent recoveries
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_attempts() -> u8 {
    3
}

fn default_jitter_factor() -> f64 {
    0.5
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, attempts: u8) -> Self {
        self.max_attempts = attempts;
        self
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new()
            .base_delay_ms(self.base_delay_ms)
            .max_delay_ms(self.max_delay_ms)
            .multiplier(self.multiplier)
            // One step per try, the last try included
            .max_attempts(self.max_attempts.saturating_add(1))
            .jitter_factor(self.jitter_factor)
    }

    /// Delay to wait after `failed` tries have failed
    ///
    /// Past the budget this is `max_delay`.
    pub fn delay_after(&self, failed: u8) -> Duration {
        let mut rng = rng();
        self.backoff()
            .delay(failed, &mut rng)
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(self.max_delay_ms))
    }
}

fn default_restart_policy() -> RetryPolicy {
    RetryPolicy::default().with_max_attempts(2)
}

fn default_fallback_policy() -> RetryPolicy {
    RetryPolicy::default().with_max_attempts(2)
}

/// Recovery configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfig {
    /// Deadline for a single recovery action in seconds
    #[serde(default = "default_action_timeout")]
    pub action_timeout: u64,

    /// Severity above which a repeat failure escalates
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: f64,

    /// Window in seconds in which past failures count against a key
    #[serde(default = "default_cooloff")]
    pub cooloff: u64,

    /// Whether an escalation clears by itself after the cool-off
    #[serde(default = "default_escalation_auto_clear")]
    pub escalation_auto_clear: bool,

    /// Delay in seconds before re-checking an opened breaker
    #[serde(default = "default_recheck")]
    pub recheck: u64,

    /// Finished attempts kept per (resource, kind)
    #[serde(default = "default_history_per_key")]
    pub history_per_key: usize,

    /// Backoff for the retry strategy
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Backoff for re-submitted restarts
    #[serde(default = "default_restart_policy")]
    pub restart: RetryPolicy,

    /// Backoff for re-submitted fallbacks
    #[serde(default = "default_fallback_policy")]
    pub fallback: RetryPolicy,
}

fn default_action_timeout() -> u64 {
    30
}

fn default_escalation_threshold() -> f64 {
    0.9
}

fn default_cooloff() -> u64 {
    600
}

fn default_escalation_auto_clear() -> bool {
    true
}

fn default_recheck() -> u64 {
    30
}

fn default_history_per_key() -> usize {
    20
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            action_timeout: default_action_timeout(),
            escalation_threshold: default_escalation_threshold(),
            cooloff: default_cooloff(),
            escalation_auto_clear: default_escalation_auto_clear(),
            recheck: default_recheck(),
            history_per_key: default_history_per_key(),
            retry: RetryPolicy::default(),
            restart: default_restart_policy(),
            fallback: default_fallback_policy(),
        }
    }
}

impl RecoveryConfig {
    pub fn action_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.action_timeout)
    }

    pub fn cooloff_duration(&self) -> Duration {
        Duration::from_secs(self.cooloff)
    }

    pub fn recheck_duration(&self) -> Duration {
        Duration::from_secs(self.recheck)
    }
}

/// Family of a strategy, used to compare attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    CircuitBreaker,
    Retry,
    Restart,
    Fallback,
    Escalate,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::CircuitBreaker => write!(f, "circuit_breaker"),
            StrategyKind::Retry => write!(f, "retry"),
            StrategyKind::Restart => write!(f, "restart"),
            StrategyKind::Fallback => write!(f, "fallback"),
            StrategyKind::Escalate => write!(f, "escalate"),
        }
    }
}

/// Remediation chosen for a problem, with its parameters
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Keep the breaker open and re-check later
    CircuitBreaker { recheck_after_ms: u64 },
    /// Wait with backoff and re-verify the resource
    Retry { policy: RetryPolicy },
    /// Restart one component instance
    Restart { component: String, policy: RetryPolicy },
    /// Switch a dependency to its registered fallback
    Fallback { dependency: String, policy: RetryPolicy },
    /// Stop automating and notify humans
    Escalate { reason: String },
}

impl RecoveryStrategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            RecoveryStrategy::CircuitBreaker { .. } => StrategyKind::CircuitBreaker,
            RecoveryStrategy::Retry { .. } => StrategyKind::Retry,
            RecoveryStrategy::Restart { .. } => StrategyKind::Restart,
            RecoveryStrategy::Fallback { .. } => StrategyKind::Fallback,
            RecoveryStrategy::Escalate { .. } => StrategyKind::Escalate,
        }
    }

    /// Tries the executor may make before the budget is exhausted
    pub fn max_attempts(&self) -> u8 {
        match self {
            RecoveryStrategy::Retry { policy }
            | RecoveryStrategy::Restart { policy, .. }
            | RecoveryStrategy::Fallback { policy, .. } => policy.max_attempts.max(1),
            RecoveryStrategy::CircuitBreaker { .. } | RecoveryStrategy::Escalate { .. } => 1,
        }
    }

    pub fn policy(&self) -> Option<&RetryPolicy> {
        match self {
            RecoveryStrategy::Retry { policy }
            | RecoveryStrategy::Restart { policy, .. }
            | RecoveryStrategy::Fallback { policy, .. } => Some(policy),
            _ => None,
        }
    }
}

/// Chooses strategies; holds only configuration
#[derive(Debug, Clone)]
pub struct StrategySelector {
    config: RecoveryConfig,
}

impl StrategySelector {
    pub fn new(config: RecoveryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Strategy for a problem given the finished attempts for its resource
    pub fn select(
        &self,
        problem: &Problem,
        history: &[RecoveryAttempt],
        now: DateTime<Utc>,
    ) -> RecoveryStrategy {
        let cooloff = chrono::Duration::seconds(self.config.cooloff as i64);
        let mut recent: Vec<&RecoveryAttempt> = history
            .iter()
            .filter(|a| a.resource == problem.resource && a.kind == problem.kind)
            .filter(|a| a.finished_at.is_some_and(|at| now - at <= cooloff))
            .collect();
        recent.sort_by_key(|a| a.finished_at);

        let failed_recently = recent
            .iter()
            .any(|a| matches!(a.status, AttemptStatus::Failed | AttemptStatus::Escalated));

        if problem.severity > self.config.escalation_threshold && failed_recently {
            return RecoveryStrategy::Escalate {
                reason: format!(
                    "severity {:.2} above {:.2} after a failed recovery",
                    problem.severity, self.config.escalation_threshold
                ),
            };
        }

        let preferred = self.preferred(problem);

        match recent.last() {
            Some(last)
                if last.status == AttemptStatus::Failed
                    && last.strategy.kind() == preferred.kind() =>
            {
                self.alternate(preferred)
            }
            _ => preferred,
        }
    }

    fn preferred(&self, problem: &Problem) -> RecoveryStrategy {
        match problem.kind {
            ProblemKind::ConsecutiveFailures => RecoveryStrategy::CircuitBreaker {
                recheck_after_ms: self.config.recheck_duration().as_millis() as u64,
            },
            ProblemKind::PerformanceDegradation => RecoveryStrategy::Retry {
                policy: self.config.retry.clone(),
            },
            ProblemKind::MemoryLeak => RecoveryStrategy::Restart {
                component: problem.resource.clone(),
                policy: self.config.restart.clone(),
            },
            ProblemKind::IntegrationFailure => RecoveryStrategy::Fallback {
                dependency: problem.resource.clone(),
                policy: self.config.fallback.clone(),
            },
        }
    }

    /// What to do instead of a strategy that just failed for the same key
    fn alternate(&self, failed: RecoveryStrategy) -> RecoveryStrategy {
        match failed {
            RecoveryStrategy::Retry { .. } | RecoveryStrategy::Fallback { .. } => {
                RecoveryStrategy::CircuitBreaker {
                    recheck_after_ms: self.config.recheck_duration().as_millis() as u64,
                }
            }
            RecoveryStrategy::CircuitBreaker { .. } | RecoveryStrategy::Restart { .. } => {
                RecoveryStrategy::Escalate {
                    reason: format!("{} already failed for this problem", failed.kind()),
                }
            }
            escalate @ RecoveryStrategy::Escalate { .. } => escalate,
        }
    }
}
