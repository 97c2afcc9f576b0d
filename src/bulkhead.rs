//! Bulkheads between resources
//!
//! Provides:
//! - One circuit breaker per protected resource, created on first use
//! - A sharded breaker table so unrelated resources never share a lock
//! - The error type for guarded calls

pub mod breaker;

pub use breaker::{BreakerConfig, BreakerStats, CircuitBreaker, CircuitState};

use crate::error::{Error, Result};
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error as ThisError;

/// Failure of a call made through [`crate::bridge::Bridge::call`]
#[derive(Debug, ThisError)]
pub enum CallError<E> {
    /// The breaker rejected the call; the resource was never reached
    #[error(transparent)]
    Rejected(Error),

    /// The call exceeded its deadline; always [`Error::CallTimeout`]
    #[error(transparent)]
    TimedOut(Error),

    /// The call itself failed
    #[error("{0}")]
    Failed(E),
}

impl<E> CallError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CallError::Rejected(_))
    }
}

/// Table of per-resource breakers
pub struct BreakerBoard {
    config: BreakerConfig,
    enabled: bool,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerBoard {
    pub fn new(config: BreakerConfig, enabled: bool) -> Self {
        Self {
            config,
            enabled,
            breakers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Breaker for a resource, created closed on first use
    pub fn breaker(&self, resource: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(resource) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.breakers
                .entry(resource.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(resource, self.config.clone())))
                .value(),
        )
    }

    pub fn get(&self, resource: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(resource).map(|b| Arc::clone(b.value()))
    }

    /// Hot-path gate
    pub fn allow(&self, resource: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.breaker(resource).allow()
    }

    pub fn report(&self, resource: &str, success: bool) {
        if self.enabled {
            self.breaker(resource).report(success);
        }
    }

    /// Open a resource's breaker on an external verdict
    pub fn trip(&self, resource: &str, reason: &str) {
        if self.enabled {
            self.breaker(resource).trip(reason);
        }
    }

    pub fn state(&self, resource: &str) -> CircuitState {
        self.get(resource)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn stats(&self) -> Vec<BreakerStats> {
        let mut stats: Vec<BreakerStats> = self.breakers.iter().map(|b| b.value().stats()).collect();
        stats.sort_by(|a, b| a.resource.cmp(&b.resource));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_board_isolates_resources() {
        let board = BreakerBoard::new(BreakerConfig::default(), true);
        for _ in 0..5 {
            board.allow("db-primary").unwrap();
            board.report("db-primary", false);
        }
        assert!(board.allow("db-primary").unwrap_err().is_circuit_open());
        assert!(board.allow("search-svc").is_ok());
        assert_eq!(board.state("search-svc"), CircuitState::Closed);
        assert_eq!(board.stats().len(), 2);
    }

    #[test]
    fn test_disabled_board_never_rejects() {
        let board = BreakerBoard::new(BreakerConfig::default(), false);
        board.trip("db-primary", "test");
        for _ in 0..10 {
            board.report("db-primary", false);
        }
        assert!(board.allow("db-primary").is_ok());
        assert!(board.stats().is_empty());
    }

    #[test]
    fn test_same_breaker_instance_is_shared() {
        let board = BreakerBoard::new(BreakerConfig::default(), true);
        let a = board.breaker("cache");
        let b = board.breaker("cache");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_call_error_display() {
        let err: CallError<std::io::Error> = CallError::TimedOut(Error::CallTimeout {
            resource: "db".into(),
            timeout_ms: 250,
        });
        assert_eq!(err.to_string(), "Call to 'db' timed out after 250ms");
        assert!(!err.is_rejected());
    }
}
