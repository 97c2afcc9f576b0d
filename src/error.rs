//! Unified error types for Lazarus

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Lazarus operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    // Probe errors
    #[error("Probe '{probe}' timed out after {timeout_ms}ms")]
    ProbeTimeout { probe: String, timeout_ms: u64 },

    #[error("Probe '{probe}' failed: {message}")]
    ProbeFailed { probe: String, message: String },

    // Hot path errors
    #[error("Circuit for '{resource}' is open, retry in {retry_after_ms}ms")]
    CircuitOpen {
        resource: String,
        retry_after_ms: u64,
    },

    #[error("Call to '{resource}' timed out after {timeout_ms}ms")]
    CallTimeout { resource: String, timeout_ms: u64 },

    // Recovery errors
    #[error("Recovery strategy '{strategy}' failed for '{resource}': {message}")]
    RecoveryStrategyFailure {
        resource: String,
        strategy: String,
        message: String,
    },

    #[error("Recovery action timed out after {0}ms")]
    RecoveryTimeout(u64),

    #[error("Escalation required for '{resource}' ({kind}): {reason}")]
    EscalationRequired {
        resource: String,
        kind: String,
        reason: String,
    },

    #[error("No {role} handler registered for '{target}'")]
    NoHandler { role: String, target: String },
}

impl Error {
    /// Whether this error is the expected "resource unavailable" signal
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Error::CircuitOpen { .. })
    }
}

/// Result type alias for Lazarus operations
pub type Result<T> = std::result::Result<T, Error>;
