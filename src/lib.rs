//! Lazarus - self-healing engine
//!
//! Samples health probes, classifies degradations, gates calls through
//! per-resource circuit breakers and runs bounded recovery strategies.

pub mod bell;
pub mod bridge;
pub mod bulkhead;
pub mod cli;
pub mod error;
pub mod flare;
pub mod manifest;
pub mod sickbay;
pub mod warden;

pub use bridge::{Bridge, Detection, EngineStatus};
pub use error::{Error, Result};
