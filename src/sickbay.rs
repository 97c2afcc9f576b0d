//! Sickbay - health sampling, problem detection and recovery planning
//!
//! Provides:
//! - Probe definitions and concurrent sampling under a deadline
//! - Sliding-window detection of consecutive failures, latency
//!   degradation, memory leaks and integration failures
//! - Pure strategy selection for detected problems

pub mod detector;
pub mod probe;
pub mod problem;
pub mod recovery;
pub mod sampler;

pub use detector::{DetectorConfig, OperationOutcome, ProblemDetector};
pub use probe::{CommandProbe, Probe, ProbeDef, ProbeReading, Signal};
pub use problem::{Evidence, Problem, ProblemKind};
pub use recovery::{RecoveryConfig, RecoveryStrategy, RetryPolicy, StrategyKind, StrategySelector};
pub use sampler::{HealthSampler, HealthSnapshot, HealthStatus, SamplerConfig};
