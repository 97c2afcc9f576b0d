//! Flare - best-effort alerting
//!
//! Problem and recovery events leave the engine through a bounded channel
//! drained by a delivery task. Emitting never blocks and never fails:
//! when the channel is full or the token bucket is empty the event is
//! dropped and counted.

use crate::bulkhead::BreakerStats;
use crate::error::Result;
use crate::sickbay::problem::Problem;
use crate::warden::attempt::RecoveryAttempt;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use throttle_machines::token_bucket;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Alert configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    /// Events buffered between the engine and the sinks
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Token bucket capacity (events emitted back to back)
    #[serde(default = "default_burst")]
    pub burst: f64,

    /// Token refill rate in events per second
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,

    /// Write events to the log
    #[serde(default = "default_log")]
    pub log: bool,

    /// Append events as JSON lines to this file
    #[serde(default)]
    pub jsonl: Option<PathBuf>,
}

fn default_channel_capacity() -> usize {
    256
}

fn default_burst() -> f64 {
    20.0
}

fn default_refill_per_sec() -> f64 {
    5.0
}

fn default_log() -> bool {
    true
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            burst: default_burst(),
            refill_per_sec: default_refill_per_sec(),
            log: default_log(),
            jsonl: None,
        }
    }
}

/// Event family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Problem,
    Recovery,
}

/// Recovery lifecycle step being reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Accepted,
    Started,
    Succeeded,
    Failed,
    Escalated,
    Recheck,
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Transition::Accepted => "accepted",
            Transition::Started => "started",
            Transition::Succeeded => "succeeded",
            Transition::Failed => "failed",
            Transition::Escalated => "escalated",
            Transition::Recheck => "recheck",
        };
        f.write_str(s)
    }
}

/// One alert as delivered to sinks
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

impl AlertEvent {
    pub fn problem(problem: &Problem) -> Self {
        Self {
            kind: AlertKind::Problem,
            payload: json!({
                "problem": problem,
                "description": problem.description(),
                "recommendation": problem.kind.recommendation(),
            }),
            at: Utc::now(),
        }
    }

    pub fn recovery(transition: Transition, attempt: &RecoveryAttempt) -> Self {
        Self {
            kind: AlertKind::Recovery,
            payload: json!({
                "transition": transition,
                "attempt": attempt,
            }),
            at: Utc::now(),
        }
    }

    /// Breaker state reported after a circuit-breaker recovery's delay
    pub fn recheck(stats: &BreakerStats) -> Self {
        Self {
            kind: AlertKind::Recovery,
            payload: json!({
                "transition": Transition::Recheck,
                "breaker": stats,
            }),
            at: Utc::now(),
        }
    }

    /// Recovery transition name, if this is a recovery event
    pub fn transition(&self) -> Option<&str> {
        self.payload.get("transition").and_then(Value::as_str)
    }
}

/// Destination for alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, event: &AlertEvent) -> Result<()>;
}

/// Sink that writes alerts through `tracing`
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, event: &AlertEvent) -> Result<()> {
        match (event.kind, event.transition()) {
            (AlertKind::Problem, _) => warn!(
                alert = "problem",
                description = event.payload["description"].as_str().unwrap_or_default(),
                recommendation = event.payload["recommendation"].as_str().unwrap_or_default(),
                "problem detected"
            ),
            (AlertKind::Recovery, Some("escalated")) => error!(
                alert = "recovery",
                attempt = %event.payload["attempt"],
                "recovery escalated, operator attention required"
            ),
            (AlertKind::Recovery, Some("failed")) => {
                warn!(alert = "recovery", attempt = %event.payload["attempt"], "recovery failed")
            }
            (AlertKind::Recovery, transition) => info!(
                alert = "recovery",
                transition = transition.unwrap_or_default(),
                "recovery progress"
            ),
        }
        Ok(())
    }
}

/// Sink that appends one JSON document per line to a file
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AlertSink for JsonLinesSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn notify(&self, event: &AlertEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

/// Token bucket state: (tokens, last refill in seconds since epoch)
struct Bucket {
    tokens: f64,
    last_refill: f64,
}

/// Cloneable handle used by the engine to emit alerts
#[derive(Clone)]
pub struct Flare {
    tx: Option<mpsc::Sender<AlertEvent>>,
    bucket: Arc<Mutex<Bucket>>,
    epoch: Instant,
    capacity: f64,
    refill_per_sec: f64,
    dropped: Arc<AtomicU64>,
}

impl Flare {
    fn with_sender(config: &AlertConfig, tx: Option<mpsc::Sender<AlertEvent>>) -> Self {
        Self {
            tx,
            bucket: Arc::new(Mutex::new(Bucket {
                tokens: config.burst,
                last_refill: 0.0,
            })),
            epoch: Instant::now(),
            capacity: config.burst,
            refill_per_sec: config.refill_per_sec,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Flare plus the receiving end, for callers that deliver themselves
    pub fn channel(config: &AlertConfig) -> (Self, mpsc::Receiver<AlertEvent>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        (Self::with_sender(config, Some(tx)), rx)
    }

    /// Flare with a delivery task fanning out to `sinks`
    pub fn spawn(config: &AlertConfig, sinks: Vec<Arc<dyn AlertSink>>) -> (Self, JoinHandle<()>) {
        let (flare, rx) = Self::channel(config);
        let task = tokio::spawn(deliver(rx, sinks));
        (flare, task)
    }

    /// Flare that discards everything
    pub fn silent() -> Self {
        Self::with_sender(&AlertConfig::default(), None)
    }

    /// Sinks described by the config
    pub fn sinks_from(config: &AlertConfig) -> Vec<Arc<dyn AlertSink>> {
        let mut sinks: Vec<Arc<dyn AlertSink>> = Vec::new();
        if config.log {
            sinks.push(Arc::new(LogSink));
        }
        if let Some(path) = &config.jsonl {
            sinks.push(Arc::new(JsonLinesSink::new(path.clone())));
        }
        sinks
    }

    /// Queue an event; never waits
    pub fn emit(&self, event: AlertEvent) {
        let Some(tx) = &self.tx else {
            return;
        };

        if !self.take_token() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(kind = ?event.kind, "alert rate limited");
            return;
        }

        if let Err(e) = tx.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(error = %e, "alert dropped");
        }
    }

    fn take_token(&self) -> bool {
        let now_secs = self.epoch.elapsed().as_secs_f64();
        let mut bucket = self.bucket.lock();
        let result = token_bucket::check(
            bucket.tokens,
            bucket.last_refill,
            now_secs,
            self.capacity,
            self.refill_per_sec,
        );
        bucket.tokens = result.new_tokens;
        bucket.last_refill = now_secs;
        result.allowed
    }

    /// Events dropped by rate limiting or a full channel
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn deliver(mut rx: mpsc::Receiver<AlertEvent>, sinks: Vec<Arc<dyn AlertSink>>) {
    while let Some(event) = rx.recv().await {
        for sink in &sinks {
            if let Err(e) = sink.notify(&event).await {
                warn!(sink = sink.name(), error = %e, "alert sink failed");
            }
        }
    }
    debug!("alert channel closed");
}
