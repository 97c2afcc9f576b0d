//! Recovery attempt records

use crate::sickbay::problem::{Problem, ProblemKind};
use crate::sickbay::recovery::RecoveryStrategy;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Registry key: one active attempt per resource and problem kind
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct AttemptKey {
    pub resource: String,
    pub kind: ProblemKind,
}

impl AttemptKey {
    pub fn new(resource: impl Into<String>, kind: ProblemKind) -> Self {
        Self {
            resource: resource.into(),
            kind,
        }
    }
}

impl std::fmt::Display for AttemptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.resource, self.kind)
    }
}

/// Lifecycle of a recovery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Escalated,
}

impl AttemptStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, AttemptStatus::Pending | AttemptStatus::Running)
    }
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptStatus::Pending => write!(f, "pending"),
            AttemptStatus::Running => write!(f, "running"),
            AttemptStatus::Succeeded => write!(f, "succeeded"),
            AttemptStatus::Failed => write!(f, "failed"),
            AttemptStatus::Escalated => write!(f, "escalated"),
        }
    }
}

/// One tracked execution of a recovery strategy
///
/// Copies of a terminal attempt are immutable; only the executor's registry
/// entry is updated while the attempt is active.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryAttempt {
    pub id: Uuid,
    pub problem_id: Uuid,
    pub resource: String,
    pub kind: ProblemKind,
    pub severity: f64,
    pub strategy: RecoveryStrategy,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts_made: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip)]
    pub problem: Arc<Problem>,
}

impl RecoveryAttempt {
    pub fn new(problem: Arc<Problem>, strategy: RecoveryStrategy) -> Self {
        Self {
            id: Uuid::new_v4(),
            problem_id: problem.id,
            resource: problem.resource.clone(),
            kind: problem.kind,
            severity: problem.severity,
            strategy,
            status: AttemptStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            attempts_made: 0,
            note: None,
            problem,
        }
    }

    pub fn key(&self) -> AttemptKey {
        AttemptKey::new(self.resource.clone(), self.kind)
    }

    /// Terminal copy of this attempt
    pub fn finish(&self, status: AttemptStatus, note: Option<String>) -> Self {
        let mut done = self.clone();
        done.status = status;
        done.finished_at = Some(Utc::now());
        if note.is_some() {
            done.note = note;
        }
        done
    }
}
