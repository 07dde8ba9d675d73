//! TaskRun types: the execution of one Task on one Device.

use crate::{DeviceId, RunId, RunStatus, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal outcome of a run, carried into [`RunStatus`] by the state
/// machine's `complete` funnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RunOutcome {
    /// Exploration finished normally.
    Success,
    /// Exploration failed; reason is surfaced on the run and its task.
    Failure { reason: String },
    /// Run was cancelled (cooperatively or forced at grace expiry).
    Cancelled,
}

impl RunOutcome {
    /// Shorthand for a failure outcome.
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
        }
    }

    /// The terminal status this outcome maps to.
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Success => RunStatus::Succeeded,
            Self::Failure { .. } => RunStatus::Failed,
            Self::Cancelled => RunStatus::Cancelled,
        }
    }
}

/// One progress record from the locator/diff producer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressDelta {
    /// Screens visited since the last record.
    pub screens_visited: u64,
    /// Actions executed since the last record.
    pub actions_executed: u64,
    /// Locators produced since the last record.
    pub locators_produced: u64,
    /// Locators that failed to resolve in this window.
    pub failed_locators: u64,
    /// Highest screen-diff severity observed in this window (0 = none).
    pub diff_severity: u32,
}

/// The execution of one Task on one Device. Owns the device lease for
/// its entire non-terminal lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    /// Unique run identifier.
    pub id: RunId,

    /// Owning task.
    pub task_id: TaskId,

    /// Leased device (non-owning; the device outlives the run).
    pub device_id: DeviceId,

    /// Opaque lease token, needed to release the device.
    pub lease_token: String,

    /// Current run status.
    pub status: RunStatus,

    /// Driver session handle once the session is confirmed.
    pub session_id: Option<String>,

    /// Cooperative-cancel intent flag observed by the driver loop.
    pub cancel_requested: bool,

    /// Total screens visited.
    pub screens_visited: u64,

    /// Total actions executed.
    pub actions_executed: u64,

    /// Total locators produced.
    pub locators_produced: u64,

    /// When the run was created (lease acquired).
    pub created_at: DateTime<Utc>,

    /// When the driver confirmed session start.
    pub started_at: Option<DateTime<Utc>>,

    /// When the run reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,

    /// Error message if the run failed.
    pub failure_reason: Option<String>,
}

impl TaskRun {
    /// Create a new run in Created status, bound to a lease.
    pub fn new(task_id: TaskId, device_id: DeviceId, lease_token: impl Into<String>) -> Self {
        Self {
            id: RunId::generate(),
            task_id,
            device_id,
            lease_token: lease_token.into(),
            status: RunStatus::Created,
            session_id: None,
            cancel_requested: false,
            screens_visited: 0,
            actions_executed: 0,
            locators_produced: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            failure_reason: None,
        }
    }

    /// Builder method to set a specific ID (useful when the id is minted
    /// before the lease).
    pub fn with_id(mut self, id: RunId) -> Self {
        self.id = id;
        self
    }

    /// Mark the run as started on the given driver session.
    pub fn start(&mut self, session_id: impl Into<String>) {
        self.status = RunStatus::Running;
        self.session_id = Some(session_id.into());
        self.started_at = Some(Utc::now());
    }

    /// Apply a progress record. Counters only; never touches status.
    pub fn apply_progress(&mut self, delta: &ProgressDelta) {
        self.screens_visited += delta.screens_visited;
        self.actions_executed += delta.actions_executed;
        self.locators_produced += delta.locators_produced;
    }

    /// Move the run to the outcome's terminal status.
    pub fn finish(&mut self, outcome: &RunOutcome) {
        self.status = outcome.status();
        self.finished_at = Some(Utc::now());
        if let RunOutcome::Failure { reason } = outcome {
            self.failure_reason = Some(reason.clone());
        }
    }

    /// Check if the run is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
