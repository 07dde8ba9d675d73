//! Alert types: durable records of detected anomalies.

use crate::{AlertId, AlertStatus, DeviceId, RunId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of anomaly an alert records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Locator failure count crossed the configured threshold.
    LocatorFailure,
    /// A task reached Failed.
    TaskFailure,
    /// Screen-diff severity crossed the configured threshold.
    ScreenDiff,
    /// A device went offline (possibly while leased).
    DeviceOffline,
    /// The locator/diff producer reported an error.
    ProducerError,
    /// Orchestrator-internal inconsistency.
    Internal,
}

/// How urgently a human should look at an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// A durable record of a detected anomaly requiring human attention.
///
/// The Alert row is the source of truth; delivery to the notification
/// channel is best-effort and never rolls the record back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Unique alert identifier.
    pub id: AlertId,

    /// Anomaly classification.
    pub kind: AlertKind,

    /// Severity assigned at creation.
    pub severity: AlertSeverity,

    /// Workflow status.
    pub status: AlertStatus,

    /// Human-readable description of the anomaly.
    pub message: String,

    /// Originating task, if any.
    pub task_id: Option<TaskId>,

    /// Originating run, if any.
    pub run_id: Option<RunId>,

    /// Originating device, if any.
    pub device_id: Option<DeviceId>,

    /// When the alert was raised.
    pub created_at: DateTime<Utc>,

    /// When the alert status last changed.
    pub updated_at: DateTime<Utc>,
}

impl Alert {
    /// Create a new Alert in Pending status.
    pub fn new(kind: AlertKind, severity: AlertSeverity, message: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: AlertId::generate(),
            kind,
            severity,
            status: AlertStatus::Pending,
            message: message.into(),
            task_id: None,
            run_id: None,
            device_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder method to link the originating task.
    pub fn for_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Builder method to link the originating run.
    pub fn for_run(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Builder method to link the originating device.
    pub fn for_device(mut self, device_id: DeviceId) -> Self {
        self.device_id = Some(device_id);
        self
    }

    /// Apply a human workflow transition. Closed alerts stay closed.
    pub fn set_status(&mut self, status: AlertStatus) {
        if self.status.is_closed() {
            return;
        }
        self.status = status;
        self.updated_at = Utc::now();
    }
}
