//! Status enums for Devices, Tasks, Runs, and Alerts.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a Device in the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    /// Device is ready to be leased.
    #[default]
    Available,
    /// Device is leased to exactly one active run.
    Busy,
    /// Device stopped heartbeating or was taken offline.
    Offline,
    /// Device is under maintenance and must not be leased.
    Maintenance,
}

impl DeviceStatus {
    /// Returns true if the device can be leased right now.
    pub fn is_leasable(&self) -> bool {
        matches!(self, Self::Available)
    }
}

/// Status of a Task in the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Task admitted but no device leased yet.
    #[default]
    Queued,
    /// Task has at least one non-terminal run.
    Running,
    /// All runs finished, at least one succeeded and none failed.
    Succeeded,
    /// At least one run failed.
    Failed,
    /// Task was cancelled by user or system.
    Cancelled,
}

impl TaskStatus {
    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Returns true if a task in this state may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }
}

/// Status of a TaskRun on a specific device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Lease acquired, waiting for the driver to confirm session start.
    #[default]
    Created,
    /// Exploration session actively executing on the device.
    Running,
    /// Run completed successfully.
    Succeeded,
    /// Run failed.
    Failed,
    /// Run was cancelled.
    Cancelled,
}

impl RunStatus {
    /// Returns true if the run is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the run is still active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// Workflow status of an Alert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    /// Alert raised, nobody has looked at it yet.
    #[default]
    Pending,
    /// A human acknowledged the alert.
    Acked,
    /// The underlying condition was resolved.
    Resolved,
    /// Explicitly dismissed without action.
    Ignored,
}

impl AlertStatus {
    /// Returns true if the alert no longer needs attention.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Resolved | Self::Ignored)
    }
}
