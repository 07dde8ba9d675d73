//! Live events published to dashboard subscribers.
//!
//! A closed set of tagged variants per entity type, each with a fixed
//! field set, so the event stream stays statically checkable.

use crate::{DeviceId, DeviceStatus, RunId, RunStatus, TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An event on the live stream consumed by dashboards.
///
/// Delivery is at-least-once towards live subscribers; ordering is
/// preserved per entity (publish order), unordered across entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum LiveEvent {
    /// A device joined the pool.
    DeviceRegistered {
        device_id: DeviceId,
        at: DateTime<Utc>,
    },

    /// A device changed lifecycle status.
    DeviceStatusChanged {
        device_id: DeviceId,
        from: DeviceStatus,
        to: DeviceStatus,
        at: DateTime<Utc>,
    },

    /// A task was admitted to the queue.
    TaskSubmitted { task_id: TaskId, at: DateTime<Utc> },

    /// A task changed status.
    TaskStatusChanged {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        at: DateTime<Utc>,
    },

    /// A run was created against a leased device.
    RunCreated {
        run_id: RunId,
        task_id: TaskId,
        device_id: DeviceId,
        at: DateTime<Utc>,
    },

    /// A run changed status.
    RunStatusChanged {
        run_id: RunId,
        task_id: TaskId,
        from: RunStatus,
        to: RunStatus,
        at: DateTime<Utc>,
    },
}

impl LiveEvent {
    /// Timestamp of the event.
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Self::DeviceRegistered { at, .. }
            | Self::DeviceStatusChanged { at, .. }
            | Self::TaskSubmitted { at, .. }
            | Self::TaskStatusChanged { at, .. }
            | Self::RunCreated { at, .. }
            | Self::RunStatusChanged { at, .. } => *at,
        }
    }
}
