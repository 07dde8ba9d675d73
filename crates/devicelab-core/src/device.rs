//! Device pool types: devices, leases, lease tokens.

use crate::{DeviceId, DeviceStatus, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A physical or virtual device capable of running one automation
/// session at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Unique device identifier.
    pub id: DeviceId,

    /// Serial number or emulator handle (e.g. "emulator-5554").
    pub serial: String,

    /// Human-readable model descriptor (e.g. "Pixel 8, Android 15").
    pub model: String,

    /// Capability tags used for task/device matching (e.g. "android",
    /// "tablet", "camera").
    pub tags: Vec<String>,

    /// Current lifecycle status.
    pub status: DeviceStatus,

    /// Active lease, present iff the device is held by a run.
    pub lease: Option<Lease>,

    /// When the device last heartbeated.
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// Soft-retired devices stay referenced by historical runs but are
    /// never leased again.
    pub retired: bool,

    /// When the device was registered.
    pub registered_at: DateTime<Utc>,
}

impl Device {
    /// Create a new Device in Available status.
    pub fn new(id: DeviceId, serial: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id,
            serial: serial.into(),
            model: model.into(),
            tags: Vec::new(),
            status: DeviceStatus::Available,
            lease: None,
            last_heartbeat: None,
            retired: false,
            registered_at: Utc::now(),
        }
    }

    /// Builder method to add a capability tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Check if this device carries every tag in `required`.
    pub fn has_tags(&self, required: &[String]) -> bool {
        required.iter().all(|t| self.tags.iter().any(|have| have == t))
    }

    /// Check if this device can be leased right now.
    pub fn is_leasable(&self) -> bool {
        !self.retired && self.status.is_leasable() && self.lease.is_none()
    }
}

/// The lease record held by a BUSY device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    /// Opaque token identifying this lease instance.
    pub token: String,

    /// The run that holds the lease.
    pub run_id: RunId,

    /// When the lease was granted.
    pub leased_at: DateTime<Utc>,
}

/// Token returned by a successful lease acquisition, required to release.
///
/// The token is bound to one lease instance: releasing with a stale token
/// (a lease that was already released or re-granted) is a no-op, which is
/// what makes release idempotent across crash-recovery paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseToken {
    /// The leased device.
    pub device_id: DeviceId,

    /// Opaque token matching the device's lease record.
    pub token: String,
}
