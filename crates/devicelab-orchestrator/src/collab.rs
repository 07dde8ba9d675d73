//! Boundary traits for external collaborators.
//!
//! The orchestrator drives devices through an Appium-style automation
//! driver and pushes alerts to a notification channel. Both are injected
//! as trait objects so the core never depends on a concrete transport.

use async_trait::async_trait;
use thiserror::Error;

use devicelab_core::{Alert, Device, DeviceId};

/// Errors surfaced by the automation driver.
///
/// Never propagated raw out of the orchestrator: the run state machine
/// converts them into run failure reasons at its boundary.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Session could not be created on the device.
    #[error("Failed to start session on {device_id}: {message}")]
    SessionStart { device_id: String, message: String },

    /// An established session broke mid-run.
    #[error("Session {session_id} failed: {message}")]
    Session { session_id: String, message: String },
}

/// Handle to a live automation session on one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    /// Driver-assigned session identifier.
    pub session_id: String,

    /// The device the session runs on.
    pub device_id: DeviceId,
}

/// Remote-control driver for automation sessions (Appium-style).
///
/// Calls may be slow and are treated as cancellable I/O; the orchestrator
/// never invokes them while holding a store lock.
#[async_trait]
pub trait AutomationDriver: Send + Sync + 'static {
    /// Create an automation session on the device.
    async fn start_session(&self, device: &Device) -> Result<SessionHandle, DriverError>;

    /// Tear down a session. Called on completion and on cooperative
    /// cancellation; the driver should close the device session cleanly.
    async fn end_session(&self, handle: &SessionHandle) -> Result<(), DriverError>;
}

/// Error delivering an alert to the notification channel.
#[derive(Debug, Error)]
#[error("Alert delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// Outbound notification channel (chat webhook, email, ...).
///
/// Delivery is fire-and-forget from the dispatcher's perspective; the
/// Alert record in the store is the durable source of truth.
#[async_trait]
pub trait NotificationChannel: Send + Sync + 'static {
    /// Deliver one alert.
    async fn deliver(&self, alert: &Alert) -> Result<(), DeliveryError>;
}
