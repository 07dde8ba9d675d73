//! Core domain errors.

use thiserror::Error;

/// Core domain errors for DeviceLab.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Device cannot be leased right now. The scheduler retries against
    /// other candidates; never surfaced as a hard failure on its own.
    #[error("Device not available: {0}")]
    NotAvailable(String),

    /// Duplicate registration or double-lease attempt.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Driver session start/teardown did not confirm in time.
    #[error("Driver timed out after {seconds}s: {context}")]
    DriverTimeout { seconds: u64, context: String },

    /// Optimistic precondition failed during a sweeper correction. The
    /// correction is skipped this cycle and retried next cycle.
    #[error("Reconciliation precondition no longer holds: {0}")]
    ReconciliationConflict(String),

    /// Device not found.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Run not found.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Alert not found.
    #[error("Alert not found: {0}")]
    AlertNotFound(String),

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Structurally invalid task specification.
    #[error("Invalid task spec: {0}")]
    InvalidSpec(String),
}

impl CoreError {
    /// Helper for transition errors from any pair of status enums.
    pub fn invalid_transition(from: impl std::fmt::Debug, to: impl std::fmt::Debug) -> Self {
        Self::InvalidTransition {
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
    }
}
