//! Orchestrator configuration.

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Fixed dispatch interval (seconds). Dispatch is additionally
    /// triggered on submission and on every device release.
    pub dispatch_interval_secs: u64,

    /// Fixed reconciliation sweep interval (seconds).
    pub sweep_interval_secs: u64,

    /// How long the driver may take to confirm session start before the
    /// run is failed and the lease released (seconds).
    pub session_start_timeout_secs: u64,

    /// Grace period for cooperative cancellation and lost-session
    /// confirmation before the run is forced terminal (seconds).
    pub grace_period_secs: u64,

    /// Heartbeat age after which a device is considered offline (seconds).
    pub heartbeat_timeout_secs: u64,

    /// Failed-locator count per progress record that raises an alert.
    pub failed_locator_threshold: u64,

    /// Screen-diff severity at or above which an alert is raised.
    pub diff_severity_threshold: u32,

    /// Capacity of the live-event broadcast channel.
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dispatch_interval_secs: 5,
            sweep_interval_secs: 30,
            session_start_timeout_secs: 60,
            grace_period_secs: 30,
            heartbeat_timeout_secs: 45,
            failed_locator_threshold: 5,
            diff_severity_threshold: 3,
            event_capacity: 256,
        }
    }
}
