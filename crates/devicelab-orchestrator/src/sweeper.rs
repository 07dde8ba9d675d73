//! Reconciliation sweeper.
//!
//! A periodic consistency pass that repairs drift between Task, TaskRun,
//! and Device state after process restarts or missed events. Every rule
//! re-validates its precondition inside the store's conditional update,
//! so a correction that races a normal completion is skipped this cycle
//! and retried on the next one.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use devicelab_core::{
    Alert, AlertKind, AlertSeverity, CoreError, DeviceStatus, LeaseToken, LiveEvent, RunOutcome,
    TaskStatus,
};

use crate::config::Config;
use crate::dispatcher::EventDispatcher;
use crate::machine::RunMachine;
use crate::registry::DeviceRegistry;
use crate::store::Store;

/// What one sweep pass corrected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Devices marked offline for stale heartbeats.
    pub devices_offlined: usize,
    /// Running tasks with no runs at all, cancelled (rule 1).
    pub tasks_cancelled: usize,
    /// Running tasks with terminal-only children, re-aggregated.
    pub tasks_aggregated: usize,
    /// Orphaned leases released (rule 2).
    pub leases_released: usize,
    /// Runs force-failed on offline devices (rule 3).
    pub runs_failed: usize,
    /// Runs force-cancelled by administrative recovery.
    pub runs_cancelled: usize,
}

impl SweepReport {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Periodic reconciliation pass over devices, tasks, and runs.
pub struct Sweeper {
    store: Arc<dyn Store>,
    registry: Arc<DeviceRegistry>,
    machine: Arc<RunMachine>,
    dispatcher: Arc<EventDispatcher>,
    config: Config,
}

impl Sweeper {
    /// Create a new Sweeper.
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<DeviceRegistry>,
        machine: Arc<RunMachine>,
        dispatcher: Arc<EventDispatcher>,
        config: Config,
    ) -> Self {
        Self {
            store,
            registry,
            machine,
            dispatcher,
            config,
        }
    }

    /// Sweep loop on the configured interval. Runs until the owning
    /// handle is aborted.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.sweep_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep_once().await;
        }
    }

    /// One full reconciliation pass. Idempotent and safe to run
    /// concurrently with dispatch/completion traffic.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        self.sweep_stale_heartbeats(&mut report).await;
        self.sweep_running_tasks(&mut report).await;
        self.sweep_orphaned_leases(&mut report).await;
        self.sweep_offline_leases(&mut report).await;
        if !report.is_empty() {
            info!(?report, "Sweep corrections applied");
        }
        report
    }

    /// Devices whose last heartbeat is older than the timeout go offline.
    /// Devices that never heartbeated are left alone; not every pool
    /// member reports health.
    async fn sweep_stale_heartbeats(&self, report: &mut SweepReport) {
        let cutoff = Utc::now()
            - chrono::Duration::seconds(self.config.heartbeat_timeout_secs as i64);
        for device in self.store.devices().await {
            if device.retired
                || matches!(
                    device.status,
                    DeviceStatus::Offline | DeviceStatus::Maintenance
                )
            {
                continue;
            }
            let Some(beat) = device.last_heartbeat else {
                continue;
            };
            if beat < cutoff {
                warn!(device_id = %device.id, last_heartbeat = %beat, "Heartbeat stale");
                if self.registry.mark_offline(&device.id).await.is_ok() {
                    report.devices_offlined += 1;
                }
            }
        }
    }

    /// Rule 1 plus the aggregation re-check: a Running task with no runs
    /// at all can only be a crash leftover and is cancelled; a Running
    /// task whose children are all terminal missed its aggregation and is
    /// re-aggregated instead.
    async fn sweep_running_tasks(&self, report: &mut SweepReport) {
        for task in self.store.tasks().await {
            if task.status != TaskStatus::Running {
                continue;
            }
            let runs = self.store.runs_for_task(&task.id).await;
            if runs.is_empty() {
                let result = self
                    .store
                    .try_update_task(
                        &task.id,
                        Box::new(|task| {
                            if task.status != TaskStatus::Running {
                                return Err(CoreError::ReconciliationConflict(
                                    "task moved on".to_string(),
                                ));
                            }
                            task.status = TaskStatus::Cancelled;
                            task.finished_at = Some(Utc::now());
                            Ok(())
                        }),
                    )
                    .await;
                if result.is_ok() {
                    warn!(task_id = %task.id, "Running task had no runs; cancelled");
                    self.dispatcher.on_transition(LiveEvent::TaskStatusChanged {
                        task_id: task.id.clone(),
                        from: TaskStatus::Running,
                        to: TaskStatus::Cancelled,
                        at: Utc::now(),
                    });
                    report.tasks_cancelled += 1;
                }
            } else if runs.iter().all(|r| r.is_terminal()) {
                match self.machine.aggregate_task(&task.id).await {
                    Ok(Some(_)) => {
                        warn!(task_id = %task.id, "Missed aggregation repaired");
                        report.tasks_aggregated += 1;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(task_id = %task.id, error = %e, "Aggregation repair failed"),
                }
            }
        }
    }

    /// Rule 2: a Busy device whose lease points at a terminal or missing
    /// run is an orphaned lease; release it back to the pool.
    async fn sweep_orphaned_leases(&self, report: &mut SweepReport) {
        for device in self.store.devices().await {
            if device.status != DeviceStatus::Busy {
                continue;
            }
            let Some(lease) = device.lease.clone() else {
                // Busy with no lease record at all; repair the status.
                warn!(device_id = %device.id, "Busy device without a lease record");
                if self.registry.force_release(&device.id).await.is_ok() {
                    report.leases_released += 1;
                    let alert = Alert::new(
                        AlertKind::Internal,
                        AlertSeverity::High,
                        format!("device {} was busy with no lease record", device.id),
                    )
                    .for_device(device.id.clone());
                    if let Err(e) = self.dispatcher.on_anomaly(alert).await {
                        warn!(device_id = %device.id, error = %e, "Failed to raise alert");
                    }
                }
                continue;
            };
            let orphaned = match self.store.run(&lease.run_id).await {
                Ok(run) => run.is_terminal(),
                Err(_) => true,
            };
            if orphaned {
                warn!(device_id = %device.id, run_id = %lease.run_id, "Orphaned lease released");
                let token = LeaseToken {
                    device_id: device.id.clone(),
                    token: lease.token,
                };
                if self.registry.release(&token).await.is_ok() {
                    report.leases_released += 1;
                }
            }
        }
    }

    /// Rule 3: a device that went offline while leased forces its active
    /// run to fail; a leftover lease with no live run is just released.
    async fn sweep_offline_leases(&self, report: &mut SweepReport) {
        for device in self.store.devices().await {
            if device.status != DeviceStatus::Offline {
                continue;
            }
            let Some(lease) = device.lease.clone() else {
                continue;
            };
            match self.store.run(&lease.run_id).await {
                Ok(run) if !run.is_terminal() => {
                    warn!(device_id = %device.id, run_id = %run.id, "Failing run on offline device");
                    match self
                        .machine
                        .complete(&run.id, RunOutcome::failure("device offline"))
                        .await
                    {
                        Ok(_) => report.runs_failed += 1,
                        Err(e) => {
                            warn!(run_id = %run.id, error = %e, "Offline-run correction failed")
                        }
                    }
                }
                _ => {
                    let token = LeaseToken {
                        device_id: device.id.clone(),
                        token: lease.token,
                    };
                    if self.registry.release(&token).await.is_ok() {
                        report.leases_released += 1;
                    }
                }
            }
        }
    }

    /// Administrative full-system recovery: force-cancel every in-flight
    /// run and task and force-release every device. Explicit operator
    /// action, never part of the periodic sweep.
    pub async fn recover_all(&self) -> SweepReport {
        warn!("Administrative recovery requested: cancelling all in-flight work");
        let mut report = SweepReport::default();

        for run in self.store.runs().await {
            if run.is_terminal() {
                continue;
            }
            match self.machine.complete(&run.id, RunOutcome::Cancelled).await {
                Ok(_) => report.runs_cancelled += 1,
                Err(e) => warn!(run_id = %run.id, error = %e, "Recovery cancel failed"),
            }
        }

        for task in self.store.tasks().await {
            if task.status.is_terminal() {
                continue;
            }
            // Completed-run aggregation above already closed most tasks;
            // this catches queued tasks and crash leftovers.
            let from = task.status;
            let result = self
                .store
                .try_update_task(
                    &task.id,
                    Box::new(|task| {
                        if task.status.is_terminal() {
                            return Err(CoreError::ReconciliationConflict(
                                "task already terminal".to_string(),
                            ));
                        }
                        task.status = TaskStatus::Cancelled;
                        task.finished_at = Some(Utc::now());
                        Ok(())
                    }),
                )
                .await;
            if result.is_ok() {
                self.dispatcher.on_transition(LiveEvent::TaskStatusChanged {
                    task_id: task.id.clone(),
                    from,
                    to: TaskStatus::Cancelled,
                    at: Utc::now(),
                });
                report.tasks_cancelled += 1;
            }
        }

        for device in self.store.devices().await {
            if device.status == DeviceStatus::Busy || device.lease.is_some() {
                if self.registry.force_release(&device.id).await.is_ok() {
                    report.leases_released += 1;
                }
            }
        }

        info!(?report, "Administrative recovery finished");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{harness, harness_with};
    use devicelab_core::{Device, DeviceId, RunId, RunStatus, Task, TaskRun, TaskSpec};

    fn device(id: &str) -> Device {
        Device::new(DeviceId::new(id), format!("serial-{id}"), "Pixel 8")
    }

    /// Insert a task directly in Running, bypassing the scheduler, to
    /// model crash leftovers.
    async fn crashed_running_task(h: &crate::testutil::Harness) -> Task {
        let task = Task::new(TaskSpec::new("app-1"), "test");
        h.store.insert_task(task.clone()).await.unwrap();
        h.store
            .try_update_task(
                &task.id,
                Box::new(|t| {
                    t.status = TaskStatus::Running;
                    Ok(())
                }),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_rule1_running_task_with_no_runs_is_cancelled() {
        let h = harness();
        let task = crashed_running_task(&h).await;

        let report = h.sweeper.sweep_once().await;
        assert_eq!(report.tasks_cancelled, 1);
        assert_eq!(
            h.store.task(&task.id).await.unwrap().status,
            TaskStatus::Cancelled
        );

        // Idempotent: a second pass changes nothing.
        assert_eq!(h.sweeper.sweep_once().await, SweepReport::default());
    }

    #[tokio::test]
    async fn test_scenario_d_missed_aggregation_is_repaired_not_cancelled() {
        let h = harness();
        let task = crashed_running_task(&h).await;

        // Child finished but the parent update never committed.
        let mut run = TaskRun::new(task.id.clone(), DeviceId::new("d1"), "tok");
        run.finish(&RunOutcome::Success);
        h.store.insert_run(run).await.unwrap();

        let report = h.sweeper.sweep_once().await;
        assert_eq!(report.tasks_cancelled, 0);
        assert_eq!(report.tasks_aggregated, 1);
        assert_eq!(
            h.store.task(&task.id).await.unwrap().status,
            TaskStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_running_task_with_live_run_is_untouched() {
        let h = harness();
        let task = crashed_running_task(&h).await;
        let mut run = TaskRun::new(task.id.clone(), DeviceId::new("d1"), "tok");
        run.start("session-1");
        h.store.insert_run(run).await.unwrap();

        let report = h.sweeper.sweep_once().await;
        assert_eq!(report.tasks_cancelled, 0);
        assert_eq!(report.tasks_aggregated, 0);
        assert_eq!(
            h.store.task(&task.id).await.unwrap().status,
            TaskStatus::Running
        );
    }

    #[tokio::test]
    async fn test_rule2_orphaned_lease_is_released() {
        let h = harness();
        h.registry.register(device("d1")).await.unwrap();
        let id = DeviceId::new("d1");

        // Leased, but the referenced run is already terminal.
        let run_id = RunId::generate();
        let _token = h.registry.lease(&id, &run_id).await.unwrap();
        let task = crashed_running_task(&h).await;
        let mut run = TaskRun::new(task.id.clone(), id.clone(), "tok").with_id(run_id);
        run.finish(&RunOutcome::Success);
        h.store.insert_run(run).await.unwrap();

        let report = h.sweeper.sweep_once().await;
        assert_eq!(report.leases_released, 1);
        let device = h.store.device(&id).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Available);
        assert!(device.lease.is_none());
    }

    #[tokio::test]
    async fn test_rule2_lease_to_missing_run_is_released() {
        let h = harness();
        h.registry.register(device("d1")).await.unwrap();
        let id = DeviceId::new("d1");
        h.registry
            .lease(&id, &RunId::new("never-created"))
            .await
            .unwrap();

        let report = h.sweeper.sweep_once().await;
        assert_eq!(report.leases_released, 1);
        assert_eq!(
            h.store.device(&id).await.unwrap().status,
            DeviceStatus::Available
        );
    }

    #[tokio::test]
    async fn test_rule3_offline_device_fails_its_run() {
        let h = harness();
        h.registry.register(device("d1")).await.unwrap();
        let id = DeviceId::new("d1");

        let task = crashed_running_task(&h).await;
        let run_id = RunId::generate();
        let token = h.registry.lease(&id, &run_id).await.unwrap();
        let mut run =
            TaskRun::new(task.id.clone(), id.clone(), token.token.clone()).with_id(run_id.clone());
        run.start("session-1");
        h.store.insert_run(run).await.unwrap();

        h.registry.mark_offline(&id).await.unwrap();

        let report = h.sweeper.sweep_once().await;
        assert_eq!(report.runs_failed, 1);

        let run = h.store.run(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failure_reason.as_deref(), Some("device offline"));

        // Lease cleared, device stays out of the pool until marked back.
        let device = h.store.device(&id).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Offline);
        assert!(device.lease.is_none());

        // Parent aggregation ran through the normal funnel.
        assert_eq!(
            h.store.task(&task.id).await.unwrap().status,
            TaskStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_stale_heartbeat_marks_offline() {
        let mut config = Config::default();
        config.heartbeat_timeout_secs = 1;
        let h = harness_with(config);

        let mut d = device("d1");
        d.last_heartbeat = Some(Utc::now() - chrono::Duration::seconds(120));
        h.registry.register(d).await.unwrap();

        // Never-heartbeating devices are not touched.
        h.registry.register(device("d2")).await.unwrap();

        let report = h.sweeper.sweep_once().await;
        assert_eq!(report.devices_offlined, 1);
        assert_eq!(
            h.store.device(&DeviceId::new("d1")).await.unwrap().status,
            DeviceStatus::Offline
        );
        assert_eq!(
            h.store.device(&DeviceId::new("d2")).await.unwrap().status,
            DeviceStatus::Available
        );
    }

    #[tokio::test]
    async fn test_sweep_converges_from_mixed_drift() {
        let h = harness();

        // Drift 1: running task, no runs.
        let empty = crashed_running_task(&h).await;
        // Drift 2: busy device, terminal run.
        h.registry.register(device("d1")).await.unwrap();
        let orphan_run = RunId::generate();
        h.registry
            .lease(&DeviceId::new("d1"), &orphan_run)
            .await
            .unwrap();
        let owner = crashed_running_task(&h).await;
        let mut run = TaskRun::new(owner.id.clone(), DeviceId::new("d1"), "tok")
            .with_id(orphan_run);
        run.finish(&RunOutcome::failure("crash"));
        h.store.insert_run(run).await.unwrap();

        let first = h.sweeper.sweep_once().await;
        assert!(first.tasks_cancelled >= 1);
        assert!(first.leases_released >= 1);
        assert!(first.tasks_aggregated >= 1);

        // Invariants hold after one pass and the next pass is a no-op.
        for device in h.store.devices().await {
            let live = h
                .store
                .runs_for_device(&device.id)
                .await
                .iter()
                .filter(|r| !r.is_terminal())
                .count();
            assert_eq!(device.status == DeviceStatus::Busy, live == 1);
        }
        assert!(h.store.task(&empty.id).await.unwrap().status.is_terminal());
        assert!(h.store.task(&owner.id).await.unwrap().status.is_terminal());
        assert_eq!(h.sweeper.sweep_once().await, SweepReport::default());
    }

    #[tokio::test]
    async fn test_recover_all_clears_everything() {
        let h = harness();
        for id in ["d1", "d2"] {
            h.registry.register(device(id)).await.unwrap();
        }
        let running = h
            .scheduler
            .submit(TaskSpec::new("app-1").with_device_count(2), "test")
            .await
            .unwrap();
        let queued = h
            .scheduler
            .submit(TaskSpec::new("app-2"), "test")
            .await
            .unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert_eq!(queued.status, TaskStatus::Queued);

        let report = h.sweeper.recover_all().await;
        assert_eq!(report.runs_cancelled, 2);

        for task in h.store.tasks().await {
            assert!(task.status.is_terminal());
        }
        for run in h.store.runs().await {
            assert!(run.is_terminal());
        }
        for device in h.store.devices().await {
            assert_eq!(device.status, DeviceStatus::Available);
            assert!(device.lease.is_none());
        }
    }
}
