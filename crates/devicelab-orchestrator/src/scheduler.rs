//! Task queue and scheduler - matches queued tasks against available
//! devices and fans each task out into per-device runs.
//!
//! Dispatch runs on a fixed interval and is additionally triggered on
//! submission and on every device release, so freed devices are reclaimed
//! promptly. Fulfillment is decided at admission: a task that started
//! under-provisioned never absorbs devices freed later.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use devicelab_core::{
    CoreError, Device, LiveEvent, RunId, RunOutcome, Task, TaskId, TaskSpec, TaskStatus,
};

use crate::config::Config;
use crate::dispatcher::EventDispatcher;
use crate::machine::RunMachine;
use crate::registry::DeviceRegistry;
use crate::store::Store;

/// Task scheduler.
pub struct Scheduler {
    store: Arc<dyn Store>,
    registry: Arc<DeviceRegistry>,
    machine: Arc<RunMachine>,
    dispatcher: Arc<EventDispatcher>,
    config: Config,
    /// Serializes dispatch cycles so two triggers cannot fan the same
    /// task out twice.
    dispatch_lock: Mutex<()>,
}

impl Scheduler {
    /// Create a new Scheduler.
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
            dispatch_lock: Mutex::new(()),
        }
    }

    /// Admit a task and attempt to dispatch it immediately.
    ///
    /// Only structural preconditions are checked here (device count,
    /// coverage well-formedness); full request validation belongs to the
    /// admission layer in front of this core.
    pub async fn submit(
        &self,
        spec: TaskSpec,
        created_by: impl Into<String>,
    ) -> Result<Task, CoreError> {
        spec.validate()?;
        let task = Task::new(spec, created_by);
        self.store.insert_task(task.clone()).await?;

        info!(
            task_id = %task.id,
            app_version = %task.spec.app_version,
            devices = task.spec.device_count,
            priority = task.spec.priority,
            "Task submitted"
        );
        self.dispatcher.on_transition(LiveEvent::TaskSubmitted {
            task_id: task.id.clone(),
            at: Utc::now(),
        });

        self.dispatch().await?;
        self.store.task(&task.id).await
    }

    /// One dispatch cycle over every queued task, highest priority first,
    /// FIFO within a priority band. Returns the number of runs launched.
    pub async fn dispatch(&self) -> Result<usize, CoreError> {
        let _guard = self.dispatch_lock.lock().await;

        let mut queued: Vec<Task> = self
            .store
            .tasks()
            .await
            .into_iter()
            .filter(|t| t.status == TaskStatus::Queued)
            .collect();
        queued.sort_by(|a, b| {
            b.spec
                .priority
                .cmp(&a.spec.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        let mut launched = 0;
        for task in queued {
            launched += self.dispatch_task(&task).await;
        }
        Ok(launched)
    }

    /// Try to fan one queued task out across matching available devices.
    /// Partial fulfillment is allowed; zero successful leases leaves the
    /// task queued for the next cycle.
    async fn dispatch_task(&self, task: &Task) -> usize {
        let mut pool: Vec<Device> = self
            .store
            .devices()
            .await
            .into_iter()
            .filter(|d| d.is_leasable() && d.has_tags(&task.spec.required_tags))
            .collect();
        pool.sort_by(|a, b| a.id.cmp(&b.id));
        let mut candidates = pool.into_iter();

        let mut launched = Vec::new();
        'slots: for _ in 0..task.spec.device_count {
            loop {
                let Some(device) = candidates.next() else {
                    break 'slots;
                };
                let run_id = RunId::generate();
                match self.registry.lease(&device.id, &run_id).await {
                    Ok(token) => {
                        match self.machine.launch(&task.id, &device, token, run_id).await {
                            Ok(run) => {
                                launched.push(run);
                                break;
                            }
                            Err(e) => {
                                // Lease is held with no run to own it; the
                                // sweeper reclaims it as an orphan.
                                warn!(
                                    task_id = %task.id,
                                    device_id = %device.id,
                                    error = %e,
                                    "Failed to launch run on leased device"
                                );
                                continue;
                            }
                        }
                    }
                    // Someone raced us to this device; try the next one.
                    Err(CoreError::NotAvailable(_)) => continue,
                    Err(e) => {
                        warn!(device_id = %device.id, error = %e, "Lease attempt failed");
                        continue;
                    }
                }
            }
        }

        if launched.is_empty() {
            debug!(task_id = %task.id, "No devices available; task stays queued");
            return 0;
        }

        // Runs exist before the task leaves Queued, so a Running task
        // always has at least one child.
        let flip = self
            .store
            .try_update_task(
                &task.id,
                Box::new(|task| {
                    if task.status != TaskStatus::Queued {
                        return Err(CoreError::ReconciliationConflict(
                            "task left the queue during dispatch".to_string(),
                        ));
                    }
                    task.status = TaskStatus::Running;
                    Ok(())
                }),
            )
            .await;

        match flip {
            Ok(_) => {
                info!(
                    task_id = %task.id,
                    runs = launched.len(),
                    requested = task.spec.device_count,
                    "Task dispatched"
                );
                self.dispatcher.on_transition(LiveEvent::TaskStatusChanged {
                    task_id: task.id.clone(),
                    from: TaskStatus::Queued,
                    to: TaskStatus::Running,
                    at: Utc::now(),
                });
                launched.len()
            }
            Err(_) => {
                // The task was cancelled between admission and the status
                // flip; unwind the leases we just took.
                warn!(task_id = %task.id, "Task cancelled mid-dispatch; unwinding runs");
                for run in launched {
                    let _ = self.machine.complete(&run.id, RunOutcome::Cancelled).await;
                }
                0
            }
        }
    }

    /// Cancel a task.
    ///
    /// A queued task moves straight to Cancelled without ever leasing a
    /// device. A running task has cancellation signalled to every live
    /// run; the task reaches Cancelled through parent aggregation once
    /// the runs wind down.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<Task, CoreError> {
        let flip = self
            .store
            .try_update_task(
                task_id,
                Box::new(|task| {
                    if task.status != TaskStatus::Queued {
                        return Err(CoreError::ReconciliationConflict(
                            "task is not queued".to_string(),
                        ));
                    }
                    task.status = TaskStatus::Cancelled;
                    task.finished_at = Some(Utc::now());
                    Ok(())
                }),
            )
            .await;

        match flip {
            Ok(task) => {
                info!(task_id = %task_id, "Queued task cancelled");
                self.dispatcher.on_transition(LiveEvent::TaskStatusChanged {
                    task_id: task_id.clone(),
                    from: TaskStatus::Queued,
                    to: TaskStatus::Cancelled,
                    at: Utc::now(),
                });
                return Ok(task);
            }
            Err(CoreError::ReconciliationConflict(_)) => {}
            Err(e) => return Err(e),
        }

        let task = self.store.task(task_id).await?;
        match task.status {
            TaskStatus::Running => {
                info!(task_id = %task_id, "Cancelling task; signalling live runs");
                for run in self.store.runs_for_task(task_id).await {
                    if !run.is_terminal() {
                        self.machine.cancel_run(&run.id).await?;
                    }
                }
                self.store.task(task_id).await
            }
            status => Err(CoreError::invalid_transition(status, TaskStatus::Cancelled)),
        }
    }

    /// Retry a failed or cancelled task by submitting a fresh task with
    /// the same specification. The original record is kept for audit.
    pub async fn retry(
        &self,
        task_id: &TaskId,
        created_by: impl Into<String>,
    ) -> Result<Task, CoreError> {
        let source = self.store.task(task_id).await?;
        if !source.status.is_retryable() {
            return Err(CoreError::invalid_transition(
                source.status,
                TaskStatus::Queued,
            ));
        }

        let mut task = Task::new(source.spec.clone(), created_by);
        task.retry_of = Some(source.id.clone());
        self.store.insert_task(task.clone()).await?;

        info!(task_id = %task.id, retry_of = %source.id, "Task resubmitted");
        self.dispatcher.on_transition(LiveEvent::TaskSubmitted {
            task_id: task.id.clone(),
            at: Utc::now(),
        });

        self.dispatch().await?;
        self.store.task(&task.id).await
    }

    /// Dispatch loop: fixed interval plus a wakeup on every device
    /// release. Runs until the owning handle is aborted.
    pub async fn run(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.dispatch_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let released = self.registry.release_signal();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = released.notified() => {}
            }
            if let Err(e) = self.dispatch().await {
                warn!(error = %e, "Dispatch cycle failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{harness, wait_until};
    use devicelab_core::{DeviceId, DeviceStatus, RunStatus};

    fn device(id: &str, tags: &[&str]) -> Device {
        let mut device = Device::new(DeviceId::new(id), format!("serial-{id}"), "Pixel 8");
        device.tags = tags.iter().map(|t| t.to_string()).collect();
        device
    }

    async fn busy_count(h: &crate::testutil::Harness) -> usize {
        h.store
            .devices()
            .await
            .iter()
            .filter(|d| d.status == DeviceStatus::Busy)
            .count()
    }

    #[tokio::test]
    async fn test_scenario_a_full_fulfillment() {
        let h = harness();
        for id in ["d1", "d2", "d3"] {
            h.registry
                .register(device(id, &["android"]))
                .await
                .unwrap();
        }

        let spec = TaskSpec::new("app-1")
            .with_device_count(2)
            .with_required_tag("android");
        let task = h.scheduler.submit(spec, "test").await.unwrap();

        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(h.store.runs_for_task(&task.id).await.len(), 2);
        assert_eq!(busy_count(&h).await, 2);
    }

    #[tokio::test]
    async fn test_scenario_b_partial_fulfillment_is_permanent() {
        let h = harness();
        h.registry
            .register(device("d1", &["android"]))
            .await
            .unwrap();

        let spec = TaskSpec::new("app-1")
            .with_device_count(2)
            .with_required_tag("android");
        let task = h.scheduler.submit(spec, "test").await.unwrap();

        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(h.store.runs_for_task(&task.id).await.len(), 1);

        // A device freed later must not be absorbed by the running task.
        h.registry
            .register(device("d2", &["android"]))
            .await
            .unwrap();
        h.scheduler.dispatch().await.unwrap();
        assert_eq!(h.store.runs_for_task(&task.id).await.len(), 1);
        assert_eq!(busy_count(&h).await, 1);
    }

    #[tokio::test]
    async fn test_no_devices_leaves_task_queued() {
        let h = harness();
        let task = h
            .scheduler
            .submit(TaskSpec::new("app-1"), "test")
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(h.store.runs_for_task(&task.id).await.is_empty());

        // A device appearing makes the next cycle pick the task up.
        h.registry.register(device("d1", &[])).await.unwrap();
        h.scheduler.dispatch().await.unwrap();
        let task = h.store.task(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_tag_filtering() {
        let h = harness();
        h.registry.register(device("d1", &["ios"])).await.unwrap();

        let spec = TaskSpec::new("app-1").with_required_tag("android");
        let task = h.scheduler.submit(spec, "test").await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(busy_count(&h).await, 0);
    }

    #[tokio::test]
    async fn test_priority_order_then_fifo() {
        let h = harness();

        // Admit with no devices so nothing dispatches yet.
        let low = h
            .scheduler
            .submit(TaskSpec::new("low").with_priority(1), "test")
            .await
            .unwrap();
        let high = h
            .scheduler
            .submit(TaskSpec::new("high").with_priority(5), "test")
            .await
            .unwrap();

        // One device: only the high-priority task can win it.
        h.registry.register(device("d1", &[])).await.unwrap();
        h.scheduler.dispatch().await.unwrap();

        assert_eq!(
            h.store.task(&high.id).await.unwrap().status,
            TaskStatus::Running
        );
        assert_eq!(
            h.store.task(&low.id).await.unwrap().status,
            TaskStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_cancel_queued_never_leases() {
        let h = harness();
        let task = h
            .scheduler
            .submit(TaskSpec::new("app-1"), "test")
            .await
            .unwrap();

        let cancelled = h.scheduler.cancel(&task.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(h.store.runs_for_task(&task.id).await.is_empty());

        // Devices arriving later must not resurrect the task.
        h.registry.register(device("d1", &[])).await.unwrap();
        h.scheduler.dispatch().await.unwrap();
        assert!(h.store.runs_for_task(&task.id).await.is_empty());
        assert_eq!(busy_count(&h).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_running_winds_down_runs() {
        let h = harness();
        h.registry.register(device("d1", &[])).await.unwrap();
        let task = h
            .scheduler
            .submit(TaskSpec::new("app-1"), "test")
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Running);

        let run_id = h.store.runs_for_task(&task.id).await[0].id.clone();
        wait_until(|| {
            let store = h.store.clone();
            let run_id = run_id.clone();
            async move { store.run(&run_id).await.unwrap().status == RunStatus::Running }
        })
        .await;

        h.scheduler.cancel(&task.id).await.unwrap();

        wait_until(|| {
            let store = h.store.clone();
            let task_id = task.id.clone();
            async move { store.task(&task_id).await.unwrap().status == TaskStatus::Cancelled }
        })
        .await;

        assert_eq!(busy_count(&h).await, 0);
    }

    #[tokio::test]
    async fn test_cancel_terminal_task_is_an_error() {
        let h = harness();
        let task = h
            .scheduler
            .submit(TaskSpec::new("app-1"), "test")
            .await
            .unwrap();
        h.scheduler.cancel(&task.id).await.unwrap();

        let err = h.scheduler.cancel(&task.id).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_retry_creates_fresh_task() {
        let h = harness();
        let task = h
            .scheduler
            .submit(TaskSpec::new("app-1").with_priority(3), "test")
            .await
            .unwrap();
        h.scheduler.cancel(&task.id).await.unwrap();

        let retried = h.scheduler.retry(&task.id, "operator").await.unwrap();
        assert_ne!(retried.id, task.id);
        assert_eq!(retried.retry_of, Some(task.id.clone()));
        assert_eq!(retried.spec, task.spec);

        // The original record is untouched.
        assert_eq!(
            h.store.task(&task.id).await.unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_retry_requires_terminal_failure() {
        let h = harness();
        let task = h
            .scheduler
            .submit(TaskSpec::new("app-1"), "test")
            .await
            .unwrap();

        let err = h.scheduler.retry(&task.id, "operator").await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_submit_rejects_zero_device_count() {
        let h = harness();
        let err = h
            .scheduler
            .submit(TaskSpec::new("app-1").with_device_count(0), "test")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidSpec(_)));
    }
}
