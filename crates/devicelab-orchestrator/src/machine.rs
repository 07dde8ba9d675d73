//! Run state machine.
//!
//! Tracks one task-on-one-device execution: CREATED -> RUNNING ->
//! {SUCCEEDED, FAILED, CANCELLED}. Every terminal transition, whatever
//! triggers it, funnels through [`RunMachine::complete`], which releases
//! the device lease and re-aggregates the parent task. Driver calls are
//! treated as slow cancellable I/O and never happen under a store lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use devicelab_core::{
    Alert, AlertKind, AlertSeverity, CoreError, Device, LeaseToken, LiveEvent, ProgressDelta,
    RunId, RunOutcome, RunStatus, Task, TaskId, TaskRun, TaskStatus,
};

use crate::collab::{AutomationDriver, SessionHandle};
use crate::config::Config;
use crate::dispatcher::EventDispatcher;
use crate::registry::DeviceRegistry;
use crate::store::Store;

/// Drives TaskRun lifecycles against the automation driver.
pub struct RunMachine {
    store: Arc<dyn Store>,
    driver: Arc<dyn AutomationDriver>,
    registry: Arc<DeviceRegistry>,
    dispatcher: Arc<EventDispatcher>,
    config: Config,
    /// Live driver sessions by run, so completion and cancellation can
    /// tear them down.
    sessions: RwLock<HashMap<RunId, SessionHandle>>,
}

impl RunMachine {
    /// Create a new RunMachine.
    pub fn new(
        store: Arc<dyn Store>,
        driver: Arc<dyn AutomationDriver>,
        registry: Arc<DeviceRegistry>,
        dispatcher: Arc<EventDispatcher>,
        config: Config,
    ) -> Self {
        Self {
            store,
            driver,
            registry,
            dispatcher,
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Create a run against a freshly leased device and hand control to
    /// the driver. The run starts in Created; the spawned session task
    /// moves it to Running once the driver confirms, or fails it when the
    /// confirmation does not arrive within the configured timeout.
    pub async fn launch(
        self: &Arc<Self>,
        task_id: &TaskId,
        device: &Device,
        token: LeaseToken,
        run_id: RunId,
    ) -> Result<TaskRun, CoreError> {
        let run =
            TaskRun::new(task_id.clone(), device.id.clone(), token.token.clone()).with_id(run_id);
        self.store.insert_run(run.clone()).await?;

        info!(
            task_id = %task_id,
            run_id = %run.id,
            device_id = %device.id,
            "Run created"
        );
        self.dispatcher.on_transition(LiveEvent::RunCreated {
            run_id: run.id.clone(),
            task_id: task_id.clone(),
            device_id: device.id.clone(),
            at: Utc::now(),
        });

        let machine = self.clone();
        let spawned_run = run.id.clone();
        let device = device.clone();
        tokio::spawn(async move {
            machine.drive(spawned_run, device).await;
        });

        Ok(run)
    }

    /// Session-start leg of a run, executed off the caller's path.
    async fn drive(self: Arc<Self>, run_id: RunId, device: Device) {
        let deadline = Duration::from_secs(self.config.session_start_timeout_secs);
        let handle = match tokio::time::timeout(deadline, self.driver.start_session(&device)).await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                warn!(run_id = %run_id, device_id = %device.id, error = %e, "Session start failed");
                let _ = self
                    .complete(&run_id, RunOutcome::failure(format!("session start failed: {e}")))
                    .await;
                return;
            }
            Err(_) => {
                let err = CoreError::DriverTimeout {
                    seconds: self.config.session_start_timeout_secs,
                    context: format!("session start on device {}", device.id),
                };
                warn!(run_id = %run_id, device_id = %device.id, "Session start timed out");
                let _ = self
                    .complete(&run_id, RunOutcome::failure(err.to_string()))
                    .await;
                return;
            }
        };

        self.sessions
            .write()
            .await
            .insert(run_id.clone(), handle.clone());

        let session_id = handle.session_id.clone();
        let started = self
            .store
            .try_update_run(
                &run_id,
                Box::new(move |run| {
                    if run.is_terminal() {
                        return Err(CoreError::ReconciliationConflict(
                            "run finished before session start".to_string(),
                        ));
                    }
                    run.start(session_id);
                    Ok(())
                }),
            )
            .await;

        match started {
            Ok(updated) => {
                info!(
                    run_id = %run_id,
                    session_id = %handle.session_id,
                    "Run started"
                );
                self.dispatcher.on_transition(LiveEvent::RunStatusChanged {
                    run_id: run_id.clone(),
                    task_id: updated.task_id.clone(),
                    from: RunStatus::Created,
                    to: RunStatus::Running,
                    at: Utc::now(),
                });

                // Cancellation raced with session start: tear down now.
                if updated.cancel_requested {
                    self.sessions.write().await.remove(&run_id);
                    if let Err(e) = self.driver.end_session(&handle).await {
                        warn!(run_id = %run_id, error = %e, "Session teardown failed");
                    }
                    let _ = self.complete(&run_id, RunOutcome::Cancelled).await;
                }
            }
            Err(_) => {
                // The run went terminal while the session was starting;
                // nothing owns the session anymore, so close it here.
                self.sessions.write().await.remove(&run_id);
                if let Err(e) = self.driver.end_session(&handle).await {
                    warn!(run_id = %run_id, error = %e, "Session teardown failed");
                }
            }
        }
    }

    /// Apply a progress record from the locator/diff producer. Counters
    /// only; status never changes here. Signals past the configured
    /// thresholds raise alerts.
    pub async fn record_progress(
        &self,
        run_id: &RunId,
        delta: ProgressDelta,
    ) -> Result<TaskRun, CoreError> {
        let updated = self
            .store
            .try_update_run(
                run_id,
                Box::new(move |run| {
                    if run.is_terminal() {
                        return Err(CoreError::ReconciliationConflict(
                            "progress after terminal status".to_string(),
                        ));
                    }
                    run.apply_progress(&delta);
                    Ok(())
                }),
            )
            .await?;

        if delta.failed_locators >= self.config.failed_locator_threshold {
            let alert = Alert::new(
                AlertKind::LocatorFailure,
                AlertSeverity::Medium,
                format!(
                    "{} locators failed on run {}",
                    delta.failed_locators, run_id
                ),
            )
            .for_task(updated.task_id.clone())
            .for_run(run_id.clone())
            .for_device(updated.device_id.clone());
            self.dispatcher.on_anomaly(alert).await?;
        }

        if delta.diff_severity >= self.config.diff_severity_threshold {
            let alert = Alert::new(
                AlertKind::ScreenDiff,
                AlertSeverity::High,
                format!(
                    "screen diff severity {} on run {}",
                    delta.diff_severity, run_id
                ),
            )
            .for_task(updated.task_id.clone())
            .for_run(run_id.clone())
            .for_device(updated.device_id.clone());
            self.dispatcher.on_anomaly(alert).await?;
        }

        Ok(updated)
    }

    /// Record an upstream locator/diff producer error. The run keeps
    /// going; the alert is the signal.
    pub async fn producer_error(
        &self,
        run_id: &RunId,
        message: impl Into<String>,
    ) -> Result<(), CoreError> {
        let run = self.store.run(run_id).await?;
        let alert = Alert::new(AlertKind::ProducerError, AlertSeverity::Medium, message)
            .for_task(run.task_id.clone())
            .for_run(run_id.clone())
            .for_device(run.device_id);
        self.dispatcher.on_anomaly(alert).await?;
        Ok(())
    }

    /// The single authoritative exit path for a run. Idempotent: once a
    /// run is terminal, later calls return the stored record unchanged.
    ///
    /// Moves the run to the outcome's terminal status, tears down the
    /// driver session, releases the device lease, and re-aggregates the
    /// parent task.
    pub async fn complete(
        &self,
        run_id: &RunId,
        outcome: RunOutcome,
    ) -> Result<TaskRun, CoreError> {
        let snapshot = self.store.run(run_id).await?;
        if snapshot.is_terminal() {
            return Ok(snapshot);
        }

        let from = snapshot.status;
        let finishing = outcome.clone();
        let result = self
            .store
            .try_update_run(
                run_id,
                Box::new(move |run| {
                    if run.is_terminal() {
                        return Err(CoreError::ReconciliationConflict(
                            "run already terminal".to_string(),
                        ));
                    }
                    run.finish(&finishing);
                    Ok(())
                }),
            )
            .await;

        let updated = match result {
            Ok(run) => run,
            // Another completion won the race; its end state stands.
            Err(CoreError::ReconciliationConflict(_)) => return self.store.run(run_id).await,
            Err(e) => return Err(e),
        };

        info!(
            run_id = %run_id,
            task_id = %updated.task_id,
            device_id = %updated.device_id,
            status = ?updated.status,
            reason = updated.failure_reason.as_deref().unwrap_or(""),
            "Run completed"
        );
        self.dispatcher.on_transition(LiveEvent::RunStatusChanged {
            run_id: run_id.clone(),
            task_id: updated.task_id.clone(),
            from,
            to: updated.status,
            at: Utc::now(),
        });

        if let Some(handle) = self.sessions.write().await.remove(run_id) {
            let driver = self.driver.clone();
            let ended_run = run_id.clone();
            tokio::spawn(async move {
                if let Err(e) = driver.end_session(&handle).await {
                    warn!(run_id = %ended_run, error = %e, "Session teardown failed");
                }
            });
        }

        self.registry
            .release(&LeaseToken {
                device_id: updated.device_id.clone(),
                token: updated.lease_token.clone(),
            })
            .await?;

        self.aggregate_task(&updated.task_id).await?;

        Ok(updated)
    }

    /// Request cooperative cancellation of a run.
    ///
    /// Sets the intent flag, asks the driver to tear the session down,
    /// and forces the run to Cancelled when the grace period expires
    /// without confirmation, so devices are never stranded.
    pub async fn cancel_run(self: &Arc<Self>, run_id: &RunId) -> Result<(), CoreError> {
        let flagged = self
            .store
            .try_update_run(
                run_id,
                Box::new(|run| {
                    if run.is_terminal() {
                        return Err(CoreError::ReconciliationConflict(
                            "run already terminal".to_string(),
                        ));
                    }
                    run.cancel_requested = true;
                    Ok(())
                }),
            )
            .await;
        match flagged {
            Ok(_) => {}
            Err(CoreError::ReconciliationConflict(_)) => return Ok(()),
            Err(e) => return Err(e),
        }

        info!(run_id = %run_id, "Cancellation requested");

        let machine = self.clone();
        let run_id = run_id.clone();
        tokio::spawn(async move {
            let grace = Duration::from_secs(machine.config.grace_period_secs);
            let session = machine.sessions.read().await.get(&run_id).cloned();
            match session {
                Some(handle) => {
                    machine.sessions.write().await.remove(&run_id);
                    match tokio::time::timeout(grace, machine.driver.end_session(&handle)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!(run_id = %run_id, error = %e, "Session teardown failed")
                        }
                        Err(_) => {
                            warn!(run_id = %run_id, "Grace period exceeded; forcing cancellation")
                        }
                    }
                }
                None => {
                    // Session not confirmed yet; the drive task observes the
                    // intent flag. Wait out the grace period before forcing.
                    tokio::time::sleep(grace).await;
                }
            }
            let _ = machine.complete(&run_id, RunOutcome::Cancelled).await;
        });

        Ok(())
    }

    /// Driver health callback: the session terminated unexpectedly. The
    /// run gets the grace period to confirm a normal completion, then is
    /// forced to Failed.
    pub async fn session_lost(
        self: &Arc<Self>,
        run_id: &RunId,
        reason: impl Into<String>,
    ) -> Result<(), CoreError> {
        let reason = reason.into();
        let snapshot = self.store.run(run_id).await?;
        if snapshot.is_terminal() {
            return Ok(());
        }

        warn!(run_id = %run_id, reason = %reason, "Driver session lost; grace timer started");
        let machine = self.clone();
        let run_id = run_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(machine.config.grace_period_secs)).await;
            let still_active = matches!(
                machine.store.run(&run_id).await,
                Ok(run) if !run.is_terminal()
            );
            if still_active {
                let _ = machine
                    .complete(
                        &run_id,
                        RunOutcome::failure(format!("driver session lost: {reason}")),
                    )
                    .await;
            }
        });
        Ok(())
    }

    /// Re-evaluate the parent task after a child reached a terminal
    /// status. Also invoked by the sweeper to repair a crash between a
    /// child completion and the parent update.
    ///
    /// Returns the updated task when the aggregation moved it, `None`
    /// when any child is still live or the task already left Running.
    pub async fn aggregate_task(&self, task_id: &TaskId) -> Result<Option<Task>, CoreError> {
        let runs = self.store.runs_for_task(task_id).await;
        if runs.is_empty() || runs.iter().any(|r| !r.is_terminal()) {
            return Ok(None);
        }

        let total = runs.len();
        let failed: Vec<&TaskRun> = runs
            .iter()
            .filter(|r| r.status == RunStatus::Failed)
            .collect();
        let succeeded = runs
            .iter()
            .filter(|r| r.status == RunStatus::Succeeded)
            .count();

        let (target, reason) = if !failed.is_empty() {
            let first = failed[0]
                .failure_reason
                .clone()
                .unwrap_or_else(|| "run failed".to_string());
            (
                TaskStatus::Failed,
                Some(format!("{} of {} runs failed: {}", failed.len(), total, first)),
            )
        } else if succeeded > 0 {
            (TaskStatus::Succeeded, None)
        } else {
            (TaskStatus::Cancelled, None)
        };

        let stored_reason = reason.clone();
        let result = self
            .store
            .try_update_task(
                task_id,
                Box::new(move |task| {
                    if task.status != TaskStatus::Running {
                        return Err(CoreError::ReconciliationConflict(
                            "task is not running".to_string(),
                        ));
                    }
                    task.status = target;
                    task.finished_at = Some(Utc::now());
                    task.failure_reason = stored_reason;
                    Ok(())
                }),
            )
            .await;

        let task = match result {
            Ok(task) => task,
            // Already aggregated, or the task never left Queued (dispatch
            // unwound); either way there is nothing to move.
            Err(CoreError::ReconciliationConflict(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        info!(task_id = %task_id, status = ?target, "Task finished");
        self.dispatcher.on_transition(LiveEvent::TaskStatusChanged {
            task_id: task_id.clone(),
            from: TaskStatus::Running,
            to: target,
            at: Utc::now(),
        });

        if target == TaskStatus::Failed {
            let message = task
                .failure_reason
                .clone()
                .unwrap_or_else(|| "task failed".to_string());
            let alert = Alert::new(AlertKind::TaskFailure, AlertSeverity::High, message)
                .for_task(task_id.clone());
            self.dispatcher.on_anomaly(alert).await?;
        }

        Ok(Some(task))
    }
}
