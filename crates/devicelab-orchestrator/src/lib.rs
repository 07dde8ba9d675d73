//! DeviceLab orchestration core.
//!
//! Coordinates automated UI-exploration runs of mobile applications
//! across a pool of physical and virtual devices:
//!
//! - [`registry::DeviceRegistry`] owns the device pool and lease
//!   lifecycle (the only mutator of device status).
//! - [`scheduler::Scheduler`] admits tasks and fans them out into one
//!   run per matched device.
//! - [`machine::RunMachine`] advances each run through
//!   CREATED -> RUNNING -> terminal, with every exit funnelled through
//!   `complete`.
//! - [`sweeper::Sweeper`] periodically repairs state drift left behind
//!   by crashes and partial failures.
//! - [`dispatcher::EventDispatcher`] turns transitions into live events
//!   and anomalies into durable alerts.
//!
//! The REST/admission layer, persistence engine, dashboards, automation
//! driver, and notification channels are external collaborators injected
//! through the [`store::Store`], [`collab::AutomationDriver`], and
//! [`collab::NotificationChannel`] seams.

pub mod collab;
pub mod config;
pub mod dispatcher;
pub mod machine;
pub mod metrics;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod sweeper;

#[cfg(test)]
pub(crate) mod testutil;

use std::sync::Arc;

use tokio::task::JoinHandle;

pub use collab::{AutomationDriver, NotificationChannel, SessionHandle};
pub use config::Config;
pub use dispatcher::EventDispatcher;
pub use machine::RunMachine;
pub use registry::DeviceRegistry;
pub use scheduler::Scheduler;
pub use store::{MemoryStore, Store};
pub use sweeper::{SweepReport, Sweeper};

/// Fully wired orchestration core.
///
/// Construction only wires the components; call [`Orchestrator::spawn_loops`]
/// to start the periodic dispatch and sweep loops.
pub struct Orchestrator {
    /// Shared configuration.
    pub config: Config,
    /// Injected store.
    pub store: Arc<dyn Store>,
    /// Live events and alerts.
    pub dispatcher: Arc<EventDispatcher>,
    /// Device pool and leases.
    pub registry: Arc<DeviceRegistry>,
    /// Run lifecycles.
    pub machine: Arc<RunMachine>,
    /// Task queue and dispatch.
    pub scheduler: Arc<Scheduler>,
    /// Reconciliation.
    pub sweeper: Arc<Sweeper>,
}

impl Orchestrator {
    /// Wire the orchestration core against injected collaborators.
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        driver: Arc<dyn AutomationDriver>,
        notifier: Arc<dyn NotificationChannel>,
    ) -> Self {
        let dispatcher = Arc::new(EventDispatcher::new(
            store.clone(),
            notifier,
            config.event_capacity,
        ));
        let registry = Arc::new(DeviceRegistry::new(store.clone(), dispatcher.clone()));
        let machine = Arc::new(RunMachine::new(
            store.clone(),
            driver,
            registry.clone(),
            dispatcher.clone(),
            config.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            registry.clone(),
            machine.clone(),
            dispatcher.clone(),
            config.clone(),
        ));
        let sweeper = Arc::new(Sweeper::new(
            store.clone(),
            registry.clone(),
            machine.clone(),
            dispatcher.clone(),
            config.clone(),
        ));

        Self {
            config,
            store,
            dispatcher,
            registry,
            machine,
            scheduler,
            sweeper,
        }
    }

    /// Start the periodic dispatch and sweep loops. Abort the handles to
    /// stop them.
    pub fn spawn_loops(&self) -> (JoinHandle<()>, JoinHandle<()>) {
        let dispatch = tokio::spawn(self.scheduler.clone().run());
        let sweep = tokio::spawn(self.sweeper.clone().run());
        (dispatch, sweep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{wait_until, FakeDriver, FakeNotifier};
    use devicelab_core::{
        Device, DeviceId, DeviceStatus, LiveEvent, RunOutcome, RunStatus, TaskSpec, TaskStatus,
    };
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn test_end_to_end_submit_run_complete() {
        let driver = Arc::new(FakeDriver::new());
        let notifier = Arc::new(FakeNotifier::new());
        let orchestrator = Orchestrator::new(
            Config::default(),
            Arc::new(MemoryStore::new()),
            driver,
            notifier,
        );
        let (dispatch_loop, sweep_loop) = orchestrator.spawn_loops();
        let mut events = orchestrator.dispatcher.subscribe();

        orchestrator
            .registry
            .register(Device::new(DeviceId::new("d1"), "serial-1", "Pixel 8"))
            .await
            .unwrap();

        let task = orchestrator
            .scheduler
            .submit(TaskSpec::new("app-1.2.3"), "operator")
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Running);

        let run_id = orchestrator.store.runs_for_task(&task.id).await[0]
            .id
            .clone();
        wait_until(|| {
            let store = orchestrator.store.clone();
            let run_id = run_id.clone();
            async move { store.run(&run_id).await.unwrap().status == RunStatus::Running }
        })
        .await;

        orchestrator
            .machine
            .complete(&run_id, RunOutcome::Success)
            .await
            .unwrap();

        let task = orchestrator.store.task(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);

        let device = orchestrator
            .store
            .device(&DeviceId::new("d1"))
            .await
            .unwrap();
        assert_eq!(device.status, DeviceStatus::Available);

        // The stream carries the whole lifecycle, in per-entity order.
        let mut seen = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(std::time::Duration::from_secs(1), events.next()).await
        {
            seen.push(event.unwrap());
        }
        let run_events: Vec<&LiveEvent> = seen
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    LiveEvent::RunCreated { .. } | LiveEvent::RunStatusChanged { .. }
                )
            })
            .collect();
        assert!(matches!(run_events[0], LiveEvent::RunCreated { .. }));
        assert!(matches!(
            run_events[1],
            LiveEvent::RunStatusChanged {
                from: RunStatus::Created,
                to: RunStatus::Running,
                ..
            }
        ));
        assert!(matches!(
            run_events[2],
            LiveEvent::RunStatusChanged {
                to: RunStatus::Succeeded,
                ..
            }
        ));

        dispatch_loop.abort();
        sweep_loop.abort();
    }
}
