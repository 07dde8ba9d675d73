//! Test doubles and wiring helpers shared by the module tests.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use devicelab_core::{Alert, Device};

use crate::collab::{
    AutomationDriver, DeliveryError, DriverError, NotificationChannel, SessionHandle,
};
use crate::config::Config;
use crate::dispatcher::EventDispatcher;
use crate::machine::RunMachine;
use crate::registry::DeviceRegistry;
use crate::scheduler::Scheduler;
use crate::store::{MemoryStore, Store};
use crate::sweeper::Sweeper;

/// Driver double. Confirms sessions immediately by default; can be told
/// to reject or hang session starts.
pub(crate) struct FakeDriver {
    fail_starts: AtomicBool,
    hang_starts: AtomicBool,
    next_session: AtomicU64,
    ended: Mutex<Vec<String>>,
}

impl FakeDriver {
    pub(crate) fn new() -> Self {
        Self {
            fail_starts: AtomicBool::new(false),
            hang_starts: AtomicBool::new(false),
            next_session: AtomicU64::new(1),
            ended: Mutex::new(Vec::new()),
        }
    }

    /// Make every subsequent session start fail.
    pub(crate) fn fail_sessions(&self) {
        self.fail_starts.store(true, Ordering::SeqCst);
    }

    /// Make every subsequent session start hang past any timeout.
    pub(crate) fn hang_sessions(&self) {
        self.hang_starts.store(true, Ordering::SeqCst);
    }

    /// Session ids the orchestrator tore down.
    pub(crate) async fn ended_sessions(&self) -> Vec<String> {
        self.ended.lock().await.clone()
    }
}

#[async_trait]
impl AutomationDriver for FakeDriver {
    async fn start_session(&self, device: &Device) -> Result<SessionHandle, DriverError> {
        if self.hang_starts.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(86_400)).await;
        }
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(DriverError::SessionStart {
                device_id: device.id.to_string(),
                message: "injected failure".to_string(),
            });
        }
        let n = self.next_session.fetch_add(1, Ordering::SeqCst);
        Ok(SessionHandle {
            session_id: format!("session-{n}"),
            device_id: device.id.clone(),
        })
    }

    async fn end_session(&self, handle: &SessionHandle) -> Result<(), DriverError> {
        self.ended.lock().await.push(handle.session_id.clone());
        Ok(())
    }
}

/// Notification-channel double recording delivered alerts.
pub(crate) struct FakeNotifier {
    delivered: Mutex<Vec<Alert>>,
    fail_next: AtomicBool,
}

impl FakeNotifier {
    pub(crate) fn new() -> Self {
        Self {
            delivered: Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
        }
    }

    /// Reject the next delivery.
    pub(crate) fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Alerts that reached the channel.
    pub(crate) async fn delivered(&self) -> Vec<Alert> {
        self.delivered.lock().await.clone()
    }

    /// Wait until at least `n` alerts were delivered.
    pub(crate) async fn wait_for_delivery(&self, n: usize) {
        wait_until(|| async move { self.delivered.lock().await.len() >= n }).await;
    }
}

#[async_trait]
impl NotificationChannel for FakeNotifier {
    async fn deliver(&self, alert: &Alert) -> Result<(), DeliveryError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(DeliveryError("injected delivery failure".to_string()));
        }
        self.delivered.lock().await.push(alert.clone());
        Ok(())
    }
}

/// Fully wired orchestrator over the in-memory store and the doubles.
pub(crate) struct Harness {
    pub(crate) config: Config,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) driver: Arc<FakeDriver>,
    pub(crate) notifier: Arc<FakeNotifier>,
    pub(crate) dispatcher: Arc<EventDispatcher>,
    pub(crate) registry: Arc<DeviceRegistry>,
    pub(crate) machine: Arc<RunMachine>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) sweeper: Arc<Sweeper>,
}

pub(crate) fn harness() -> Harness {
    harness_with(Config::default())
}

pub(crate) fn harness_with(config: Config) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let driver = Arc::new(FakeDriver::new());
    let notifier = Arc::new(FakeNotifier::new());
    let dispatcher = Arc::new(EventDispatcher::new(
        store.clone(),
        notifier.clone(),
        config.event_capacity,
    ));
    let registry = Arc::new(DeviceRegistry::new(store.clone(), dispatcher.clone()));
    let machine = Arc::new(RunMachine::new(
        store.clone(),
        driver.clone(),
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

    Harness {
        config,
        store,
        driver,
        notifier,
        dispatcher,
        registry,
        machine,
        scheduler,
        sweeper,
    }
}

/// Poll a condition until it holds. Panics if it never does; virtual time
/// auto-advances under a paused runtime, so timer-driven paths converge.
pub(crate) async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..1200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    panic!("condition not reached in time");
}
