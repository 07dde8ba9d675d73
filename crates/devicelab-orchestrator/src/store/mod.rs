//! Storage capability interface.
//!
//! The registry, scheduler, state machine, and sweeper all depend on this
//! trait rather than a concrete global, so tests can inject doubles and a
//! persistence layer can be swapped in without touching the orchestration
//! logic. [`MemoryStore`] is the in-process implementation.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;

use devicelab_core::{Alert, AlertId, CoreError, Device, DeviceId, RunId, Task, TaskId, TaskRun};

/// Conditional mutation applied under the store's per-entity lock.
///
/// The closure may veto the update by returning an error, in which case
/// nothing is committed. This is the optimistic-check primitive the lease
/// CAS and every sweeper correction are built on. Closures must be
/// synchronous: no I/O happens under a store lock.
pub type Mutation<T> = Box<dyn FnOnce(&mut T) -> Result<(), CoreError> + Send>;

/// Repository interface over devices, tasks, runs, and alerts.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Insert a new device. Fails with `Conflict` if the id exists.
    async fn insert_device(&self, device: Device) -> Result<(), CoreError>;

    /// Fetch one device.
    async fn device(&self, id: &DeviceId) -> Result<Device, CoreError>;

    /// Snapshot of all devices.
    async fn devices(&self) -> Vec<Device>;

    /// Atomically mutate one device; commits only if the closure returns Ok.
    async fn try_update_device(
        &self,
        id: &DeviceId,
        mutate: Mutation<Device>,
    ) -> Result<Device, CoreError>;

    /// Insert a new task. Fails with `Conflict` if the id exists.
    async fn insert_task(&self, task: Task) -> Result<(), CoreError>;

    /// Fetch one task.
    async fn task(&self, id: &TaskId) -> Result<Task, CoreError>;

    /// Snapshot of all tasks.
    async fn tasks(&self) -> Vec<Task>;

    /// Atomically mutate one task; commits only if the closure returns Ok.
    async fn try_update_task(&self, id: &TaskId, mutate: Mutation<Task>)
        -> Result<Task, CoreError>;

    /// Insert a new run. Fails with `Conflict` if the id exists.
    async fn insert_run(&self, run: TaskRun) -> Result<(), CoreError>;

    /// Fetch one run.
    async fn run(&self, id: &RunId) -> Result<TaskRun, CoreError>;

    /// Snapshot of all runs.
    async fn runs(&self) -> Vec<TaskRun>;

    /// All runs belonging to a task.
    async fn runs_for_task(&self, task_id: &TaskId) -> Vec<TaskRun>;

    /// All runs referencing a device.
    async fn runs_for_device(&self, device_id: &DeviceId) -> Vec<TaskRun>;

    /// Atomically mutate one run; commits only if the closure returns Ok.
    async fn try_update_run(
        &self,
        id: &RunId,
        mutate: Mutation<TaskRun>,
    ) -> Result<TaskRun, CoreError>;

    /// Insert a new alert.
    async fn insert_alert(&self, alert: Alert) -> Result<(), CoreError>;

    /// Fetch one alert.
    async fn alert(&self, id: &AlertId) -> Result<Alert, CoreError>;

    /// Snapshot of all alerts.
    async fn alerts(&self) -> Vec<Alert>;

    /// Atomically mutate one alert; commits only if the closure returns Ok.
    async fn try_update_alert(
        &self,
        id: &AlertId,
        mutate: Mutation<Alert>,
    ) -> Result<Alert, CoreError>;
}
