//! In-memory store implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use devicelab_core::{Alert, AlertId, CoreError, Device, DeviceId, RunId, Task, TaskId, TaskRun};

use super::{Mutation, Store};

/// In-memory store backed by per-entity-type maps.
///
/// `try_update_*` runs the mutation against a copy under the map's write
/// lock and commits only on Ok, which makes every conditional update an
/// atomic compare-and-set keyed by entity id.
#[derive(Default)]
pub struct MemoryStore {
    devices: RwLock<HashMap<DeviceId, Device>>,
    tasks: RwLock<HashMap<TaskId, Task>>,
    runs: RwLock<HashMap<RunId, TaskRun>>,
    alerts: RwLock<HashMap<AlertId, Alert>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_device(&self, device: Device) -> Result<(), CoreError> {
        let mut devices = self.devices.write().await;
        if devices.contains_key(&device.id) {
            return Err(CoreError::Conflict(format!(
                "device {} already registered",
                device.id
            )));
        }
        devices.insert(device.id.clone(), device);
        Ok(())
    }

    async fn device(&self, id: &DeviceId) -> Result<Device, CoreError> {
        self.devices
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::DeviceNotFound(id.to_string()))
    }

    async fn devices(&self) -> Vec<Device> {
        self.devices.read().await.values().cloned().collect()
    }

    async fn try_update_device(
        &self,
        id: &DeviceId,
        mutate: Mutation<Device>,
    ) -> Result<Device, CoreError> {
        let mut devices = self.devices.write().await;
        let entry = devices
            .get_mut(id)
            .ok_or_else(|| CoreError::DeviceNotFound(id.to_string()))?;
        let mut candidate = entry.clone();
        mutate(&mut candidate)?;
        *entry = candidate.clone();
        Ok(candidate)
    }

    async fn insert_task(&self, task: Task) -> Result<(), CoreError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(CoreError::Conflict(format!(
                "task {} already exists",
                task.id
            )));
        }
        tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn task(&self, id: &TaskId) -> Result<Task, CoreError> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::TaskNotFound(id.to_string()))
    }

    async fn tasks(&self) -> Vec<Task> {
        self.tasks.read().await.values().cloned().collect()
    }

    async fn try_update_task(
        &self,
        id: &TaskId,
        mutate: Mutation<Task>,
    ) -> Result<Task, CoreError> {
        let mut tasks = self.tasks.write().await;
        let entry = tasks
            .get_mut(id)
            .ok_or_else(|| CoreError::TaskNotFound(id.to_string()))?;
        let mut candidate = entry.clone();
        mutate(&mut candidate)?;
        *entry = candidate.clone();
        Ok(candidate)
    }

    async fn insert_run(&self, run: TaskRun) -> Result<(), CoreError> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.id) {
            return Err(CoreError::Conflict(format!("run {} already exists", run.id)));
        }
        runs.insert(run.id.clone(), run);
        Ok(())
    }

    async fn run(&self, id: &RunId) -> Result<TaskRun, CoreError> {
        self.runs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::RunNotFound(id.to_string()))
    }

    async fn runs(&self) -> Vec<TaskRun> {
        self.runs.read().await.values().cloned().collect()
    }

    async fn runs_for_task(&self, task_id: &TaskId) -> Vec<TaskRun> {
        self.runs
            .read()
            .await
            .values()
            .filter(|r| &r.task_id == task_id)
            .cloned()
            .collect()
    }

    async fn runs_for_device(&self, device_id: &DeviceId) -> Vec<TaskRun> {
        self.runs
            .read()
            .await
            .values()
            .filter(|r| &r.device_id == device_id)
            .cloned()
            .collect()
    }

    async fn try_update_run(
        &self,
        id: &RunId,
        mutate: Mutation<TaskRun>,
    ) -> Result<TaskRun, CoreError> {
        let mut runs = self.runs.write().await;
        let entry = runs
            .get_mut(id)
            .ok_or_else(|| CoreError::RunNotFound(id.to_string()))?;
        let mut candidate = entry.clone();
        mutate(&mut candidate)?;
        *entry = candidate.clone();
        Ok(candidate)
    }

    async fn insert_alert(&self, alert: Alert) -> Result<(), CoreError> {
        let mut alerts = self.alerts.write().await;
        if alerts.contains_key(&alert.id) {
            return Err(CoreError::Conflict(format!(
                "alert {} already exists",
                alert.id
            )));
        }
        alerts.insert(alert.id.clone(), alert);
        Ok(())
    }

    async fn alert(&self, id: &AlertId) -> Result<Alert, CoreError> {
        self.alerts
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::AlertNotFound(id.to_string()))
    }

    async fn alerts(&self) -> Vec<Alert> {
        self.alerts.read().await.values().cloned().collect()
    }

    async fn try_update_alert(
        &self,
        id: &AlertId,
        mutate: Mutation<Alert>,
    ) -> Result<Alert, CoreError> {
        let mut alerts = self.alerts.write().await;
        let entry = alerts
            .get_mut(id)
            .ok_or_else(|| CoreError::AlertNotFound(id.to_string()))?;
        let mut candidate = entry.clone();
        mutate(&mut candidate)?;
        *entry = candidate.clone();
        Ok(candidate)
    }
}
