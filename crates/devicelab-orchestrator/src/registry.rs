//! Device registry and lease manager.
//!
//! Owns every mutation of device lifecycle status. Lease acquisition and
//! release are compare-and-set operations keyed by device id: concurrent
//! lease attempts for the same device never both succeed, and release is
//! idempotent so crash-recovery paths can call it twice.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

use devicelab_core::{
    Alert, AlertKind, AlertSeverity, CoreError, Device, DeviceId, DeviceStatus, Lease, LeaseToken,
    LiveEvent, RunId,
};

use crate::dispatcher::EventDispatcher;
use crate::store::Store;

/// Device registry and lease manager.
pub struct DeviceRegistry {
    store: Arc<dyn Store>,
    dispatcher: Arc<EventDispatcher>,
    released: Arc<Notify>,
}

impl DeviceRegistry {
    /// Create a new registry.
    pub fn new(store: Arc<dyn Store>, dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            store,
            dispatcher,
            released: Arc::new(Notify::new()),
        }
    }

    /// Signal fired after every successful release, so the scheduler can
    /// reclaim freed devices without waiting for the next tick.
    pub fn release_signal(&self) -> Arc<Notify> {
        self.released.clone()
    }

    /// Add a device to the pool in Available status.
    pub async fn register(&self, device: Device) -> Result<(), CoreError> {
        let device_id = device.id.clone();
        self.store.insert_device(device).await?;
        info!(device_id = %device_id, "Device registered");
        self.dispatcher.on_transition(LiveEvent::DeviceRegistered {
            device_id,
            at: Utc::now(),
        });
        Ok(())
    }

    /// Atomically lease an Available device to a run.
    ///
    /// Never queues: if the device is not leasable the caller gets
    /// `NotAvailable` and the scheduler decides whether to try another
    /// candidate.
    pub async fn lease(
        &self,
        device_id: &DeviceId,
        run_id: &RunId,
    ) -> Result<LeaseToken, CoreError> {
        let token = Uuid::new_v4().to_string();
        let lease = Lease {
            token: token.clone(),
            run_id: run_id.clone(),
            leased_at: Utc::now(),
        };

        self.store
            .try_update_device(
                device_id,
                Box::new(move |device| {
                    if !device.is_leasable() {
                        return Err(CoreError::NotAvailable(format!(
                            "device {} is {:?}",
                            device.id, device.status
                        )));
                    }
                    device.status = DeviceStatus::Busy;
                    device.lease = Some(lease);
                    Ok(())
                }),
            )
            .await?;

        info!(device_id = %device_id, run_id = %run_id, "Device leased");
        self.dispatcher
            .on_transition(LiveEvent::DeviceStatusChanged {
                device_id: device_id.clone(),
                from: DeviceStatus::Available,
                to: DeviceStatus::Busy,
                at: Utc::now(),
            });

        Ok(LeaseToken {
            device_id: device_id.clone(),
            token,
        })
    }

    /// Release a lease. Idempotent: a stale token (already released or
    /// re-granted lease) is a no-op, not an error.
    ///
    /// A device that went Offline while leased keeps its Offline status;
    /// only a Busy device returns to Available.
    pub async fn release(&self, token: &LeaseToken) -> Result<(), CoreError> {
        let snapshot = self.store.device(&token.device_id).await?;
        let holds = snapshot
            .lease
            .as_ref()
            .is_some_and(|l| l.token == token.token);
        if !holds {
            return Ok(());
        }

        let from = snapshot.status;
        let expected = token.token.clone();
        let result = self
            .store
            .try_update_device(
                &token.device_id,
                Box::new(move |device| match &device.lease {
                    Some(lease) if lease.token == expected => {
                        device.lease = None;
                        if device.status == DeviceStatus::Busy {
                            device.status = DeviceStatus::Available;
                        }
                        Ok(())
                    }
                    _ => Err(CoreError::ReconciliationConflict(
                        "lease changed under release".to_string(),
                    )),
                }),
            )
            .await;

        match result {
            Ok(updated) => {
                info!(device_id = %token.device_id, status = ?updated.status, "Lease released");
                if updated.status != from {
                    self.dispatcher
                        .on_transition(LiveEvent::DeviceStatusChanged {
                            device_id: token.device_id.clone(),
                            from,
                            to: updated.status,
                            at: Utc::now(),
                        });
                }
                self.released.notify_one();
                Ok(())
            }
            // Someone else released first; the end state is identical.
            Err(CoreError::ReconciliationConflict(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Clear whatever lease a device holds, token unchecked. Reserved
    /// for reconciliation and administrative recovery; normal completion
    /// paths release with their token.
    pub async fn force_release(&self, device_id: &DeviceId) -> Result<Device, CoreError> {
        let from = self.store.device(device_id).await?.status;
        let updated = self
            .store
            .try_update_device(
                device_id,
                Box::new(|device| {
                    device.lease = None;
                    if device.status == DeviceStatus::Busy {
                        device.status = DeviceStatus::Available;
                    }
                    Ok(())
                }),
            )
            .await?;

        warn!(device_id = %device_id, "Lease force-released");
        if updated.status != from {
            self.dispatcher
                .on_transition(LiveEvent::DeviceStatusChanged {
                    device_id: device_id.clone(),
                    from,
                    to: updated.status,
                    at: Utc::now(),
                });
        }
        self.released.notify_one();
        Ok(updated)
    }

    /// Mark a device offline (heartbeat timeout or administrative).
    ///
    /// On a Busy device the lease stays intact; the sweeper is
    /// responsible for terminating the orphaned run.
    pub async fn mark_offline(&self, device_id: &DeviceId) -> Result<Device, CoreError> {
        let snapshot = self.store.device(device_id).await?;
        if snapshot.status == DeviceStatus::Offline {
            return Ok(snapshot);
        }

        let from = snapshot.status;
        let updated = self
            .store
            .try_update_device(
                device_id,
                Box::new(|device| {
                    if device.status == DeviceStatus::Offline {
                        return Err(CoreError::ReconciliationConflict(
                            "device already offline".to_string(),
                        ));
                    }
                    device.status = DeviceStatus::Offline;
                    Ok(())
                }),
            )
            .await;
        let updated = match updated {
            Ok(d) => d,
            // Raced with another offline marking; same end state.
            Err(CoreError::ReconciliationConflict(_)) => {
                return self.store.device(device_id).await
            }
            Err(e) => return Err(e),
        };

        warn!(device_id = %device_id, leased = updated.lease.is_some(), "Device marked offline");
        self.dispatcher
            .on_transition(LiveEvent::DeviceStatusChanged {
                device_id: device_id.clone(),
                from,
                to: DeviceStatus::Offline,
                at: Utc::now(),
            });

        if let Some(lease) = &updated.lease {
            let alert = Alert::new(
                AlertKind::DeviceOffline,
                AlertSeverity::Critical,
                format!("device {} went offline while leased", device_id),
            )
            .for_device(device_id.clone())
            .for_run(lease.run_id.clone());
            self.dispatcher.on_anomaly(alert).await?;
        }

        Ok(updated)
    }

    /// Return an Offline or Maintenance device to the pool.
    pub async fn mark_available(&self, device_id: &DeviceId) -> Result<Device, CoreError> {
        let from = self.store.device(device_id).await?.status;
        let updated = self
            .store
            .try_update_device(
                device_id,
                Box::new(|device| {
                    if device.retired {
                        return Err(CoreError::Conflict(format!(
                            "device {} is retired",
                            device.id
                        )));
                    }
                    if device.lease.is_some() {
                        return Err(CoreError::Conflict(format!(
                            "device {} still holds a lease",
                            device.id
                        )));
                    }
                    match device.status {
                        DeviceStatus::Available => Ok(()),
                        DeviceStatus::Offline | DeviceStatus::Maintenance => {
                            device.status = DeviceStatus::Available;
                            Ok(())
                        }
                        DeviceStatus::Busy => Err(CoreError::invalid_transition(
                            DeviceStatus::Busy,
                            DeviceStatus::Available,
                        )),
                    }
                }),
            )
            .await?;

        info!(device_id = %device_id, "Device marked available");
        if from != updated.status {
            self.dispatcher
                .on_transition(LiveEvent::DeviceStatusChanged {
                    device_id: device_id.clone(),
                    from,
                    to: DeviceStatus::Available,
                    at: Utc::now(),
                });
        }
        Ok(updated)
    }

    /// Take an idle device out of the pool for maintenance.
    pub async fn mark_maintenance(&self, device_id: &DeviceId) -> Result<Device, CoreError> {
        let from = self.store.device(device_id).await?.status;
        let updated = self
            .store
            .try_update_device(
                device_id,
                Box::new(|device| match device.status {
                    DeviceStatus::Available | DeviceStatus::Offline => {
                        device.status = DeviceStatus::Maintenance;
                        Ok(())
                    }
                    other => Err(CoreError::invalid_transition(
                        other,
                        DeviceStatus::Maintenance,
                    )),
                }),
            )
            .await?;

        info!(device_id = %device_id, "Device under maintenance");
        self.dispatcher
            .on_transition(LiveEvent::DeviceStatusChanged {
                device_id: device_id.clone(),
                from,
                to: DeviceStatus::Maintenance,
                at: Utc::now(),
            });
        Ok(updated)
    }

    /// Record a device heartbeat. Heartbeat time is not guarded by the
    /// status CAS; any state may heartbeat.
    pub async fn record_heartbeat(&self, device_id: &DeviceId) -> Result<(), CoreError> {
        self.store
            .try_update_device(
                device_id,
                Box::new(|device| {
                    device.last_heartbeat = Some(Utc::now());
                    Ok(())
                }),
            )
            .await?;
        Ok(())
    }

    /// Soft-retire a device. Historical runs keep referencing it; it is
    /// never leased again.
    pub async fn retire(&self, device_id: &DeviceId) -> Result<Device, CoreError> {
        let updated = self
            .store
            .try_update_device(
                device_id,
                Box::new(|device| {
                    if device.status == DeviceStatus::Busy {
                        return Err(CoreError::Conflict(format!(
                            "device {} is busy; release it before retiring",
                            device.id
                        )));
                    }
                    device.retired = true;
                    Ok(())
                }),
            )
            .await?;
        info!(device_id = %device_id, "Device retired");
        Ok(updated)
    }
}
