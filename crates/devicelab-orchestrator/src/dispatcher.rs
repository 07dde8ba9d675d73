//! Event/Alert dispatcher.
//!
//! Converts state transitions into live events for dashboard subscribers
//! and anomaly detections into durable Alert records forwarded to the
//! notification channel.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use devicelab_core::{Alert, AlertId, AlertStatus, CoreError, LiveEvent};

use crate::collab::NotificationChannel;
use crate::store::Store;

/// Publishes live events and raises alerts.
///
/// Live events go out over a broadcast channel: at-least-once towards
/// connected subscribers, publish order preserved per entity. Subscribers
/// that fall behind observe `Lagged` and skip the overwritten items.
///
/// Alerts are written to the store first (the durable source of truth),
/// then forwarded fire-and-forget to the notification channel; a delivery
/// failure is logged and never rolls the record back.
pub struct EventDispatcher {
    store: Arc<dyn Store>,
    notifier: Arc<dyn NotificationChannel>,
    events: broadcast::Sender<LiveEvent>,
}

impl EventDispatcher {
    /// Create a dispatcher with the given live-event channel capacity.
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn NotificationChannel>,
        event_capacity: usize,
    ) -> Self {
        let (events, _rx) = broadcast::channel(event_capacity.max(1));
        Self {
            store,
            notifier,
            events,
        }
    }

    /// Subscribe to the live event stream. Only events published after
    /// the call are observed.
    pub fn subscribe(&self) -> BroadcastStream<LiveEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    /// Publish one transition to live subscribers.
    pub fn on_transition(&self, event: LiveEvent) {
        debug!(?event, "Publishing live event");
        // No receivers is fine; dashboards come and go.
        let _ = self.events.send(event);
    }

    /// Record an anomaly: persist the alert, then forward it.
    pub async fn on_anomaly(&self, alert: Alert) -> Result<Alert, CoreError> {
        info!(
            alert_id = %alert.id,
            kind = ?alert.kind,
            severity = ?alert.severity,
            message = %alert.message,
            "Alert raised"
        );
        self.store.insert_alert(alert.clone()).await?;

        let notifier = self.notifier.clone();
        let outbound = alert.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.deliver(&outbound).await {
                warn!(alert_id = %outbound.id, error = %e, "Alert delivery failed");
            }
        });

        Ok(alert)
    }

    /// Accept a human acknowledgement.
    pub async fn ack_alert(&self, id: &AlertId) -> Result<Alert, CoreError> {
        self.set_alert_status(id, AlertStatus::Acked).await
    }

    /// Accept a human resolution.
    pub async fn resolve_alert(&self, id: &AlertId) -> Result<Alert, CoreError> {
        self.set_alert_status(id, AlertStatus::Resolved).await
    }

    /// Accept a human dismissal.
    pub async fn ignore_alert(&self, id: &AlertId) -> Result<Alert, CoreError> {
        self.set_alert_status(id, AlertStatus::Ignored).await
    }

    async fn set_alert_status(
        &self,
        id: &AlertId,
        status: AlertStatus,
    ) -> Result<Alert, CoreError> {
        self.store
            .try_update_alert(
                id,
                Box::new(move |alert| {
                    alert.set_status(status);
                    Ok(())
                }),
            )
            .await
    }
}
