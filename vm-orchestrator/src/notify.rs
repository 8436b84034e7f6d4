//! Fire-and-forget notifications to request owners.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    RequestApproved,
    RequestRejected,
    ProvisioningStarted,
    ProvisioningCompleted,
    ProvisioningFailed,
    ResourceDestroyed,
    ResourceDestroyFailed,
}

/// Delivery channel for notifications. Errors are logged by the caller and
/// never change the outcome of the operation that raised the event.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: NotificationEvent, user_id: &str, payload: Value) -> anyhow::Result<()>;
}

/// Sink that only writes a log line.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, event: NotificationEvent, user_id: &str, payload: Value) -> anyhow::Result<()> {
        let event = serde_json::to_string(&event)?;
        info!(event = %event.trim_matches('"'), user_id, %payload, "Notification");
        Ok(())
    }
}

pub(crate) async fn send(sink: &dyn NotificationSink, event: NotificationEvent, user_id: &str, payload: Value) {
    if let Err(e) = sink.notify(event, user_id, payload).await {
        warn!(?event, user_id, error = %e, "Notification delivery failed");
    }
}
