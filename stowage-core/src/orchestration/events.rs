use async_trait::async_trait;
use stowage_model::LifecycleEvent;
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::Result;

/// Outbound channel for group and per-file lifecycle notifications.
#[async_trait]
pub trait LifecyclePublisher: Send + Sync {
    async fn publish(&self, event: LifecycleEvent) -> Result<()>;
}

/// Lets callers subscribe without depending on a concrete bus type.
pub trait LifecycleEventStream {
    fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent>;
}

/// Publishes an event; a delivery failure never fails the state change that
/// produced it.
pub(crate) async fn notify(
    publisher: &dyn LifecyclePublisher,
    event: impl Into<LifecycleEvent>,
) {
    let event = event.into();
    if let Err(err) = publisher.publish(event).await {
        warn!(error = %err, "failed to publish lifecycle event");
    }
}
