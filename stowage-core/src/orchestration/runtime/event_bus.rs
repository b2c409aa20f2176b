use async_trait::async_trait;
use std::fmt;
use stowage_model::LifecycleEvent;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::orchestration::events::{LifecycleEventStream, LifecyclePublisher};

/// In-process event bus that fans lifecycle notifications out to every
/// subscriber. Events published while nobody listens are dropped.
pub struct InProcEventBus {
    sender: broadcast::Sender<LifecycleEvent>,
    channel_capacity: usize,
}

impl fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("channel_capacity", &self.channel_capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            channel_capacity: capacity,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl LifecyclePublisher for InProcEventBus {
    async fn publish(&self, event: LifecycleEvent) -> Result<()> {
        let _ = self.sender.send(event);
        Ok(())
    }
}

impl LifecycleEventStream for InProcEventBus {
    fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.subscribe()
    }
}
