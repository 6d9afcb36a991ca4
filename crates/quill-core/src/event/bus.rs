//! Broadcast bus distributing `WorkflowEvent`s to any number of listeners.
//!
//! Publishing with no active subscribers is a no-op.

use quill_types::event::WorkflowEvent;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Multi-consumer event bus for workflow events.
///
/// Cloning the bus clones the sender; every clone feeds the same channel.
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Dropped silently when nobody listens.
    pub fn publish(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Drain every buffered event for `instance_id` from `rx` without waiting.
pub fn drain_for(
    rx: &mut broadcast::Receiver<WorkflowEvent>,
    instance_id: Uuid,
) -> Vec<WorkflowEvent> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) if event.instance_id() == instance_id => out.push(event),
            Ok(_) => {}
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event receiver lagged");
            }
            Err(_) => break,
        }
    }
    out
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
