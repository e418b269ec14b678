//! Event bus the pipeline orchestrator uses to publish state transitions
//! and errors to subscribers, grounded on `state::events::EventBus`
//! (a thin wrapper over `tokio::sync::broadcast`).

use tokio::sync::broadcast;

use crate::error::PipelineError;
use crate::pipeline::PipelineState;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events published by [`crate::pipeline::AudioPipelineOrchestrator`].
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// The orchestrator transitioned from `from` to `to`.
    StateChanged {
        from: PipelineState,
        to: PipelineState,
    },
    /// A fatal condition occurred; the orchestrator is now in `Error`.
    ErrorOccurred(std::sync::Arc<PipelineError>),
}

/// Broadcast-backed event bus. Cloning a subscriber is cheap; a slow
/// subscriber that falls behind the channel capacity silently misses the
/// oldest events rather than stalling the publisher, matching
/// `tokio::sync::broadcast`'s lag semantics.
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event. Returns the number of active subscribers that
    /// received it (0 if there are none — not an error).
    pub fn emit(&self, event: PipelineEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
