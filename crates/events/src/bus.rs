//! Broadcast transport for engine events

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::types::{Event, EventEnvelope};

const DEFAULT_CAPACITY: usize = 1000;

/// Fans envelopes out to every subscriber. Publishing never blocks; slow
/// subscribers lose the oldest envelopes.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    published: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns how many subscribers saw the envelope; with none it is dropped.
    pub fn publish(&self, envelope: EventEnvelope) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        trace!(policy = %envelope.policy, kind = %envelope.resource.kind, resource = %envelope.resource.name, "Publishing event");
        self.sender.send(envelope).unwrap_or(0)
    }

    pub fn emit(&self, event: Event) -> usize {
        self.publish(EventEnvelope::new(event))
    }

    /// Everything published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Events of one experiment from now on.
    pub fn watch(&self, experiment: impl Into<String>) -> ExperimentEvents {
        ExperimentEvents {
            experiment: experiment.into(),
            rx: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("published", &self.published())
            .finish()
    }
}

/// A subscription narrowed to one experiment. Lag is logged and skipped.
#[derive(Debug)]
pub struct ExperimentEvents {
    experiment: String,
    rx: broadcast::Receiver<EventEnvelope>,
}

impl ExperimentEvents {
    pub fn experiment(&self) -> &str {
        &self.experiment
    }

    /// Next event for the experiment; None once the bus is gone.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.event.experiment() == Some(self.experiment.as_str()) => {
                    return Some(envelope)
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(experiment = %self.experiment, missed, "Event watcher lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
