//! Event Bus for Supervisor Events
//!
//! Broadcast channel decoupling the agent loops from alerting and other
//! observers. Publishing never blocks and never fails the publisher.

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::agent::AgentStatus;
use crate::utils::types::{AgentId, Signal};

/// Events emitted by agents and the supervisor
#[derive(Debug, Clone)]
pub enum Event {
    StatusChanged {
        agent: AgentId,
        from: AgentStatus,
        to: AgentStatus,
    },
    EntryOpened {
        agent: AgentId,
        signal: Signal,
    },
    RebuildTriggered {
        agent: AgentId,
    },
    /// Retrain budget exhausted, operator intervention needed
    AgentFatal {
        agent: AgentId,
    },
    PairPermission {
        instrument: String,
        green: bool,
    },
    TradingAllowedChanged {
        allowed: bool,
    },
    Shutdown,
}

/// Event bus for broadcasting events to multiple subscribers
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: Event) {
        match self.sender.send(event) {
            Ok(count) => debug!("Event sent to {} receivers", count),
            // No receivers during startup/shutdown
            Err(_) => debug!("No event receivers"),
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Named subscriber that tolerates lag
pub struct EventProcessor {
    receiver: broadcast::Receiver<Event>,
    name: String,
}

impl EventProcessor {
    pub fn new(bus: &EventBus, name: &str) -> Self {
        Self {
            receiver: bus.subscribe(),
            name: name.to_string(),
        }
    }

    /// Next event, `None` once the bus is closed
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!("Event processor '{}' lagged by {} messages", self.name, count);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed for processor '{}'", self.name);
                    return None;
                }
            }
        }
    }
}

/// Spawn a task running `handler` for every event until the bus closes
pub fn spawn_event_handler<F, Fut>(bus: &EventBus, name: &str, mut handler: F) -> tokio::task::JoinHandle<()>
where
    F: FnMut(Event) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let mut processor = EventProcessor::new(bus, name);
    let name = name.to_string();

    tokio::spawn(async move {
        debug!("Event handler '{}' started", name);
        while let Some(event) = processor.next().await {
            if matches!(event, Event::Shutdown) {
                break;
            }
            handler(event).await;
        }
        debug!("Event handler '{}' stopped", name);
    })
}
