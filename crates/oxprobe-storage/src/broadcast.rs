use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

pub const HOST_ADDED: &str = "host.added";
pub const HOST_UPDATED: &str = "host.updated";
pub const HOST_DELETED: &str = "host.deleted";
pub const PROBE_ADDED: &str = "probe.added";
pub const PROBE_UPDATED: &str = "probe.updated";
pub const PROBE_DELETED: &str = "probe.deleted";

/// Fire-and-forget notification of store changes, for live views.
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, event: &str, payload: Value);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBroadcaster;

impl Broadcaster for NoopBroadcaster {
    fn broadcast(&self, _event: &str, _payload: Value) {}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub event: String,
    pub payload: Value,
}

/// Publishes events on a `tokio` broadcast channel. Events sent while no
/// receiver is subscribed are dropped.
pub struct ChannelBroadcaster {
    sender: broadcast::Sender<Event>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn broadcast(&self, event: &str, payload: Value) {
        let sent = self.sender.send(Event {
            event: event.to_string(),
            payload,
        });
        if sent.is_err() {
            tracing::trace!(event, "No subscribers for store event");
        }
    }
}
