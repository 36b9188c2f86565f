use ledgersync_core::events::{ProgressPhase, ProgressSink, SyncProgressEvent};
use serde_json::Value;
use tokio::sync::broadcast;

/// Event names pushed over the SSE stream.
pub const SYNC_PROGRESS: &str = "sync:progress";
pub const SYNC_COMPLETE: &str = "sync:complete";

/// Serializable envelope that carries event names and optional payloads.
#[derive(Clone, Debug)]
pub struct ServerEvent {
    pub name: &'static str,
    pub payload: Option<Value>,
}

impl ServerEvent {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            payload: None,
        }
    }

    pub fn with_payload(name: &'static str, payload: Value) -> Self {
        Self {
            name,
            payload: Some(payload),
        }
    }
}

/// Lightweight broadcast bus that fans out events to any connected clients.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: ServerEvent) {
        // Lagging listeners are ignored to avoid blocking producers.
        let _ = self.sender.send(event);
    }
}

impl ProgressSink for EventBus {
    fn emit(&self, event: SyncProgressEvent) {
        let name = match event.phase {
            ProgressPhase::RunFinished => SYNC_COMPLETE,
            _ => SYNC_PROGRESS,
        };
        match serde_json::to_value(&event) {
            Ok(payload) => self.publish(ServerEvent::with_payload(name, payload)),
            Err(err) => {
                tracing::warn!("Dropping progress event for run {}: {}", event.run_id, err)
            }
        }
    }
}
