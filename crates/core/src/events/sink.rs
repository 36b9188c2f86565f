//! Progress sink trait and implementations.

use std::sync::{Arc, Mutex};

use super::SyncProgressEvent;

/// Receives sync progress events.
///
/// `emit()` must not block and must not fail the sync; delivery is
/// best-effort.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: SyncProgressEvent);
}

/// Discards every event.
#[derive(Clone, Default)]
pub struct NoOpProgressSink;

impl ProgressSink for NoOpProgressSink {
    fn emit(&self, _event: SyncProgressEvent) {}
}

/// Mock sink for testing - collects emitted events.
#[derive(Clone, Default)]
pub struct MockProgressSink {
    events: Arc<Mutex<Vec<SyncProgressEvent>>>,
}

impl MockProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SyncProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
    }
}

impl ProgressSink for MockProgressSink {
    fn emit(&self, event: SyncProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}
