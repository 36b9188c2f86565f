//! Progress events.
//!
//! The orchestrator emits [`SyncProgressEvent`]s through a [`ProgressSink`];
//! runtime adapters (the HTTP server) implement the sink to forward them.

mod progress_event;
mod sink;

pub use progress_event::*;
pub use sink::*;
