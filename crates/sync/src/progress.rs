//! Progress arithmetic and broadcast delivery of progress events.

use std::sync::Arc;

use ledgersync_core::events::{ProgressSink, SyncProgressEvent};
use ledgersync_core::sync::SyncPlan;
use log::warn;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Default buffer of the broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Cumulative progress, in basis points, after `done` of `total` chunks of
/// step `index`.
pub fn step_progress_bps(plan: &SyncPlan, index: usize, done: u64, total: u64) -> u32 {
    let before = plan.weight_before(index);
    let Some(step) = plan.steps().get(index) else {
        return before;
    };
    if total == 0 {
        return before;
    }
    let share = u64::from(step.weight_bps) * done.min(total) / total;
    before + share as u32
}

/// Fans progress events out to any number of subscribers.
///
/// Emitting never blocks: when a subscriber falls behind it loses the oldest
/// events and sees a `Lagged` error on its next receive.
#[derive(Clone)]
pub struct ProgressPublisher {
    sender: broadcast::Sender<SyncProgressEvent>,
}

impl ProgressPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncProgressEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Forward every event to `sink` on a background task until the
    /// publisher is dropped.
    pub fn spawn_forwarder(&self, sink: Arc<dyn ProgressSink>) -> JoinHandle<()> {
        let mut receiver = self.subscribe();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => sink.emit(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Progress forwarder lagged, {} events dropped", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for ProgressPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl ProgressSink for ProgressPublisher {
    fn emit(&self, event: SyncProgressEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgersync_core::events::{MockProgressSink, ProgressPhase};
    use ledgersync_core::sync::{Capability, ChunkDirection, SyncMode, SyncRun, SyncStep};

    fn plan(weights: &[u32]) -> SyncPlan {
        let caps = [Capability::Trades, Capability::Deposits, Capability::Withdrawals];
        SyncPlan::new(
            weights
                .iter()
                .zip(caps)
                .map(|(w, capability)| SyncStep {
                    id: capability.as_str().to_string(),
                    label: capability.as_str().to_string(),
                    capability,
                    weight_bps: *w,
                    chunk_width_secs: 86_400,
                    direction: ChunkDirection::Descending,
                    required: false,
                })
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_step_progress() {
        let plan = plan(&[5000, 3000, 2000]);
        assert_eq!(step_progress_bps(&plan, 0, 0, 4), 0);
        assert_eq!(step_progress_bps(&plan, 0, 2, 4), 2500);
        assert_eq!(step_progress_bps(&plan, 1, 1, 3), 6000);
        assert_eq!(step_progress_bps(&plan, 2, 1, 1), 10_000);
        assert_eq!(step_progress_bps(&plan, 1, 0, 0), 5000);
        assert_eq!(step_progress_bps(&plan, 3, 0, 0), 10_000);
    }

    fn event(phase: ProgressPhase) -> SyncProgressEvent {
        let run = SyncRun::new("acc".into(), "SCRIPTED".into(), SyncMode::Full);
        SyncProgressEvent::from_run(&run, phase)
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_fine() {
        let publisher = ProgressPublisher::new(4);
        assert_eq!(publisher.subscriber_count(), 0);
        publisher.emit(event(ProgressPhase::RunStarted));
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_without_blocking() {
        let publisher = ProgressPublisher::new(2);
        let mut receiver = publisher.subscribe();

        for _ in 0..5 {
            publisher.emit(event(ProgressPhase::ChunkCompleted));
        }

        assert!(matches!(
            receiver.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert!(receiver.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_forwarder_delivers_until_closed() {
        let publisher = ProgressPublisher::new(16);
        let sink = MockProgressSink::new();
        let handle = publisher.spawn_forwarder(Arc::new(sink.clone()));

        publisher.emit(event(ProgressPhase::RunStarted));
        publisher.emit(event(ProgressPhase::RunFinished));
        drop(publisher);

        handle.await.unwrap();
        let phases: Vec<_> = sink.events().iter().map(|e| e.phase).collect();
        assert_eq!(phases, vec![ProgressPhase::RunStarted, ProgressPhase::RunFinished]);
    }
}
