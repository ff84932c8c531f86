use crate::events::ProgressEvent;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Narrow seam to an external event store. The engine never calls it
/// directly; events are forwarded through an unbounded channel so a slow or
/// unavailable store can never block traversal.
#[async_trait]
pub trait EventStoreSink: Send + Sync {
    async fn append(&self, event: ProgressEvent);
}

pub type SharedEventStoreSink = Arc<dyn EventStoreSink>;

/// Spawns the drain task that feeds a store sink from the progress channel.
/// Returns the sender to hand to the [`crate::events::ProgressSink`] and the
/// drain handle, which completes once the sender side is dropped.
pub fn spawn_store_forwarder(
    store: SharedEventStoreSink,
) -> (mpsc::UnboundedSender<ProgressEvent>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            store.append(event).await;
        }
    });
    (tx, handle)
}
