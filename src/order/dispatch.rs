// =============================================================================
// Dispatch Worker — drains the order queue through the broker adapter
// =============================================================================
//
// A single background task pops queued orders and hands them to the injected
// `OrderAdapter`. Retry/termination policy lives in the queue itself
// (`process_next`); the worker only supplies pacing and lifecycle.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::order::queue::OrderQueue;
use crate::upstream::OrderAdapter;

/// Delay between polls while the queue is empty.
const IDLE_DELAY: Duration = Duration::from_millis(200);
/// Grace period for the worker task to finish on shutdown.
const STOP_GRACE: Duration = Duration::from_secs(1);

pub struct DispatchWorker {
    queue: Arc<OrderQueue>,
    adapter: Arc<dyn OrderAdapter>,
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchWorker {
    pub fn new(queue: Arc<OrderQueue>, adapter: Arc<dyn OrderAdapter>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            queue,
            adapter,
            stop_tx,
            handle: Mutex::new(None),
        }
    }

    /// Spawn the drain loop. A no-op when the worker is already running.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        let _ = self.stop_tx.send_replace(false);
        let worker = self.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        *handle = Some(tokio::spawn(async move {
            info!("dispatch worker started");
            loop {
                if *stop_rx.borrow() {
                    break;
                }

                if worker.queue.queue_depth() == 0 {
                    tokio::select! {
                        _ = stop_rx.changed() => {}
                        _ = tokio::time::sleep(IDLE_DELAY) => {}
                    }
                    continue;
                }

                worker.queue.process_next(worker.adapter.as_ref()).await;
            }
            info!("dispatch worker stopped");
        }));
    }

    /// Signal the loop to stop and join it with a short grace period.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_GRACE, handle).await.is_err() {
                warn!("dispatch worker did not stop within grace period");
            }
        }
    }
}
