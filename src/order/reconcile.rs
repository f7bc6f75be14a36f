// =============================================================================
// Reconciliation Engine — periodic diff between local jobs and broker truth
// =============================================================================
//
// Each pass snapshots the known job ids first, then re-reads every job and
// asks the broker status provider for its view. The queue lock is never held
// across the provider call. Mismatches are corrected in place (the broker is
// the execution authority) and appended to a durable line-delimited JSON
// journal.
//
// The journal is append-only. On startup the engine scans it, counts the
// lines it can parse and loads the last 100 events into the in-memory ring;
// malformed lines are skipped silently.
// =============================================================================

use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::order::queue::OrderQueue;
use crate::types::{epoch_now, OrderStatus, ReconciliationEvent};
use crate::upstream::BrokerStatusProvider;

/// Size of the in-memory recent-events ring.
const RECENT_EVENTS_CAP: usize = 100;
/// Grace period for the worker task to finish on shutdown.
const STOP_GRACE: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Result payloads
// ---------------------------------------------------------------------------

/// Outcome of a single reconciliation pass.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileSummary {
    pub checked: u64,
    pub mismatched: u64,
    pub corrected: u64,
    pub events: Vec<ReconciliationEvent>,
}

/// Cumulative engine metrics plus the recent-events ring.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileMetrics {
    pub runs: u64,
    pub checked: u64,
    pub mismatched: u64,
    pub corrected: u64,
    pub persisted_count: u64,
    pub recent_events: Vec<ReconciliationEvent>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct Inner {
    runs: u64,
    checked: u64,
    mismatched: u64,
    corrected: u64,
    persisted_count: u64,
    recent_events: VecDeque<ReconciliationEvent>,
}

pub struct ReconciliationEngine {
    queue: Arc<OrderQueue>,
    provider: Arc<dyn BrokerStatusProvider>,
    interval: Duration,
    journal_path: Option<PathBuf>,
    inner: Mutex<Inner>,
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReconciliationEngine {
    pub fn new(
        queue: Arc<OrderQueue>,
        provider: Arc<dyn BrokerStatusProvider>,
        interval_sec: f64,
        journal_path: Option<PathBuf>,
    ) -> Self {
        let (persisted_count, recent_events) = match &journal_path {
            Some(path) => Self::load_journal(path),
            None => (0, VecDeque::new()),
        };
        if persisted_count > 0 {
            info!(
                persisted = persisted_count,
                recent = recent_events.len(),
                "reconciliation journal recovered"
            );
        }

        let (stop_tx, _) = watch::channel(false);
        Self {
            queue,
            provider,
            interval: Duration::from_secs_f64(interval_sec.max(0.01)),
            journal_path,
            inner: Mutex::new(Inner {
                runs: 0,
                checked: 0,
                mismatched: 0,
                corrected: 0,
                persisted_count,
                recent_events,
            }),
            stop_tx,
            handle: Mutex::new(None),
        }
    }

    // ── Journal ─────────────────────────────────────────────────────────

    fn load_journal(path: &PathBuf) -> (u64, VecDeque<ReconciliationEvent>) {
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(_) => return (0, VecDeque::new()),
        };

        let mut count = 0u64;
        let mut ring: VecDeque<ReconciliationEvent> = VecDeque::new();
        for line in std::io::BufReader::new(file).lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => continue,
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ReconciliationEvent>(&line) {
                Ok(event) => {
                    count += 1;
                    ring.push_back(event);
                    if ring.len() > RECENT_EVENTS_CAP {
                        ring.pop_front();
                    }
                }
                Err(_) => {
                    // Malformed journal lines are skipped silently.
                    continue;
                }
            }
        }
        (count, ring)
    }

    fn append_journal(&self, event: &ReconciliationEvent) -> Result<()> {
        let path = match &self.journal_path {
            Some(path) => path,
            None => return Ok(()),
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create journal dir {}", parent.display()))?;
            }
        }

        let line = serde_json::to_string(event).context("failed to serialize journal event")?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open journal {}", path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append journal {}", path.display()))?;
        Ok(())
    }

    // ── Reconcile pass ──────────────────────────────────────────────────

    /// Diff every known job against the broker's view and correct drift.
    pub async fn reconcile_once(&self) -> ReconcileSummary {
        let mut checked = 0u64;
        let mut mismatched = 0u64;
        let mut corrected = 0u64;
        let mut events: Vec<ReconciliationEvent> = Vec::new();

        for order_id in self.queue.job_ids() {
            let job = match self.queue.get(&order_id) {
                Some(job) => job,
                None => continue,
            };
            checked += 1;

            let broker_view = match self.provider.order_status(&order_id, &job).await {
                Ok(Some(status)) => status,
                Ok(None) => continue,
                Err(err) => {
                    warn!(order_id = %order_id, error = %err, "broker status lookup failed");
                    continue;
                }
            };

            let normalized = broker_view.to_uppercase();
            if job.status.to_string() == normalized {
                continue;
            }

            let broker_status = match OrderStatus::parse(&normalized) {
                Some(status) => status,
                None => {
                    warn!(order_id = %order_id, status = %normalized, "unknown broker status — skipped");
                    continue;
                }
            };

            mismatched += 1;
            if let Some(previous) = self.queue.adopt_broker_status(&order_id, broker_status) {
                corrected += 1;
                let event = ReconciliationEvent {
                    order_id: order_id.clone(),
                    internal_status: previous.to_string(),
                    broker_status: normalized,
                    corrected_status: broker_status.to_string(),
                    ts: epoch_now(),
                };
                info!(
                    order_id = %order_id,
                    from = %event.internal_status,
                    to = %event.corrected_status,
                    "reconciliation corrected order status"
                );

                match self.append_journal(&event) {
                    Ok(()) => {
                        if self.journal_path.is_some() {
                            self.inner.lock().persisted_count += 1;
                        }
                    }
                    Err(err) => warn!(error = %err, "journal append failed"),
                }

                let mut inner = self.inner.lock();
                inner.recent_events.push_back(event.clone());
                if inner.recent_events.len() > RECENT_EVENTS_CAP {
                    inner.recent_events.pop_front();
                }
                drop(inner);
                events.push(event);
            }
        }

        let mut inner = self.inner.lock();
        inner.runs += 1;
        inner.checked += checked;
        inner.mismatched += mismatched;
        inner.corrected += corrected;
        drop(inner);

        debug!(checked, mismatched, corrected, "reconciliation pass complete");
        ReconcileSummary {
            checked,
            mismatched,
            corrected,
            events,
        }
    }

    /// Run one pass synchronously (the `/orders/reconcile` endpoint).
    pub async fn trigger(&self) -> ReconcileSummary {
        self.reconcile_once().await
    }

    // ── Scheduler ───────────────────────────────────────────────────────

    /// Start the periodic worker. A no-op when it is already running.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        let _ = self.stop_tx.send_replace(false);
        let engine = self.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        *handle = Some(tokio::spawn(async move {
            info!(interval = ?engine.interval, "reconciliation worker started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(engine.interval) => {
                        // A failing pass must not kill the worker; provider
                        // errors are already absorbed inside reconcile_once.
                        let _ = engine.reconcile_once().await;
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("reconciliation worker stopped");
        }));
    }

    /// Signal the worker to stop and join it with a short grace period.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_GRACE, handle).await.is_err() {
                warn!("reconciliation worker did not stop within grace period");
            }
        }
    }

    pub fn metrics(&self) -> ReconcileMetrics {
        let inner = self.inner.lock();
        ReconcileMetrics {
            runs: inner.runs,
            checked: inner.checked,
            mismatched: inner.mismatched,
            corrected: inner.corrected,
            persisted_count: inner.persisted_count,
            recent_events: inner.recent_events.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderJob, OrderRequest};
    use crate::upstream::UpstreamError;
    use async_trait::async_trait;
    use uuid::Uuid;

    fn req() -> OrderRequest {
        OrderRequest {
            account_id: "12345678-01".into(),
            symbol: "005930".into(),
            side: "BUY".into(),
            qty: 1,
            order_type: "LIMIT".into(),
            price: Some(70_000.0),
            strategy_id: None,
        }
    }

    /// Provider double reporting the same status for every order.
    struct StaticProvider(Option<String>);

    #[async_trait]
    impl BrokerStatusProvider for StaticProvider {
        async fn order_status(
            &self,
            _order_id: &str,
            _job: &OrderJob,
        ) -> Result<Option<String>, UpstreamError> {
            Ok(self.0.clone())
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl BrokerStatusProvider for FailingProvider {
        async fn order_status(
            &self,
            _order_id: &str,
            _job: &OrderJob,
        ) -> Result<Option<String>, UpstreamError> {
            Err(UpstreamError::Transport("unreachable".into()))
        }
    }

    fn temp_journal() -> PathBuf {
        std::env::temp_dir().join(format!("kis-gateway-journal-{}.jsonl", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn silent_provider_changes_nothing() {
        let queue = Arc::new(OrderQueue::new(3));
        queue.enqueue(req(), "key-1").unwrap();
        let engine = ReconciliationEngine::new(
            queue.clone(),
            Arc::new(StaticProvider(None)),
            5.0,
            None,
        );

        let summary = engine.reconcile_once().await;
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.mismatched, 0);
        assert_eq!(summary.corrected, 0);
        assert_eq!(engine.metrics().runs, 1);
    }

    #[tokio::test]
    async fn mismatch_corrects_job_and_records_event() {
        let queue = Arc::new(OrderQueue::new(3));
        let accepted = queue.enqueue(req(), "key-1").unwrap().accepted;
        let engine = ReconciliationEngine::new(
            queue.clone(),
            Arc::new(StaticProvider(Some("filled".into()))),
            5.0,
            None,
        );

        let summary = engine.reconcile_once().await;
        assert_eq!(summary.mismatched, 1);
        assert_eq!(summary.corrected, 1);
        assert_eq!(summary.events.len(), 1);
        assert_eq!(summary.events[0].internal_status, "NEW");
        assert_eq!(summary.events[0].broker_status, "FILLED");

        let job = queue.get(&accepted.order_id).unwrap();
        assert_eq!(job.status, OrderStatus::Filled);
        assert!(job.terminal);
        assert_eq!(job.error, None);

        // Second pass: statuses now agree.
        let summary = engine.reconcile_once().await;
        assert_eq!(summary.mismatched, 0);
    }

    #[tokio::test]
    async fn provider_errors_are_swallowed() {
        let queue = Arc::new(OrderQueue::new(3));
        queue.enqueue(req(), "key-1").unwrap();
        let engine =
            ReconciliationEngine::new(queue.clone(), Arc::new(FailingProvider), 5.0, None);

        let summary = engine.reconcile_once().await;
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.corrected, 0);
    }

    #[tokio::test]
    async fn journal_survives_engine_restart() {
        let path = temp_journal();
        let queue = Arc::new(OrderQueue::new(3));
        queue.enqueue(req(), "key-1").unwrap();

        let engine_a = ReconciliationEngine::new(
            queue.clone(),
            Arc::new(StaticProvider(Some("FILLED".into()))),
            5.0,
            Some(path.clone()),
        );
        let summary = engine_a.reconcile_once().await;
        assert_eq!(summary.corrected, 1);
        assert_eq!(engine_a.metrics().persisted_count, 1);
        drop(engine_a);

        // A fresh engine over the same journal recovers the event.
        let engine_b = ReconciliationEngine::new(
            Arc::new(OrderQueue::new(3)),
            Arc::new(StaticProvider(None)),
            5.0,
            Some(path.clone()),
        );
        let metrics = engine_b.metrics();
        assert_eq!(metrics.persisted_count, 1);
        assert_eq!(metrics.recent_events.len(), 1);
        assert_eq!(metrics.recent_events[0].corrected_status, "FILLED");

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn malformed_journal_lines_are_skipped() {
        let path = temp_journal();
        std::fs::write(
            &path,
            "not json at all\n{\"order_id\":\"ord_1\",\"internal_status\":\"SENT\",\"broker_status\":\"FILLED\",\"corrected_status\":\"FILLED\",\"ts\":1}\n\n",
        )
        .unwrap();

        let engine = ReconciliationEngine::new(
            Arc::new(OrderQueue::new(3)),
            Arc::new(StaticProvider(None)),
            5.0,
            Some(path.clone()),
        );
        let metrics = engine.metrics();
        assert_eq!(metrics.persisted_count, 1);
        assert_eq!(metrics.recent_events.len(), 1);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn journal_append_creates_parent_directories() {
        let dir = std::env::temp_dir().join(format!("kis-gateway-{}", Uuid::new_v4()));
        let path = dir.join("nested").join("events.jsonl");

        let queue = Arc::new(OrderQueue::new(3));
        queue.enqueue(req(), "key-1").unwrap();
        let engine = ReconciliationEngine::new(
            queue,
            Arc::new(StaticProvider(Some("CANCELED".into()))),
            5.0,
            Some(path.clone()),
        );
        engine.reconcile_once().await;
        assert!(path.exists());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn periodic_worker_runs_and_stops() {
        let queue = Arc::new(OrderQueue::new(3));
        queue.enqueue(req(), "key-1").unwrap();
        let engine = Arc::new(ReconciliationEngine::new(
            queue,
            Arc::new(StaticProvider(None)),
            0.02,
            None,
        ));

        engine.start();
        // Idempotent start while running.
        engine.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.stop().await;

        assert!(engine.metrics().runs >= 1);
    }
}
