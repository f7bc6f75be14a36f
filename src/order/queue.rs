// =============================================================================
// Order Queue — idempotency store, FIFO queue, per-job lifecycle
// =============================================================================
//
// All public operations are mutually exclusive on the instance lock. The one
// exception to lock scope is the broker call inside `process_next`: the lock
// is released before the adapter is awaited and re-taken to record the
// outcome, so a slow broker never blocks enqueue or status reads.
//
// Terminal discipline: once a job reaches FILLED/REJECTED/CANCELED the queue
// API refuses further transitions. Reconciliation may still adopt a new
// terminal truth from the broker via `adopt_broker_status`.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::types::{epoch_now, OrderAccepted, OrderJob, OrderRequest, OrderStatus};
use crate::upstream::OrderAdapter;

// ---------------------------------------------------------------------------
// Idempotency
// ---------------------------------------------------------------------------

struct IdemRecord {
    accepted: OrderAccepted,
    body_hash: String,
}

/// SHA-256 over the canonical JSON form of the request (sorted keys, compact
/// separators — `serde_json`'s default map is BTree-backed, so serializing a
/// `Value` already yields sorted keys).
pub fn body_hash(req: &OrderRequest) -> String {
    let value = serde_json::to_value(req).unwrap_or(serde_json::Value::Null);
    let canonical = serde_json::to_string(&value).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Queue counters served by `/metrics/order`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueMetrics {
    pub queue_depth: usize,
    pub accepted: u64,
    pub deduplicated: u64,
    pub processed: u64,
    pub sent: u64,
    pub rejected: u64,
    pub filled: u64,
    pub retried: u64,
    pub retry_exhausted: u64,
    pub terminal: u64,
}

// ---------------------------------------------------------------------------
// Execution results
// ---------------------------------------------------------------------------

/// Broker-confirmed terminal outcome reported from outside the dispatch path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionResult {
    Filled,
    Rejected,
}

/// Result of an enqueue: the acceptance receipt plus whether it was a replay
/// of an earlier submission.
#[derive(Debug, Clone)]
pub struct Enqueued {
    pub accepted: OrderAccepted,
    pub deduplicated: bool,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

struct Inner {
    queue: VecDeque<String>,
    idem: HashMap<String, IdemRecord>,
    jobs: HashMap<String, OrderJob>,
    counters: QueueMetrics,
}

pub struct OrderQueue {
    inner: Mutex<Inner>,
    max_attempts: u32,
}

impl OrderQueue {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                idem: HashMap::new(),
                jobs: HashMap::new(),
                counters: QueueMetrics::default(),
            }),
            max_attempts,
        }
    }

    // ── Enqueue ─────────────────────────────────────────────────────────

    /// Accept an order under an idempotency key. A repeat submission with the
    /// same key and body replays the original acceptance without re-queueing;
    /// the same key with a different body is a conflict.
    pub fn enqueue(&self, request: OrderRequest, idem_key: &str) -> Result<Enqueued, QueueError> {
        let hash = body_hash(&request);
        let mut inner = self.inner.lock();

        if let Some(record) = inner.idem.get(idem_key) {
            if record.body_hash != hash {
                warn!(idem_key, "idempotency key reused with different body");
                return Err(QueueError::IdempotencyKeyBodyMismatch);
            }
            let accepted = record.accepted.clone();
            inner.counters.deduplicated += 1;
            debug!(idem_key, order_id = %accepted.order_id, "duplicate submission deduplicated");
            return Ok(Enqueued {
                accepted,
                deduplicated: true,
            });
        }

        let now = epoch_now();
        let suffix = Uuid::new_v4().simple().to_string();
        let order_id = format!("ord_{}_{}", now, &suffix[..8]);

        let job = OrderJob {
            order_id: order_id.clone(),
            request,
            status: OrderStatus::New,
            created_at: now,
            updated_at: now,
            error: None,
            broker_order_id: None,
            attempts: 0,
            max_attempts: self.max_attempts,
            terminal: false,
        };
        let accepted = OrderAccepted {
            order_id: order_id.clone(),
            status: "ACCEPTED".to_string(),
            idempotency_key: idem_key.to_string(),
        };

        inner.jobs.insert(order_id.clone(), job);
        inner.queue.push_back(order_id.clone());
        inner.idem.insert(
            idem_key.to_string(),
            IdemRecord {
                accepted: accepted.clone(),
                body_hash: hash,
            },
        );
        inner.counters.accepted += 1;
        info!(order_id = %order_id, idem_key, "order accepted and queued");

        Ok(Enqueued {
            accepted,
            deduplicated: false,
        })
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    /// Pop the head of the queue and dispatch it through `adapter`.
    ///
    /// Returns `None` when the queue is empty; otherwise the job in its
    /// post-dispatch state. Retryable failures loop the job back to NEW at the
    /// tail of the queue until its attempt budget runs out.
    pub async fn process_next(&self, adapter: &dyn OrderAdapter) -> Option<OrderJob> {
        // Phase 1: claim the next live job under the lock.
        let (order_id, request) = {
            let mut inner = self.inner.lock();
            let order_id = loop {
                let candidate = inner.queue.pop_front()?;
                match inner.jobs.get(&candidate) {
                    Some(job) if job.terminal => continue,
                    Some(_) => break candidate,
                    None => continue,
                }
            };
            let job = inner
                .jobs
                .get_mut(&order_id)
                .expect("claimed job exists in the map");
            job.status = OrderStatus::Dispatching;
            job.updated_at = epoch_now();
            job.attempts += 1;
            (order_id, job.request.clone())
        };

        // Phase 2: broker call without holding the queue lock.
        let outcome = adapter.place_order(&request).await;

        // Phase 3: record the outcome. The explicit reborrow keeps the job
        // and counter borrows on disjoint fields.
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let job = inner.jobs.get_mut(&order_id)?;

        match outcome {
            Ok(placed) => {
                job.status = OrderStatus::Sent;
                job.error = None;
                job.broker_order_id = Some(placed.broker_order_id);
                job.updated_at = epoch_now();
                inner.counters.sent += 1;
                info!(order_id = %order_id, "order sent to broker");
            }
            Err(err) => {
                let code = err.classify();
                let (attempts, max_attempts) = (job.attempts, job.max_attempts);

                if code.is_retryable() && attempts < max_attempts {
                    job.status = OrderStatus::New;
                    job.error = Some(code.as_str().to_string());
                    job.updated_at = epoch_now();
                    inner.queue.push_back(order_id.clone());
                    inner.counters.retried += 1;
                    warn!(
                        order_id = %order_id,
                        code = %code,
                        attempts,
                        "dispatch failed — requeued for retry"
                    );
                } else {
                    let exhausted = code.is_retryable();
                    job.status = OrderStatus::Rejected;
                    job.error = Some(if exhausted {
                        "RETRY_EXHAUSTED".to_string()
                    } else {
                        code.as_str().to_string()
                    });
                    job.terminal = true;
                    job.updated_at = epoch_now();
                    if exhausted {
                        inner.counters.retry_exhausted += 1;
                    }
                    inner.counters.rejected += 1;
                    inner.counters.terminal += 1;
                    warn!(
                        order_id = %order_id,
                        code = %code,
                        attempts,
                        exhausted,
                        "dispatch failed — order rejected"
                    );
                }
            }
        }

        inner.counters.processed += 1;
        inner.jobs.get(&order_id).cloned()
    }

    // ── External execution truth ────────────────────────────────────────

    /// Record a broker-confirmed fill or rejection. Idempotent: a job that is
    /// already terminal is returned unchanged.
    pub fn mark_execution_result(
        &self,
        order_id: &str,
        result: ExecutionResult,
        reason: Option<String>,
    ) -> Result<OrderJob, QueueError> {
        let mut inner = self.inner.lock();
        let job = inner
            .jobs
            .get_mut(order_id)
            .ok_or(QueueError::OrderNotFound)?;

        if job.terminal {
            return Ok(job.clone());
        }

        match result {
            ExecutionResult::Filled => {
                job.status = OrderStatus::Filled;
                job.error = None;
            }
            ExecutionResult::Rejected => {
                job.status = OrderStatus::Rejected;
                job.error = Some(reason.unwrap_or_else(|| "BROKER_REJECTED".to_string()));
            }
        }
        job.terminal = true;
        job.updated_at = epoch_now();
        let snapshot = job.clone();

        match result {
            ExecutionResult::Filled => inner.counters.filled += 1,
            ExecutionResult::Rejected => inner.counters.rejected += 1,
        }
        inner.counters.terminal += 1;
        info!(order_id, status = %snapshot.status, "execution result recorded");

        Ok(snapshot)
    }

    // ── Cancel / modify ─────────────────────────────────────────────────

    pub fn request_cancel(&self, order_id: &str) -> Result<OrderJob, QueueError> {
        let mut inner = self.inner.lock();
        let job = inner
            .jobs
            .get_mut(order_id)
            .ok_or(QueueError::OrderNotFound)?;
        if job.terminal {
            return Err(QueueError::OrderAlreadyTerminal);
        }
        job.status = OrderStatus::CancelPending;
        job.updated_at = epoch_now();
        info!(order_id, "cancel requested");
        Ok(job.clone())
    }

    pub fn request_modify(
        &self,
        order_id: &str,
        qty: i64,
        price: Option<f64>,
    ) -> Result<OrderJob, QueueError> {
        let mut inner = self.inner.lock();
        let job = inner
            .jobs
            .get_mut(order_id)
            .ok_or(QueueError::OrderNotFound)?;
        if job.terminal {
            return Err(QueueError::OrderAlreadyTerminal);
        }
        job.status = OrderStatus::ModifyPending;
        job.request.qty = qty;
        job.request.price = price;
        job.updated_at = epoch_now();
        info!(order_id, qty, ?price, "modify requested");
        Ok(job.clone())
    }

    // ── Reads ───────────────────────────────────────────────────────────

    pub fn get(&self, order_id: &str) -> Option<OrderJob> {
        self.inner.lock().jobs.get(order_id).cloned()
    }

    /// Snapshot of all known job ids (reconciliation iterates this, then
    /// re-reads each job so the lock is never held across broker calls).
    pub fn job_ids(&self) -> Vec<String> {
        self.inner.lock().jobs.keys().cloned().collect()
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn metrics(&self) -> QueueMetrics {
        let inner = self.inner.lock();
        let mut metrics = inner.counters.clone();
        metrics.queue_depth = inner.queue.len();
        metrics
    }

    // ── Reconciliation hook ─────────────────────────────────────────────

    /// Adopt the broker-reported status for a job. Returns the previous
    /// status when a correction was applied, `None` when the job is unknown
    /// or already agrees. Unlike the public API this may overwrite a terminal
    /// status — the broker is the execution authority.
    pub fn adopt_broker_status(
        &self,
        order_id: &str,
        broker_status: OrderStatus,
    ) -> Option<OrderStatus> {
        let mut inner = self.inner.lock();
        let job = inner.jobs.get_mut(order_id)?;
        if job.status == broker_status {
            return None;
        }

        let previous = job.status;
        job.status = broker_status;
        if broker_status.is_terminal() {
            job.terminal = true;
            match broker_status {
                OrderStatus::Filled | OrderStatus::Canceled => job.error = None,
                OrderStatus::Rejected => {
                    if job.error.is_none() {
                        job.error = Some("BROKER_REJECTED".to_string());
                    }
                }
                _ => {}
            }
        }
        job.updated_at = epoch_now();
        Some(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{BrokerError, PlacedOrder};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    fn req(symbol: &str, qty: i64) -> OrderRequest {
        OrderRequest {
            account_id: "12345678-01".into(),
            symbol: symbol.into(),
            side: "BUY".into(),
            qty,
            order_type: "LIMIT".into(),
            price: Some(70_000.0),
            strategy_id: None,
        }
    }

    /// Adapter double driven by a queue of scripted outcomes; defaults to
    /// success once the script is drained.
    struct ScriptedAdapter {
        script: Mutex<VecDeque<Result<PlacedOrder, BrokerError>>>,
    }

    impl ScriptedAdapter {
        fn ok() -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
            }
        }

        fn failing_with(errors: Vec<BrokerError>) -> Self {
            Self {
                script: Mutex::new(errors.into_iter().map(Err).collect()),
            }
        }
    }

    #[async_trait]
    impl OrderAdapter for ScriptedAdapter {
        async fn place_order(&self, _request: &OrderRequest) -> Result<PlacedOrder, BrokerError> {
            match self.script.lock().pop_front() {
                Some(result) => result,
                None => Ok(PlacedOrder {
                    broker_order_id: "KIS-0001".into(),
                    raw: serde_json::json!({"ODNO": "KIS-0001"}),
                }),
            }
        }
    }

    #[test]
    fn idempotent_resubmit_returns_same_acceptance() {
        let queue = OrderQueue::new(3);
        let first = queue.enqueue(req("005930", 1), "key-1").unwrap().accepted;
        let second = queue.enqueue(req("005930", 1), "key-1").unwrap().accepted;

        assert_eq!(first.order_id, second.order_id);
        let metrics = queue.metrics();
        assert_eq!(metrics.accepted, 1);
        assert_eq!(metrics.deduplicated, 1);
        assert_eq!(metrics.queue_depth, 1);
    }

    #[test]
    fn same_key_different_body_conflicts() {
        let queue = OrderQueue::new(3);
        queue.enqueue(req("005930", 1), "key-1").unwrap();
        let err = queue.enqueue(req("005930", 2), "key-1").unwrap_err();
        assert_eq!(err, QueueError::IdempotencyKeyBodyMismatch);
        assert_eq!(queue.metrics().queue_depth, 1);
    }

    #[test]
    fn body_hash_ignores_field_declaration_order() {
        // Canonical form sorts keys: two equal requests always hash equal.
        let a = body_hash(&req("005930", 1));
        let b = body_hash(&req("005930", 1));
        assert_eq!(a, b);
        assert_ne!(a, body_hash(&req("005930", 2)));
    }

    #[tokio::test]
    async fn successful_dispatch_marks_sent() {
        let queue = OrderQueue::new(3);
        let accepted = queue.enqueue(req("005930", 1), "key-1").unwrap().accepted;
        let adapter = ScriptedAdapter::ok();

        let job = queue.process_next(&adapter).await.unwrap();
        assert_eq!(job.order_id, accepted.order_id);
        assert_eq!(job.status, OrderStatus::Sent);
        assert_eq!(job.broker_order_id.as_deref(), Some("KIS-0001"));
        assert_eq!(job.attempts, 1);
        assert_eq!(job.error, None);

        let metrics = queue.metrics();
        assert_eq!(metrics.sent, 1);
        assert_eq!(metrics.processed, 1);
        assert_eq!(metrics.queue_depth, 0);
    }

    #[tokio::test]
    async fn empty_queue_returns_none() {
        let queue = OrderQueue::new(3);
        let adapter = ScriptedAdapter::ok();
        assert!(queue.process_next(&adapter).await.is_none());
        assert_eq!(queue.metrics().processed, 0);
    }

    #[tokio::test]
    async fn retryable_errors_exhaust_into_rejection() {
        let queue = OrderQueue::new(3);
        queue.enqueue(req("005930", 1), "key-1").unwrap();
        let adapter = ScriptedAdapter::failing_with(vec![
            BrokerError::text("RATE_LIMIT"),
            BrokerError::text("RATE_LIMIT"),
            BrokerError::text("RATE_LIMIT"),
        ]);

        let job = queue.process_next(&adapter).await.unwrap();
        assert_eq!(job.status, OrderStatus::New);
        assert_eq!(job.error.as_deref(), Some("RATE_LIMIT"));

        let job = queue.process_next(&adapter).await.unwrap();
        assert_eq!(job.status, OrderStatus::New);

        let job = queue.process_next(&adapter).await.unwrap();
        assert_eq!(job.status, OrderStatus::Rejected);
        assert_eq!(job.error.as_deref(), Some("RETRY_EXHAUSTED"));
        assert!(job.terminal);
        assert_eq!(job.attempts, 3);

        let metrics = queue.metrics();
        assert_eq!(metrics.retried, 2);
        assert_eq!(metrics.retry_exhausted, 1);
        assert_eq!(metrics.rejected, 1);
        assert_eq!(metrics.terminal, 1);
        assert_eq!(metrics.processed, 3);
        assert_eq!(metrics.queue_depth, 0);
    }

    #[tokio::test]
    async fn non_retryable_error_rejects_immediately() {
        let queue = OrderQueue::new(3);
        queue.enqueue(req("005930", 1), "key-1").unwrap();
        let adapter =
            ScriptedAdapter::failing_with(vec![BrokerError::text("INVALID_ORDER: bad qty")]);

        let job = queue.process_next(&adapter).await.unwrap();
        assert_eq!(job.status, OrderStatus::Rejected);
        assert_eq!(job.error.as_deref(), Some("INVALID_ORDER"));
        assert!(job.terminal);
        assert_eq!(queue.metrics().retried, 0);
    }

    #[tokio::test]
    async fn auth_error_is_not_retried() {
        let queue = OrderQueue::new(3);
        queue.enqueue(req("005930", 1), "key-1").unwrap();
        let adapter = ScriptedAdapter::failing_with(vec![BrokerError::text("TOKEN expired")]);

        let job = queue.process_next(&adapter).await.unwrap();
        assert_eq!(job.status, OrderStatus::Rejected);
        assert_eq!(job.error.as_deref(), Some("AUTH"));
    }

    #[tokio::test]
    async fn retry_requeues_at_tail_preserving_fifo() {
        let queue = OrderQueue::new(3);
        let first = queue.enqueue(req("005930", 1), "key-1").unwrap().accepted;
        let second = queue.enqueue(req("000660", 1), "key-2").unwrap().accepted;
        let adapter = ScriptedAdapter::failing_with(vec![BrokerError::text("429")]);

        // First job fails retryable and moves to the tail.
        let job = queue.process_next(&adapter).await.unwrap();
        assert_eq!(job.order_id, first.order_id);
        assert_eq!(job.status, OrderStatus::New);

        // Script drained: the second job dispatches next, then the retry.
        let job = queue.process_next(&adapter).await.unwrap();
        assert_eq!(job.order_id, second.order_id);
        assert_eq!(job.status, OrderStatus::Sent);

        let job = queue.process_next(&adapter).await.unwrap();
        assert_eq!(job.order_id, first.order_id);
        assert_eq!(job.status, OrderStatus::Sent);
    }

    #[test]
    fn mark_execution_result_is_idempotent() {
        let queue = OrderQueue::new(3);
        let accepted = queue.enqueue(req("005930", 1), "key-1").unwrap().accepted;

        let job = queue
            .mark_execution_result(&accepted.order_id, ExecutionResult::Filled, None)
            .unwrap();
        assert_eq!(job.status, OrderStatus::Filled);
        assert!(job.terminal);
        assert_eq!(job.error, None);

        // Second terminal report leaves the first outcome in place.
        let job = queue
            .mark_execution_result(
                &accepted.order_id,
                ExecutionResult::Rejected,
                Some("LATE".into()),
            )
            .unwrap();
        assert_eq!(job.status, OrderStatus::Filled);

        let metrics = queue.metrics();
        assert_eq!(metrics.filled, 1);
        assert_eq!(metrics.rejected, 0);
        assert_eq!(metrics.terminal, 1);
    }

    #[test]
    fn rejected_execution_defaults_reason() {
        let queue = OrderQueue::new(3);
        let accepted = queue.enqueue(req("005930", 1), "key-1").unwrap().accepted;
        let job = queue
            .mark_execution_result(&accepted.order_id, ExecutionResult::Rejected, None)
            .unwrap();
        assert_eq!(job.error.as_deref(), Some("BROKER_REJECTED"));
    }

    #[test]
    fn cancel_and_modify_transitions() {
        let queue = OrderQueue::new(3);
        let accepted = queue.enqueue(req("005930", 10), "key-1").unwrap().accepted;

        let job = queue
            .request_modify(&accepted.order_id, 5, Some(68_000.0))
            .unwrap();
        assert_eq!(job.status, OrderStatus::ModifyPending);
        assert_eq!(job.request.qty, 5);
        assert_eq!(job.request.price, Some(68_000.0));

        let job = queue.request_cancel(&accepted.order_id).unwrap();
        assert_eq!(job.status, OrderStatus::CancelPending);
    }

    #[test]
    fn cancel_unknown_and_terminal_orders_fail() {
        let queue = OrderQueue::new(3);
        assert_eq!(
            queue.request_cancel("ord_missing").unwrap_err(),
            QueueError::OrderNotFound
        );

        let accepted = queue.enqueue(req("005930", 1), "key-1").unwrap().accepted;
        queue
            .mark_execution_result(&accepted.order_id, ExecutionResult::Filled, None)
            .unwrap();
        assert_eq!(
            queue.request_cancel(&accepted.order_id).unwrap_err(),
            QueueError::OrderAlreadyTerminal
        );
        assert_eq!(
            queue
                .request_modify(&accepted.order_id, 1, None)
                .unwrap_err(),
            QueueError::OrderAlreadyTerminal
        );
    }

    #[test]
    fn adopt_broker_status_overrides_and_normalizes_errors() {
        let queue = OrderQueue::new(3);
        let accepted = queue.enqueue(req("005930", 1), "key-1").unwrap().accepted;

        let previous = queue
            .adopt_broker_status(&accepted.order_id, OrderStatus::Filled)
            .unwrap();
        assert_eq!(previous, OrderStatus::New);

        let job = queue.get(&accepted.order_id).unwrap();
        assert_eq!(job.status, OrderStatus::Filled);
        assert!(job.terminal);
        assert_eq!(job.error, None);

        // Agreeing status is a no-op.
        assert!(queue
            .adopt_broker_status(&accepted.order_id, OrderStatus::Filled)
            .is_none());

        // The broker remains authoritative even over a terminal local state.
        let previous = queue
            .adopt_broker_status(&accepted.order_id, OrderStatus::Canceled)
            .unwrap();
        assert_eq!(previous, OrderStatus::Filled);
    }
}
