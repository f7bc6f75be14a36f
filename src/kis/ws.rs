// =============================================================================
// KIS streaming client — subscribe, ingest, reconnect with capped backoff
// =============================================================================
//
// The client subscribes to an ordered list of symbols using an approval key
// issued lazily through the REST client. Parsed ticks flow into the ingest
// worker; connection-state changes flow through the same worker's
// `sync_ws_state` hook so `/metrics/quote` reports a single truth.
//
// Reconnect policy: attempt i sleeps `min(base·2^(i-1), cap)` after a
// transient failure. The `running` flag is observed before every attempt and
// before every sleep; clearing it aborts immediately without sleeping.
// =============================================================================

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::quote::ingest::{QuoteIngest, WsStateUpdate};
use crate::types::epoch_now;
use crate::upstream::ApprovalKeyIssuer;

/// Reconnect budget before the run gives up.
pub const DEFAULT_MAX_RETRIES: u32 = 5;
/// First reconnect delay in seconds.
pub const DEFAULT_BACKOFF_BASE_SEC: f64 = 1.0;
/// Backoff ceiling in seconds.
pub const DEFAULT_BACKOFF_CAP_SEC: f64 = 30.0;

/// Transaction id for realtime domestic execution ticks.
const TR_ID_REALTIME_PRICE: &str = "H0STCNT0";

// ---------------------------------------------------------------------------
// Reconnect loop
// ---------------------------------------------------------------------------

/// Drive `connect_once` with capped exponential backoff.
///
/// Returns `true` when a connection ends cleanly (server-side close), `false`
/// on cancellation or when the retry budget is exhausted. `on_failure` fires
/// once per failed attempt with the attempt number and error text.
pub async fn run_with_reconnect<F, Fut>(
    running: &AtomicBool,
    mut connect_once: F,
    max_retries: u32,
    base_delay_sec: f64,
    cap_sec: f64,
    mut on_failure: impl FnMut(u32, String),
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    for attempt in 1..=max_retries {
        if !running.load(Ordering::Relaxed) {
            return false;
        }

        match connect_once().await {
            Ok(()) => return true,
            Err(err) => {
                warn!(attempt, error = %err, "stream connection failed");
                on_failure(attempt, err.to_string());
            }
        }

        if attempt == max_retries {
            break;
        }
        if !running.load(Ordering::Relaxed) {
            return false;
        }
        let delay = (base_delay_sec * 2f64.powi(attempt as i32 - 1)).min(cap_sec);
        if delay > 0.0 {
            tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct KisWsClient {
    url: String,
    symbols: Vec<String>,
    issuer: Arc<dyn ApprovalKeyIssuer>,
    ingest: Arc<QuoteIngest>,
    running: Arc<AtomicBool>,
    reconnect_count: AtomicU64,
}

impl KisWsClient {
    pub fn new(
        url: impl Into<String>,
        symbols: Vec<String>,
        issuer: Arc<dyn ApprovalKeyIssuer>,
        ingest: Arc<QuoteIngest>,
    ) -> Self {
        Self {
            url: url.into(),
            symbols,
            issuer,
            ingest,
            running: Arc::new(AtomicBool::new(false)),
            reconnect_count: AtomicU64::new(0),
        }
    }

    /// Cooperative cancellation: the reconnect loop observes this flag before
    /// every attempt and sleep. An in-flight socket read finishes its current
    /// frame before the loop notices.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Connect-and-ingest until cancelled or the retry budget runs out.
    pub async fn run(self: Arc<Self>) -> bool {
        self.running.store(true, Ordering::Relaxed);
        let client = self.clone();
        let ingest = self.ingest.clone();

        let result = run_with_reconnect(
            &self.running,
            move || {
                let client = client.clone();
                async move { client.connect_once().await }
            },
            DEFAULT_MAX_RETRIES,
            DEFAULT_BACKOFF_BASE_SEC,
            DEFAULT_BACKOFF_CAP_SEC,
            |_, error| {
                let count = self.reconnect_count.fetch_add(1, Ordering::Relaxed) + 1;
                ingest.sync_ws_state(WsStateUpdate {
                    connected: Some(false),
                    reconnect_count: Some(count),
                    last_error: Some(Some(error)),
                    heartbeat_ts: None,
                });
            },
        )
        .await;

        self.ingest.sync_ws_state(WsStateUpdate {
            connected: Some(false),
            ..Default::default()
        });
        result
    }

    /// One full connection lifecycle: subscribe, then pump frames into the
    /// ingest worker until the stream ends.
    async fn connect_once(&self) -> Result<()> {
        let approval_key = self
            .issuer
            .issue_approval_key()
            .await
            .map_err(|e| anyhow::anyhow!("approval key issuance failed: {e}"))?;

        info!(url = %self.url, symbols = ?self.symbols, "connecting to KIS stream");
        let (stream, _response) = connect_async(&self.url)
            .await
            .context("failed to connect to KIS WebSocket")?;
        let (mut write, mut read) = stream.split();

        for symbol in &self.symbols {
            let frame = subscribe_frame(&approval_key, symbol);
            write
                .send(Message::Text(frame))
                .await
                .with_context(|| format!("failed to subscribe {symbol}"))?;
        }

        self.ingest.sync_ws_state(WsStateUpdate {
            connected: Some(true),
            last_error: Some(None),
            heartbeat_ts: Some(epoch_now()),
            ..Default::default()
        });
        info!(count = self.symbols.len(), "KIS stream subscribed");

        while let Some(message) = read.next().await {
            if !self.running.load(Ordering::Relaxed) {
                return Ok(());
            }

            match message {
                Ok(Message::Text(text)) => {
                    // Any inbound frame counts as provider liveness.
                    self.ingest.sync_ws_state(WsStateUpdate {
                        heartbeat_ts: Some(epoch_now()),
                        ..Default::default()
                    });
                    match self.ingest.on_payload(&text) {
                        Ok(snapshot) => {
                            debug!(symbol = %snapshot.symbol, price = snapshot.price, "tick ingested");
                        }
                        Err(err) if err.is_control_frame() => {
                            debug!(frame = %text, "control frame skipped");
                        }
                        Err(err) => {
                            warn!(error = %err, "unparseable stream frame skipped");
                        }
                    }
                }
                Ok(Message::Ping(data)) => {
                    write
                        .send(Message::Pong(data))
                        .await
                        .context("failed to answer ping")?;
                }
                Ok(Message::Close(_)) => {
                    info!("KIS stream closed by server");
                    return Ok(());
                }
                Ok(_) => {}
                Err(err) => {
                    return Err(err).context("KIS stream read error");
                }
            }
        }

        info!("KIS stream ended");
        Ok(())
    }
}

/// KIS realtime subscribe frame for one symbol.
fn subscribe_frame(approval_key: &str, symbol: &str) -> String {
    json!({
        "header": {
            "approval_key": approval_key,
            "custtype": "P",
            "tr_type": "1",
            "content-type": "utf-8",
        },
        "body": {
            "input": {
                "tr_id": TR_ID_REALTIME_PRICE,
                "tr_key": symbol,
            }
        }
    })
    .to_string()
}
