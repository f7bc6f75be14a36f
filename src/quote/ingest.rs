// =============================================================================
// Quote Ingest — streaming frames into the cache, WS health bookkeeping
// =============================================================================
//
// The only writer of the quote cache. Each accepted frame becomes a HEALTHY
// snapshot with zero freshness; `refresh_freshness` re-ages every row against
// the supplied reference time.
//
// Connection flag and heartbeat freshness are independent signals: a socket
// can be connected while the provider has gone quiet, and both are reported.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::quote::cache::QuoteCache;
use crate::quote::parser::{self, ParseError};
use crate::types::{epoch_now, QuoteSnapshot};

// ---------------------------------------------------------------------------
// WS state sync
// ---------------------------------------------------------------------------

/// Partial update pushed by the streaming client; `None` fields are left
/// untouched.
#[derive(Debug, Default)]
pub struct WsStateUpdate {
    pub connected: Option<bool>,
    pub reconnect_count: Option<u64>,
    pub last_error: Option<Option<String>>,
    pub heartbeat_ts: Option<i64>,
}

#[derive(Debug, Default)]
struct WsState {
    connected: bool,
    reconnect_count: u64,
    last_error: Option<String>,
    last_ws_message_ts: Option<i64>,
    last_ws_heartbeat_ts: Option<i64>,
}

// ---------------------------------------------------------------------------
// Metrics payload
// ---------------------------------------------------------------------------

/// Ingest health snapshot served by `/metrics/quote`.
#[derive(Debug, Clone, Serialize)]
pub struct IngestMetrics {
    pub cached_symbols: usize,
    pub ws_messages: u64,
    pub upserts: u64,
    pub stale_symbols: usize,
    pub ws_connected: bool,
    pub ws_heartbeat_fresh: bool,
    pub last_ws_message_ts: Option<i64>,
    pub last_ws_heartbeat_ts: Option<i64>,
    pub ws_last_error: Option<String>,
    pub ws_reconnect_count: u64,
}

// ---------------------------------------------------------------------------
// Ingest worker
// ---------------------------------------------------------------------------

pub struct QuoteIngest {
    cache: Arc<QuoteCache>,
    stale_after_sec: i64,
    heartbeat_timeout_sec: i64,
    ws_messages: AtomicU64,
    upserts: AtomicU64,
    ws_state: RwLock<WsState>,
}

impl QuoteIngest {
    pub fn new(cache: Arc<QuoteCache>, stale_after_sec: i64, heartbeat_timeout_sec: i64) -> Self {
        Self {
            cache,
            stale_after_sec,
            heartbeat_timeout_sec,
            ws_messages: AtomicU64::new(0),
            upserts: AtomicU64::new(0),
            ws_state: RwLock::new(WsState::default()),
        }
    }

    pub fn cache(&self) -> &Arc<QuoteCache> {
        &self.cache
    }

    /// Normalize one textual streaming frame and upsert it. Control frames
    /// surface as skippable errors for the caller to log at debug level.
    pub fn on_payload(&self, payload: &str) -> Result<QuoteSnapshot, ParseError> {
        let now = epoch_now();
        let snapshot = parser::parse_message(payload, now)?;
        self.on_snapshot(snapshot.clone(), now);
        Ok(snapshot)
    }

    /// Upsert an already-parsed snapshot.
    pub fn on_snapshot(&self, snapshot: QuoteSnapshot, now: i64) {
        let symbol_ts = snapshot.ts;
        self.cache.upsert(snapshot);
        self.ws_messages.fetch_add(1, Ordering::Relaxed);
        self.upserts.fetch_add(1, Ordering::Relaxed);

        let mut ws = self.ws_state.write();
        ws.connected = true;
        ws.last_ws_message_ts = Some(symbol_ts);
        ws.last_ws_heartbeat_ts = Some(now);
    }

    /// Hook for the streaming client to publish connection-state changes.
    pub fn sync_ws_state(&self, update: WsStateUpdate) {
        let mut ws = self.ws_state.write();
        if let Some(connected) = update.connected {
            ws.connected = connected;
        }
        if let Some(count) = update.reconnect_count {
            ws.reconnect_count = count;
        }
        if let Some(error) = update.last_error {
            ws.last_error = error;
        }
        if let Some(ts) = update.heartbeat_ts {
            ws.last_ws_heartbeat_ts = Some(ts);
        }
        debug!(
            connected = ws.connected,
            reconnects = ws.reconnect_count,
            "ws state synced"
        );
    }

    /// Re-age every cached row against `now`.
    pub fn refresh_freshness(&self, now: i64) -> usize {
        self.cache.refresh_all(now, self.stale_after_sec)
    }

    /// Refresh freshness, then emit the full health snapshot.
    pub fn metrics(&self, now: i64) -> IngestMetrics {
        let stale_symbols = self.refresh_freshness(now);
        let ws = self.ws_state.read();

        let ws_heartbeat_fresh = ws
            .last_ws_heartbeat_ts
            .map(|ts| now - ts <= self.heartbeat_timeout_sec)
            .unwrap_or(false);

        IngestMetrics {
            cached_symbols: self.cache.len(),
            ws_messages: self.ws_messages.load(Ordering::Relaxed),
            upserts: self.upserts.load(Ordering::Relaxed),
            stale_symbols,
            ws_connected: ws.connected,
            ws_heartbeat_fresh,
            last_ws_message_ts: ws.last_ws_message_ts,
            last_ws_heartbeat_ts: ws.last_ws_heartbeat_ts,
            ws_last_error: ws.last_error.clone(),
            ws_reconnect_count: ws.reconnect_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{QuoteSource, QuoteState};

    fn ingest() -> QuoteIngest {
        QuoteIngest::new(Arc::new(QuoteCache::new()), 5, 10)
    }

    fn snap(symbol: &str, ts: i64) -> QuoteSnapshot {
        QuoteSnapshot {
            symbol: symbol.to_string(),
            price: 100.0,
            change_pct: 0.0,
            turnover: 0.0,
            source: QuoteSource::KisWs,
            ts,
            freshness_sec: 0.0,
            state: QuoteState::Healthy,
        }
    }

    #[test]
    fn payload_upserts_and_counts() {
        let ingest = ingest();
        let result = ingest
            .on_payload(r#"{"symbol": "005930", "price": "70000"}"#)
            .unwrap();
        assert_eq!(result.symbol, "005930");

        let now = epoch_now();
        let metrics = ingest.metrics(now);
        assert_eq!(metrics.cached_symbols, 1);
        assert_eq!(metrics.ws_messages, 1);
        assert_eq!(metrics.upserts, 1);
        assert!(metrics.ws_connected);
        assert!(metrics.ws_heartbeat_fresh);
        assert_eq!(metrics.last_ws_message_ts, Some(result.ts));
    }

    #[test]
    fn control_frame_does_not_touch_cache() {
        let ingest = ingest();
        let err = ingest
            .on_payload(r#"{"header": {"tr_id": "PINGPONG"}}"#)
            .unwrap_err();
        assert!(err.is_control_frame());
        assert!(ingest.cache().is_empty());
        assert_eq!(ingest.metrics(epoch_now()).ws_messages, 0);
    }

    #[test]
    fn freshness_law_holds_after_refresh() {
        let ingest = ingest();
        let now = 1_000;
        ingest.on_snapshot(snap("A", now - 2), now); // fresh
        ingest.on_snapshot(snap("B", now - 6), now); // stale at stale_after=5
        ingest.on_snapshot(snap("C", now - 20), now); // stale

        let metrics = ingest.metrics(now);
        assert_eq!(metrics.stale_symbols, 2);
        assert_eq!(
            ingest.cache().get("A").unwrap().state,
            QuoteState::Healthy
        );
        assert_eq!(ingest.cache().get("B").unwrap().state, QuoteState::Stale);
    }

    #[test]
    fn heartbeat_staleness_is_independent_of_connected_flag() {
        let ingest = ingest();
        let now = 10_000;
        ingest.sync_ws_state(WsStateUpdate {
            connected: Some(true),
            heartbeat_ts: Some(now - 30),
            ..Default::default()
        });

        let metrics = ingest.metrics(now);
        assert!(metrics.ws_connected);
        assert!(!metrics.ws_heartbeat_fresh);
    }

    #[test]
    fn sync_updates_error_and_reconnects() {
        let ingest = ingest();
        ingest.sync_ws_state(WsStateUpdate {
            connected: Some(false),
            reconnect_count: Some(3),
            last_error: Some(Some("connection reset".into())),
            heartbeat_ts: None,
        });

        let metrics = ingest.metrics(epoch_now());
        assert!(!metrics.ws_connected);
        assert_eq!(metrics.ws_reconnect_count, 3);
        assert_eq!(metrics.ws_last_error.as_deref(), Some("connection reset"));
        // No heartbeat has ever been recorded.
        assert!(!metrics.ws_heartbeat_fresh);
        assert_eq!(metrics.last_ws_heartbeat_ts, None);
    }
}
