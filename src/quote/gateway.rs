// =============================================================================
// Quote Gateway — WS-first read path with REST fallback and cooldown
// =============================================================================
//
// Source selection for a single symbol:
//   1. Active cooldown: serve whatever the cache has (stale allowed), or fail
//      with REST_RATE_LIMIT_COOLDOWN.
//   2. Market open + fresh cache row: serve the WS snapshot.
//   3. Otherwise pull via REST. A 429 opens a per-symbol cooldown window;
//      other failures propagate.
//
// The batch path deduplicates, fills from cache where possible, then works
// the remainder through REST with bounded retries, exponential backoff and a
// small inter-symbol jitter so a burst of fallbacks does not hammer the
// upstream.
//
// Market-open checks and the clock are injected so the selection logic is
// fully deterministic under test.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::KisConfig;
use crate::error::QuoteError;
use crate::market_hours;
use crate::quote::cache::QuoteCache;
use crate::types::{epoch_now, QuoteSnapshot};
use crate::upstream::QuoteRest;

// ---------------------------------------------------------------------------
// Tuning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GatewayTuning {
    pub stale_after_sec: i64,
    pub rest_cooldown_sec: i64,
    pub rest_retry_attempts: u32,
    pub rest_retry_backoff_base_sec: f64,
    pub symbol_delay_min_sec: f64,
    pub symbol_delay_max_sec: f64,
}

impl Default for GatewayTuning {
    fn default() -> Self {
        Self {
            stale_after_sec: 5,
            rest_cooldown_sec: 3,
            rest_retry_attempts: 3,
            rest_retry_backoff_base_sec: 0.5,
            symbol_delay_min_sec: 0.05,
            symbol_delay_max_sec: 0.2,
        }
    }
}

impl GatewayTuning {
    pub fn from_config(config: &KisConfig) -> Self {
        Self {
            stale_after_sec: config.stale_after_sec,
            rest_cooldown_sec: config.rest_cooldown_sec,
            rest_retry_attempts: config.rest_retry_attempts,
            rest_retry_backoff_base_sec: config.rest_retry_backoff_base_sec,
            symbol_delay_min_sec: config.symbol_delay_min_sec,
            symbol_delay_max_sec: config.symbol_delay_max_sec,
        }
    }
}

// ---------------------------------------------------------------------------
// Batch result / metrics payloads
// ---------------------------------------------------------------------------

/// Per-batch summary returned next to the quote list.
#[derive(Debug, Clone, Serialize)]
pub struct BatchMeta {
    pub missing_count: usize,
    /// Symbols with no snapshot at all, preserving input order.
    pub failed_symbols: Vec<String>,
}

/// Gateway counters served by `/metrics/quote`.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayMetrics {
    pub rest_fallbacks: u64,
    pub fallback_triggered: u64,
    pub rest_filled_count: u64,
    pub ws_count: u64,
    pub batch_target_count: u64,
    pub batch_final_count: u64,
    pub batch_market_open: bool,
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

type MarketOpenFn = Box<dyn Fn() -> bool + Send + Sync>;
type ClockFn = Box<dyn Fn() -> i64 + Send + Sync>;

pub struct QuoteGateway {
    cache: Arc<QuoteCache>,
    rest: Arc<dyn QuoteRest>,
    tuning: GatewayTuning,
    market_open: MarketOpenFn,
    clock: ClockFn,
    /// symbol → cooldown expiry (epoch s). Entries are pruned on read.
    cooldowns: Mutex<HashMap<String, i64>>,

    rest_fallbacks: AtomicU64,
    fallback_triggered: AtomicU64,
    rest_filled_count: AtomicU64,
    ws_count: AtomicU64,
    batch_target_count: AtomicU64,
    batch_final_count: AtomicU64,
    batch_market_open: AtomicBool,
}

impl QuoteGateway {
    pub fn new(cache: Arc<QuoteCache>, rest: Arc<dyn QuoteRest>, tuning: GatewayTuning) -> Self {
        Self {
            cache,
            rest,
            tuning,
            market_open: Box::new(market_hours::is_market_open),
            clock: Box::new(epoch_now),
            cooldowns: Mutex::new(HashMap::new()),
            rest_fallbacks: AtomicU64::new(0),
            fallback_triggered: AtomicU64::new(0),
            rest_filled_count: AtomicU64::new(0),
            ws_count: AtomicU64::new(0),
            batch_target_count: AtomicU64::new(0),
            batch_final_count: AtomicU64::new(0),
            batch_market_open: AtomicBool::new(false),
        }
    }

    /// Override the market-open check (tests, non-KRX deployments).
    pub fn with_market_open(mut self, market_open: MarketOpenFn) -> Self {
        self.market_open = market_open;
        self
    }

    /// Override the clock (tests).
    pub fn with_clock(mut self, clock: ClockFn) -> Self {
        self.clock = clock;
        self
    }

    // ── Cooldown bookkeeping ────────────────────────────────────────────

    fn prune_cooldowns(&self, now: i64) {
        self.cooldowns.lock().retain(|_, expires| *expires > now);
    }

    fn cooldown_active(&self, symbol: &str, now: i64) -> bool {
        self.cooldowns
            .lock()
            .get(symbol)
            .map(|expires| *expires > now)
            .unwrap_or(false)
    }

    fn set_cooldown(&self, symbol: &str, now: i64) {
        let expires = now + self.tuning.rest_cooldown_sec;
        self.cooldowns.lock().insert(symbol.to_string(), expires);
        warn!(symbol, expires_at = expires, "REST rate limit — cooldown opened");
    }

    fn cached_refreshed(&self, symbol: &str, now: i64) -> Option<QuoteSnapshot> {
        self.cache.get(symbol).map(|mut snap| {
            snap.refresh(now, self.tuning.stale_after_sec);
            snap
        })
    }

    // ── Single-symbol read ──────────────────────────────────────────────

    pub async fn get_quote(&self, symbol: &str) -> Result<QuoteSnapshot, QuoteError> {
        let now = (self.clock)();
        self.prune_cooldowns(now);

        if self.cooldown_active(symbol, now) {
            return match self.cached_refreshed(symbol, now) {
                Some(snap) => Ok(snap),
                None => Err(QuoteError::RestRateLimitCooldown),
            };
        }

        if (self.market_open)() {
            if let Some(snap) = self.cache.get(symbol) {
                if now - snap.ts <= self.tuning.stale_after_sec {
                    let mut snap = snap;
                    snap.refresh(now, self.tuning.stale_after_sec);
                    self.ws_count.fetch_add(1, Ordering::Relaxed);
                    return Ok(snap);
                }
            }
        }

        self.rest_fallbacks.fetch_add(1, Ordering::Relaxed);
        match self.rest.get_quote(symbol).await {
            Ok(snap) => Ok(snap),
            Err(err) if err.is_rate_limited() => {
                let now = (self.clock)();
                self.set_cooldown(symbol, now);
                match self.cached_refreshed(symbol, now) {
                    Some(snap) => Ok(snap),
                    None => Err(QuoteError::RestRateLimitCooldown),
                }
            }
            Err(err) => Err(QuoteError::Upstream(err)),
        }
    }

    // ── Batch read ──────────────────────────────────────────────────────

    pub async fn get_quotes(&self, symbols: &[String]) -> (Vec<QuoteSnapshot>, BatchMeta) {
        // Deduplicate, preserving first-occurrence order.
        let mut seen = HashSet::new();
        let unique: Vec<String> = symbols
            .iter()
            .filter(|s| seen.insert(s.as_str()))
            .cloned()
            .collect();

        let now = (self.clock)();
        self.prune_cooldowns(now);
        let market_open = (self.market_open)();
        self.batch_market_open.store(market_open, Ordering::Relaxed);
        self.batch_target_count
            .store(unique.len() as u64, Ordering::Relaxed);

        let mut results: HashMap<String, QuoteSnapshot> = HashMap::new();
        let mut rest_queue: Vec<String> = Vec::new();

        for symbol in &unique {
            if market_open {
                if let Some(snap) = self.cache.get(symbol) {
                    if now - snap.ts <= self.tuning.stale_after_sec {
                        let mut snap = snap;
                        snap.refresh(now, self.tuning.stale_after_sec);
                        results.insert(symbol.clone(), snap);
                        self.ws_count.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                }
            }
            rest_queue.push(symbol.clone());
        }

        if !market_open || !rest_queue.is_empty() {
            self.fallback_triggered.fetch_add(1, Ordering::Relaxed);
        }

        for (idx, symbol) in rest_queue.iter().enumerate() {
            if idx > 0 {
                self.sleep_jitter().await;
            }

            let now = (self.clock)();
            if self.cooldown_active(symbol, now) {
                // Substitute whatever the cache has; otherwise the symbol
                // stays missing for this batch.
                if let Some(snap) = self.cached_refreshed(symbol, now) {
                    results.insert(symbol.clone(), snap);
                }
                continue;
            }

            if let Some(snap) = self.fetch_rest_with_retry(symbol).await {
                results.insert(symbol.clone(), snap);
            }
        }

        let quotes: Vec<QuoteSnapshot> = unique
            .iter()
            .filter_map(|s| results.get(s).cloned())
            .collect();
        let failed_symbols: Vec<String> = unique
            .iter()
            .filter(|s| !results.contains_key(*s))
            .cloned()
            .collect();

        self.batch_final_count
            .store(quotes.len() as u64, Ordering::Relaxed);

        let meta = BatchMeta {
            missing_count: failed_symbols.len(),
            failed_symbols,
        };
        debug!(
            target = unique.len(),
            filled = quotes.len(),
            missing = meta.missing_count,
            "batch quote read complete"
        );
        (quotes, meta)
    }

    /// REST fill with up to `rest_retry_attempts` tries. A 429 short-circuits
    /// into a cooldown (stale cache substitution if available); other errors
    /// back off `base·2^(i-1)` seconds between attempts.
    async fn fetch_rest_with_retry(&self, symbol: &str) -> Option<QuoteSnapshot> {
        let attempts = self.tuning.rest_retry_attempts.max(1);
        for attempt in 1..=attempts {
            self.rest_fallbacks.fetch_add(1, Ordering::Relaxed);
            match self.rest.get_quote(symbol).await {
                Ok(snap) => {
                    self.rest_filled_count.fetch_add(1, Ordering::Relaxed);
                    return Some(snap);
                }
                Err(err) if err.is_rate_limited() => {
                    let now = (self.clock)();
                    self.set_cooldown(symbol, now);
                    return self.cached_refreshed(symbol, now);
                }
                Err(err) => {
                    warn!(symbol, attempt, error = %err, "REST quote fetch failed");
                    if attempt < attempts {
                        let backoff = self.tuning.rest_retry_backoff_base_sec
                            * 2f64.powi(attempt as i32 - 1);
                        sleep_secs(backoff).await;
                    }
                }
            }
        }
        None
    }

    async fn sleep_jitter(&self) {
        let (min, max) = (
            self.tuning.symbol_delay_min_sec,
            self.tuning.symbol_delay_max_sec,
        );
        let delay = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        sleep_secs(delay).await;
    }

    pub fn metrics(&self) -> GatewayMetrics {
        GatewayMetrics {
            rest_fallbacks: self.rest_fallbacks.load(Ordering::Relaxed),
            fallback_triggered: self.fallback_triggered.load(Ordering::Relaxed),
            rest_filled_count: self.rest_filled_count.load(Ordering::Relaxed),
            ws_count: self.ws_count.load(Ordering::Relaxed),
            batch_target_count: self.batch_target_count.load(Ordering::Relaxed),
            batch_final_count: self.batch_final_count.load(Ordering::Relaxed),
            batch_market_open: self.batch_market_open.load(Ordering::Relaxed),
        }
    }
}

async fn sleep_secs(secs: f64) {
    if secs > 0.0 {
        tokio::time::sleep(std::time::Duration::from_secs_f64(secs)).await;
    }
}
