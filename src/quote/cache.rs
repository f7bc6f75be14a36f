// =============================================================================
// Quote Cache — latest snapshot per symbol
// =============================================================================
//
// Single-writer discipline: only the ingest worker mutates rows; readers get
// cloned snapshots so a concurrent freshness sweep can never expose torn
// fields. No eviction — the symbol set is bounded by the subscription list.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::{epoch_now, QuoteSnapshot, QuoteSource, QuoteState};

pub struct QuoteCache {
    rows: RwLock<HashMap<String, QuoteSnapshot>>,
}

impl QuoteCache {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
        }
    }

    pub fn upsert(&self, snapshot: QuoteSnapshot) {
        self.rows.write().insert(snapshot.symbol.clone(), snapshot);
    }

    pub fn get(&self, symbol: &str) -> Option<QuoteSnapshot> {
        self.rows.read().get(symbol).cloned()
    }

    /// Rows for the requested symbols, preserving input order and skipping
    /// symbols with no cached snapshot.
    pub fn list_many(&self, symbols: &[String]) -> Vec<QuoteSnapshot> {
        let rows = self.rows.read();
        symbols
            .iter()
            .filter_map(|s| rows.get(s).cloned())
            .collect()
    }

    pub fn list_all(&self) -> Vec<QuoteSnapshot> {
        self.rows.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Recompute freshness for every row against `now`; returns the number of
    /// rows now classified STALE.
    pub fn refresh_all(&self, now: i64, stale_after_sec: i64) -> usize {
        let mut rows = self.rows.write();
        let mut stale = 0;
        for row in rows.values_mut() {
            row.refresh(now, stale_after_sec);
            if row.state == QuoteState::Stale {
                stale += 1;
            }
        }
        stale
    }

    /// Install a synthetic snapshot for `symbol` (mock environment and tests).
    pub fn seed_demo_quote(&self, symbol: &str) {
        let now = epoch_now();
        self.upsert(QuoteSnapshot {
            symbol: symbol.to_string(),
            price: 70_000.0,
            change_pct: 0.0,
            turnover: 0.0,
            source: QuoteSource::Demo,
            ts: now,
            freshness_sec: 0.0,
            state: QuoteState::Healthy,
        });
    }
}

impl Default for QuoteCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn upsert_replaces_existing_row() {
        let cache = QuoteCache::new();
        cache.upsert(snap("005930", 100));
        let mut updated = snap("005930", 200);
        updated.price = 101.0;
        cache.upsert(updated);

        assert_eq!(cache.len(), 1);
        let row = cache.get("005930").unwrap();
        assert_eq!(row.ts, 200);
        assert_eq!(row.price, 101.0);
    }

    #[test]
    fn list_many_preserves_order_and_skips_missing() {
        let cache = QuoteCache::new();
        cache.upsert(snap("B", 1));
        cache.upsert(snap("A", 1));

        let rows = cache.list_many(&["A".into(), "X".into(), "B".into()]);
        let symbols: Vec<&str> = rows.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["A", "B"]);
    }

    #[test]
    fn refresh_all_counts_stale_rows() {
        let cache = QuoteCache::new();
        cache.upsert(snap("A", 100));
        cache.upsert(snap("B", 94));

        // now=105, stale_after=5: A is 5s old (healthy), B is 11s old (stale).
        let stale = cache.refresh_all(105, 5);
        assert_eq!(stale, 1);
        assert_eq!(cache.get("A").unwrap().state, QuoteState::Healthy);
        assert_eq!(cache.get("B").unwrap().state, QuoteState::Stale);
    }

    #[test]
    fn seed_demo_quote_installs_demo_source() {
        let cache = QuoteCache::new();
        cache.seed_demo_quote("005930");
        let row = cache.get("005930").unwrap();
        assert_eq!(row.source, QuoteSource::Demo);
        assert_eq!(row.price, 70_000.0);
    }
}
