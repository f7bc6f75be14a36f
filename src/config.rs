// =============================================================================
// Gateway configuration — resolved from the environment at startup
// =============================================================================
//
// Startup is lenient: missing required keys do not abort the process, they are
// reported through `missing_required()` and block trading via the
// live-readiness probe instead. Read paths keep working against the mock
// upstream so operators can inspect the gateway while fixing the env.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::info;

/// Required environment keys, in the order they are reported when missing.
pub const REQUIRED_ENV: [&str; 4] = [
    "KIS_APP_KEY",
    "KIS_APP_SECRET",
    "KIS_ACCOUNT_NO",
    "KIS_ENV",
];

const WS_URL_MOCK: &str = "ws://ops.koreainvestment.com:31000";
const WS_URL_LIVE: &str = "ws://ops.koreainvestment.com:21000";
const REST_URL_MOCK: &str = "https://openapivts.koreainvestment.com:29443";
const REST_URL_LIVE: &str = "https://openapi.koreainvestment.com:9443";

/// Which KIS environment the gateway talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KisEnv {
    Mock,
    Live,
}

impl KisEnv {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "mock" => Some(Self::Mock),
            "live" => Some(Self::Live),
            _ => None,
        }
    }
}

impl std::fmt::Display for KisEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mock => write!(f, "mock"),
            Self::Live => write!(f, "live"),
        }
    }
}

/// Full gateway configuration.
#[derive(Debug, Clone)]
pub struct KisConfig {
    // ── Credentials / upstream selection ────────────────────────────────
    pub app_key: String,
    pub app_secret: String,
    pub account_no: String,
    pub env: KisEnv,
    /// `KIS_ENV` was present and parseable. Tracked separately because the
    /// field above always holds a usable value (mock by default).
    pub env_configured: bool,

    // ── Streaming ───────────────────────────────────────────────────────
    pub ws_symbols: Vec<String>,
    pub ws_url_mock: String,
    pub ws_url_live: String,

    // ── HTTP surface ────────────────────────────────────────────────────
    pub bind_addr: String,

    // ── Quote read path ─────────────────────────────────────────────────
    pub stale_after_sec: i64,
    pub heartbeat_timeout_sec: i64,
    pub rest_cooldown_sec: i64,
    pub rest_retry_attempts: u32,
    pub rest_retry_backoff_base_sec: f64,
    pub symbol_delay_min_sec: f64,
    pub symbol_delay_max_sec: f64,

    // ── Risk / orders ───────────────────────────────────────────────────
    pub daily_order_limit: u32,
    pub max_order_qty: i64,
    pub buy_notional_cap: f64,
    pub default_price: f64,
    pub order_max_attempts: u32,

    // ── Reconciliation ──────────────────────────────────────────────────
    pub reconcile_interval_sec: f64,
    pub journal_path: Option<PathBuf>,
}

impl Default for KisConfig {
    fn default() -> Self {
        Self {
            app_key: String::new(),
            app_secret: String::new(),
            account_no: String::new(),
            env: KisEnv::Mock,
            env_configured: false,

            ws_symbols: vec!["005930".to_string()],
            ws_url_mock: WS_URL_MOCK.to_string(),
            ws_url_live: WS_URL_LIVE.to_string(),

            bind_addr: "0.0.0.0:8000".to_string(),

            stale_after_sec: 5,
            heartbeat_timeout_sec: 10,
            rest_cooldown_sec: 3,
            rest_retry_attempts: 3,
            rest_retry_backoff_base_sec: 0.5,
            symbol_delay_min_sec: 0.05,
            symbol_delay_max_sec: 0.2,

            daily_order_limit: 100,
            max_order_qty: 1000,
            buy_notional_cap: 10_000_000.0,
            default_price: 70_000.0,
            order_max_attempts: 3,

            reconcile_interval_sec: 5.0,
            journal_path: Some(PathBuf::from("data/reconciliation_events.jsonl")),
        }
    }
}

impl KisConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Self {
        let vars: HashMap<String, String> = std::env::vars().collect();
        let config = Self::from_lookup(|key| vars.get(key).cloned());
        info!(
            env = %config.env,
            symbols = ?config.ws_symbols,
            journal = ?config.journal_path,
            "gateway configuration resolved"
        );
        config
    }

    /// Env resolution against an injected lookup (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty("KIS_APP_KEY") {
            config.app_key = v;
        }
        if let Some(v) = non_empty("KIS_APP_SECRET") {
            config.app_secret = v;
        }
        if let Some(v) = non_empty("KIS_ACCOUNT_NO") {
            config.account_no = v;
        }
        if let Some(env) = non_empty("KIS_ENV").and_then(|v| KisEnv::parse(&v)) {
            config.env = env;
            config.env_configured = true;
        }

        if let Some(raw) = non_empty("KIS_WS_SYMBOLS") {
            let symbols: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !symbols.is_empty() {
                config.ws_symbols = symbols;
            }
        }
        if let Some(v) = non_empty("KIS_WS_URL_MOCK") {
            config.ws_url_mock = v;
        }
        if let Some(v) = non_empty("KIS_WS_URL_LIVE") {
            config.ws_url_live = v;
        }
        if let Some(v) = non_empty("KIS_BIND_ADDR") {
            config.bind_addr = v;
        }
        if let Some(v) = non_empty("KIS_RECONCILE_JOURNAL") {
            config.journal_path = Some(PathBuf::from(v));
        }
        if let Some(limit) = non_empty("KIS_DAILY_ORDER_LIMIT").and_then(|v| v.parse().ok()) {
            config.daily_order_limit = limit;
        }
        if let Some(qty) = non_empty("KIS_MAX_ORDER_QTY").and_then(|v| v.parse().ok()) {
            config.max_order_qty = qty;
        }

        config
    }

    /// Names of required keys that are unset or empty.
    pub fn missing_required(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if self.app_key.is_empty() {
            missing.push("KIS_APP_KEY".to_string());
        }
        if self.app_secret.is_empty() {
            missing.push("KIS_APP_SECRET".to_string());
        }
        if self.account_no.is_empty() {
            missing.push("KIS_ACCOUNT_NO".to_string());
        }
        if !self.env_configured {
            missing.push("KIS_ENV".to_string());
        }
        missing
    }

    pub fn rest_base_url(&self) -> &'static str {
        match self.env {
            KisEnv::Mock => REST_URL_MOCK,
            KisEnv::Live => REST_URL_LIVE,
        }
    }

    pub fn ws_url(&self) -> &str {
        match self.env {
            KisEnv::Mock => &self.ws_url_mock,
            KisEnv::Live => &self.ws_url_live,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn defaults_apply_when_env_is_empty() {
        let cfg = KisConfig::from_lookup(|_| None);
        assert_eq!(cfg.ws_symbols, vec!["005930"]);
        assert_eq!(cfg.env, KisEnv::Mock);
        assert_eq!(cfg.stale_after_sec, 5);
        assert_eq!(cfg.rest_cooldown_sec, 3);
        assert_eq!(
            cfg.missing_required(),
            vec!["KIS_APP_KEY", "KIS_APP_SECRET", "KIS_ACCOUNT_NO", "KIS_ENV"]
        );
    }

    #[test]
    fn full_env_reports_nothing_missing() {
        let pairs = [
            ("KIS_APP_KEY", "key"),
            ("KIS_APP_SECRET", "secret"),
            ("KIS_ACCOUNT_NO", "12345678-01"),
            ("KIS_ENV", "live"),
        ];
        let cfg = KisConfig::from_lookup(lookup_from(&pairs));
        assert!(cfg.missing_required().is_empty());
        assert_eq!(cfg.env, KisEnv::Live);
        assert_eq!(cfg.rest_base_url(), "https://openapi.koreainvestment.com:9443");
    }

    #[test]
    fn blank_values_count_as_missing() {
        let pairs = [("KIS_APP_KEY", "  "), ("KIS_ENV", "staging")];
        let cfg = KisConfig::from_lookup(lookup_from(&pairs));
        // Invalid KIS_ENV keeps the mock default and stays reported.
        assert_eq!(cfg.env, KisEnv::Mock);
        assert!(cfg
            .missing_required()
            .iter()
            .any(|k| k == "KIS_APP_KEY"));
        assert!(cfg.missing_required().iter().any(|k| k == "KIS_ENV"));
    }

    #[test]
    fn ws_symbols_parse_and_trim() {
        let pairs = [("KIS_WS_SYMBOLS", " 005930 , 000660 ,, ")];
        let cfg = KisConfig::from_lookup(lookup_from(&pairs));
        assert_eq!(cfg.ws_symbols, vec!["005930", "000660"]);
    }

    #[test]
    fn ws_url_override_per_env() {
        let pairs = [("KIS_ENV", "mock"), ("KIS_WS_URL_MOCK", "ws://localhost:9")];
        let cfg = KisConfig::from_lookup(lookup_from(&pairs));
        assert_eq!(cfg.ws_url(), "ws://localhost:9");
    }
}
