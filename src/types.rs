// =============================================================================
// Shared types used across the KIS trading gateway
// =============================================================================

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Quotes
// ---------------------------------------------------------------------------

/// Where a quote snapshot originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuoteSource {
    #[serde(rename = "kis-ws")]
    KisWs,
    #[serde(rename = "kis-rest")]
    KisRest,
    #[serde(rename = "demo")]
    Demo,
}

impl std::fmt::Display for QuoteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KisWs => write!(f, "kis-ws"),
            Self::KisRest => write!(f, "kis-rest"),
            Self::Demo => write!(f, "demo"),
        }
    }
}

/// Freshness classification of a cached quote row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuoteState {
    Healthy,
    Stale,
}

/// Latest known price for a single symbol.
///
/// `freshness_sec` and `state` are recomputed against `now` at read time; `ts`
/// is the upstream event time in epoch seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteSnapshot {
    pub symbol: String,
    pub price: f64,
    pub change_pct: f64,
    pub turnover: f64,
    pub source: QuoteSource,
    pub ts: i64,
    pub freshness_sec: f64,
    pub state: QuoteState,
}

impl QuoteSnapshot {
    /// Recompute `freshness_sec`/`state` for the given reference time.
    pub fn refresh(&mut self, now: i64, stale_after_sec: i64) {
        let age = (now - self.ts).max(0) as f64;
        self.freshness_sec = age;
        self.state = if age <= stale_after_sec as f64 {
            QuoteState::Healthy
        } else {
            QuoteState::Stale
        };
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Order side. Input is case-insensitive; [`OrderRequest::normalize`]
/// upper-cases at the boundary before this parse is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_uppercase().as_str() {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Order pricing type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_uppercase().as_str() {
            "LIMIT" => Some(Self::Limit),
            "MARKET" => Some(Self::Market),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Limit => write!(f, "LIMIT"),
            Self::Market => write!(f, "MARKET"),
        }
    }
}

fn default_order_type() -> String {
    "LIMIT".to_string()
}

/// A client order submission.
///
/// `side` and `order_type` stay as strings here so that invalid values reach
/// the risk/validation layer and surface as `INVALID_SIDE` /
/// `INVALID_ORDER_TYPE` codes instead of a deserialization failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub account_id: String,
    pub symbol: String,
    pub side: String,
    pub qty: i64,
    #[serde(default = "default_order_type")]
    pub order_type: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub strategy_id: Option<String>,
}

impl OrderRequest {
    /// Upper-case `side` and `order_type` in place (boundary normalization).
    pub fn normalize(&mut self) {
        self.side = self.side.to_uppercase();
        self.order_type = self.order_type.to_uppercase();
    }

    pub fn side(&self) -> Option<OrderSide> {
        OrderSide::parse(&self.side)
    }

    pub fn order_type(&self) -> Option<OrderType> {
        OrderType::parse(&self.order_type)
    }
}

/// Acceptance receipt returned to the client on enqueue (and replayed on
/// idempotent re-submits).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAccepted {
    pub order_id: String,
    pub status: String,
    pub idempotency_key: String,
}

/// Lifecycle states of a queued order job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Queued,
    Accepted,
    Dispatching,
    Sent,
    Filled,
    Rejected,
    Canceled,
    CancelPending,
    ModifyPending,
}

impl OrderStatus {
    /// Case-insensitive parse of a broker-reported status string.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_uppercase().as_str() {
            "NEW" => Some(Self::New),
            "QUEUED" => Some(Self::Queued),
            "ACCEPTED" => Some(Self::Accepted),
            "DISPATCHING" => Some(Self::Dispatching),
            "SENT" => Some(Self::Sent),
            "FILLED" => Some(Self::Filled),
            "REJECTED" => Some(Self::Rejected),
            "CANCELED" => Some(Self::Canceled),
            "CANCEL_PENDING" => Some(Self::CancelPending),
            "MODIFY_PENDING" => Some(Self::ModifyPending),
            _ => None,
        }
    }

    /// Whether this status permits no further queue-API transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Rejected | Self::Canceled)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Queued => "QUEUED",
            Self::Accepted => "ACCEPTED",
            Self::Dispatching => "DISPATCHING",
            Self::Sent => "SENT",
            Self::Filled => "FILLED",
            Self::Rejected => "REJECTED",
            Self::Canceled => "CANCELED",
            Self::CancelPending => "CANCEL_PENDING",
            Self::ModifyPending => "MODIFY_PENDING",
        };
        write!(f, "{s}")
    }
}

fn default_max_attempts() -> u32 {
    3
}

/// Per-order lifecycle record held by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderJob {
    pub order_id: String,
    pub request: OrderRequest,
    pub status: OrderStatus,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub broker_order_id: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub terminal: bool,
}

// ---------------------------------------------------------------------------
// Portfolio
// ---------------------------------------------------------------------------

/// Cash balance row for an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub account_id: String,
    pub currency: String,
    pub cash_available: f64,
}

/// Open position row for an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub account_id: String,
    pub symbol: String,
    pub qty: i64,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Whether a session lease is currently held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPhase {
    Idle,
    Active,
}

/// Snapshot of the single-owner trading session lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub mode: String,
    pub owner: Option<String>,
    pub state: SessionPhase,
    pub source: String,
    pub lease_expires_at: Option<i64>,
}

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

/// Aggregated go/no-go decision for live trading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveReadiness {
    pub required_env_missing: Vec<String>,
    pub ws_connected: bool,
    pub ws_last_error: Option<String>,
    pub can_trade: bool,
    pub blocker_reasons: Vec<String>,
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// One local-vs-broker correction, appended to the durable journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationEvent {
    pub order_id: String,
    pub internal_status: String,
    pub broker_status: String,
    pub corrected_status: String,
    pub ts: i64,
}

/// Current epoch seconds.
pub fn epoch_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_parse_is_case_insensitive() {
        assert_eq!(OrderSide::parse("buy"), Some(OrderSide::Buy));
        assert_eq!(OrderSide::parse("Sell"), Some(OrderSide::Sell));
        assert_eq!(OrderSide::parse("hold"), None);
    }

    #[test]
    fn status_terminal_set() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(!OrderStatus::Sent.is_terminal());
        assert!(!OrderStatus::CancelPending.is_terminal());
    }

    #[test]
    fn snapshot_refresh_clamps_negative_age() {
        let mut snap = QuoteSnapshot {
            symbol: "005930".into(),
            price: 70000.0,
            change_pct: 0.0,
            turnover: 0.0,
            source: QuoteSource::KisWs,
            ts: 100,
            freshness_sec: 0.0,
            state: QuoteState::Healthy,
        };
        // Reference time behind the event time: age clamps to zero.
        snap.refresh(90, 5);
        assert_eq!(snap.freshness_sec, 0.0);
        assert_eq!(snap.state, QuoteState::Healthy);

        snap.refresh(110, 5);
        assert_eq!(snap.freshness_sec, 10.0);
        assert_eq!(snap.state, QuoteState::Stale);
    }

    #[test]
    fn request_normalize_uppercases_side_and_type() {
        let mut req = OrderRequest {
            account_id: "12345678-01".into(),
            symbol: "005930".into(),
            side: "buy".into(),
            qty: 1,
            order_type: "limit".into(),
            price: Some(70000.0),
            strategy_id: None,
        };
        req.normalize();
        assert_eq!(req.side, "BUY");
        assert_eq!(req.order_type, "LIMIT");
        assert_eq!(req.side(), Some(OrderSide::Buy));
        assert_eq!(req.order_type(), Some(OrderType::Limit));
    }

    #[test]
    fn quote_source_serializes_hyphenated() {
        assert_eq!(
            serde_json::to_string(&QuoteSource::KisWs).unwrap(),
            "\"kis-ws\""
        );
        assert_eq!(
            serde_json::to_string(&QuoteSource::KisRest).unwrap(),
            "\"kis-rest\""
        );
    }
}
