// =============================================================================
// Upstream capability interfaces — every broker-facing collaborator is
// injected behind one of these traits
// =============================================================================
//
// Handlers and engines depend only on the interfaces; the concrete KIS
// implementations live in `kis::`. Tests swap in hand-rolled mocks.
// =============================================================================

use async_trait::async_trait;

use crate::types::{Balance, OrderJob, OrderRequest, Position, QuoteSnapshot};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure talking to an upstream HTTP/WS endpoint. The HTTP status is
/// surfaced so callers can react to specific conditions (429 in particular).
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("upstream transport error: {0}")]
    Transport(String),
    #[error("unexpected upstream payload: {0}")]
    Payload(String),
}

impl UpstreamError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Http { status: 429, .. })
    }
}

/// Dispatcher-facing classification of a broker order failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorCode {
    RateLimit,
    Auth,
    InvalidOrder,
    Unknown,
}

impl BrokerErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "RATE_LIMIT",
            Self::Auth => "AUTH",
            Self::InvalidOrder => "INVALID_ORDER",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Retryable set: rate limits and unclassified failures get another
    /// attempt; auth and validation failures do not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimit | Self::Unknown)
    }
}

impl std::fmt::Display for BrokerErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Failure reported by the order adapter.
///
/// Adapters that understand the broker's error vocabulary attach a typed
/// `code`; [`BrokerError::classify`] falls back to a case-insensitive
/// substring match on the message only when no code is present.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct BrokerError {
    pub code: Option<BrokerErrorCode>,
    pub message: String,
}

impl BrokerError {
    pub fn new(code: BrokerErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }

    /// An error that only conveys text (legacy adapters).
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn classify(&self) -> BrokerErrorCode {
        if let Some(code) = self.code {
            return code;
        }
        let upper = self.message.to_uppercase();
        if upper.contains("RATE_LIMIT") || upper.contains("429") {
            BrokerErrorCode::RateLimit
        } else if upper.contains("AUTH") || upper.contains("TOKEN") {
            BrokerErrorCode::Auth
        } else if upper.contains("INVALID_ORDER") || upper.contains("INVALID") {
            BrokerErrorCode::InvalidOrder
        } else {
            BrokerErrorCode::Unknown
        }
    }
}

/// Broker acknowledgement of a placed order.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub broker_order_id: String,
    pub raw: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Capability interfaces
// ---------------------------------------------------------------------------

/// On-demand quote pull (the REST side of the read path).
#[async_trait]
pub trait QuoteRest: Send + Sync {
    async fn get_quote(&self, symbol: &str) -> Result<QuoteSnapshot, UpstreamError>;
}

/// Issues the streaming authorization key used in WS subscribe frames.
#[async_trait]
pub trait ApprovalKeyIssuer: Send + Sync {
    async fn issue_approval_key(&self) -> Result<String, UpstreamError>;
}

/// Submits orders to the broker.
#[async_trait]
pub trait OrderAdapter: Send + Sync {
    async fn place_order(&self, request: &OrderRequest) -> Result<PlacedOrder, BrokerError>;
}

/// Account balances and positions, proxied through the gateway.
#[async_trait]
pub trait PortfolioProvider: Send + Sync {
    async fn get_balances(&self, account_id: &str) -> Result<Vec<Balance>, UpstreamError>;
    async fn get_positions(&self, account_id: &str) -> Result<Vec<Position>, UpstreamError>;
}

/// Broker-side truth for a single order, consulted by reconciliation.
/// `Ok(None)` means the broker has nothing to say about this order yet.
#[async_trait]
pub trait BrokerStatusProvider: Send + Sync {
    async fn order_status(
        &self,
        order_id: &str,
        job: &OrderJob,
    ) -> Result<Option<String>, UpstreamError>;
}
