// =============================================================================
// Typed domain errors with machine-readable string codes
// =============================================================================
//
// Every rejection that crosses the HTTP boundary carries one of the stable
// codes below, verbatim. Policy: validation and transition errors map to 400,
// conflicts to 409, not-found to 404, upstream unavailability to 503.
// =============================================================================

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde::Serialize;

use crate::upstream::UpstreamError;

// ---------------------------------------------------------------------------
// Request/risk rejection codes
// ---------------------------------------------------------------------------

/// Pre-trade rejection reasons, shared between request validation and the
/// risk policy chain. Serializes as the SCREAMING_SNAKE_CASE code string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectCode {
    InvalidSide,
    InvalidOrderType,
    PriceRequiredForLimit,
    PriceNotAllowedForMarket,
    InvalidQty,
    InvalidPrice,
    NotionalLimitExceeded,
    InsufficientPositionQty,
    MaxQtyExceeded,
    DailyLimitExceeded,
    LiveDisabled,
    OutOfTradingWindow,
    InvalidTransition,
}

impl RejectCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidSide => "INVALID_SIDE",
            Self::InvalidOrderType => "INVALID_ORDER_TYPE",
            Self::PriceRequiredForLimit => "PRICE_REQUIRED_FOR_LIMIT",
            Self::PriceNotAllowedForMarket => "PRICE_NOT_ALLOWED_FOR_MARKET",
            Self::InvalidQty => "INVALID_QTY",
            Self::InvalidPrice => "INVALID_PRICE",
            Self::NotionalLimitExceeded => "NOTIONAL_LIMIT_EXCEEDED",
            Self::InsufficientPositionQty => "INSUFFICIENT_POSITION_QTY",
            Self::MaxQtyExceeded => "MAX_QTY_EXCEEDED",
            Self::DailyLimitExceeded => "DAILY_LIMIT_EXCEEDED",
            Self::LiveDisabled => "LIVE_DISABLED",
            Self::OutOfTradingWindow => "OUT_OF_TRADING_WINDOW",
            Self::InvalidTransition => "INVALID_TRANSITION",
        }
    }
}

impl std::fmt::Display for RejectCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Queue errors
// ---------------------------------------------------------------------------

/// Failures raised by the order queue API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("IDEMPOTENCY_KEY_BODY_MISMATCH")]
    IdempotencyKeyBodyMismatch,
    #[error("ORDER_NOT_FOUND")]
    OrderNotFound,
    #[error("ORDER_ALREADY_TERMINAL")]
    OrderAlreadyTerminal,
}

impl QueueError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::IdempotencyKeyBodyMismatch => "IDEMPOTENCY_KEY_BODY_MISMATCH",
            Self::OrderNotFound => "ORDER_NOT_FOUND",
            Self::OrderAlreadyTerminal => "ORDER_ALREADY_TERMINAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::IdempotencyKeyBodyMismatch => StatusCode::CONFLICT,
            Self::OrderNotFound => StatusCode::NOT_FOUND,
            Self::OrderAlreadyTerminal => StatusCode::CONFLICT,
        }
    }
}

// ---------------------------------------------------------------------------
// Quote read-path errors
// ---------------------------------------------------------------------------

/// Failures raised by the quote gateway read path.
#[derive(Debug, thiserror::Error)]
pub enum QuoteError {
    /// Symbol is inside a rate-limit cooldown window and no cached snapshot
    /// is available to substitute.
    #[error("REST_RATE_LIMIT_COOLDOWN")]
    RestRateLimitCooldown,
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl QuoteError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RestRateLimitCooldown => "REST_RATE_LIMIT_COOLDOWN",
            Self::Upstream(_) => "UPSTREAM_ERROR",
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP mapping
// ---------------------------------------------------------------------------

/// Uniform error payload returned by every handler.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Handler-level error: a status code plus the machine-readable body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: code.into(),
                message: None,
            },
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.body.message = Some(message.into());
        self
    }

    pub fn bad_request(code: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code)
    }

    pub fn reject(code: RejectCode) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code.as_str())
    }

    pub fn service_unavailable(code: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, code)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        ApiError::new(err.status(), err.code())
    }
}

impl From<QuoteError> for ApiError {
    fn from(err: QuoteError) -> Self {
        match &err {
            QuoteError::RestRateLimitCooldown => {
                ApiError::service_unavailable(err.code())
            }
            QuoteError::Upstream(upstream) => {
                ApiError::service_unavailable(err.code()).with_message(upstream.to_string())
            }
        }
    }
}
