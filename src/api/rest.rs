// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/v1`. Error policy: validation and transition
// rejects map to 400, idempotency/terminal conflicts to 409, unknown orders
// to 404, upstream unavailability to 503 — always with a machine-readable
// code in the body.
//
// CORS is configured permissively for development; tighten the allowed
// origins in production.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::app_state::AppState;
use crate::error::ApiError;
use crate::market_hours;
use crate::risk::{
    evaluate_trade_risk, validate_action_transition, validate_order_request,
    validate_risk_request, OrderAction, RiskContext, RiskVerdict,
};
use crate::types::{OrderAccepted, OrderJob, OrderRequest, OrderSide, OrderStatus};

/// TTL granted to an operator reconnect.
const RECONNECT_TTL_SEC: i64 = 30;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    use tower_http::cors::{Any, CorsLayer};
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Health / session ────────────────────────────────────────
        .route("/v1/health", get(health))
        .route("/v1/session/status", get(session_status))
        .route("/v1/session/reconnect", post(session_reconnect))
        .route("/v1/session/live-readiness", get(live_readiness))
        // ── Quotes ──────────────────────────────────────────────────
        .route("/v1/quotes", get(get_quotes_batch))
        .route("/v1/quotes/:symbol", get(get_quote_single))
        // ── Risk / orders ───────────────────────────────────────────
        .route("/v1/risk/check", post(risk_check))
        .route("/v1/orders", post(create_order))
        .route("/v1/orders/reconcile", post(reconcile_now))
        .route("/v1/orders/:order_id", get(get_order_public))
        .route("/v1/orders/:order_id/state", get(get_order_state))
        .route("/v1/orders/:order_id/cancel", post(cancel_order))
        .route("/v1/orders/:order_id/modify", post(modify_order))
        // ── Portfolio proxy ─────────────────────────────────────────
        .route("/v1/balances", get(get_balances))
        .route("/v1/positions", get(get_positions))
        // ── Metrics ─────────────────────────────────────────────────
        .route("/v1/metrics/quote", get(quote_metrics))
        .route("/v1/metrics/order", get(order_metrics))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_sec": state.start_time.elapsed().as_secs(),
    }))
}

// =============================================================================
// Session
// =============================================================================

async fn session_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.session.status())
}

async fn session_reconnect(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let operator_token = headers
        .get("X-Operator-Token")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if operator_token.is_none() {
        return Err(ApiError::bad_request("OPERATOR_TOKEN_REQUIRED")
            .with_message("X-Operator-Token header required"));
    }

    let acquired = state
        .session
        .acquire("gateway", RECONNECT_TTL_SEC, "operator-reconnect");
    info!(acquired, "session reconnect attempted");

    Ok(Json(json!({
        "acquired": acquired,
        "session": state.session.status(),
    })))
}

async fn live_readiness(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.live_readiness())
}

// =============================================================================
// Quotes
// =============================================================================

async fn get_quote_single(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.quote_gateway.get_quote(&symbol).await?;
    Ok(Json(snapshot))
}

async fn get_quotes_batch(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let raw = params
        .get("symbols")
        .map(String::as_str)
        .unwrap_or_default();
    let symbols: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if symbols.is_empty() {
        return Err(ApiError::bad_request("SYMBOLS_REQUIRED")
            .with_message("query parameter 'symbols' must list at least one symbol"));
    }

    let (quotes, meta) = state.quote_gateway.get_quotes(&symbols).await;
    Ok(Json(json!({ "quotes": quotes, "meta": meta })))
}

// =============================================================================
// Risk
// =============================================================================

async fn risk_check(
    State(state): State<Arc<AppState>>,
    Json(mut req): Json<OrderRequest>,
) -> impl IntoResponse {
    req.normalize();
    let verdict = match validate_risk_request(&req, market_hours::is_market_open()) {
        Err(code) => RiskVerdict::reject(code),
        Ok(()) => risk_verdict(&state, &req).await,
    };
    Json(verdict)
}

/// Full pre-trade evaluation for order creation: structural validation first,
/// then the risk policy chain.
async fn evaluate_order(state: &Arc<AppState>, req: &OrderRequest) -> RiskVerdict {
    if let Err(code) = validate_order_request(req, market_hours::is_market_open()) {
        return RiskVerdict::reject(code);
    }
    risk_verdict(state, req).await
}

/// The risk policy chain, with the live-readiness probe as the live gate.
async fn risk_verdict(state: &Arc<AppState>, req: &OrderRequest) -> RiskVerdict {
    let sell_qty = resolve_sell_qty(state, req).await;
    let ctx = RiskContext {
        live_enabled: state.live_readiness().can_trade,
        daily_order_count: state.daily_orders.current(),
        daily_order_limit: state.config.daily_order_limit,
        max_qty: state.config.max_order_qty,
        buy_notional_cap: state.config.buy_notional_cap,
        default_price: state.config.default_price,
    };
    evaluate_trade_risk(req, &ctx, &|_, _| sell_qty)
}

/// Sellable quantity for SELL-side checks, resolved through the portfolio
/// provider. Without a provider (or on upstream failure) the answer is 0 —
/// the conservative bound.
async fn resolve_sell_qty(state: &Arc<AppState>, req: &OrderRequest) -> i64 {
    if req.side() != Some(OrderSide::Sell) {
        return 0;
    }
    let provider = match &state.portfolio {
        Some(provider) => provider,
        None => return 0,
    };
    match provider.get_positions(&req.account_id).await {
        Ok(positions) => positions
            .iter()
            .filter(|p| p.symbol == req.symbol)
            .map(|p| p.qty)
            .sum(),
        Err(_) => 0,
    }
}

// =============================================================================
// Orders
// =============================================================================

async fn create_order(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(mut req): Json<OrderRequest>,
) -> Result<Json<OrderAccepted>, ApiError> {
    let idem_key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            ApiError::bad_request("IDEMPOTENCY_KEY_REQUIRED")
                .with_message("Idempotency-Key header required")
        })?;

    req.normalize();
    let verdict = evaluate_order(&state, &req).await;
    if let Some(reason) = verdict.reason {
        return Err(ApiError::reject(reason));
    }

    let enqueued = state.order_queue.enqueue(req, idem_key)?;
    if !enqueued.deduplicated {
        state.daily_orders.increment();
    }
    Ok(Json(enqueued.accepted))
}

/// Client-facing order view. The internal NEW status is published as QUEUED;
/// the raw state (including NEW) is available at `/orders/{id}/state`.
#[derive(Debug, Serialize)]
struct PublicOrder {
    order_id: String,
    status: String,
    created_at: i64,
    updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    broker_order_id: Option<String>,
}

fn public_view(job: OrderJob) -> PublicOrder {
    let status = match job.status {
        OrderStatus::New => "QUEUED".to_string(),
        other => other.to_string(),
    };
    PublicOrder {
        order_id: job.order_id,
        status,
        created_at: job.created_at,
        updated_at: job.updated_at,
        error: job.error,
        broker_order_id: job.broker_order_id,
    }
}

async fn get_order_public(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .order_queue
        .get(&order_id)
        .ok_or_else(order_not_found)?;
    Ok(Json(public_view(job)))
}

async fn get_order_state(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .order_queue
        .get(&order_id)
        .ok_or_else(order_not_found)?;
    Ok(Json(job))
}

async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .order_queue
        .get(&order_id)
        .ok_or_else(order_not_found)?;
    if job.terminal {
        return Err(crate::error::QueueError::OrderAlreadyTerminal.into());
    }
    validate_action_transition(OrderAction::Cancel, job.status).map_err(ApiError::reject)?;

    let job = state.order_queue.request_cancel(&order_id)?;
    Ok(Json(public_view(job)))
}

#[derive(Debug, Deserialize)]
struct ModifyRequest {
    qty: i64,
    #[serde(default)]
    price: Option<f64>,
}

async fn modify_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
    Json(body): Json<ModifyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.qty < 1 {
        return Err(ApiError::reject(crate::error::RejectCode::InvalidQty));
    }
    if let Some(price) = body.price {
        if price <= 0.0 {
            return Err(ApiError::reject(crate::error::RejectCode::InvalidPrice));
        }
    }

    let job = state
        .order_queue
        .get(&order_id)
        .ok_or_else(order_not_found)?;
    if job.terminal {
        return Err(crate::error::QueueError::OrderAlreadyTerminal.into());
    }
    validate_action_transition(OrderAction::Modify, job.status).map_err(ApiError::reject)?;

    let job = state
        .order_queue
        .request_modify(&order_id, body.qty, body.price)?;
    Ok(Json(public_view(job)))
}

async fn reconcile_now(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.reconciler.trigger().await)
}

fn order_not_found() -> ApiError {
    crate::error::QueueError::OrderNotFound.into()
}

// =============================================================================
// Portfolio proxy
// =============================================================================

fn required_account_id(params: &HashMap<String, String>) -> Result<&str, ApiError> {
    params
        .get("account_id")
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| {
            ApiError::bad_request("ACCOUNT_ID_REQUIRED")
                .with_message("query parameter 'account_id' required")
        })
}

async fn get_balances(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let account_id = required_account_id(&params)?;
    let provider = state
        .portfolio
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("PORTFOLIO_PROVIDER_NOT_CONFIGURED"))?;

    let balances = provider.get_balances(account_id).await.map_err(|err| {
        ApiError::service_unavailable("PORTFOLIO_PROVIDER_UNAVAILABLE").with_message(err.to_string())
    })?;
    Ok(Json(balances))
}

async fn get_positions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let account_id = required_account_id(&params)?;
    let provider = state
        .portfolio
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("PORTFOLIO_PROVIDER_NOT_CONFIGURED"))?;

    let positions = provider.get_positions(account_id).await.map_err(|err| {
        ApiError::service_unavailable("PORTFOLIO_PROVIDER_UNAVAILABLE").with_message(err.to_string())
    })?;
    Ok(Json(positions))
}

// =============================================================================
// Metrics
// =============================================================================

async fn quote_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ingest = state.quote_ingest.metrics(crate::types::epoch_now());
    let gateway = state.quote_gateway.metrics();
    Json(json!({ "ingest": ingest, "gateway": gateway }))
}

async fn order_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "queue": state.order_queue.metrics(),
        "reconciliation": state.reconciler.metrics(),
    }))
}
