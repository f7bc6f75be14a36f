// =============================================================================
// Risk Policy — pre-trade checks, action transitions, daily order counter
// =============================================================================
//
// `evaluate_trade_risk` applies a first-match policy chain:
//   1. Live gate          — trading disabled blocks everything.
//   2. Daily limit        — order count for the current UTC day.
//   3. Side policy        — BUY notional cap / SELL position bound.
//   4. BUY max quantity   — not applied to SELL (position-bounded already).
//
// Request-layer validation (quantity, price shape, trading window) lives in
// `validate_order_request`; both layers reject with stable string codes.
// =============================================================================

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::RejectCode;
use crate::types::{OrderRequest, OrderSide, OrderStatus, OrderType};

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// Outcome of a risk evaluation: `ok` with no reason, or the first rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RiskVerdict {
    pub ok: bool,
    pub reason: Option<RejectCode>,
}

impl RiskVerdict {
    pub fn pass() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    pub fn reject(reason: RejectCode) -> Self {
        Self {
            ok: false,
            reason: Some(reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Policy context
// ---------------------------------------------------------------------------

/// Limits supplied by the caller for one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct RiskContext {
    pub live_enabled: bool,
    pub daily_order_count: u32,
    pub daily_order_limit: u32,
    pub max_qty: i64,
    pub buy_notional_cap: f64,
    pub default_price: f64,
}

/// Pre-trade policy chain. `get_available_sell_qty` resolves the account's
/// sellable quantity for SELL-side checks.
pub fn evaluate_trade_risk(
    req: &OrderRequest,
    ctx: &RiskContext,
    get_available_sell_qty: &dyn Fn(&str, &str) -> i64,
) -> RiskVerdict {
    if !ctx.live_enabled {
        return RiskVerdict::reject(RejectCode::LiveDisabled);
    }

    if ctx.daily_order_count >= ctx.daily_order_limit {
        return RiskVerdict::reject(RejectCode::DailyLimitExceeded);
    }

    let side = match req.side() {
        Some(side) => side,
        None => return RiskVerdict::reject(RejectCode::InvalidSide),
    };

    match side {
        OrderSide::Buy => {
            let effective_price = req.price.unwrap_or(ctx.default_price);
            if req.qty as f64 * effective_price > ctx.buy_notional_cap {
                return RiskVerdict::reject(RejectCode::NotionalLimitExceeded);
            }
        }
        OrderSide::Sell => {
            let available = get_available_sell_qty(&req.account_id, &req.symbol);
            if req.qty > available {
                return RiskVerdict::reject(RejectCode::InsufficientPositionQty);
            }
        }
    }

    // max_qty bounds the BUY path only; SELL is bounded by the position.
    if side == OrderSide::Buy && req.qty > ctx.max_qty {
        return RiskVerdict::reject(RejectCode::MaxQtyExceeded);
    }

    RiskVerdict::pass()
}

// ---------------------------------------------------------------------------
// Request-layer validation
// ---------------------------------------------------------------------------

/// Bounds checks shared by order creation and the standalone risk check:
/// quantity, price positivity, trading window. Price *presence* rules are an
/// order-shape concern and live in [`validate_order_request`] — a bare risk
/// check may omit the price and fall through to the default-price notional.
pub fn validate_risk_request(req: &OrderRequest, market_open: bool) -> Result<(), RejectCode> {
    if req.qty < 1 {
        return Err(RejectCode::InvalidQty);
    }
    if let Some(price) = req.price {
        if price <= 0.0 {
            return Err(RejectCode::InvalidPrice);
        }
    }
    if !market_open {
        return Err(RejectCode::OutOfTradingWindow);
    }
    Ok(())
}

/// Structural validation of an order request. The request must already be
/// normalized (upper-cased side/order_type).
pub fn validate_order_request(req: &OrderRequest, market_open: bool) -> Result<(), RejectCode> {
    if req.side().is_none() {
        return Err(RejectCode::InvalidSide);
    }
    let order_type = req.order_type().ok_or(RejectCode::InvalidOrderType)?;

    match order_type {
        OrderType::Limit if req.price.is_none() => {
            return Err(RejectCode::PriceRequiredForLimit);
        }
        OrderType::Market if req.price.is_some() => {
            return Err(RejectCode::PriceNotAllowedForMarket);
        }
        _ => {}
    }

    validate_risk_request(req, market_open)
}

// ---------------------------------------------------------------------------
// Action transitions
// ---------------------------------------------------------------------------

/// Order actions a client can request on an existing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderAction {
    Cancel,
    Modify,
}

/// Cancel/modify are permitted only from these statuses.
const ACTIONABLE_STATUSES: [OrderStatus; 5] = [
    OrderStatus::New,
    OrderStatus::Dispatching,
    OrderStatus::Sent,
    OrderStatus::Accepted,
    OrderStatus::Queued,
];

pub fn validate_action_transition(
    _action: OrderAction,
    current: OrderStatus,
) -> Result<(), RejectCode> {
    if ACTIONABLE_STATUSES.contains(&current) {
        Ok(())
    } else {
        Err(RejectCode::InvalidTransition)
    }
}

// ---------------------------------------------------------------------------
// Daily order counter
// ---------------------------------------------------------------------------

struct CounterInner {
    date: String,
    count: u32,
}

/// Order count for the current UTC calendar day. Counters reset automatically
/// when the date rolls, double-checked under the write lock.
pub struct DailyOrderCounter {
    inner: RwLock<CounterInner>,
}

impl DailyOrderCounter {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CounterInner {
                date: Self::today(),
                count: 0,
            }),
        }
    }

    fn today() -> String {
        Utc::now().format("%Y-%m-%d").to_string()
    }

    fn maybe_reset(&self) {
        let today = Self::today();
        {
            let inner = self.inner.read();
            if inner.date == today {
                return;
            }
        }
        let mut inner = self.inner.write();
        // Another caller may have already rolled the date.
        if inner.date != today {
            info!(
                old_date = %inner.date,
                new_date = %today,
                "date rolled — resetting daily order counter"
            );
            inner.date = today;
            inner.count = 0;
        }
    }

    pub fn current(&self) -> u32 {
        self.maybe_reset();
        self.inner.read().count
    }

    /// Record one accepted order; returns the new count.
    pub fn increment(&self) -> u32 {
        self.maybe_reset();
        let mut inner = self.inner.write();
        inner.count += 1;
        debug!(count = inner.count, "daily order counter incremented");
        inner.count
    }
}

impl Default for DailyOrderCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(side: &str, qty: i64, price: Option<f64>) -> OrderRequest {
        let mut req = OrderRequest {
            account_id: "12345678-01".into(),
            symbol: "005930".into(),
            side: side.into(),
            qty,
            order_type: "LIMIT".into(),
            price,
            strategy_id: None,
        };
        req.normalize();
        req
    }

    fn ctx() -> RiskContext {
        RiskContext {
            live_enabled: true,
            daily_order_count: 0,
            daily_order_limit: 100,
            max_qty: 1000,
            buy_notional_cap: 10_000_000.0,
            default_price: 70_000.0,
        }
    }

    fn no_position(_: &str, _: &str) -> i64 {
        0
    }

    #[test]
    fn live_gate_blocks_first() {
        let mut c = ctx();
        c.live_enabled = false;
        c.daily_order_count = c.daily_order_limit; // would also trip
        let verdict = evaluate_trade_risk(&req("BUY", 1, Some(100.0)), &c, &no_position);
        assert_eq!(verdict.reason, Some(RejectCode::LiveDisabled));
    }

    #[test]
    fn daily_limit_blocks_before_side_policy() {
        let mut c = ctx();
        c.daily_order_count = c.daily_order_limit;
        let verdict = evaluate_trade_risk(&req("HOLD", 1, None), &c, &no_position);
        assert_eq!(verdict.reason, Some(RejectCode::DailyLimitExceeded));
    }

    #[test]
    fn buy_notional_cap_uses_default_price_when_absent() {
        // 143 * 70_000 = 10_010_000 > cap.
        let verdict = evaluate_trade_risk(&req("BUY", 143, None), &ctx(), &no_position);
        assert_eq!(verdict.reason, Some(RejectCode::NotionalLimitExceeded));
        // 142 * 70_000 = 9_940_000 <= cap.
        let verdict = evaluate_trade_risk(&req("BUY", 142, None), &ctx(), &no_position);
        assert!(verdict.ok);
    }

    #[test]
    fn sell_bounded_by_position() {
        let verdict = evaluate_trade_risk(&req("SELL", 5, Some(100.0)), &ctx(), &|_, _| 4);
        assert_eq!(verdict.reason, Some(RejectCode::InsufficientPositionQty));
        let verdict = evaluate_trade_risk(&req("SELL", 5, Some(100.0)), &ctx(), &|_, _| 5);
        assert!(verdict.ok);
    }

    #[test]
    fn unknown_side_rejected() {
        let verdict = evaluate_trade_risk(&req("HOLD", 1, Some(100.0)), &ctx(), &no_position);
        assert_eq!(verdict.reason, Some(RejectCode::InvalidSide));
    }

    #[test]
    fn max_qty_applies_to_buy_only() {
        let mut c = ctx();
        c.max_qty = 10;
        let verdict = evaluate_trade_risk(&req("BUY", 11, Some(100.0)), &c, &no_position);
        assert_eq!(verdict.reason, Some(RejectCode::MaxQtyExceeded));
        // SELL with qty over max_qty passes as long as the position covers it.
        let verdict = evaluate_trade_risk(&req("SELL", 11, Some(100.0)), &c, &|_, _| 100);
        assert!(verdict.ok);
    }

    #[test]
    fn risk_request_tolerates_missing_price() {
        // A bare risk check may omit the price; the chain then applies the
        // default-price notional. Bounds still apply.
        assert_eq!(validate_risk_request(&req("BUY", 1, None), true), Ok(()));
        assert_eq!(
            validate_risk_request(&req("BUY", 0, None), true),
            Err(RejectCode::InvalidQty)
        );
    }

    #[test]
    fn limit_requires_price() {
        let r = req("BUY", 1, None);
        assert_eq!(
            validate_order_request(&r, true),
            Err(RejectCode::PriceRequiredForLimit)
        );
    }

    #[test]
    fn market_forbids_price() {
        let mut r = req("BUY", 1, Some(100.0));
        r.order_type = "MARKET".into();
        assert_eq!(
            validate_order_request(&r, true),
            Err(RejectCode::PriceNotAllowedForMarket)
        );
        r.price = None;
        assert_eq!(validate_order_request(&r, true), Ok(()));
    }

    #[test]
    fn qty_and_price_bounds() {
        assert_eq!(
            validate_order_request(&req("BUY", 0, Some(100.0)), true),
            Err(RejectCode::InvalidQty)
        );
        assert_eq!(
            validate_order_request(&req("BUY", 1, Some(0.0)), true),
            Err(RejectCode::InvalidPrice)
        );
    }

    #[test]
    fn closed_market_rejects_request() {
        assert_eq!(
            validate_order_request(&req("BUY", 1, Some(100.0)), false),
            Err(RejectCode::OutOfTradingWindow)
        );
    }

    #[test]
    fn transitions_from_actionable_statuses_only() {
        for status in ACTIONABLE_STATUSES {
            assert!(validate_action_transition(OrderAction::Cancel, status).is_ok());
            assert!(validate_action_transition(OrderAction::Modify, status).is_ok());
        }
        for status in [
            OrderStatus::Filled,
            OrderStatus::Rejected,
            OrderStatus::Canceled,
            OrderStatus::CancelPending,
            OrderStatus::ModifyPending,
        ] {
            assert_eq!(
                validate_action_transition(OrderAction::Cancel, status),
                Err(RejectCode::InvalidTransition)
            );
        }
    }

    #[test]
    fn daily_counter_increments() {
        let counter = DailyOrderCounter::new();
        assert_eq!(counter.current(), 0);
        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.increment(), 2);
        assert_eq!(counter.current(), 2);
    }
}
