// =============================================================================
// KIS broker adapters — order placement, order status, portfolio
// =============================================================================
//
// All three capabilities share the REST client's token lifecycle and differ
// only in endpoint, tr_id and payload mapping. KIS signals most business
// failures inside a 200 response (`rt_cd != "0"`), so classification looks at
// `msg_cd` first and falls back to the transport status.
// =============================================================================

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::config::KisEnv;
use crate::kis::rest::KisRestClient;
use crate::types::{Balance, OrderJob, OrderRequest, OrderSide, OrderType, Position};
use crate::upstream::{
    BrokerError, BrokerErrorCode, BrokerStatusProvider, OrderAdapter, PlacedOrder,
    PortfolioProvider, UpstreamError,
};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Shared mapping helpers
// ---------------------------------------------------------------------------

/// `CANO` is the first 8 digits of the account number; the product code
/// defaults to "01" when the account has no `-NN` suffix.
fn split_account(account_id: &str) -> (String, String) {
    match account_id.split_once('-') {
        Some((cano, prdt)) if !prdt.is_empty() => (cano.to_string(), prdt.to_string()),
        _ => (account_id.to_string(), "01".to_string()),
    }
}

/// Cash-order tr_id: mock ids carry a V prefix, live ids a T prefix; buy and
/// sell are distinct transactions.
fn order_tr_id(env: KisEnv, side: OrderSide) -> &'static str {
    match (env, side) {
        (KisEnv::Mock, OrderSide::Buy) => "VTTC0802U",
        (KisEnv::Mock, OrderSide::Sell) => "VTTC0801U",
        (KisEnv::Live, OrderSide::Buy) => "TTTC0802U",
        (KisEnv::Live, OrderSide::Sell) => "TTTC0801U",
    }
}

fn ccld_tr_id(env: KisEnv) -> &'static str {
    match env {
        KisEnv::Mock => "VTTC8001R",
        KisEnv::Live => "TTTC8001R",
    }
}

fn balance_tr_id(env: KisEnv) -> &'static str {
    match env {
        KisEnv::Mock => "VTTC8434R",
        KisEnv::Live => "TTTC8434R",
    }
}

/// `ORD_DVSN`: 00 = limit, 01 = market.
fn ord_dvsn(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Limit => "00",
        OrderType::Market => "01",
    }
}

/// Typed classification of a KIS business reject (`rt_cd != "0"`).
fn classify_kis_reject(msg_cd: &str, msg1: &str) -> BrokerError {
    let code = match msg_cd {
        "EGW00201" => Some(BrokerErrorCode::RateLimit),
        "EGW00121" | "EGW00123" => Some(BrokerErrorCode::Auth),
        cd if cd.starts_with("APBK") => Some(BrokerErrorCode::InvalidOrder),
        _ => None,
    };
    let message = format!("{msg_cd}: {msg1}");
    match code {
        Some(code) => BrokerError::new(code, message),
        None => BrokerError::text(message),
    }
}

fn broker_error_from_upstream(err: UpstreamError) -> BrokerError {
    let code = match err.status() {
        Some(429) => Some(BrokerErrorCode::RateLimit),
        Some(401) | Some(403) => Some(BrokerErrorCode::Auth),
        _ => None,
    };
    match code {
        Some(code) => BrokerError::new(code, err.to_string()),
        None => BrokerError::text(err.to_string()),
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

fn num_field(value: &Value, key: &str) -> f64 {
    match value.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

// ---------------------------------------------------------------------------
// Order adapter
// ---------------------------------------------------------------------------

pub struct KisOrderAdapter {
    rest: Arc<KisRestClient>,
    env: KisEnv,
    default_account: String,
}

impl KisOrderAdapter {
    pub fn new(rest: Arc<KisRestClient>, env: KisEnv, default_account: impl Into<String>) -> Self {
        Self {
            rest,
            env,
            default_account: default_account.into(),
        }
    }

    fn account_for(&self, request: &OrderRequest) -> String {
        if request.account_id.is_empty() {
            self.default_account.clone()
        } else {
            request.account_id.clone()
        }
    }
}

#[async_trait]
impl OrderAdapter for KisOrderAdapter {
    #[instrument(skip(self, request), fields(symbol = %request.symbol, side = %request.side))]
    async fn place_order(&self, request: &OrderRequest) -> Result<PlacedOrder, BrokerError> {
        let side = request
            .side()
            .ok_or_else(|| BrokerError::new(BrokerErrorCode::InvalidOrder, "unknown side"))?;
        let order_type = request
            .order_type()
            .ok_or_else(|| BrokerError::new(BrokerErrorCode::InvalidOrder, "unknown order type"))?;

        let token = self
            .rest
            .get_access_token()
            .await
            .map_err(broker_error_from_upstream)?;

        let (cano, prdt) = split_account(&self.account_for(request));
        let body = json!({
            "CANO": cano,
            "ACNT_PRDT_CD": prdt,
            "PDNO": request.symbol,
            "ORD_DVSN": ord_dvsn(order_type),
            "ORD_QTY": request.qty.to_string(),
            "ORD_UNPR": request
                .price
                .map(|p| format!("{p:.0}"))
                .unwrap_or_else(|| "0".to_string()),
        });

        let url = format!(
            "{}/uapi/domestic-stock/v1/trading/order-cash",
            self.rest.base_url()
        );
        let response = self
            .rest
            .http()
            .post(&url)
            .header("authorization", format!("Bearer {token}"))
            .header("appkey", self.rest.app_key())
            .header("appsecret", self.rest.app_secret())
            .header("tr_id", order_tr_id(self.env, side))
            .json(&body)
            .send()
            .await
            .map_err(|e| BrokerError::text(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(broker_error_from_upstream(UpstreamError::Http {
                status: status.as_u16(),
                message: text,
            }));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| BrokerError::text(e.to_string()))?;

        if str_field(&payload, "rt_cd") != "0" {
            let err = classify_kis_reject(
                str_field(&payload, "msg_cd"),
                str_field(&payload, "msg1"),
            );
            warn!(error = %err, "KIS rejected order");
            return Err(err);
        }

        let output = payload.get("output").cloned().unwrap_or(Value::Null);
        let broker_order_id = str_field(&output, "ODNO").to_string();
        if broker_order_id.is_empty() {
            return Err(BrokerError::text("order accepted without ODNO"));
        }

        info!(broker_order_id = %broker_order_id, "KIS order placed");
        Ok(PlacedOrder {
            broker_order_id,
            raw: payload,
        })
    }
}

// ---------------------------------------------------------------------------
// Broker status provider
// ---------------------------------------------------------------------------

pub struct KisStatusProvider {
    rest: Arc<KisRestClient>,
    env: KisEnv,
}

impl KisStatusProvider {
    pub fn new(rest: Arc<KisRestClient>, env: KisEnv) -> Self {
        Self { rest, env }
    }
}

/// Derive a gateway status from a daily-execution row.
fn status_from_ccld_row(row: &Value) -> Option<String> {
    let ord_qty = num_field(row, "ord_qty");
    let filled_qty = num_field(row, "tot_ccld_qty");
    let canceled_qty = num_field(row, "cncl_cfrm_qty");

    if ord_qty > 0.0 && filled_qty >= ord_qty {
        Some("FILLED".to_string())
    } else if canceled_qty > 0.0 {
        Some("CANCELED".to_string())
    } else {
        Some("SENT".to_string())
    }
}

#[async_trait]
impl BrokerStatusProvider for KisStatusProvider {
    async fn order_status(
        &self,
        order_id: &str,
        job: &OrderJob,
    ) -> Result<Option<String>, UpstreamError> {
        // Nothing to reconcile until the broker has acknowledged the order.
        let broker_order_id = match &job.broker_order_id {
            Some(id) => id.clone(),
            None => return Ok(None),
        };

        let token = self.rest.get_access_token().await?;
        let (cano, prdt) = split_account(&job.request.account_id);
        let today = Utc::now().format("%Y%m%d").to_string();

        let url = format!(
            "{}/uapi/domestic-stock/v1/trading/inquire-daily-ccld",
            self.rest.base_url()
        );
        let response = self
            .rest
            .http()
            .get(&url)
            .header("authorization", format!("Bearer {token}"))
            .header("appkey", self.rest.app_key())
            .header("appsecret", self.rest.app_secret())
            .header("tr_id", ccld_tr_id(self.env))
            .query(&[
                ("CANO", cano.as_str()),
                ("ACNT_PRDT_CD", prdt.as_str()),
                ("INQR_STRT_DT", today.as_str()),
                ("INQR_END_DT", today.as_str()),
                ("SLL_BUY_DVSN_CD", "00"),
                ("INQR_DVSN", "00"),
                ("PDNO", ""),
                ("CCLD_DVSN", "00"),
                ("ORD_GNO_BRNO", ""),
                ("ODNO", broker_order_id.as_str()),
                ("INQR_DVSN_3", "00"),
                ("INQR_DVSN_1", ""),
                ("CTX_AREA_FK100", ""),
                ("CTX_AREA_NK100", ""),
            ])
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let row = payload
            .get("output1")
            .and_then(|v| v.as_array())
            .and_then(|rows| {
                rows.iter()
                    .find(|row| str_field(row, "odno") == broker_order_id)
            });

        match row {
            Some(row) => {
                let derived = status_from_ccld_row(row);
                debug!(order_id, status = ?derived, "broker status resolved");
                Ok(derived)
            }
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Portfolio provider
// ---------------------------------------------------------------------------

pub struct KisPortfolioProvider {
    rest: Arc<KisRestClient>,
    env: KisEnv,
}

impl KisPortfolioProvider {
    pub fn new(rest: Arc<KisRestClient>, env: KisEnv) -> Self {
        Self { rest, env }
    }

    async fn fetch_balance_payload(&self, account_id: &str) -> Result<Value, UpstreamError> {
        let token = self.rest.get_access_token().await?;
        let (cano, prdt) = split_account(account_id);

        let url = format!(
            "{}/uapi/domestic-stock/v1/trading/inquire-balance",
            self.rest.base_url()
        );
        let response = self
            .rest
            .http()
            .get(&url)
            .header("authorization", format!("Bearer {token}"))
            .header("appkey", self.rest.app_key())
            .header("appsecret", self.rest.app_secret())
            .header("tr_id", balance_tr_id(self.env))
            .query(&[
                ("CANO", cano.as_str()),
                ("ACNT_PRDT_CD", prdt.as_str()),
                ("AFHR_FLPR_YN", "N"),
                ("OFL_YN", ""),
                ("INQR_DVSN", "02"),
                ("UNPR_DVSN", "01"),
                ("FUND_STTL_ICLD_YN", "N"),
                ("FNCG_AMT_AUTO_RDPT_YN", "N"),
                ("PRCS_DVSN", "00"),
                ("CTX_AREA_FK100", ""),
                ("CTX_AREA_NK100", ""),
            ])
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Http {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))
    }
}

#[async_trait]
impl PortfolioProvider for KisPortfolioProvider {
    async fn get_balances(&self, account_id: &str) -> Result<Vec<Balance>, UpstreamError> {
        let payload = self.fetch_balance_payload(account_id).await?;
        let cash = payload
            .get("output2")
            .and_then(|v| v.as_array())
            .and_then(|rows| rows.first())
            .map(|row| num_field(row, "dnca_tot_amt"))
            .unwrap_or(0.0);

        Ok(vec![Balance {
            account_id: account_id.to_string(),
            currency: "KRW".to_string(),
            cash_available: cash,
        }])
    }

    async fn get_positions(&self, account_id: &str) -> Result<Vec<Position>, UpstreamError> {
        let payload = self.fetch_balance_payload(account_id).await?;
        let positions = payload
            .get("output1")
            .and_then(|v| v.as_array())
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| {
                        let symbol = str_field(row, "pdno");
                        let qty = num_field(row, "hldg_qty") as i64;
                        if symbol.is_empty() || qty == 0 {
                            return None;
                        }
                        Some(Position {
                            account_id: account_id.to_string(),
                            symbol: symbol.to_string(),
                            qty,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_splits_into_cano_and_product_code() {
        assert_eq!(
            split_account("12345678-01"),
            ("12345678".to_string(), "01".to_string())
        );
        assert_eq!(
            split_account("12345678"),
            ("12345678".to_string(), "01".to_string())
        );
        assert_eq!(
            split_account("12345678-"),
            ("12345678-".to_string(), "01".to_string())
        );
    }

    #[test]
    fn tr_ids_select_env_and_side() {
        assert_eq!(order_tr_id(KisEnv::Mock, OrderSide::Buy), "VTTC0802U");
        assert_eq!(order_tr_id(KisEnv::Mock, OrderSide::Sell), "VTTC0801U");
        assert_eq!(order_tr_id(KisEnv::Live, OrderSide::Buy), "TTTC0802U");
        assert_eq!(order_tr_id(KisEnv::Live, OrderSide::Sell), "TTTC0801U");
    }

    #[test]
    fn ord_dvsn_maps_order_types() {
        assert_eq!(ord_dvsn(OrderType::Limit), "00");
        assert_eq!(ord_dvsn(OrderType::Market), "01");
    }

    #[test]
    fn kis_reject_classification() {
        let err = classify_kis_reject("EGW00201", "요청 건수 초과");
        assert_eq!(err.classify(), BrokerErrorCode::RateLimit);

        let err = classify_kis_reject("EGW00123", "token expired");
        assert_eq!(err.classify(), BrokerErrorCode::Auth);

        let err = classify_kis_reject("APBK0919", "주문수량 오류");
        assert_eq!(err.classify(), BrokerErrorCode::InvalidOrder);

        // Unmapped codes keep the message so the substring fallback can act.
        let err = classify_kis_reject("ZZZZ9999", "mystery");
        assert_eq!(err.code, None);
        assert_eq!(err.classify(), BrokerErrorCode::Unknown);
    }

    #[test]
    fn upstream_http_statuses_classify() {
        let err = broker_error_from_upstream(UpstreamError::Http {
            status: 429,
            message: "slow down".into(),
        });
        assert_eq!(err.classify(), BrokerErrorCode::RateLimit);

        let err = broker_error_from_upstream(UpstreamError::Http {
            status: 401,
            message: "no token".into(),
        });
        assert_eq!(err.classify(), BrokerErrorCode::Auth);
    }

    #[test]
    fn ccld_row_status_mapping() {
        let filled = json!({"ord_qty": "10", "tot_ccld_qty": "10", "cncl_cfrm_qty": "0"});
        assert_eq!(status_from_ccld_row(&filled).as_deref(), Some("FILLED"));

        let canceled = json!({"ord_qty": "10", "tot_ccld_qty": "0", "cncl_cfrm_qty": "10"});
        assert_eq!(status_from_ccld_row(&canceled).as_deref(), Some("CANCELED"));

        let working = json!({"ord_qty": "10", "tot_ccld_qty": "3", "cncl_cfrm_qty": "0"});
        assert_eq!(status_from_ccld_row(&working).as_deref(), Some("SENT"));
    }
}
