// =============================================================================
// KIS REST client — token lifecycle and price queries
// =============================================================================
//
// SECURITY: the app secret is never logged or serialized; Debug output
// redacts credentials.
//
// Token caching: an issued access token is reused until its refresh deadline,
// computed as `max(expires_in - 30, min(expires_in, 1))` seconds after issue.
// The 30 s margin avoids racing the upstream expiry; the inner `min` keeps a
// ≥1 s cache window even for very short-lived tokens.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::types::{epoch_now, QuoteSnapshot, QuoteSource, QuoteState};
use crate::upstream::{ApprovalKeyIssuer, QuoteRest, UpstreamError};

/// All upstream calls share one 5 s timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Refresh margin subtracted from the upstream token TTL.
const TOKEN_REFRESH_MARGIN_SEC: i64 = 30;
/// Transaction id for the domestic price inquiry.
const TR_ID_INQUIRE_PRICE: &str = "FHKST01010100";

#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: i64,
}

pub struct KisRestClient {
    app_key: String,
    app_secret: String,
    base_url: String,
    client: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

/// Seconds an issued token stays cached before re-issue.
pub fn token_cache_ttl(expires_in: i64) -> i64 {
    (expires_in - TOKEN_REFRESH_MARGIN_SEC).max(expires_in.min(1))
}

impl KisRestClient {
    pub fn new(
        app_key: impl Into<String>,
        app_secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            app_key: app_key.into(),
            app_secret: app_secret.into(),
            base_url: base_url.into(),
            client,
            token: Mutex::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Token lifecycle
    // -------------------------------------------------------------------------

    /// Return the cached access token, issuing a fresh one when the cache
    /// window has elapsed. The cache lock is never held across the issue call.
    pub async fn get_access_token(&self) -> Result<String, UpstreamError> {
        let now = epoch_now();
        if let Some(cached) = self.token.lock().as_ref() {
            if now < cached.expires_at {
                return Ok(cached.access_token.clone());
            }
        }
        self.issue_token().await
    }

    #[instrument(skip(self), name = "kis::issue_token")]
    async fn issue_token(&self) -> Result<String, UpstreamError> {
        let url = format!("{}/oauth2/tokenP", self.base_url);
        let body = json!({
            "grant_type": "client_credentials",
            "appkey": self.app_key,
            "appsecret": self.app_secret,
        });

        let payload = self.post_json(&url, &body).await?;
        let token = payload
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| UpstreamError::Payload("missing access_token".into()))?
            .to_string();
        let expires_in = payload
            .get("expires_in")
            .and_then(as_i64_lenient)
            .unwrap_or(3600);

        let issued_at = epoch_now();
        *self.token.lock() = Some(CachedToken {
            access_token: token.clone(),
            expires_at: issued_at + token_cache_ttl(expires_in),
        });

        debug!(expires_in, "access token issued");
        Ok(token)
    }

    // -------------------------------------------------------------------------
    // Quotes
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "kis::get_quote")]
    async fn fetch_quote(&self, symbol: &str) -> Result<QuoteSnapshot, UpstreamError> {
        let token = self.get_access_token().await?;
        let url = format!(
            "{}/uapi/domestic-stock/v1/quotations/inquire-price",
            self.base_url
        );

        let response = self
            .client
            .get(&url)
            .header("authorization", format!("Bearer {token}"))
            .header("appkey", &self.app_key)
            .header("appsecret", &self.app_secret)
            .header("tr_id", TR_ID_INQUIRE_PRICE)
            .query(&[("fid_cond_mrkt_div_code", "J"), ("fid_input_iscd", symbol)])
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let payload: Value = response.json().await.map_err(transport)?;
        let output = payload.get("output").cloned().unwrap_or(Value::Null);

        Ok(QuoteSnapshot {
            symbol: symbol.to_string(),
            price: field_f64(&output, "stck_prpr"),
            change_pct: field_f64(&output, "prdy_ctrt"),
            turnover: field_f64(&output, "acml_tr_pbmn"),
            source: QuoteSource::KisRest,
            ts: epoch_now(),
            freshness_sec: 0.0,
            state: QuoteState::Healthy,
        })
    }

    // -------------------------------------------------------------------------
    // Approval key (streaming authorization)
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "kis::issue_approval_key")]
    async fn fetch_approval_key(&self) -> Result<String, UpstreamError> {
        let url = format!("{}/oauth2/Approval", self.base_url);
        let body = json!({
            "grant_type": "client_credentials",
            "appkey": self.app_key,
            "secretkey": self.app_secret,
        });

        let payload = self.post_json(&url, &body).await?;
        payload
            .get("approval_key")
            .and_then(|v| v.as_str())
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string())
            .ok_or_else(|| UpstreamError::Payload("missing approval_key".into()))
    }

    // -------------------------------------------------------------------------
    // Shared request plumbing
    // -------------------------------------------------------------------------

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value, UpstreamError> {
        let response = self
            .client
            .post(url)
            .header("content-type", "application/json; charset=utf-8")
            .json(body)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Http {
                status: status.as_u16(),
                message,
            });
        }
        response.json().await.map_err(transport)
    }

    pub fn app_key(&self) -> &str {
        &self.app_key
    }

    pub fn app_secret(&self) -> &str {
        &self.app_secret
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }
}

#[async_trait]
impl QuoteRest for KisRestClient {
    async fn get_quote(&self, symbol: &str) -> Result<QuoteSnapshot, UpstreamError> {
        self.fetch_quote(symbol).await
    }
}

#[async_trait]
impl ApprovalKeyIssuer for KisRestClient {
    async fn issue_approval_key(&self) -> Result<String, UpstreamError> {
        self.fetch_approval_key().await
    }
}

impl std::fmt::Debug for KisRestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KisRestClient")
            .field("app_key", &"<redacted>")
            .field("app_secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

fn transport(err: reqwest::Error) -> UpstreamError {
    UpstreamError::Transport(err.to_string())
}

fn as_i64_lenient(value: &Value) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    value.as_str()?.parse().ok()
}

/// KIS numeric fields arrive as strings; absent or malformed values map to 0.
fn field_f64(output: &Value, key: &str) -> f64 {
    match output.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}
