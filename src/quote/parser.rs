// =============================================================================
// Streaming payload normalization — KIS tick frames to QuoteSnapshot
// =============================================================================
//
// Frames arrive either as textual JSON or as an already-decoded object, with
// provider field names that vary by transaction id. Extraction is
// alias-tolerant and prefers the nested `body.output` object when present.
//
// Control/ACK frames carry neither symbol nor price; they surface as
// `MissingSymbol`/`MissingPrice` so the caller can skip them without treating
// the stream as broken.
// =============================================================================

use serde_json::Value;

use crate::types::{QuoteSnapshot, QuoteSource, QuoteState};

const SYMBOL_ALIASES: [&str; 5] = [
    "symbol",
    "fid_input_iscd",
    "stck_shrn_iscd",
    "mksc_shrn_iscd",
    "code",
];
const PRICE_ALIASES: [&str; 3] = ["price", "stck_prpr", "last_price"];
const CHANGE_PCT_ALIASES: [&str; 3] = ["change_pct", "prdy_ctrt", "chg_rate"];
const TURNOVER_ALIASES: [&str; 3] = ["turnover", "acml_tr_pbmn", "acc_trade_value"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("MISSING_SYMBOL")]
    MissingSymbol,
    #[error("MISSING_PRICE")]
    MissingPrice,
    #[error("payload must be a JSON object")]
    InvalidPayload,
}

impl ParseError {
    /// Control/ACK frames are skipped, not fatal.
    pub fn is_control_frame(&self) -> bool {
        matches!(self, Self::MissingSymbol | Self::MissingPrice)
    }
}

/// Parse a textual frame.
pub fn parse_message(payload: &str, now: i64) -> Result<QuoteSnapshot, ParseError> {
    let decoded: Value = serde_json::from_str(payload).map_err(|_| ParseError::InvalidPayload)?;
    parse_value(&decoded, now)
}

/// Parse an already-decoded frame.
pub fn parse_value(raw: &Value, now: i64) -> Result<QuoteSnapshot, ParseError> {
    let obj = raw.as_object().ok_or(ParseError::InvalidPayload)?;

    // Prefer the nested body.output object when the frame carries one.
    let fields = obj
        .get("body")
        .and_then(|b| b.get("output"))
        .and_then(|o| o.as_object())
        .unwrap_or(obj);

    let symbol = first_string(fields, &SYMBOL_ALIASES).ok_or(ParseError::MissingSymbol)?;
    let price =
        first_numeric(fields, &PRICE_ALIASES).ok_or(ParseError::MissingPrice)?;
    let change_pct = first_numeric(fields, &CHANGE_PCT_ALIASES).unwrap_or(0.0);
    let turnover = first_numeric(fields, &TURNOVER_ALIASES).unwrap_or(0.0);

    let source = fields
        .get("source")
        .and_then(|v| v.as_str())
        .and_then(parse_source)
        .unwrap_or(QuoteSource::KisWs);

    let ts = fields
        .get("ts")
        .and_then(as_i64_lenient)
        .unwrap_or(now);

    Ok(QuoteSnapshot {
        symbol,
        price,
        change_pct,
        turnover,
        source,
        ts,
        freshness_sec: 0.0,
        state: QuoteState::Healthy,
    })
}

fn parse_source(value: &str) -> Option<QuoteSource> {
    match value {
        "kis-ws" => Some(QuoteSource::KisWs),
        "kis-rest" => Some(QuoteSource::KisRest),
        "demo" => Some(QuoteSource::Demo),
        _ => None,
    }
}

/// First alias present as a non-empty string.
fn first_string(obj: &serde_json::Map<String, Value>, aliases: &[&str]) -> Option<String> {
    for key in aliases {
        if let Some(s) = obj.get(*key).and_then(|v| v.as_str()) {
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }
    None
}

/// First alias present as a number or numeric string.
fn first_numeric(obj: &serde_json::Map<String, Value>, aliases: &[&str]) -> Option<f64> {
    for key in aliases {
        if let Some(value) = obj.get(*key) {
            if let Some(n) = as_f64_lenient(value) {
                return Some(n);
            }
        }
    }
    None
}

fn as_f64_lenient(value: &Value) -> Option<f64> {
    if let Some(n) = value.as_f64() {
        return Some(n);
    }
    value.as_str().filter(|s| !s.is_empty())?.parse().ok()
}

fn as_i64_lenient(value: &Value) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    value.as_str().filter(|s| !s.is_empty())?.parse().ok()
}
