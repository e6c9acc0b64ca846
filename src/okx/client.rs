// =============================================================================
// OKX v5 REST API Client — HMAC-SHA256 signed requests
// =============================================================================
//
// Signing: base64(HMAC-SHA256(secret, timestamp || method || path || body))
// with the OK-ACCESS-* headers; the sandbox flag is the x-simulated-trading
// header. The secret and passphrase are never logged or serialized.
//
// Every v5 response wraps its payload in {code, msg, data}; code "0" is
// success. Errors surface the venue's code and message in the anyhow chain.
// =============================================================================

use anyhow::{Context, Result};
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_BASE_URL: &str = "https://www.okx.com";

// ---------------------------------------------------------------------------
// Payload types
// ---------------------------------------------------------------------------

/// Contract specification needed for sizing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Instrument {
    /// Coins per contract (ctVal).
    pub contract_face: f64,
    /// Contract size increment (lotSz).
    pub lot_size: f64,
    /// Minimum order size in contracts (minSz).
    pub min_size: f64,
}

/// One OHLCV candle, oldest-first once parsed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub ts_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Position as reported by the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub inst_id: String,
    /// "long" / "short" (net mode reports signed size as long).
    pub side: String,
    /// Contracts.
    pub size: f64,
    pub margin_mode: String,
    pub avg_entry_price: f64,
}

/// Equity snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountBalance {
    pub total_equity: f64,
    pub available: f64,
}

/// Margin mode ladder used when setting leverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginMode {
    Isolated,
    Cross,
    Cash,
}

impl MarginMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Isolated => "isolated",
            Self::Cross => "cross",
            Self::Cash => "cash",
        }
    }
}

impl std::fmt::Display for MarginMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

/// Market order request.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub inst_id: String,
    pub side: OrderSide,
    pub size_contracts: u64,
    pub margin_mode: MarginMode,
    pub reduce_only: bool,
}

/// Acknowledgement for a submitted order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// OKX v5 REST client with request signing.
#[derive(Clone)]
pub struct OkxClient {
    api_key: String,
    secret: String,
    passphrase: String,
    base_url: String,
    simulated: bool,
    client: reqwest::Client,
}

impl OkxClient {
    /// Create a new client. `simulated` routes to the demo-trading
    /// environment via the venue's header flag.
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        passphrase: impl Into<String>,
        simulated: bool,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(simulated, "OkxClient initialised (base_url={DEFAULT_BASE_URL})");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            passphrase: passphrase.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            simulated,
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// ISO-8601 millisecond timestamp in the form the venue requires.
    pub fn timestamp_iso() -> String {
        chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
    }

    /// base64(HMAC-SHA256(secret, timestamp || method || path || body)).
    pub fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> String {
        let prehash = format!("{timestamp}{method}{path}{body}");
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(prehash.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    fn signed_headers(&self, method: &str, path: &str, body: &str) -> HeaderMap {
        let timestamp = Self::timestamp_iso();
        let signature = self.sign(&timestamp, method, path, body);

        let mut headers = HeaderMap::new();
        let mut put = |name: &'static str, value: &str| {
            if let Ok(v) = HeaderValue::from_str(value) {
                headers.insert(name, v);
            }
        };
        put("OK-ACCESS-KEY", &self.api_key);
        put("OK-ACCESS-SIGN", &signature);
        put("OK-ACCESS-TIMESTAMP", &timestamp);
        put("OK-ACCESS-PASSPHRASE", &self.passphrase);
        put("Content-Type", "application/json");
        if self.simulated {
            put("x-simulated-trading", "1");
        }
        headers
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    /// GET a v5 endpoint and unwrap the `data` array. `signed` controls
    /// whether authentication headers are attached (market data is public).
    async fn get(&self, path: &str, signed: bool) -> Result<Vec<serde_json::Value>> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.get(&url);
        if signed {
            req = req.headers(self.signed_headers("GET", path, ""));
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        unwrap_envelope(path, status, body)
    }

    /// POST a v5 endpoint (always signed) and unwrap the `data` array.
    async fn post(&self, path: &str, payload: &serde_json::Value) -> Result<Vec<serde_json::Value>> {
        let body = payload.to_string();
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .post(&url)
            .headers(self.signed_headers("POST", path, &body))
            .body(body)
            .send()
            .await
            .with_context(|| format!("POST {path} request failed"))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        unwrap_envelope(path, status, body)
    }

    // -------------------------------------------------------------------------
    // Market data (public)
    // -------------------------------------------------------------------------

    /// GET /api/v5/public/instruments — contract spec for sizing.
    #[instrument(skip(self), name = "okx::get_instrument")]
    pub async fn get_instrument(&self, inst_id: &str) -> Result<Instrument> {
        let path = format!("/api/v5/public/instruments?instType=SWAP&instId={inst_id}");
        let data = self.get(&path, false).await?;
        let entry = data.first().context("instrument not found")?;

        Ok(Instrument {
            contract_face: field_f64(entry, "ctVal")?,
            lot_size: field_f64(entry, "lotSz")?,
            min_size: field_f64(entry, "minSz")?,
        })
    }

    /// GET /api/v5/market/ticker — last traded price.
    #[instrument(skip(self), name = "okx::get_ticker")]
    pub async fn get_ticker(&self, inst_id: &str) -> Result<f64> {
        let path = format!("/api/v5/market/ticker?instId={inst_id}");
        let data = self.get(&path, false).await?;
        let entry = data.first().context("ticker not found")?;
        field_f64(entry, "last")
    }

    /// GET /api/v5/market/candles — OHLCV series, returned oldest-first.
    ///
    /// The venue sends newest-first; the client reverses so that indicator
    /// code can treat the slice chronologically.
    #[instrument(skip(self), name = "okx::get_candles")]
    pub async fn get_candles(&self, inst_id: &str, bar: &str, limit: u32) -> Result<Vec<Candle>> {
        let path = format!("/api/v5/market/candles?instId={inst_id}&bar={bar}&limit={limit}");
        let data = self.get(&path, false).await?;

        let mut candles = Vec::with_capacity(data.len());
        for entry in &data {
            let arr = entry.as_array().context("candle entry is not an array")?;
            if arr.len() < 6 {
                warn!(elements = arr.len(), "skipping malformed candle entry");
                continue;
            }
            candles.push(Candle {
                ts_ms: value_f64(&arr[0])? as i64,
                open: value_f64(&arr[1])?,
                high: value_f64(&arr[2])?,
                low: value_f64(&arr[3])?,
                close: value_f64(&arr[4])?,
                volume: value_f64(&arr[5])?,
            });
        }
        candles.reverse();

        debug!(inst_id, bar, count = candles.len(), "candles fetched");
        Ok(candles)
    }

    // -------------------------------------------------------------------------
    // Account (signed)
    // -------------------------------------------------------------------------

    /// GET /api/v5/account/positions filtered to `inst_id`.
    #[instrument(skip(self), name = "okx::get_positions")]
    pub async fn get_positions(&self, inst_id: &str) -> Result<Vec<ExchangePosition>> {
        let path = format!("/api/v5/account/positions?instId={inst_id}");
        let data = self.get(&path, true).await?;

        let mut positions = Vec::new();
        for entry in &data {
            let size = field_f64(entry, "pos").unwrap_or(0.0);
            if size == 0.0 {
                continue;
            }
            // Net mode leaves posSide as "net"; the sign of pos carries the
            // direction in that case.
            let reported = entry.get("posSide").and_then(|v| v.as_str()).unwrap_or("net");
            let side = match reported {
                "long" | "short" => reported.to_string(),
                _ if size < 0.0 => "short".to_string(),
                _ => "long".to_string(),
            };
            positions.push(ExchangePosition {
                inst_id: entry
                    .get("instId")
                    .and_then(|v| v.as_str())
                    .unwrap_or(inst_id)
                    .to_string(),
                side,
                size: size.abs(),
                margin_mode: entry
                    .get("mgnMode")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                avg_entry_price: field_f64(entry, "avgPx").unwrap_or(0.0),
            });
        }

        debug!(inst_id, count = positions.len(), "positions fetched");
        Ok(positions)
    }

    /// GET /api/v5/account/balance — USDT equity.
    #[instrument(skip(self), name = "okx::get_account_balance")]
    pub async fn get_account_balance(&self) -> Result<AccountBalance> {
        let path = "/api/v5/account/balance?ccy=USDT";
        let data = self.get(path, true).await?;
        let entry = data.first().context("balance payload empty")?;

        let total_equity = field_f64(entry, "totalEq")?;
        let available = entry
            .get("details")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|d| field_f64(d, "availEq").ok())
            .unwrap_or(total_equity);

        Ok(AccountBalance {
            total_equity,
            available,
        })
    }

    /// POST /api/v5/account/set-leverage.
    #[instrument(skip(self), name = "okx::set_leverage")]
    pub async fn set_leverage(
        &self,
        inst_id: &str,
        leverage: u8,
        margin_mode: MarginMode,
    ) -> Result<()> {
        let payload = serde_json::json!({
            "instId": inst_id,
            "lever": leverage.to_string(),
            "mgnMode": margin_mode.as_str(),
        });
        self.post("/api/v5/account/set-leverage", &payload).await?;
        debug!(inst_id, leverage, margin_mode = %margin_mode, "leverage set");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Orders (signed)
    // -------------------------------------------------------------------------

    /// POST /api/v5/trade/order — market order.
    #[instrument(skip(self, request), name = "okx::place_market_order")]
    pub async fn place_market_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let payload = serde_json::json!({
            "instId": request.inst_id,
            "tdMode": request.margin_mode.as_str(),
            "side": request.side.as_str(),
            "ordType": "market",
            "sz": request.size_contracts.to_string(),
            "reduceOnly": request.reduce_only,
        });

        debug!(
            inst_id = %request.inst_id,
            side = request.side.as_str(),
            size = request.size_contracts,
            reduce_only = request.reduce_only,
            "placing market order"
        );

        let data = self.post("/api/v5/trade/order", &payload).await?;
        let entry = data.first().context("order response payload empty")?;

        // Per-order status rides inside the data array.
        let s_code = entry.get("sCode").and_then(|v| v.as_str()).unwrap_or("0");
        if s_code != "0" {
            let s_msg = entry.get("sMsg").and_then(|v| v.as_str()).unwrap_or("");
            anyhow::bail!("order rejected by venue: sCode={s_code} sMsg={s_msg}");
        }

        let order_id = entry
            .get("ordId")
            .and_then(|v| v.as_str())
            .context("order response missing ordId")?
            .to_string();

        debug!(order_id = %order_id, "market order accepted");
        Ok(OrderAck { order_id })
    }

    /// POST /api/v5/trade/close-position — venue-side full close.
    #[instrument(skip(self), name = "okx::close_position")]
    pub async fn close_position(&self, inst_id: &str, margin_mode: MarginMode) -> Result<()> {
        let payload = serde_json::json!({
            "instId": inst_id,
            "mgnMode": margin_mode.as_str(),
        });
        self.post("/api/v5/trade/close-position", &payload).await?;
        debug!(inst_id, "close-position accepted");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Envelope / parse helpers
// ---------------------------------------------------------------------------

/// Validate the HTTP status and the v5 {code, msg, data} envelope.
fn unwrap_envelope(
    path: &str,
    status: reqwest::StatusCode,
    body: serde_json::Value,
) -> Result<Vec<serde_json::Value>> {
    if !status.is_success() {
        anyhow::bail!("{path} returned HTTP {status}: {body}");
    }

    let code = body.get("code").and_then(|v| v.as_str()).unwrap_or("");
    if code != "0" {
        let msg = body.get("msg").and_then(|v| v.as_str()).unwrap_or("");
        anyhow::bail!("{path} returned code={code} msg={msg}");
    }

    Ok(body
        .get("data")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default())
}

/// The venue serialises numbers as strings; accept both.
fn value_f64(value: &serde_json::Value) -> Result<f64> {
    if let Some(s) = value.as_str() {
        return s
            .parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"));
    }
    value
        .as_f64()
        .with_context(|| format!("expected string or number, got: {value}"))
}

fn field_f64(entry: &serde_json::Value, key: &str) -> Result<f64> {
    let value = entry
        .get(key)
        .with_context(|| format!("response missing '{key}'"))?;
    value_f64(value)
}

impl std::fmt::Debug for OkxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OkxClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("simulated", &self.simulated)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> OkxClient {
        OkxClient::new("key-id", "hush-hush-secret", "hush-passphrase", true)
    }

    #[test]
    fn signature_is_stable_and_base64() {
        let c = client();
        let sig = c.sign("2025-06-01T10:00:00.000Z", "GET", "/api/v5/account/balance", "");
        let again = c.sign("2025-06-01T10:00:00.000Z", "GET", "/api/v5/account/balance", "");
        assert_eq!(sig, again);
        assert!(base64::engine::general_purpose::STANDARD.decode(&sig).is_ok());

        // Any prehash component changes the signature.
        let other = c.sign("2025-06-01T10:00:00.001Z", "GET", "/api/v5/account/balance", "");
        assert_ne!(sig, other);
    }

    #[test]
    fn envelope_rejects_nonzero_code() {
        let body = json!({"code": "50011", "msg": "rate limit", "data": []});
        let err = unwrap_envelope("/x", reqwest::StatusCode::OK, body).unwrap_err();
        assert!(err.to_string().contains("50011"));
    }

    #[test]
    fn envelope_unwraps_data() {
        let body = json!({"code": "0", "msg": "", "data": [{"last": "0.128"}]});
        let data = unwrap_envelope("/x", reqwest::StatusCode::OK, body).unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(field_f64(&data[0], "last").unwrap(), 0.128);
    }

    #[test]
    fn lenient_numbers_parse_both_forms() {
        assert_eq!(value_f64(&json!("1.5")).unwrap(), 1.5);
        assert_eq!(value_f64(&json!(2.5)).unwrap(), 2.5);
        assert!(value_f64(&json!(null)).is_err());
    }

    #[test]
    fn debug_redacts_credentials() {
        let repr = format!("{:?}", client());
        assert!(repr.contains("<redacted>"));
        assert!(!repr.contains("hush-hush-secret"));
        assert!(!repr.contains("hush-passphrase"));
    }

    #[test]
    fn timestamp_matches_venue_format() {
        let ts = OkxClient::timestamp_iso();
        // e.g. 2025-06-01T10:00:00.123Z
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), 24);
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }
}
