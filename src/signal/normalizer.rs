// =============================================================================
// Signal Normalizer — raw feed records to canonical signals
// =============================================================================
//
// A pure function over one raw JSON record. Two wire shapes are accepted:
//
//   v2:     { signal_type, direction, confidence, symbol, timestamp (ISO-8601),
//             data: {...} }
//   legacy: { type, ts (unix seconds), symbol, data: {...} }
//
// Records outside the trading-relevant allow-list (iceberg_*, k_god_*, state,
// resonance) and records for a foreign symbol are rejected before any gate.
// Unknown direction/status tokens are logged and mapped to the neutral or
// default variant; a record is never dropped for an unknown token alone.
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::types::{Direction, IcebergLevel, KGodStatus, MarketState, SignalKind};

// TTLs per canonical kind, in seconds.
const TTL_ICEBERG_CONFIRMED: u64 = 60;
const TTL_ICEBERG_DETECTED: u64 = 45;
const TTL_STATE: u64 = 180;
const TTL_DEFAULT: u64 = 120;

const DEFAULT_CONFIDENCE: f64 = 50.0;

/// Canonical, immutable signal produced by normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub kind: SignalKind,
    pub direction: Direction,
    /// [0, 100]
    pub confidence: f64,
    /// [0, 1] when the producer supplied one; otherwise computed from the
    /// iceberg statistics at gate-evaluation time.
    pub confirm_ratio: Option<f64>,
    pub price: f64,
    pub volume: f64,
    pub timestamp_ms: i64,
    pub ttl_seconds: u64,
    pub symbol: String,
    pub iceberg_level: Option<IcebergLevel>,
    pub market_state: Option<MarketState>,
    pub k_god_status: Option<KGodStatus>,
}

impl Signal {
    /// Age of the signal in seconds at `now_ms`.
    pub fn age_s(&self, now_ms: i64) -> f64 {
        (now_ms - self.timestamp_ms).max(0) as f64 / 1000.0
    }

    /// Whether the kind-specific TTL has lapsed.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.age_s(now_ms) > self.ttl_seconds as f64
    }
}

/// Why a raw record was rejected before normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NotAnObject,
    SymbolMismatch,
    IrrelevantType,
    BadTimestamp,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAnObject => write!(f, "not a JSON object"),
            Self::SymbolMismatch => write!(f, "symbol mismatch"),
            Self::IrrelevantType => write!(f, "signal_type not trading-relevant"),
            Self::BadTimestamp => write!(f, "missing or unparseable timestamp"),
        }
    }
}

// -----------------------------------------------------------------------------
// Entry point
// -----------------------------------------------------------------------------

/// Normalize one raw record against the configured instrument.
pub fn normalize(raw: &Value, inst_id: &str) -> Result<Signal, RejectReason> {
    if !raw.is_object() {
        return Err(RejectReason::NotAnObject);
    }

    let symbol = raw
        .get("symbol")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if !symbol_matches(symbol, inst_id) {
        return Err(RejectReason::SymbolMismatch);
    }

    let signal_type = raw
        .get("signal_type")
        .or_else(|| raw.get("type"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_ascii_lowercase();

    let relevant = signal_type.starts_with("iceberg")
        || signal_type.starts_with("k_god")
        || signal_type == "state"
        || signal_type == "resonance";
    if !relevant {
        return Err(RejectReason::IrrelevantType);
    }

    let timestamp_ms = parse_timestamp_ms(raw).ok_or(RejectReason::BadTimestamp)?;

    let data = raw.get("data").cloned().unwrap_or_else(|| Value::Object(Default::default()));

    let mut direction = parse_direction(
        raw.get("direction")
            .or_else(|| data.get("direction"))
            .and_then(Value::as_str),
    );

    // Kind resolution.
    let mut iceberg_level = None;
    let mut market_state = None;
    let mut k_god_status = None;

    let kind = if signal_type.starts_with("iceberg") {
        let level = parse_iceberg_level(data.get("level").and_then(Value::as_str));
        iceberg_level = Some(level);
        match level {
            IcebergLevel::Confirmed => SignalKind::IcebergConfirmed,
            IcebergLevel::Activity => SignalKind::IcebergDetected,
        }
    } else if signal_type == "state" {
        let state = parse_market_state(data.get("market_state").and_then(Value::as_str));
        market_state = Some(state);
        // Direction for STATE signals is derived from the classification.
        direction = state.implied_direction();
        SignalKind::State
    } else if signal_type.starts_with("k_god") {
        // Producer regime annotations ride on the STATE kind.
        k_god_status = Some(parse_k_god(
            data.get("k_god_status")
                .or_else(|| data.get("status"))
                .and_then(Value::as_str),
        ));
        SignalKind::State
    } else {
        SignalKind::Resonance
    };

    // Iceberg records may also carry a producer regime annotation.
    if k_god_status.is_none() {
        if let Some(s) = data.get("k_god_status").and_then(Value::as_str) {
            k_god_status = Some(parse_k_god(Some(s)));
        }
    }

    let ttl_seconds = match kind {
        SignalKind::IcebergConfirmed => TTL_ICEBERG_CONFIRMED,
        SignalKind::IcebergDetected => TTL_ICEBERG_DETECTED,
        SignalKind::State => TTL_STATE,
        SignalKind::Resonance => TTL_DEFAULT,
    };

    let confidence = raw
        .get("confidence")
        .or_else(|| data.get("confidence"))
        .and_then(Value::as_f64)
        .unwrap_or(DEFAULT_CONFIDENCE)
        .clamp(0.0, 100.0);

    let confirm_ratio = data
        .get("confirm_ratio")
        .or_else(|| raw.get("confirm_ratio"))
        .and_then(Value::as_f64)
        .map(|r| r.clamp(0.0, 1.0));

    let price = data
        .get("price")
        .or_else(|| raw.get("price"))
        .and_then(as_lenient_f64)
        .unwrap_or(0.0);

    let volume = data
        .get("volume")
        .or_else(|| raw.get("volume"))
        .and_then(as_lenient_f64)
        .unwrap_or(0.0);

    let id = raw
        .get("id")
        .or_else(|| data.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    Ok(Signal {
        id,
        kind,
        direction,
        confidence,
        confirm_ratio,
        price,
        volume,
        timestamp_ms,
        ttl_seconds,
        symbol: symbol.to_string(),
        iceberg_level,
        market_state,
        k_god_status,
    })
}

// -----------------------------------------------------------------------------
// Field parsers
// -----------------------------------------------------------------------------

/// Extract a millisecond timestamp from either wire shape: `timestamp` as an
/// ISO-8601 string or unix seconds, or legacy `ts` as unix seconds.
pub fn parse_timestamp_ms(raw: &Value) -> Option<i64> {
    if let Some(ts) = raw.get("timestamp") {
        if let Some(s) = ts.as_str() {
            if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
                return Some(dt.timestamp_millis());
            }
            return None;
        }
        if let Some(secs) = ts.as_i64() {
            return Some(unix_to_ms(secs));
        }
    }
    if let Some(secs) = raw.get("ts").and_then(Value::as_i64) {
        return Some(unix_to_ms(secs));
    }
    None
}

/// Legacy producers wrote unix seconds; anything already over 10^12 is ms.
fn unix_to_ms(value: i64) -> i64 {
    if value >= 1_000_000_000_000 {
        value
    } else {
        value * 1000
    }
}

fn parse_direction(token: Option<&str>) -> Direction {
    match token.map(|t| t.to_ascii_lowercase()).as_deref() {
        Some("bullish") | Some("long") | Some("buy") => Direction::Long,
        Some("bearish") | Some("short") | Some("sell") => Direction::Short,
        Some("neutral") | None => Direction::Neutral,
        Some(other) => {
            // Legacy producers emitted CJK side tokens; keep the record but
            // do not guess the side.
            warn!(token = other, "unknown direction token — treating as neutral");
            Direction::Neutral
        }
    }
}

fn parse_iceberg_level(token: Option<&str>) -> IcebergLevel {
    match token.map(|t| t.to_ascii_lowercase()).as_deref() {
        Some("confirmed") => IcebergLevel::Confirmed,
        Some("activity") | None => IcebergLevel::Activity,
        Some(other) => {
            warn!(token = other, "unknown iceberg level — treating as activity");
            IcebergLevel::Activity
        }
    }
}

fn parse_market_state(token: Option<&str>) -> MarketState {
    match token.map(|t| t.to_ascii_lowercase()).as_deref() {
        Some("trend_up") => MarketState::TrendUp,
        Some("trend_down") => MarketState::TrendDown,
        Some("accumulating") => MarketState::Accumulating,
        Some("distributing") => MarketState::Distributing,
        Some("wash_accumulate") => MarketState::WashAccumulate,
        Some("trap_distribution") => MarketState::TrapDistribution,
        Some("neutral") | None => MarketState::Neutral,
        Some(other) => {
            warn!(token = other, "unknown market state — treating as neutral");
            MarketState::Neutral
        }
    }
}

fn parse_k_god(token: Option<&str>) -> KGodStatus {
    match token.map(|t| t.to_ascii_lowercase()).as_deref() {
        Some("normal") | None => KGodStatus::Normal,
        Some("caution") => KGodStatus::Caution,
        Some("no_entry") => KGodStatus::NoEntry,
        Some("no_entry_close") => KGodStatus::NoEntryClose,
        Some(other) => {
            warn!(token = other, "unknown k_god status — treating as normal");
            KGodStatus::Normal
        }
    }
}

/// Accept numbers serialized either natively or as strings.
fn as_lenient_f64(value: &Value) -> Option<f64> {
    if let Some(n) = value.as_f64() {
        return Some(n);
    }
    value.as_str().and_then(|s| s.parse().ok())
}

/// True when the record's symbol refers to the configured instrument. The
/// producer writes symbols in several spellings ("DOGE-USDT", "DOGEUSDT",
/// "DOGE-USDT-SWAP"); comparison happens on a separator-free uppercase form.
pub fn symbol_matches(record_symbol: &str, inst_id: &str) -> bool {
    let rec = canonical_symbol(record_symbol);
    if rec.is_empty() {
        return false;
    }
    let inst = canonical_symbol(inst_id);
    let base = inst.trim_end_matches("SWAP").to_string();
    rec == inst || rec == base || rec.starts_with(&base)
}

fn canonical_symbol(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_uppercase()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const INST: &str = "DOGE-USDT-SWAP";

    fn v2_record(signal_type: &str, direction: &str, data: Value) -> Value {
        json!({
            "signal_type": signal_type,
            "direction": direction,
            "confidence": 75.0,
            "symbol": "DOGE-USDT",
            "timestamp": "2025-06-01T10:00:00+00:00",
            "data": data,
        })
    }

    #[test]
    fn foreign_symbol_is_rejected() {
        let raw = v2_record("iceberg_confirmed", "bullish", json!({"level": "confirmed"}));
        let raw = {
            let mut r = raw;
            r["symbol"] = json!("BTC-USDT");
            r
        };
        assert_eq!(normalize(&raw, INST), Err(RejectReason::SymbolMismatch));
    }

    #[test]
    fn irrelevant_type_is_rejected() {
        let raw = v2_record("funding_rate", "bullish", json!({}));
        assert_eq!(normalize(&raw, INST), Err(RejectReason::IrrelevantType));
    }

    #[test]
    fn iceberg_confirmed_shape() {
        let raw = v2_record(
            "iceberg_signal",
            "bullish",
            json!({"level": "confirmed", "price": 0.128, "volume": 120000.0,
                   "confirm_ratio": 0.8, "k_god_status": "normal"}),
        );
        let sig = normalize(&raw, INST).unwrap();
        assert_eq!(sig.kind, SignalKind::IcebergConfirmed);
        assert_eq!(sig.direction, Direction::Long);
        assert_eq!(sig.iceberg_level, Some(IcebergLevel::Confirmed));
        assert_eq!(sig.ttl_seconds, 60);
        assert!((sig.confidence - 75.0).abs() < 1e-12);
        assert_eq!(sig.confirm_ratio, Some(0.8));
        assert!((sig.price - 0.128).abs() < 1e-12);
        assert_eq!(sig.k_god_status, Some(KGodStatus::Normal));
    }

    #[test]
    fn iceberg_activity_gets_detected_kind_and_ttl() {
        let raw = v2_record("iceberg_signal", "bearish", json!({"level": "activity"}));
        let sig = normalize(&raw, INST).unwrap();
        assert_eq!(sig.kind, SignalKind::IcebergDetected);
        assert_eq!(sig.direction, Direction::Short);
        assert_eq!(sig.ttl_seconds, 45);
    }

    #[test]
    fn state_direction_comes_from_classification() {
        // The record says bearish but the classification implies LONG.
        let raw = v2_record("state", "bearish", json!({"market_state": "wash_accumulate"}));
        let sig = normalize(&raw, INST).unwrap();
        assert_eq!(sig.kind, SignalKind::State);
        assert_eq!(sig.direction, Direction::Long);
        assert_eq!(sig.market_state, Some(MarketState::WashAccumulate));
        assert_eq!(sig.ttl_seconds, 180);
    }

    #[test]
    fn k_god_records_ride_the_state_kind() {
        let raw = v2_record("k_god_update", "bullish", json!({"k_god_status": "no_entry"}));
        let sig = normalize(&raw, INST).unwrap();
        assert_eq!(sig.kind, SignalKind::State);
        assert_eq!(sig.k_god_status, Some(KGodStatus::NoEntry));
        assert_eq!(sig.direction, Direction::Long);
    }

    #[test]
    fn legacy_shape_with_unix_seconds() {
        let raw = json!({
            "type": "iceberg_signal",
            "ts": 1_748_772_000,
            "symbol": "DOGEUSDT",
            "data": {"level": "confirmed", "direction": "bullish", "price": "0.128"}
        });
        let sig = normalize(&raw, INST).unwrap();
        assert_eq!(sig.timestamp_ms, 1_748_772_000_000);
        assert_eq!(sig.kind, SignalKind::IcebergConfirmed);
        assert_eq!(sig.direction, Direction::Long);
        // String-typed price is accepted.
        assert!((sig.price - 0.128).abs() < 1e-12);
        // Confidence defaults when absent.
        assert!((sig.confidence - 50.0).abs() < 1e-12);
    }

    #[test]
    fn missing_timestamp_is_rejected() {
        let raw = json!({
            "signal_type": "state",
            "symbol": "DOGE-USDT",
            "data": {"market_state": "trend_up"}
        });
        assert_eq!(normalize(&raw, INST), Err(RejectReason::BadTimestamp));
    }

    #[test]
    fn unknown_tokens_fall_back_instead_of_dropping() {
        let raw = v2_record("iceberg_signal", "买", json!({"level": "巨量"}));
        let sig = normalize(&raw, INST).unwrap();
        assert_eq!(sig.direction, Direction::Neutral);
        assert_eq!(sig.kind, SignalKind::IcebergDetected);
    }

    #[test]
    fn expiry_follows_kind_ttl() {
        let raw = v2_record("iceberg_signal", "bullish", json!({"level": "confirmed"}));
        let sig = normalize(&raw, INST).unwrap();
        let born = sig.timestamp_ms;
        assert!(!sig.is_expired(born + 59_000));
        assert!(sig.is_expired(born + 61_000));
    }

    #[test]
    fn symbol_matching_spellings() {
        assert!(symbol_matches("DOGE-USDT", INST));
        assert!(symbol_matches("DOGEUSDT", INST));
        assert!(symbol_matches("DOGE-USDT-SWAP", INST));
        assert!(symbol_matches("doge_usdt", INST));
        assert!(!symbol_matches("BTC-USDT", INST));
        assert!(!symbol_matches("", INST));
    }
}
