// =============================================================================
// Market Context — periodically refreshed regime and risk posture
// =============================================================================
//
// Classification ladder (first match wins), computed from 5-minute candles:
//
//   1. HIGH_VOL — stdev of per-bar returns above the volatility threshold
//   2. LOW_LIQ  — recent volume collapsed versus the series average
//   3. TREND    — EMA20/EMA60 spread wide enough to call a direction
//   4. RANGE    — everything else
//
// The resulting snapshot is published copy-on-write: readers clone an
// `Arc<MarketContext>` and never block the refresher.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::indicators::{ema_last, rsi};
use crate::okx::Candle;

/// Per-bar return stdev (in %) above which the regime is HIGH_VOL.
const HIGH_VOL_RETURN_STDEV_PCT: f64 = 0.8;
/// Recent/average volume ratio below which the regime is LOW_LIQ.
const LOW_LIQ_VOLUME_RATIO: f64 = 0.2;
/// EMA20/EMA60 relative spread that qualifies as a trend.
const TREND_EMA_SPREAD: f64 = 0.004;
/// Relative EMA spread below which the bias stays neutral.
const BIAS_DEADBAND: f64 = 0.001;
/// RSI extremes that demote the risk mode to cautious.
const RSI_HOT: f64 = 75.0;
const RSI_COLD: f64 = 25.0;
/// Return stdev beyond which trading pauses outright.
const PAUSE_RETURN_STDEV_PCT: f64 = 1.6;

/// Directional lean of the market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendBias {
    Bullish,
    Bearish,
    Neutral,
}

/// Coarse market regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    Trend,
    Range,
    HighVol,
    LowLiq,
}

/// Engine-wide risk posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskMode {
    Normal,
    Cautious,
    Paused,
}

/// Immutable context snapshot consulted by the gates and the executor.
#[derive(Debug, Clone, Serialize)]
pub struct MarketContext {
    pub trend_bias: TrendBias,
    pub regime: Regime,
    pub risk_mode: RiskMode,
    /// Leverage ceiling for new entries.
    pub allowed_leverage_max: u8,
    /// Position size ceiling as a percentage of equity, [0, 10].
    pub position_cap_pct: f64,
    pub trade_allowed: bool,
    pub ema_trend: f64,
    pub rsi: f64,
    /// Millisecond timestamp of the refresh that produced this snapshot.
    pub updated_at: i64,
}

impl MarketContext {
    /// Boot default: nothing is known yet, so entries stay disabled until the
    /// first successful refresh replaces this snapshot.
    pub fn unknown() -> Self {
        Self {
            trend_bias: TrendBias::Neutral,
            regime: Regime::Range,
            risk_mode: RiskMode::Cautious,
            allowed_leverage_max: 2,
            position_cap_pct: 3.0,
            trade_allowed: false,
            ema_trend: 0.0,
            rsi: 50.0,
            updated_at: 0,
        }
    }

    /// Compact form for the status surface.
    pub fn summary(&self) -> String {
        format!(
            "{:?}/{:?} risk={:?} lev<={} cap={:.0}% trade_allowed={}",
            self.trend_bias,
            self.regime,
            self.risk_mode,
            self.allowed_leverage_max,
            self.position_cap_pct,
            self.trade_allowed
        )
    }
}

// -----------------------------------------------------------------------------
// Copy-on-write publication
// -----------------------------------------------------------------------------

/// Shared handle holding the current context snapshot.
pub struct ContextHandle {
    current: RwLock<Arc<MarketContext>>,
}

impl ContextHandle {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(MarketContext::unknown())),
        }
    }

    /// Cheap snapshot; the Arc is cloned, never the payload.
    pub fn snapshot(&self) -> Arc<MarketContext> {
        self.current.read().clone()
    }

    /// Swap in a freshly computed context.
    pub fn publish(&self, ctx: MarketContext) {
        info!(summary = %ctx.summary(), "market context refreshed");
        *self.current.write() = Arc::new(ctx);
    }
}

impl Default for ContextHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandle")
            .field("current", &self.snapshot().summary())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Classification
// -----------------------------------------------------------------------------

/// Classify a 5-minute candle series into a context snapshot.
///
/// Needs at least 61 candles (EMA60 plus one). Shorter input returns `None`
/// and the previous snapshot stays live.
pub fn classify(candles: &[Candle], now_ms: i64) -> Option<MarketContext> {
    if candles.len() < 61 {
        debug!(len = candles.len(), "not enough candles for context refresh");
        return None;
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();

    let ema20 = ema_last(&closes, 20)?;
    let ema60 = ema_last(&closes, 60)?;
    let rsi14 = rsi(&closes, 14).unwrap_or(50.0);

    // Per-bar percentage returns over the most recent 50 bars.
    let tail = &closes[closes.len() - 51..];
    let returns: Vec<f64> = tail
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0] * 100.0)
        .collect();
    let return_stdev = stdev(&returns);

    // Recent volume (last 12 bars = one hour) versus the series average.
    let avg_volume = volumes.iter().sum::<f64>() / volumes.len() as f64;
    let recent_volume =
        volumes[volumes.len() - 12..].iter().sum::<f64>() / 12.0;
    let volume_ratio = if avg_volume > 0.0 {
        recent_volume / avg_volume
    } else {
        1.0
    };

    let ema_spread = if ema60 > 0.0 { (ema20 - ema60) / ema60 } else { 0.0 };

    let trend_bias = if ema_spread > BIAS_DEADBAND {
        TrendBias::Bullish
    } else if ema_spread < -BIAS_DEADBAND {
        TrendBias::Bearish
    } else {
        TrendBias::Neutral
    };

    let regime = if return_stdev >= HIGH_VOL_RETURN_STDEV_PCT {
        Regime::HighVol
    } else if volume_ratio < LOW_LIQ_VOLUME_RATIO {
        Regime::LowLiq
    } else if ema_spread.abs() >= TREND_EMA_SPREAD {
        Regime::Trend
    } else {
        Regime::Range
    };

    let risk_mode = if return_stdev >= PAUSE_RETURN_STDEV_PCT {
        RiskMode::Paused
    } else if regime == Regime::HighVol || rsi14 >= RSI_HOT || rsi14 <= RSI_COLD {
        RiskMode::Cautious
    } else {
        RiskMode::Normal
    };

    let allowed_leverage_max = match (risk_mode, regime, trend_bias) {
        (RiskMode::Normal, Regime::Trend, TrendBias::Bullish) => 5,
        (RiskMode::Normal, _, _) => 3,
        _ => 2,
    };

    let position_cap_pct = match risk_mode {
        RiskMode::Normal => 10.0,
        RiskMode::Cautious => 5.0,
        RiskMode::Paused => 0.0,
    };

    // FIXME: the hour-of-day liquidity screen is disabled — it misfired on
    // UTC versus exchange-local sessions; keep returning false until the
    // session table is rebuilt from actual fill data.
    let low_liq_hour = is_low_liquidity_hour();

    let trade_allowed =
        risk_mode != RiskMode::Paused && regime != Regime::LowLiq && !low_liq_hour;

    Some(MarketContext {
        trend_bias,
        regime,
        risk_mode,
        allowed_leverage_max,
        position_cap_pct,
        trade_allowed,
        ema_trend: ema_spread,
        rsi: rsi14,
        updated_at: now_ms,
    })
}

/// Hour-of-day liquidity screen. Permanently off, see the call site.
fn is_low_liquidity_hour() -> bool {
    false
}

// -----------------------------------------------------------------------------
// Refresh task
// -----------------------------------------------------------------------------

/// Refresh cadence.
const REFRESH_INTERVAL_SECS: u64 = 15 * 60;

/// Background task: refresh the context every 15 minutes, or immediately when
/// the analysis trigger fires (the control surface's trigger-analysis
/// command).
pub async fn run_context_loop(
    state: std::sync::Arc<crate::app_state::AppState>,
    client: std::sync::Arc<crate::okx::OkxClient>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    info!(interval_s = REFRESH_INTERVAL_SECS, "market context loop started");
    let mut ticker =
        tokio::time::interval(tokio::time::Duration::from_secs(REFRESH_INTERVAL_SECS));

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = state.analysis_trigger.notified() => {
                info!("context refresh triggered out of cycle");
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("market context loop stopping");
                    return;
                }
            }
        }

        if !state.budget.try_request() {
            continue;
        }
        match client.get_candles(&state.config.inst_id, "5m", 100).await {
            Ok(candles) => {
                let now_ms = chrono::Utc::now().timestamp_millis();
                if let Some(ctx) = classify(&candles, now_ms) {
                    state.context.publish(ctx);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "context refresh failed — keeping previous snapshot");
                state.push_error(format!("context refresh failed: {e}"));
            }
        }
    }
}

fn stdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}
