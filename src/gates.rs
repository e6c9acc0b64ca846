// =============================================================================
// Three-Gate Admission Filter
// =============================================================================
//
// Stateless check run against every normalized signal:
//
//   Gate 1 — signal validity. Main channel (confidence >= 50) or the
//            exception channel (confidence >= 40 AND confirm ratio > 0.75 AND
//            kind == ICEBERG_CONFIRMED AND age < 30 s), then the kind TTL.
//   Gate 2 — execution feasibility. Reserved hook for order-book slippage and
//            liquidity checks; the baseline passes when a price exists.
//   Gate 3 — environment. Market context must allow trading, the risk mode
//            must not be paused, and the feed heartbeat must be RUNNING.
//            These clauses scope entries only; exit-intent signals are not
//            blocked from reducing risk.
// =============================================================================

use crate::context::{MarketContext, RiskMode};
use crate::runtime_config::GateThresholds;
use crate::signal::{FeedState, Signal};
use crate::types::SignalKind;

/// What the caller intends to do with an admitted signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateIntent {
    /// The signal may open a position; all three gates apply fully.
    Entry,
    /// The signal may only reduce or close exposure; the environment gate's
    /// entry-scoped clauses are skipped.
    Exit,
}

/// Which gate rejected the signal and why.
#[derive(Debug, Clone, PartialEq)]
pub enum GateRejection {
    Signal(String),
    Execution(String),
    Environment(String),
}

impl GateRejection {
    pub fn gate_name(&self) -> &'static str {
        match self {
            Self::Signal(_) => "signal",
            Self::Execution(_) => "execution",
            Self::Environment(_) => "environment",
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Signal(r) | Self::Execution(r) | Self::Environment(r) => r,
        }
    }
}

impl std::fmt::Display for GateRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gate {}: {}", self.gate_name(), self.reason())
    }
}

/// Everything the gates need beyond the signal itself.
pub struct GateInputs<'a> {
    pub thresholds: &'a GateThresholds,
    pub context: &'a MarketContext,
    pub heartbeat: FeedState,
    /// Current mark price, if the ring has one.
    pub current_price: Option<f64>,
    /// Confirm ratio from the iceberg statistics, used when the signal does
    /// not carry its own.
    pub confirm_ratio_fallback: f64,
    pub intent: GateIntent,
    pub now_ms: i64,
}

/// Run all three gates in order. `Ok(())` admits the signal.
pub fn evaluate(signal: &Signal, inputs: &GateInputs<'_>) -> Result<(), GateRejection> {
    gate_signal(signal, inputs)?;
    gate_execution(inputs)?;
    gate_environment(inputs)?;
    Ok(())
}

// -----------------------------------------------------------------------------
// Gate 1 — signal validity
// -----------------------------------------------------------------------------

fn gate_signal(signal: &Signal, inputs: &GateInputs<'_>) -> Result<(), GateRejection> {
    let t = inputs.thresholds;
    let age_s = signal.age_s(inputs.now_ms);
    let confirm_ratio = signal.confirm_ratio.unwrap_or(inputs.confirm_ratio_fallback);

    let main = signal.confidence >= t.main_confidence;

    // The exception channel admits lower confidence only for fresh,
    // confirmed icebergs with strong buy confirmation.
    let exception = signal.confidence >= t.exception_confidence
        && confirm_ratio > t.exception_confirm_ratio
        && signal.kind == SignalKind::IcebergConfirmed
        && age_s < t.exception_age_s as f64;

    if !main && !exception {
        return Err(GateRejection::Signal(format!(
            "confidence {:.0} below both channels (ratio {:.2}, age {:.0}s)",
            signal.confidence, confirm_ratio, age_s
        )));
    }

    if signal.is_expired(inputs.now_ms) {
        return Err(GateRejection::Signal(format!(
            "expired: age {:.0}s > ttl {}s",
            age_s, signal.ttl_seconds
        )));
    }

    Ok(())
}

// -----------------------------------------------------------------------------
// Gate 2 — execution feasibility
// -----------------------------------------------------------------------------

fn gate_execution(inputs: &GateInputs<'_>) -> Result<(), GateRejection> {
    // TODO: wire the order-book snapshot in here for spread/slippage checks
    // once the depth endpoint is polled; for now a live price is the bar.
    match inputs.current_price {
        Some(price) if price > 0.0 => Ok(()),
        _ => Err(GateRejection::Execution("no current price".to_string())),
    }
}

// -----------------------------------------------------------------------------
// Gate 3 — environment
// -----------------------------------------------------------------------------

fn gate_environment(inputs: &GateInputs<'_>) -> Result<(), GateRejection> {
    if inputs.intent == GateIntent::Exit {
        // Risk reduction is never blocked by posture.
        return Ok(());
    }

    if !inputs.context.trade_allowed {
        return Err(GateRejection::Environment(
            "market context disallows trading".to_string(),
        ));
    }
    if inputs.context.risk_mode == RiskMode::Paused {
        return Err(GateRejection::Environment("risk mode is paused".to_string()));
    }
    if inputs.heartbeat != FeedState::Running {
        return Err(GateRejection::Environment(format!(
            "feed heartbeat is {}, not RUNNING",
            inputs.heartbeat
        )));
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Regime, TrendBias};
    use crate::types::Direction;

    const T0: i64 = 1_700_000_000_000;

    fn permissive_context() -> MarketContext {
        MarketContext {
            trend_bias: TrendBias::Neutral,
            regime: Regime::Range,
            risk_mode: RiskMode::Normal,
            allowed_leverage_max: 3,
            position_cap_pct: 10.0,
            trade_allowed: true,
            ema_trend: 0.0,
            rsi: 50.0,
            updated_at: T0,
        }
    }

    fn sig(kind: SignalKind, confidence: f64, confirm_ratio: Option<f64>, age_s: i64) -> Signal {
        Signal {
            id: "t".into(),
            kind,
            direction: Direction::Long,
            confidence,
            confirm_ratio,
            price: 0.128,
            volume: 0.0,
            timestamp_ms: T0 - age_s * 1000,
            ttl_seconds: match kind {
                SignalKind::IcebergConfirmed => 60,
                SignalKind::IcebergDetected => 45,
                SignalKind::State => 180,
                SignalKind::Resonance => 120,
            },
            symbol: "DOGE-USDT".into(),
            iceberg_level: None,
            market_state: None,
            k_god_status: None,
        }
    }

    fn inputs<'a>(
        thresholds: &'a GateThresholds,
        context: &'a MarketContext,
        heartbeat: FeedState,
    ) -> GateInputs<'a> {
        GateInputs {
            thresholds,
            context,
            heartbeat,
            current_price: Some(0.128),
            confirm_ratio_fallback: 0.5,
            intent: GateIntent::Entry,
            now_ms: T0,
        }
    }

    #[test]
    fn main_channel_admits_confident_signal() {
        let t = GateThresholds::default();
        let ctx = permissive_context();
        let inp = inputs(&t, &ctx, FeedState::Running);
        let s = sig(SignalKind::IcebergConfirmed, 75.0, Some(0.8), 10);
        assert!(evaluate(&s, &inp).is_ok());
    }

    #[test]
    fn below_both_channels_is_rejected() {
        let t = GateThresholds::default();
        let ctx = permissive_context();
        let inp = inputs(&t, &ctx, FeedState::Running);
        let s = sig(SignalKind::IcebergConfirmed, 39.0, Some(0.9), 5);
        let err = evaluate(&s, &inp).unwrap_err();
        assert_eq!(err.gate_name(), "signal");
    }

    #[test]
    fn exception_channel_admits_fresh_confirmed_iceberg() {
        let t = GateThresholds::default();
        let ctx = permissive_context();
        let inp = inputs(&t, &ctx, FeedState::Running);

        // confidence 45, ratio 0.80, confirmed, 10 s old: admitted.
        let s = sig(SignalKind::IcebergConfirmed, 45.0, Some(0.80), 10);
        assert!(evaluate(&s, &inp).is_ok());

        // Same but ratio 0.70: rejected.
        let s = sig(SignalKind::IcebergConfirmed, 45.0, Some(0.70), 10);
        assert!(evaluate(&s, &inp).is_err());
    }

    #[test]
    fn exception_channel_is_confirmed_only() {
        let t = GateThresholds::default();
        let ctx = permissive_context();
        let inp = inputs(&t, &ctx, FeedState::Running);
        let s = sig(SignalKind::IcebergDetected, 45.0, Some(0.9), 5);
        assert!(evaluate(&s, &inp).is_err());
    }

    #[test]
    fn exception_channel_requires_freshness() {
        let t = GateThresholds::default();
        let ctx = permissive_context();
        let inp = inputs(&t, &ctx, FeedState::Running);
        let s = sig(SignalKind::IcebergConfirmed, 45.0, Some(0.9), 35);
        assert!(evaluate(&s, &inp).is_err());
    }

    #[test]
    fn fallback_confirm_ratio_feeds_the_exception_channel() {
        let t = GateThresholds::default();
        let ctx = permissive_context();
        let mut inp = inputs(&t, &ctx, FeedState::Running);
        inp.confirm_ratio_fallback = 0.9;
        let s = sig(SignalKind::IcebergConfirmed, 45.0, None, 10);
        assert!(evaluate(&s, &inp).is_ok());
    }

    #[test]
    fn expired_signal_is_rejected_even_when_confident() {
        let t = GateThresholds::default();
        let ctx = permissive_context();
        let inp = inputs(&t, &ctx, FeedState::Running);
        let s = sig(SignalKind::IcebergConfirmed, 95.0, Some(0.8), 61);
        let err = evaluate(&s, &inp).unwrap_err();
        assert!(err.reason().contains("expired"));
    }

    #[test]
    fn missing_price_fails_the_execution_gate() {
        let t = GateThresholds::default();
        let ctx = permissive_context();
        let mut inp = inputs(&t, &ctx, FeedState::Running);
        inp.current_price = None;
        let s = sig(SignalKind::IcebergConfirmed, 75.0, Some(0.8), 10);
        assert_eq!(evaluate(&s, &inp).unwrap_err().gate_name(), "execution");
    }

    #[test]
    fn environment_gate_requires_running_heartbeat() {
        let t = GateThresholds::default();
        let ctx = permissive_context();
        for state in [FeedState::Paused, FeedState::Cooldown, FeedState::Error] {
            let inp = inputs(&t, &ctx, state);
            let s = sig(SignalKind::IcebergConfirmed, 75.0, Some(0.8), 10);
            assert_eq!(evaluate(&s, &inp).unwrap_err().gate_name(), "environment");
        }
    }

    #[test]
    fn environment_gate_respects_context() {
        let t = GateThresholds::default();
        let s = sig(SignalKind::IcebergConfirmed, 75.0, Some(0.8), 10);

        let mut ctx = permissive_context();
        ctx.trade_allowed = false;
        let inp = inputs(&t, &ctx, FeedState::Running);
        assert_eq!(evaluate(&s, &inp).unwrap_err().gate_name(), "environment");

        let mut ctx = permissive_context();
        ctx.risk_mode = RiskMode::Paused;
        ctx.trade_allowed = true;
        let inp = inputs(&t, &ctx, FeedState::Running);
        assert_eq!(evaluate(&s, &inp).unwrap_err().gate_name(), "environment");
    }

    #[test]
    fn exit_intent_skips_the_environment_gate() {
        let t = GateThresholds::default();
        let mut ctx = permissive_context();
        ctx.trade_allowed = false;
        ctx.risk_mode = RiskMode::Paused;
        let mut inp = inputs(&t, &ctx, FeedState::Paused);
        inp.intent = GateIntent::Exit;
        let s = sig(SignalKind::IcebergConfirmed, 92.0, Some(0.8), 10);
        assert!(evaluate(&s, &inp).is_ok());
    }
}
