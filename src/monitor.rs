// =============================================================================
// Monitor Loops — periodic price, stop, trailing, and reconciliation duties
// =============================================================================
//
// Two background tasks live here:
//
//   run_monitor_loop      — every 5 s: fetch the mark price into the ring,
//                           refresh the candle EMA source, mark paper shorts,
//                           run hard-stop / trailing / stop-price checks on a
//                           live long, and reconcile against the venue at
//                           least every 60 s.
//   run_observation_loop  — every 1 s: drive the feed heartbeat and evaluate
//                           the observation buffer; a confirmed rebound is
//                           handed to the executor.
//
// Monitor-originated stops are never suppressed by anti-jitter; that window
// only applies to bearish-signal closes in the decision task.
// =============================================================================

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::execution::{ExecutionEngine, ExecutionResult};
use crate::observation::ObservationTick;
use crate::okx::OkxClient;
use crate::position::{StopCheck, SyncOutcome};
use crate::types::{PositionSide, TradeAction};

/// Monitor cadence.
const MONITOR_INTERVAL_SECS: u64 = 5;
/// Reconcile every N monitor ticks (12 * 5 s = 60 s).
const RECONCILE_EVERY_TICKS: u64 = 12;

// -----------------------------------------------------------------------------
// 5-second monitor
// -----------------------------------------------------------------------------

pub async fn run_monitor_loop(
    state: Arc<AppState>,
    client: Arc<OkxClient>,
    exec: Arc<ExecutionEngine>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = MONITOR_INTERVAL_SECS, "monitor loop started");
    let mut ticker = interval(Duration::from_secs(MONITOR_INTERVAL_SECS));
    let mut tick: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("monitor loop stopping");
                    return;
                }
            }
        }
        tick += 1;
        let now_ms = chrono::Utc::now().timestamp_millis();

        // ── 1. Mark price into the ring ─────────────────────────────────
        let price = fetch_price(&state, &client, now_ms).await;

        // ── 2. Candle source for EMA20 ──────────────────────────────────
        refresh_candles(&state, &client).await;

        // ── 3. Paper shorts ─────────────────────────────────────────────
        if let Some(price) = price {
            state.shadow.mark_price(price, now_ms);
        }

        // ── 4. Live-long management ─────────────────────────────────────
        if let Some(price) = price {
            manage_long(&state, &exec, price, now_ms).await;
        }

        // ── 5. Reconciliation ───────────────────────────────────────────
        if tick % RECONCILE_EVERY_TICKS == 0 {
            reconcile_once(&state, &client, now_ms).await;
        }
    }
}

async fn fetch_price(state: &AppState, client: &OkxClient, now_ms: i64) -> Option<f64> {
    if !state.budget.try_request() {
        return state.price_ring.read().latest();
    }
    match client.get_ticker(&state.config.inst_id).await {
        Ok(price) => {
            state.price_ring.write().push(price, now_ms);
            Some(price)
        }
        Err(e) => {
            warn!(error = %e, "ticker fetch failed — using last known price");
            state.push_error(format!("ticker fetch failed: {e}"));
            state.price_ring.read().latest()
        }
    }
}

async fn refresh_candles(state: &AppState, client: &OkxClient) {
    let fresh = state.price_ring.read().candles_fresh();
    if fresh || !state.budget.try_request() {
        return;
    }
    match client.get_candles(&state.config.inst_id, "1m", 100).await {
        Ok(candles) => {
            let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
            state.price_ring.write().update_candles(closes);
        }
        Err(e) => {
            debug!(error = %e, "candle refresh failed — EMA falls back to ticks");
        }
    }
}

/// Hard stop, trailing give-back, and the stop price, in that order.
async fn manage_long(state: &AppState, exec: &ExecutionEngine, price: f64, now_ms: i64) {
    let Some(profit_pct) = state.machine.profit_pct(price) else {
        // FLAT, PAUSED, or an adopted long with unknown entry: nothing to
        // evaluate until an entry price exists.
        return;
    };

    state.machine.note_profit(profit_pct);
    let position = state.machine.snapshot();
    let limits = &state.config.hard_limits;

    if profit_pct <= -limits.hard_stop_pct {
        warn!(profit_pct, "hard stop hit");
        let result = exec.close_all(price, "hard stop", now_ms).await;
        note_close(state, &result, now_ms);
        return;
    }

    if position.trailing_enabled
        && position.highest_profit_pct - profit_pct >= limits.trailing_distance_pct
    {
        info!(
            highest = position.highest_profit_pct,
            current = profit_pct,
            "trailing profit give-back hit"
        );
        let result = exec.close_all(price, "trailing profit", now_ms).await;
        note_close(state, &result, now_ms);
        return;
    }

    match state.machine.check_stop_loss(price, now_ms) {
        StopCheck::Triggered => {
            warn!(price, stop = position.stop_loss_price, "protective stop hit");
            let result = exec.close_all(price, "hard stop", now_ms).await;
            note_close(state, &result, now_ms);
        }
        StopCheck::Raised(new_stop) => {
            debug!(new_stop, "trailing stop ratcheted");
        }
        StopCheck::NoAction => {}
    }
}

fn note_close(state: &AppState, result: &ExecutionResult, now_ms: i64) {
    match result {
        ExecutionResult::Placed { .. } => state.record_trade(now_ms),
        ExecutionResult::Error(err) => state.push_error(err.clone()),
        _ => {}
    }
}

/// One reconciliation pass: fetch the venue's book and let the state machine
/// converge on it.
pub async fn reconcile_once(state: &AppState, client: &OkxClient, now_ms: i64) {
    if !state.budget.try_request() {
        return;
    }
    match client.get_positions(&state.config.inst_id).await {
        Ok(positions) => {
            let count = positions.len();
            let side = positions.first().map(|p| {
                if p.side == "short" {
                    PositionSide::Short
                } else {
                    PositionSide::Long
                }
            });
            let outcome = state.machine.sync_with_exchange(count, side, now_ms);
            match outcome {
                SyncOutcome::InSync => debug!(count, "reconciliation: in sync"),
                SyncOutcome::ResetToFlat => {
                    warn!("reconciliation: venue flat — machine reset");
                    state.push_error("reconciliation reset machine to FLAT".to_string());
                }
                SyncOutcome::AdoptedLong => {
                    // The machine is LONG now; nothing may sit in observation.
                    state.observation.clear();
                    warn!("reconciliation: adopted venue long with unknown entry");
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "reconciliation fetch failed");
            state.push_error(format!("reconciliation failed: {e}"));
        }
    }
}

// -----------------------------------------------------------------------------
// 1-second observation loop
// -----------------------------------------------------------------------------

pub async fn run_observation_loop(
    state: Arc<AppState>,
    exec: Arc<ExecutionEngine>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("observation loop started (1 Hz)");
    let mut ticker = interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("observation loop stopping");
                    return;
                }
            }
        }
        let now_ms = chrono::Utc::now().timestamp_millis();

        // The heartbeat's silence and cooldown transitions ride this tick.
        state.heartbeat.tick(now_ms);

        let Some(price) = state.price_ring.read().latest() else {
            continue;
        };

        match state.observation.tick(price, now_ms) {
            ObservationTick::Confirmed(obs) => {
                confirm_entry(&state, &exec, obs.signal, price, now_ms).await;
            }
            ObservationTick::Expired(_) | ObservationTick::Idle => {}
            ObservationTick::Tracking { rebound_pct } => {
                debug!(rebound_pct, "observation tracking");
            }
        }
    }
}

async fn confirm_entry(
    state: &AppState,
    exec: &ExecutionEngine,
    signal: crate::signal::Signal,
    price: f64,
    now_ms: i64,
) {
    // Conditions may have moved during observation; re-run the entry check at
    // the commit point.
    let (entry_check, speed_drop) = {
        let ring = state.price_ring.read();
        (
            state.machine.can_open_long(price, &ring, now_ms),
            ring.speed_drop_pct(60, now_ms),
        )
    };
    if let Err(block) = entry_check {
        info!(signal_id = %signal.id, %block, "confirmed rebound refused at commit");
        return;
    }

    let context = state.context.snapshot();
    let result = exec
        .open_long(&signal, &context, price, speed_drop, now_ms)
        .await;

    match &result {
        ExecutionResult::Placed { order_id } => {
            state.record_trade(now_ms);
            info!(
                signal_id = %signal.id,
                order_id = %order_id,
                action = %TradeAction::OpenLong,
                price,
                "OPEN_LONG placed"
            );
        }
        ExecutionResult::Rejected(reason) => {
            info!(signal_id = %signal.id, reason = %reason, "OPEN_LONG rejected");
        }
        ExecutionResult::Skipped(reason) => {
            info!(signal_id = %signal.id, reason = %reason, "OPEN_LONG skipped");
        }
        ExecutionResult::Error(err) => {
            state.push_error(err.clone());
            warn!(signal_id = %signal.id, error = %err, "OPEN_LONG errored — reconciliation will converge");
        }
    }
}
