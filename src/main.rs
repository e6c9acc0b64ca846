// =============================================================================
// Flow Radar Perp Trader — Main Entry Point
// =============================================================================
//
// Boot order: config, state restore, venue reconciliation, then the task
// fleet. The engine auto-resumes only when the previous run was left running
// within the last 24 hours; otherwise it boots stopped and waits for the
// start command on the control surface.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod context;
mod decision_envelope;
mod execution;
mod gates;
mod indicators;
mod market_data;
mod monitor;
mod observation;
mod okx;
mod position;
mod runtime_config;
mod shadow;
mod signal;
mod strategy;
mod supervisor;
mod types;

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::execution::ExecutionEngine;
use crate::observation::ObservationBuffer;
use crate::okx::OkxClient;
use crate::position::PositionMachine;
use crate::runtime_config::RuntimeConfig;
use crate::shadow::ShadowLog;
use crate::signal::{FeedHeartbeat, SignalTailer};
use crate::strategy::DecisionEngine;

/// Capacity of the tailer -> decision signal channel.
const SIGNAL_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Flow Radar Perp Trader — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load("config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();
    config.validate()?;
    let trial_start = config.trial_start()?;

    info!(
        inst_id = %config.inst_id,
        signals_root = %config.signals_root,
        trial_start = %config.trial_start_date,
        "configuration loaded"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let now_ms = chrono::Utc::now().timestamp_millis();

    let machine = Arc::new(PositionMachine::new(
        &config.state_file,
        config.hard_limits.clone(),
        config.gate_thresholds.clone(),
    ));
    match machine.restore() {
        Ok(true) => info!(state = %machine.state(), "previous position state restored"),
        Ok(false) => info!("no previous state file — starting flat"),
        Err(e) => warn!(error = %e, "state file unreadable — starting flat"),
    }

    let observation = Arc::new(ObservationBuffer::new(&config.gate_thresholds));
    let heartbeat = Arc::new(FeedHeartbeat::new(now_ms));
    let shadow = Arc::new(ShadowLog::new(&config.shadow_log));

    let state = Arc::new(AppState::new(
        config.clone(),
        machine.clone(),
        observation,
        heartbeat,
        shadow,
    ));

    // ── 3. Build exchange client ─────────────────────────────────────────
    let api_key = std::env::var("OKX_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("OKX_API_SECRET").unwrap_or_default();
    let passphrase = std::env::var("OKX_API_PASSPHRASE").unwrap_or_default();
    let simulated = std::env::var("OKX_SIMULATED")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);
    if simulated {
        info!("simulated-trading flag set — orders go to the demo environment");
    }
    let client = Arc::new(OkxClient::new(api_key, api_secret, passphrase, simulated));

    let exec = Arc::new(ExecutionEngine::new(
        client.clone(),
        machine.clone(),
        state.budget.clone(),
        config.hard_limits.clone(),
        config.gate_thresholds.clone(),
        config.inst_id.clone(),
        trial_start,
    ));

    // ── 4. Boot reconciliation & auto-resume ─────────────────────────────
    supervisor::boot_reconcile(&state, &client).await;

    if supervisor::should_autoresume(&machine) {
        info!("auto-resume: previous run was live within 24h");
        supervisor::start(&state);
    } else {
        machine.set_running(false);
        info!("engine booted stopped — use the control surface to start");
    }

    // ── 5. Shutdown signal & signal channel ──────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (signal_tx, signal_rx) = broadcast::channel::<serde_json::Value>(SIGNAL_CHANNEL_CAPACITY);

    // ── 6. Signal tailer ─────────────────────────────────────────────────
    let tailer = SignalTailer::new(
        &config.signals_root,
        &config.events_root,
        &config.inst_id,
        state.tailer_stats.clone(),
        state.heartbeat.clone(),
    );
    tokio::spawn(tailer.run(signal_tx.clone(), shutdown_rx.clone()));

    // ── 7. Decision engine ───────────────────────────────────────────────
    let decision = DecisionEngine::new(state.clone(), exec.clone());
    tokio::spawn(decision.run(signal_rx, shutdown_rx.clone()));

    // ── 8. Observation & monitor loops ───────────────────────────────────
    tokio::spawn(monitor::run_observation_loop(
        state.clone(),
        exec.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(monitor::run_monitor_loop(
        state.clone(),
        client.clone(),
        exec.clone(),
        shutdown_rx.clone(),
    ));

    // ── 9. Market context loop ───────────────────────────────────────────
    tokio::spawn(context::run_context_loop(
        state.clone(),
        client.clone(),
        shutdown_rx.clone(),
    ));

    // ── 10. Control surface ──────────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr = config.bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("Failed to bind control surface");
        info!(addr = %bind_addr, "control surface listening");
        axum::serve(listener, app)
            .await
            .expect("control surface failed");
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 11. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if shutdown_tx.send(true).is_err() {
        error!("shutdown channel closed early");
    }
    // Give the tasks a moment to observe the signal and finish their tick.
    tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;

    // The state file is flushed with the current running flag so the next
    // boot can decide on auto-resume.
    machine.set_running(state.accepting.load(std::sync::atomic::Ordering::Relaxed));

    info!("Flow Radar Perp Trader shut down complete.");
    Ok(())
}
