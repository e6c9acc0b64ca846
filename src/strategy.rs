// =============================================================================
// Decision Engine — consumes the signal stream and drives the state machine
// =============================================================================
//
// One task owns this engine. Per record, in order: normalize, heartbeat
// bookkeeping, history/iceberg statistics, then the admission pipeline:
//
//   SHORT while not LONG          -> shadow short (paper), no gates needed
//   SHORT while LONG              -> gates (exit intent) -> bearish ladder
//   LONG                          -> gates (entry intent) -> entry check ->
//                                    observation buffer
//   NEUTRAL                       -> statistics only
//
// Signals are processed strictly in arrival order; a lagging consumer loses
// the oldest queued records and logs how many.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::decision_envelope::DecisionEnvelope;
use crate::execution::{ExecutionEngine, ExecutionResult};
use crate::gates::{self, GateInputs, GateIntent};
use crate::market_data::IcebergStats;
use crate::position::{BearishAction, PositionState};
use crate::signal::{normalize, Signal, SignalHistory};
use crate::types::{Direction, SignalKind, TradeAction};

/// The decision task: signal stream in, state-machine actions out.
pub struct DecisionEngine {
    state: Arc<AppState>,
    exec: Arc<ExecutionEngine>,
    history: SignalHistory,
    iceberg: IcebergStats,
}

impl DecisionEngine {
    pub fn new(state: Arc<AppState>, exec: Arc<ExecutionEngine>) -> Self {
        Self {
            state,
            exec,
            history: SignalHistory::new(),
            iceberg: IcebergStats::new(),
        }
    }

    /// Run until shutdown. Consumes raw records from the tailer's channel.
    pub async fn run(
        mut self,
        mut rx: broadcast::Receiver<Value>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("decision engine started");
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(record) => self.handle_record(&record).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(dropped = n, "signal backlog overflowed — oldest records dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("signal channel closed — decision engine exiting");
                        return;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("decision engine stopping");
                        return;
                    }
                }
            }
        }
    }

    async fn handle_record(&mut self, record: &Value) {
        let now_ms = chrono::Utc::now().timestamp_millis();

        let signal = match normalize(record, &self.state.config.inst_id) {
            Ok(signal) => signal,
            Err(reason) => {
                self.state
                    .signals_rejected_normalize
                    .fetch_add(1, Ordering::Relaxed);
                self.state.heartbeat.on_signal(false, now_ms);
                debug!(%reason, "record dropped before the gates");
                return;
            }
        };

        self.state.heartbeat.on_signal(true, now_ms);
        self.history.push(&signal);

        if let Some(level) = signal.iceberg_level {
            self.iceberg.update(signal.direction, level, now_ms);
        }

        if !self.state.accepting.load(Ordering::Relaxed) {
            debug!(signal_id = %signal.id, "engine stopped — signal observed, not decided");
            return;
        }

        if self.apply_k_god_annotation(&signal, now_ms).await {
            return;
        }

        match signal.direction {
            Direction::Short => self.handle_short(signal, now_ms).await,
            Direction::Long => self.handle_long(signal, now_ms).await,
            Direction::Neutral => {
                debug!(signal_id = %signal.id, kind = %signal.kind, "neutral signal — statistics only");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Producer regime annotations
    // -------------------------------------------------------------------------

    /// The producer's K-God annotation can force the machine into PAUSED
    /// (no_entry / no_entry_close) and lift a producer-originated pause when
    /// conditions normalise. Returns `true` when the signal is consumed here.
    async fn apply_k_god_annotation(&mut self, signal: &Signal, now_ms: i64) -> bool {
        use crate::types::KGodStatus;

        let Some(status) = signal.k_god_status else {
            return false;
        };

        // Only the producer's dedicated regime records are authoritative
        // here; the same annotation riding an iceberg signal just feeds the
        // sizing bonus.
        if signal.kind != SignalKind::State || signal.market_state.is_some() {
            return false;
        }

        match status {
            KGodStatus::NoEntryClose => {
                if self.state.machine.state() == PositionState::Long {
                    let mark = self.current_price().unwrap_or(signal.price);
                    let result = self
                        .exec
                        .close_all(mark, "producer no_entry_close", now_ms)
                        .await;
                    self.after_execution(&result, now_ms);
                    info!(result = %result, "producer no_entry_close — position closed");
                }
                if self.state.machine.state() != PositionState::Paused {
                    self.state
                        .machine
                        .pause("producer no_entry_close", None, now_ms);
                }
                self.state.observation.clear();
                true
            }
            KGodStatus::NoEntry => {
                if self.state.machine.state() == PositionState::Flat {
                    self.state.machine.pause("producer no_entry", None, now_ms);
                    self.state.observation.clear();
                }
                true
            }
            KGodStatus::Normal | KGodStatus::Caution => {
                // Lift only pauses this annotation caused; operator pauses
                // stay until an explicit resume.
                let position = self.state.machine.snapshot();
                let producer_pause = position.state == PositionState::Paused
                    && position
                        .pause_reason
                        .as_deref()
                        .map(|r| r.starts_with("producer "))
                        .unwrap_or(false);
                if producer_pause {
                    if let Err(e) = self.state.machine.resume(now_ms) {
                        debug!(error = %e, "producer pause not lifted");
                    }
                }
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // SHORT path
    // -------------------------------------------------------------------------

    async fn handle_short(&mut self, signal: Signal, now_ms: i64) {
        let price = self.current_price();

        // Not long: the short is paper only, no gates involved.
        if self.state.machine.state() != PositionState::Long {
            let entry = price.unwrap_or(signal.price);
            self.state.shadow.record(&signal, entry, now_ms);
            self.state.push_decision(DecisionEnvelope::shadowed(&signal));
            return;
        }

        // Long book: the bearish signal must still be valid before it may
        // touch the position, but posture never blocks risk reduction.
        if let Err(rejection) = self.run_gates(&signal, price, GateIntent::Exit, now_ms) {
            self.state.count_gate_reject(&rejection);
            self.state.push_decision(DecisionEnvelope::rejected(
                &signal,
                rejection.gate_name(),
                rejection.reason(),
            ));
            info!(signal_id = %signal.id, %rejection, "bearish signal rejected");
            return;
        }

        // Anti-jitter: a fresh entry ignores bearish noise below the
        // high-confidence bar.
        if self.state.machine.within_jitter_window(now_ms) && signal.confidence < 90.0 {
            info!(
                signal_id = %signal.id,
                confidence = signal.confidence,
                "anti-jitter — bearish close suppressed"
            );
            self.state.push_decision(DecisionEnvelope::rejected(
                &signal,
                "anti-jitter",
                "bearish close suppressed shortly after entry",
            ));
            return;
        }

        let is_dual = self.history.is_dual_signal(Direction::Short, now_ms);
        let action = self
            .state
            .machine
            .handle_bearish(signal.confidence, is_dual, now_ms);
        let mark = price.unwrap_or(signal.price);

        match action {
            BearishAction::CloseAll(reason) => {
                self.state.push_decision(DecisionEnvelope::close_action(
                    &signal,
                    TradeAction::CloseAll,
                    reason.clone(),
                ));
                let result = self.exec.close_all(mark, &reason, now_ms).await;
                self.after_execution(&result, now_ms);
                info!(signal_id = %signal.id, result = %result, "CLOSE_ALL handled");
            }
            BearishAction::CloseHalf(reason) => {
                self.state.push_decision(DecisionEnvelope::close_action(
                    &signal,
                    TradeAction::CloseHalf,
                    reason.clone(),
                ));
                let result = self.exec.close_half(&reason).await;
                self.after_execution(&result, now_ms);
                info!(signal_id = %signal.id, result = %result, "CLOSE_HALF handled");
            }
            BearishAction::None => {
                // Not strong enough to touch the book; note it on paper.
                self.state.shadow.record(&signal, mark, now_ms);
                self.state.push_decision(DecisionEnvelope::shadowed(&signal));
            }
        }
    }

    // -------------------------------------------------------------------------
    // LONG path
    // -------------------------------------------------------------------------

    async fn handle_long(&mut self, signal: Signal, now_ms: i64) {
        let price = self.current_price();

        if let Err(rejection) = self.run_gates(&signal, price, GateIntent::Entry, now_ms) {
            self.state.count_gate_reject(&rejection);
            info!(signal_id = %signal.id, %rejection, "long signal rejected");
            self.state.push_decision(DecisionEnvelope::rejected(
                &signal,
                rejection.gate_name(),
                rejection.reason(),
            ));
            return;
        }

        // Gate 2 guarantees a price at this point.
        let price = price.unwrap_or(signal.price);

        let entry_check = {
            let ring = self.state.price_ring.read();
            self.state.machine.can_open_long(price, &ring, now_ms)
        };
        if let Err(block) = entry_check {
            info!(signal_id = %signal.id, %block, "entry check refused the signal");
            self.state.push_decision(DecisionEnvelope::rejected(
                &signal,
                "entry",
                block.to_string(),
            ));
            return;
        }

        if self.state.observation.install(signal.clone(), price, now_ms) {
            self.state.push_decision(DecisionEnvelope::admitted(&signal));
        } else {
            self.state.push_decision(DecisionEnvelope::rejected(
                &signal,
                "entry",
                "observation slot occupied",
            ));
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn run_gates(
        &self,
        signal: &Signal,
        price: Option<f64>,
        intent: GateIntent,
        now_ms: i64,
    ) -> Result<(), crate::gates::GateRejection> {
        let context = self.state.context.snapshot();
        let inputs = GateInputs {
            thresholds: &self.state.config.gate_thresholds,
            context: &context,
            heartbeat: self.state.heartbeat.state(),
            current_price: price,
            confirm_ratio_fallback: self.iceberg.confirm_ratio(),
            intent,
            now_ms,
        };
        gates::evaluate(signal, &inputs)
    }

    fn current_price(&self) -> Option<f64> {
        self.state.price_ring.read().latest()
    }

    fn after_execution(&self, result: &ExecutionResult, now_ms: i64) {
        match result {
            ExecutionResult::Placed { .. } => self.state.record_trade(now_ms),
            ExecutionResult::Error(err) => self.state.push_error(err.clone()),
            _ => {}
        }
    }
}

impl std::fmt::Debug for DecisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionEngine")
            .field("history_len", &self.history.len())
            .finish()
    }
}
