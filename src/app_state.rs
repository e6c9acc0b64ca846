// =============================================================================
// Central Application State — flow trader engine
// =============================================================================
//
// Ties the subsystems together and backs the status surface. Each subsystem
// manages its own interior mutability; AppState adds the error ring, the
// decision audit trail, and lock-free counters.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Notify;

use crate::context::ContextHandle;
use crate::decision_envelope::DecisionEnvelope;
use crate::gates::GateRejection;
use crate::market_data::PriceRing;
use crate::observation::ObservationBuffer;
use crate::okx::RequestBudget;
use crate::position::PositionMachine;
use crate::runtime_config::RuntimeConfig;
use crate::shadow::ShadowLog;
use crate::signal::{FeedHeartbeat, TailerStats};

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;
/// Maximum number of recent decision envelopes to retain.
const MAX_RECENT_DECISIONS: usize = 100;

/// A recorded error event for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Central state shared across all tasks via `Arc<AppState>`.
pub struct AppState {
    pub config: RuntimeConfig,

    // ── Subsystems ──────────────────────────────────────────────────────
    pub machine: Arc<PositionMachine>,
    pub price_ring: Arc<RwLock<PriceRing>>,
    pub observation: Arc<ObservationBuffer>,
    pub heartbeat: Arc<FeedHeartbeat>,
    pub context: Arc<ContextHandle>,
    pub shadow: Arc<ShadowLog>,
    pub tailer_stats: Arc<TailerStats>,
    pub budget: Arc<RequestBudget>,

    // ── Control ─────────────────────────────────────────────────────────
    /// Wakes the context task for an out-of-cycle refresh.
    pub analysis_trigger: Arc<Notify>,
    /// Whether the decision pipeline is accepting signals.
    pub accepting: AtomicBool,

    // ── Audit & errors ──────────────────────────────────────────────────
    pub recent_decisions: RwLock<Vec<DecisionEnvelope>>,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    // ── Counters ────────────────────────────────────────────────────────
    pub trades_executed: AtomicU64,
    pub last_trade_ms: AtomicI64,
    pub signals_rejected_normalize: AtomicU64,
    pub gate_rejects_signal: AtomicU64,
    pub gate_rejects_execution: AtomicU64,
    pub gate_rejects_environment: AtomicU64,

    // ── Timing ──────────────────────────────────────────────────────────
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        machine: Arc<PositionMachine>,
        observation: Arc<ObservationBuffer>,
        heartbeat: Arc<FeedHeartbeat>,
        shadow: Arc<ShadowLog>,
    ) -> Self {
        Self {
            config,
            machine,
            price_ring: Arc::new(RwLock::new(PriceRing::new())),
            observation,
            heartbeat,
            context: Arc::new(ContextHandle::new()),
            shadow,
            tailer_stats: Arc::new(TailerStats::default()),
            budget: Arc::new(RequestBudget::new()),
            analysis_trigger: Arc::new(Notify::new()),
            accepting: AtomicBool::new(false),
            recent_decisions: RwLock::new(Vec::new()),
            recent_errors: RwLock::new(Vec::new()),
            trades_executed: AtomicU64::new(0),
            last_trade_ms: AtomicI64::new(0),
            signals_rejected_normalize: AtomicU64::new(0),
            gate_rejects_signal: AtomicU64::new(0),
            gate_rejects_execution: AtomicU64::new(0),
            gate_rejects_environment: AtomicU64::new(0),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Error Logging ───────────────────────────────────────────────────

    /// Record an error message, evicting the oldest past the cap.
    pub fn push_error(&self, message: impl Into<String>) {
        let record = ErrorRecord {
            message: message.into(),
            at: Utc::now().to_rfc3339(),
        };
        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
    }

    // ── Decision Audit ──────────────────────────────────────────────────

    /// Record a decision envelope, evicting the oldest past the cap.
    pub fn push_decision(&self, envelope: DecisionEnvelope) {
        let mut decisions = self.recent_decisions.write();
        decisions.push(envelope);
        while decisions.len() > MAX_RECENT_DECISIONS {
            decisions.remove(0);
        }
    }

    /// Bump the per-gate rejection counter.
    pub fn count_gate_reject(&self, rejection: &GateRejection) {
        match rejection {
            GateRejection::Signal(_) => &self.gate_rejects_signal,
            GateRejection::Execution(_) => &self.gate_rejects_execution,
            GateRejection::Environment(_) => &self.gate_rejects_environment,
        }
        .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed trade for the status surface.
    pub fn record_trade(&self, now_ms: i64) {
        self.trades_executed.fetch_add(1, Ordering::Relaxed);
        self.last_trade_ms.store(now_ms, Ordering::Relaxed);
    }

    // ── Status Snapshot ─────────────────────────────────────────────────

    /// Build the status payload for the control surface.
    pub fn status(&self, now_ms: i64) -> StatusReport {
        let position = self.machine.snapshot();
        let position_summary = match position.state {
            crate::position::PositionState::Flat => "FLAT".to_string(),
            crate::position::PositionState::Long => format!(
                "LONG entry={:.6} stop={:.6} lev={} size={:.1}%",
                position.entry_price,
                position.stop_loss_price,
                position.leverage,
                position.size_fraction * 100.0
            ),
            crate::position::PositionState::Paused => format!(
                "PAUSED ({})",
                position.pause_reason.as_deref().unwrap_or("unspecified")
            ),
        };

        let last_trade_ms = self.last_trade_ms.load(Ordering::Relaxed);

        StatusReport {
            running: self.machine.is_running(),
            market_context_summary: self.context.snapshot().summary(),
            position_summary,
            uptime_ms: self.start_time.elapsed().as_millis() as u64,
            trades_executed: self.trades_executed.load(Ordering::Relaxed),
            last_trade_time: if last_trade_ms > 0 {
                Some(last_trade_ms)
            } else {
                None
            },
            errors: self.recent_errors.read().clone(),
            heartbeat: self.heartbeat.snapshot(now_ms),
            observation_active: self.observation.is_occupied(),
            shadow_shorts_tracked: self.shadow.recent().len(),
            counters: CounterReport {
                signals_emitted: self
                    .tailer_stats
                    .lines_emitted
                    .load(Ordering::Relaxed),
                malformed_lines: self
                    .tailer_stats
                    .malformed_lines
                    .load(Ordering::Relaxed),
                rejected_normalize: self.signals_rejected_normalize.load(Ordering::Relaxed),
                gate_rejects_signal: self.gate_rejects_signal.load(Ordering::Relaxed),
                gate_rejects_execution: self.gate_rejects_execution.load(Ordering::Relaxed),
                gate_rejects_environment: self
                    .gate_rejects_environment
                    .load(Ordering::Relaxed),
            },
        }
    }
}

/// Status payload returned by the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub running: bool,
    pub market_context_summary: String,
    pub position_summary: String,
    pub uptime_ms: u64,
    pub trades_executed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_trade_time: Option<i64>,
    pub errors: Vec<ErrorRecord>,
    pub heartbeat: crate::signal::heartbeat::HeartbeatSnapshot,
    pub observation_active: bool,
    pub shadow_shorts_tracked: usize,
    pub counters: CounterReport,
}

/// Pipeline counters for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct CounterReport {
    pub signals_emitted: u64,
    pub malformed_lines: u64,
    pub rejected_normalize: u64,
    pub gate_rejects_signal: u64,
    pub gate_rejects_execution: u64,
    pub gate_rejects_environment: u64,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_config::{GateThresholds, HardLimits};

    fn state() -> (Arc<AppState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig::default();
        let machine = Arc::new(PositionMachine::new(
            dir.path().join("state.json"),
            HardLimits::default(),
            GateThresholds::default(),
        ));
        let observation = Arc::new(ObservationBuffer::new(&GateThresholds::default()));
        let heartbeat = Arc::new(FeedHeartbeat::new(0));
        let shadow = Arc::new(ShadowLog::new(dir.path().join("shadow.jsonl")));
        (
            Arc::new(AppState::new(config, machine, observation, heartbeat, shadow)),
            dir,
        )
    }

    #[test]
    fn error_ring_is_capped() {
        let (state, _dir) = state();
        for i in 0..(MAX_RECENT_ERRORS + 10) {
            state.push_error(format!("err {i}"));
        }
        let errors = state.recent_errors.read();
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert_eq!(errors.last().unwrap().message, "err 59");
    }

    #[test]
    fn gate_counters_split_by_gate() {
        let (state, _dir) = state();
        state.count_gate_reject(&GateRejection::Signal("x".into()));
        state.count_gate_reject(&GateRejection::Signal("y".into()));
        state.count_gate_reject(&GateRejection::Environment("z".into()));
        assert_eq!(state.gate_rejects_signal.load(Ordering::Relaxed), 2);
        assert_eq!(state.gate_rejects_execution.load(Ordering::Relaxed), 0);
        assert_eq!(state.gate_rejects_environment.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn status_reflects_machine_and_trades() {
        let (state, _dir) = state();
        let now_ms = 1_700_000_000_000;

        let report = state.status(now_ms);
        assert!(!report.running);
        assert_eq!(report.position_summary, "FLAT");
        assert!(report.last_trade_time.is_none());

        state.machine.open_long(0.128, 0.04, 3, now_ms).unwrap();
        state.record_trade(now_ms);
        state.machine.set_running(true);

        let report = state.status(now_ms);
        assert!(report.running);
        assert!(report.position_summary.starts_with("LONG"));
        assert_eq!(report.trades_executed, 1);
        assert_eq!(report.last_trade_time, Some(now_ms));
    }
}
