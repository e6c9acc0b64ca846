// =============================================================================
// Position State Machine — the single source of truth for "do we hold"
// =============================================================================
//
// States:  FLAT ──open_long──▶ LONG ──close_long──▶ FLAT
//          any ──pause──▶ PAUSED ──resume──▶ FLAT (only when already flat)
//          any ──reset──▶ FLAT (emergency)
//
// Exactly one Position record exists; every mutation serialises
// {position, last 100 transitions, running, saved_at} to the state file via
// atomic tmp + rename. A failed write logs and does not block the transition:
// the in-memory record stays authoritative and the next successful write
// resynchronises the file.
// =============================================================================

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::market_data::PriceRing;
use crate::runtime_config::{GateThresholds, HardLimits};
use crate::types::PositionSide;

/// Retained transition history.
const TRANSITION_CAPACITY: usize = 100;

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

/// The three machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    Flat,
    Long,
    Paused,
}

impl std::fmt::Display for PositionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flat => write!(f, "FLAT"),
            Self::Long => write!(f, "LONG"),
            Self::Paused => write!(f, "PAUSED"),
        }
    }
}

/// The system-wide position record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub state: PositionState,
    #[serde(default)]
    pub entry_price: f64,
    #[serde(default)]
    pub entry_time_ms: i64,
    /// Fraction of account equity committed, (0, 1].
    #[serde(default)]
    pub size_fraction: f64,
    #[serde(default)]
    pub leverage: u8,
    #[serde(default)]
    pub stop_loss_price: f64,
    #[serde(default)]
    pub trailing_enabled: bool,
    /// High-water profit percentage since entry.
    #[serde(default)]
    pub highest_profit_pct: f64,
    #[serde(default)]
    pub pause_reason: Option<String>,
    #[serde(default)]
    pub pause_until_ms: Option<i64>,
}

impl Position {
    fn flat() -> Self {
        Self {
            state: PositionState::Flat,
            entry_price: 0.0,
            entry_time_ms: 0,
            size_fraction: 0.0,
            leverage: 0,
            stop_loss_price: 0.0,
            trailing_enabled: false,
            highest_profit_pct: 0.0,
            pause_reason: None,
            pause_until_ms: None,
        }
    }
}

/// One recorded state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: PositionState,
    pub to: PositionState,
    pub reason: String,
    pub at_ms: i64,
}

/// On-disk shape of the state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedState {
    position: Position,
    transitions: Vec<Transition>,
    #[serde(default)]
    running: bool,
    saved_at: String,
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Why a long entry was refused.
#[derive(Debug, Clone, PartialEq)]
pub enum OpenBlock {
    /// Already LONG or PAUSED.
    NotFlat(PositionState),
    /// Price already rose too far off the 60 s minimum.
    AntiChase { rise_pct: f64 },
}

impl std::fmt::Display for OpenBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFlat(state) => write!(f, "state is {state}, not FLAT"),
            Self::AntiChase { rise_pct } => {
                write!(f, "anti-chase: {rise_pct:.2}% rise in 60s")
            }
        }
    }
}

/// Verdict on a bearish signal while the machine may hold a position.
#[derive(Debug, Clone, PartialEq)]
pub enum BearishAction {
    CloseAll(String),
    CloseHalf(String),
    None,
}

/// Result of a stop-loss evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopCheck {
    /// Price is at or under the stop; close now.
    Triggered,
    /// Trailing logic lifted the stop to the contained price.
    Raised(f64),
    NoAction,
}

/// Result of an exchange reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    InSync,
    /// Venue reports flat while we were LONG; machine reset.
    ResetToFlat,
    /// Venue reports a long we did not know about; adopted with unknown entry.
    AdoptedLong,
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

struct Inner {
    position: Position,
    transitions: VecDeque<Transition>,
}

/// Thread-safe owner of the single position record.
pub struct PositionMachine {
    inner: RwLock<Inner>,
    state_path: PathBuf,
    limits: HardLimits,
    thresholds: GateThresholds,
    running: AtomicBool,
}

impl PositionMachine {
    pub fn new(
        state_path: impl Into<PathBuf>,
        limits: HardLimits,
        thresholds: GateThresholds,
    ) -> Self {
        Self {
            inner: RwLock::new(Inner {
                position: Position::flat(),
                transitions: VecDeque::with_capacity(TRANSITION_CAPACITY),
            }),
            state_path: state_path.into(),
            limits,
            thresholds,
            running: AtomicBool::new(false),
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn state(&self) -> PositionState {
        self.inner.read().position.state
    }

    pub fn snapshot(&self) -> Position {
        self.inner.read().position.clone()
    }

    pub fn transitions(&self) -> Vec<Transition> {
        self.inner.read().transitions.iter().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Flip the engine's running flag (persisted for the auto-resume check).
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
        let inner = self.inner.read();
        self.persist(&inner);
    }

    /// Profit percentage at `price`, when LONG with a known entry.
    pub fn profit_pct(&self, price: f64) -> Option<f64> {
        let inner = self.inner.read();
        let p = &inner.position;
        if p.state != PositionState::Long || p.entry_price <= 0.0 {
            return None;
        }
        Some((price - p.entry_price) / p.entry_price * 100.0)
    }

    /// Whether a bearish-signal close is still inside the anti-jitter window.
    pub fn within_jitter_window(&self, now_ms: i64) -> bool {
        let inner = self.inner.read();
        let p = &inner.position;
        p.state == PositionState::Long
            && p.entry_time_ms > 0
            && now_ms - p.entry_time_ms < (self.limits.anti_jitter_s as i64) * 1000
    }

    // -------------------------------------------------------------------------
    // Entry admission
    // -------------------------------------------------------------------------

    /// Precondition check for a long entry. The anti-chase rule rejects an
    /// entry when the 60-second window already rose >= the configured
    /// percentage off its minimum — the mean-reversion edge has passed.
    pub fn can_open_long(
        &self,
        price: f64,
        ring: &PriceRing,
        now_ms: i64,
    ) -> Result<(), OpenBlock> {
        let state = self.state();
        if state != PositionState::Flat {
            return Err(OpenBlock::NotFlat(state));
        }

        if let Some(min) = ring.min_in_window(60, now_ms) {
            if min > 0.0 {
                let rise_pct = (price - min) / min * 100.0;
                if rise_pct >= self.thresholds.anti_chase_rise_pct {
                    return Err(OpenBlock::AntiChase { rise_pct });
                }
            }
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    /// FLAT -> LONG. The caller supplies the sized entry; the stop is placed
    /// at the hard-stop distance below the fill.
    pub fn open_long(
        &self,
        price: f64,
        size_fraction: f64,
        leverage: u8,
        now_ms: i64,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.write();
        if inner.position.state != PositionState::Flat {
            let state = inner.position.state;
            warn!(%state, "open_long refused — machine is not FLAT");
            anyhow::bail!("open_long from {state}");
        }

        let stop = price * (1.0 - self.limits.hard_stop_pct / 100.0);
        inner.position = Position {
            state: PositionState::Long,
            entry_price: price,
            entry_time_ms: now_ms,
            size_fraction,
            leverage,
            stop_loss_price: stop,
            trailing_enabled: false,
            highest_profit_pct: 0.0,
            pause_reason: None,
            pause_until_ms: None,
        };
        Self::record(&mut inner, PositionState::Flat, PositionState::Long, "open_long", now_ms);

        info!(
            price,
            size_fraction,
            leverage,
            stop_loss = stop,
            "position opened LONG"
        );

        self.persist(&inner);
        Ok(())
    }

    /// LONG -> FLAT.
    pub fn close_long(&self, price: f64, reason: &str, now_ms: i64) -> anyhow::Result<()> {
        let mut inner = self.inner.write();
        if inner.position.state != PositionState::Long {
            let state = inner.position.state;
            warn!(%state, reason, "close_long refused — machine is not LONG");
            anyhow::bail!("close_long from {state}");
        }

        let entry = inner.position.entry_price;
        let pnl_pct = if entry > 0.0 {
            (price - entry) / entry * 100.0
        } else {
            0.0
        };

        inner.position = Position::flat();
        Self::record(&mut inner, PositionState::Long, PositionState::Flat, reason, now_ms);

        info!(price, entry, pnl_pct, reason, "position closed");

        self.persist(&inner);
        Ok(())
    }

    /// any -> PAUSED. Entry fields survive so a paused-while-long book can
    /// still be reconciled and closed.
    pub fn pause(&self, reason: &str, duration_ms: Option<i64>, now_ms: i64) {
        let mut inner = self.inner.write();
        let from = inner.position.state;
        inner.position.state = PositionState::Paused;
        inner.position.pause_reason = Some(reason.to_string());
        inner.position.pause_until_ms = duration_ms.map(|d| now_ms + d);
        Self::record(&mut inner, from, PositionState::Paused, reason, now_ms);

        warn!(reason, from = %from, "machine paused");
        self.persist(&inner);
    }

    /// PAUSED -> FLAT. Refused while a timed pause is still in force or an
    /// entry is still on the books.
    pub fn resume(&self, now_ms: i64) -> anyhow::Result<()> {
        let mut inner = self.inner.write();
        if inner.position.state != PositionState::Paused {
            let state = inner.position.state;
            anyhow::bail!("resume from {state}");
        }
        if let Some(until) = inner.position.pause_until_ms {
            if now_ms < until {
                anyhow::bail!("pause still in force for {}s", (until - now_ms) / 1000);
            }
        }
        if inner.position.entry_price > 0.0 {
            anyhow::bail!("cannot resume while an entry is still on the books");
        }

        inner.position = Position::flat();
        Self::record(&mut inner, PositionState::Paused, PositionState::Flat, "resume", now_ms);

        info!("machine resumed to FLAT");
        self.persist(&inner);
        Ok(())
    }

    /// any -> FLAT. Unconditional emergency reset.
    pub fn reset(&self, reason: &str, now_ms: i64) {
        let mut inner = self.inner.write();
        let from = inner.position.state;
        inner.position = Position::flat();
        Self::record(&mut inner, from, PositionState::Flat, reason, now_ms);

        warn!(reason, from = %from, "machine reset to FLAT");
        self.persist(&inner);
    }

    // -------------------------------------------------------------------------
    // Bearish handling
    // -------------------------------------------------------------------------

    /// Decide what a bearish signal does to a live long.
    ///
    /// Callers must only invoke this while LONG (a bearish signal while flat
    /// or paused becomes a shadow short upstream). The half-close path also
    /// moves the stop to break-even and halves the recorded size.
    pub fn handle_bearish(
        &self,
        confidence: f64,
        is_dual_signal: bool,
        now_ms: i64,
    ) -> BearishAction {
        let mut inner = self.inner.write();
        if inner.position.state != PositionState::Long {
            return BearishAction::None;
        }

        if is_dual_signal || confidence >= 90.0 {
            let reason = if is_dual_signal {
                "bearish dual signal".to_string()
            } else {
                format!("bearish confidence {confidence:.0}")
            };
            return BearishAction::CloseAll(reason);
        }

        if confidence >= 80.0 {
            // Keep half, stop the remainder at break-even.
            inner.position.stop_loss_price = inner.position.entry_price;
            inner.position.size_fraction *= 0.5;
            let reason = format!("bearish confidence {confidence:.0} — half close");
            info!(
                stop_loss = inner.position.stop_loss_price,
                size_fraction = inner.position.size_fraction,
                "break-even stop set for half close"
            );
            Self::record(
                &mut inner,
                PositionState::Long,
                PositionState::Long,
                "half close / break-even stop",
                now_ms,
            );
            self.persist(&inner);
            return BearishAction::CloseHalf(reason);
        }

        BearishAction::None
    }

    // -------------------------------------------------------------------------
    // Stop-loss / trailing
    // -------------------------------------------------------------------------

    /// Evaluate the stop at `price`. When trailing is active and profit
    /// qualifies, the stop ratchets upward (never downward).
    pub fn check_stop_loss(&self, price: f64, now_ms: i64) -> StopCheck {
        let mut inner = self.inner.write();
        let p = &inner.position;
        if p.state != PositionState::Long || p.entry_price <= 0.0 {
            return StopCheck::NoAction;
        }

        if p.stop_loss_price > 0.0 && price <= p.stop_loss_price {
            return StopCheck::Triggered;
        }

        if p.trailing_enabled {
            let profit_pct = (price - p.entry_price) / p.entry_price * 100.0;
            if profit_pct >= self.limits.trailing_trigger_pct {
                let candidate = price * (1.0 - self.limits.trailing_distance_pct / 100.0);
                if candidate > p.stop_loss_price {
                    inner.position.stop_loss_price = candidate;
                    Self::record(
                        &mut inner,
                        PositionState::Long,
                        PositionState::Long,
                        "trailing stop raised",
                        now_ms,
                    );
                    self.persist(&inner);
                    return StopCheck::Raised(candidate);
                }
            }
        }

        StopCheck::NoAction
    }

    /// Record a profit observation: high-water tracking plus trailing
    /// activation once the trigger threshold is crossed.
    pub fn note_profit(&self, profit_pct: f64) {
        let mut inner = self.inner.write();
        if inner.position.state != PositionState::Long {
            return;
        }

        let mut dirty = false;
        if profit_pct > inner.position.highest_profit_pct {
            inner.position.highest_profit_pct = profit_pct;
            dirty = true;
        }
        if !inner.position.trailing_enabled && profit_pct >= self.limits.trailing_trigger_pct {
            inner.position.trailing_enabled = true;
            info!(profit_pct, "trailing profit armed");
            dirty = true;
        }
        if dirty {
            self.persist(&inner);
        }
    }

    // -------------------------------------------------------------------------
    // Exchange reconciliation
    // -------------------------------------------------------------------------

    /// Converge the machine with the venue's reported book.
    pub fn sync_with_exchange(
        &self,
        actual_count: usize,
        actual_side: Option<PositionSide>,
        now_ms: i64,
    ) -> SyncOutcome {
        let state = self.state();

        match (state, actual_count) {
            (PositionState::Long, 0) => {
                self.reset("exchange reports flat", now_ms);
                SyncOutcome::ResetToFlat
            }
            (PositionState::Flat, n) if n > 0 && actual_side == Some(PositionSide::Long) => {
                // Adopt the unknown long. No entry price is fabricated and no
                // stop is invented; the monitor skips stop checks until an
                // entry price is learned.
                let mut inner = self.inner.write();
                inner.position = Position {
                    state: PositionState::Long,
                    entry_price: 0.0,
                    entry_time_ms: now_ms,
                    size_fraction: 0.0,
                    leverage: 0,
                    stop_loss_price: 0.0,
                    trailing_enabled: false,
                    highest_profit_pct: 0.0,
                    pause_reason: None,
                    pause_until_ms: None,
                };
                Self::record(
                    &mut inner,
                    PositionState::Flat,
                    PositionState::Long,
                    "adopted exchange long",
                    now_ms,
                );
                warn!("exchange reports a long we did not track — adopted with unknown entry");
                self.persist(&inner);
                SyncOutcome::AdoptedLong
            }
            _ => SyncOutcome::InSync,
        }
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Restore the machine from the state file. Missing file is a clean boot.
    pub fn restore(&self) -> anyhow::Result<bool> {
        if !self.state_path.exists() {
            return Ok(false);
        }
        let content = std::fs::read_to_string(&self.state_path)?;
        let persisted: PersistedState = serde_json::from_str(&content)?;

        let mut inner = self.inner.write();
        inner.position = persisted.position;
        inner.transitions = persisted.transitions.into_iter().collect();
        while inner.transitions.len() > TRANSITION_CAPACITY {
            inner.transitions.pop_front();
        }
        self.running.store(persisted.running, Ordering::Relaxed);

        info!(
            path = %self.state_path.display(),
            state = %inner.position.state,
            running = persisted.running,
            saved_at = %persisted.saved_at,
            "position state restored"
        );
        Ok(true)
    }

    /// Timestamp of the last save, read back from disk (supervisor boot check).
    pub fn saved_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        let content = std::fs::read_to_string(&self.state_path).ok()?;
        let persisted: PersistedState = serde_json::from_str(&content).ok()?;
        chrono::DateTime::parse_from_rfc3339(&persisted.saved_at)
            .ok()
            .map(|dt| dt.with_timezone(&chrono::Utc))
    }

    fn record(
        inner: &mut Inner,
        from: PositionState,
        to: PositionState,
        reason: &str,
        at_ms: i64,
    ) {
        if inner.transitions.len() == TRANSITION_CAPACITY {
            inner.transitions.pop_front();
        }
        inner.transitions.push_back(Transition {
            from,
            to,
            reason: reason.to_string(),
            at_ms,
        });
    }

    /// Serialise to the state file. Failure logs and returns — the in-memory
    /// machine stays authoritative.
    fn persist(&self, inner: &Inner) {
        let persisted = PersistedState {
            position: inner.position.clone(),
            transitions: inner.transitions.iter().cloned().collect(),
            running: self.running.load(Ordering::Relaxed),
            saved_at: chrono::Utc::now().to_rfc3339(),
        };

        if let Err(e) = write_atomic(&self.state_path, &persisted) {
            error!(path = %self.state_path.display(), error = %e, "state file write failed");
        }
    }
}

/// Write-temp-then-rename so a crash can never leave a torn state file.
fn write_atomic(path: &Path, persisted: &PersistedState) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let content = serde_json::to_string_pretty(persisted)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

impl std::fmt::Debug for PositionMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("PositionMachine")
            .field("state", &inner.position.state)
            .field("transitions", &inner.transitions.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000_000;

    fn machine() -> (PositionMachine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let m = PositionMachine::new(
            dir.path().join("position_state.json"),
            HardLimits::default(),
            GateThresholds::default(),
        );
        (m, dir)
    }

    fn ring_with(prices: &[(f64, i64)]) -> PriceRing {
        let mut ring = PriceRing::new();
        for &(p, t) in prices {
            ring.push(p, t);
        }
        ring
    }

    #[test]
    fn open_sets_hard_stop_four_percent_below_entry() {
        let (m, _dir) = machine();
        m.open_long(0.128, 0.04, 3, T0).unwrap();
        let p = m.snapshot();
        assert_eq!(p.state, PositionState::Long);
        assert!((p.stop_loss_price - 0.12288).abs() < 1e-9);
        assert!((p.entry_price - 0.128).abs() < 1e-12);
        assert_eq!(p.leverage, 3);
    }

    #[test]
    fn open_refused_when_not_flat() {
        let (m, _dir) = machine();
        m.open_long(0.128, 0.04, 3, T0).unwrap();
        assert!(m.open_long(0.129, 0.04, 3, T0 + 1000).is_err());
        // The original entry is untouched.
        assert!((m.snapshot().entry_price - 0.128).abs() < 1e-12);
    }

    #[test]
    fn close_returns_to_flat_and_clears_fields() {
        let (m, _dir) = machine();
        m.open_long(0.128, 0.04, 3, T0).unwrap();
        m.close_long(0.130, "take profit", T0 + 60_000).unwrap();
        let p = m.snapshot();
        assert_eq!(p.state, PositionState::Flat);
        assert_eq!(p.entry_price, 0.0);
        assert_eq!(p.stop_loss_price, 0.0);
        assert!(!p.trailing_enabled);
    }

    #[test]
    fn anti_chase_rejects_two_percent_rise() {
        let (m, _dir) = machine();
        let ring = ring_with(&[(0.1254, T0), (0.128, T0 + 50_000)]);
        // (0.128 - 0.1254) / 0.1254 = 2.07 %
        let err = m.can_open_long(0.128, &ring, T0 + 50_000).unwrap_err();
        assert!(matches!(err, OpenBlock::AntiChase { .. }));
    }

    #[test]
    fn flat_window_allows_entry() {
        let (m, _dir) = machine();
        let ring = ring_with(&[(0.128, T0), (0.128, T0 + 30_000), (0.128, T0 + 60_000)]);
        assert!(m.can_open_long(0.128, &ring, T0 + 60_000).is_ok());
    }

    #[test]
    fn can_open_refused_while_long_or_paused() {
        let (m, _dir) = machine();
        let ring = ring_with(&[(0.128, T0)]);
        m.open_long(0.128, 0.04, 3, T0).unwrap();
        assert!(matches!(
            m.can_open_long(0.128, &ring, T0).unwrap_err(),
            OpenBlock::NotFlat(PositionState::Long)
        ));

        m.reset("test", T0);
        m.pause("maintenance", None, T0);
        assert!(matches!(
            m.can_open_long(0.128, &ring, T0).unwrap_err(),
            OpenBlock::NotFlat(PositionState::Paused)
        ));
    }

    #[test]
    fn stop_triggers_at_or_below_stop_price() {
        let (m, _dir) = machine();
        m.open_long(0.128, 0.04, 3, T0).unwrap();
        assert_eq!(m.check_stop_loss(0.12289, T0 + 5000), StopCheck::NoAction);
        assert_eq!(m.check_stop_loss(0.12288, T0 + 5000), StopCheck::Triggered);
        assert_eq!(m.check_stop_loss(0.12287, T0 + 5000), StopCheck::Triggered);
    }

    #[test]
    fn trailing_raises_stop_monotonically() {
        let (m, _dir) = machine();
        m.open_long(0.128, 0.04, 3, T0).unwrap();
        m.note_profit(2.1);
        assert!(m.snapshot().trailing_enabled);

        // Price at +2.1 %: stop lifts to price * 0.985.
        let price = 0.13069;
        match m.check_stop_loss(price, T0 + 5000) {
            StopCheck::Raised(stop) => assert!((stop - price * 0.985).abs() < 1e-9),
            other => panic!("expected raise, got {other:?}"),
        }

        // A lower price later cannot drag the stop back down.
        let before = m.snapshot().stop_loss_price;
        assert_eq!(m.check_stop_loss(0.1295, T0 + 10_000), StopCheck::NoAction);
        assert!((m.snapshot().stop_loss_price - before).abs() < 1e-12);
    }

    #[test]
    fn trailing_inactive_without_arming() {
        let (m, _dir) = machine();
        m.open_long(0.128, 0.04, 3, T0).unwrap();
        // Profit is high but note_profit never ran, so no raise occurs.
        assert_eq!(m.check_stop_loss(0.135, T0 + 5000), StopCheck::NoAction);
    }

    #[test]
    fn bearish_ladder_dual_and_high_confidence_close_all() {
        let (m, _dir) = machine();
        m.open_long(0.128, 0.04, 3, T0).unwrap();
        assert!(matches!(
            m.handle_bearish(60.0, true, T0 + 60_000),
            BearishAction::CloseAll(_)
        ));

        let (m, _dir) = machine();
        m.open_long(0.128, 0.04, 3, T0).unwrap();
        assert!(matches!(
            m.handle_bearish(92.0, false, T0 + 60_000),
            BearishAction::CloseAll(_)
        ));
    }

    #[test]
    fn bearish_eighty_sets_break_even_and_halves_size() {
        let (m, _dir) = machine();
        m.open_long(0.128, 0.04, 3, T0).unwrap();
        let action = m.handle_bearish(85.0, false, T0 + 60_000);
        assert!(matches!(action, BearishAction::CloseHalf(_)));

        let p = m.snapshot();
        assert!((p.stop_loss_price - 0.128).abs() < 1e-12);
        assert!((p.size_fraction - 0.02).abs() < 1e-12);
    }

    #[test]
    fn bearish_below_eighty_is_no_action() {
        let (m, _dir) = machine();
        m.open_long(0.128, 0.04, 3, T0).unwrap();
        assert_eq!(m.handle_bearish(75.0, false, T0 + 60_000), BearishAction::None);
        // Stop untouched.
        assert!((m.snapshot().stop_loss_price - 0.12288).abs() < 1e-9);
    }

    #[test]
    fn sync_resets_when_exchange_flat() {
        let (m, _dir) = machine();
        m.open_long(0.128, 0.04, 3, T0).unwrap();
        let outcome = m.sync_with_exchange(0, None, T0 + 60_000);
        assert_eq!(outcome, SyncOutcome::ResetToFlat);
        assert_eq!(m.state(), PositionState::Flat);
        let last = m.transitions().last().cloned().unwrap();
        assert_eq!(last.reason, "exchange reports flat");
    }

    #[test]
    fn sync_adopts_unknown_exchange_long() {
        let (m, _dir) = machine();
        let outcome = m.sync_with_exchange(1, Some(PositionSide::Long), T0);
        assert_eq!(outcome, SyncOutcome::AdoptedLong);
        let p = m.snapshot();
        assert_eq!(p.state, PositionState::Long);
        assert_eq!(p.entry_price, 0.0);
        assert_eq!(p.stop_loss_price, 0.0);
        // Unknown entry means no stop evaluation.
        assert_eq!(m.check_stop_loss(0.01, T0 + 5000), StopCheck::NoAction);
    }

    #[test]
    fn sync_ignores_matching_books_and_shorts() {
        let (m, _dir) = machine();
        assert_eq!(m.sync_with_exchange(0, None, T0), SyncOutcome::InSync);
        assert_eq!(
            m.sync_with_exchange(1, Some(PositionSide::Short), T0),
            SyncOutcome::InSync
        );

        m.open_long(0.128, 0.04, 3, T0).unwrap();
        assert_eq!(
            m.sync_with_exchange(1, Some(PositionSide::Long), T0 + 1000),
            SyncOutcome::InSync
        );
    }

    #[test]
    fn pause_resume_lifecycle() {
        let (m, _dir) = machine();
        m.pause("producer down", Some(10_000), T0);
        assert_eq!(m.state(), PositionState::Paused);
        // Timed pause still in force.
        assert!(m.resume(T0 + 5000).is_err());
        assert!(m.resume(T0 + 11_000).is_ok());
        assert_eq!(m.state(), PositionState::Flat);
    }

    #[test]
    fn resume_refused_with_live_entry() {
        let (m, _dir) = machine();
        m.open_long(0.128, 0.04, 3, T0).unwrap();
        m.pause("emergency", None, T0 + 1000);
        assert!(m.resume(T0 + 2000).is_err());
        // reset clears the entry and pause together.
        m.reset("manual", T0 + 3000);
        assert_eq!(m.state(), PositionState::Flat);
    }

    #[test]
    fn jitter_window_tracks_entry_age() {
        let (m, _dir) = machine();
        m.open_long(0.128, 0.04, 3, T0).unwrap();
        assert!(m.within_jitter_window(T0 + 5000));
        assert!(!m.within_jitter_window(T0 + 16_000));
    }

    #[test]
    fn persistence_roundtrip_restores_machine() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("position_state.json");

        let m = PositionMachine::new(&path, HardLimits::default(), GateThresholds::default());
        m.open_long(0.128, 0.04, 3, T0).unwrap();
        m.set_running(true);

        let restored =
            PositionMachine::new(&path, HardLimits::default(), GateThresholds::default());
        assert!(restored.restore().unwrap());
        assert_eq!(restored.state(), PositionState::Long);
        assert!((restored.snapshot().entry_price - 0.128).abs() < 1e-12);
        assert!(restored.is_running());
        assert_eq!(restored.transitions().len(), m.transitions().len());
    }

    #[test]
    fn restore_missing_file_is_clean_boot() {
        let (m, _dir) = machine();
        assert!(!m.restore().unwrap());
        assert_eq!(m.state(), PositionState::Flat);
    }

    #[test]
    fn state_file_stable_without_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("position_state.json");

        let m = PositionMachine::new(&path, HardLimits::default(), GateThresholds::default());
        m.open_long(0.128, 0.04, 3, T0).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();

        // Restore into a fresh machine and run read-only operations: the file
        // must not change except through a mutation.
        let m2 = PositionMachine::new(&path, HardLimits::default(), GateThresholds::default());
        m2.restore().unwrap();
        let _ = m2.snapshot();
        let _ = m2.profit_pct(0.13);
        let _ = m2.state();
        let second = std::fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn transition_log_is_bounded() {
        let (m, _dir) = machine();
        for i in 0..120 {
            m.pause("p", None, T0 + i * 10);
            m.reset("r", T0 + i * 10 + 5);
        }
        assert_eq!(m.transitions().len(), TRANSITION_CAPACITY);
    }

    #[test]
    fn state_file_write_failure_does_not_block_transitions() {
        let dir = tempfile::tempdir().unwrap();
        // Point the state file *inside a file*, which cannot be created.
        let bogus_parent = dir.path().join("occupied");
        std::fs::write(&bogus_parent, b"file, not dir").unwrap();
        let m = PositionMachine::new(
            bogus_parent.join("state.json"),
            HardLimits::default(),
            GateThresholds::default(),
        );

        m.open_long(0.128, 0.04, 3, T0).unwrap();
        assert_eq!(m.state(), PositionState::Long);
    }
}
