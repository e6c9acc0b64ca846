// =============================================================================
// Feed Heartbeat — liveness state machine for the signal producer
// =============================================================================
//
// States and transitions:
//
//   PAUSED   — >=300 s without any signal (also the boot state: a fresh start
//              must first prove the feed is alive).
//   COOLDOWN — entered from PAUSED after 3 consecutive valid signals or 30 s
//              of continuous flow; lasts 60 s.
//   RUNNING  — entered when the cooldown expires. The only state that permits
//              opening positions.
//   ERROR    — set explicitly by the tailer on persistent I/O failure.
// =============================================================================

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

/// Silence threshold that demotes the feed to PAUSED.
const SILENCE_MS: i64 = 300_000;
/// Valid signals required to leave PAUSED.
const RECOVERY_SIGNALS: u32 = 3;
/// Continuous-flow duration that also leaves PAUSED.
const RECOVERY_FLOW_MS: i64 = 30_000;
/// A gap longer than this breaks "continuous flow".
const FLOW_GAP_MS: i64 = 10_000;
/// Cooldown length before RUNNING.
const COOLDOWN_MS: i64 = 60_000;

/// Feed liveness classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FeedState {
    Running,
    Paused,
    Cooldown,
    Error,
}

impl std::fmt::Display for FeedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Paused => write!(f, "PAUSED"),
            Self::Cooldown => write!(f, "COOLDOWN"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: FeedState,
    last_signal_ms: i64,
    consecutive_valid: u32,
    flow_since_ms: Option<i64>,
    cooldown_until_ms: i64,
    error: Option<String>,
}

/// Serialisable snapshot for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatSnapshot {
    pub state: FeedState,
    pub last_signal_age_s: i64,
    pub error: Option<String>,
}

/// Thread-safe heartbeat tracker shared between the decision and observation
/// tasks.
pub struct FeedHeartbeat {
    inner: RwLock<Inner>,
}

impl FeedHeartbeat {
    pub fn new(now_ms: i64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: FeedState::Paused,
                last_signal_ms: now_ms,
                consecutive_valid: 0,
                flow_since_ms: None,
                cooldown_until_ms: 0,
                error: None,
            }),
        }
    }

    /// Record an incoming signal. `valid` means it survived normalization.
    pub fn on_signal(&self, valid: bool, now_ms: i64) {
        let mut inner = self.inner.write();

        // A long gap restarts the continuous-flow clock.
        if now_ms - inner.last_signal_ms > FLOW_GAP_MS {
            inner.flow_since_ms = Some(now_ms);
        } else if inner.flow_since_ms.is_none() {
            inner.flow_since_ms = Some(now_ms);
        }
        inner.last_signal_ms = now_ms;

        if valid {
            inner.consecutive_valid += 1;
        } else {
            inner.consecutive_valid = 0;
        }

        if inner.state == FeedState::Paused {
            let flow_ok = inner
                .flow_since_ms
                .map(|since| now_ms - since >= RECOVERY_FLOW_MS)
                .unwrap_or(false);
            if inner.consecutive_valid >= RECOVERY_SIGNALS || flow_ok {
                inner.state = FeedState::Cooldown;
                inner.cooldown_until_ms = now_ms + COOLDOWN_MS;
                info!(
                    consecutive_valid = inner.consecutive_valid,
                    "feed recovered — entering cooldown"
                );
            }
        }
    }

    /// Periodic evaluation: silence demotion and cooldown expiry.
    pub fn tick(&self, now_ms: i64) {
        let mut inner = self.inner.write();
        if inner.state == FeedState::Error {
            return;
        }

        if now_ms - inner.last_signal_ms >= SILENCE_MS {
            if inner.state != FeedState::Paused {
                warn!(
                    silent_s = (now_ms - inner.last_signal_ms) / 1000,
                    "signal feed silent — pausing entries"
                );
            }
            inner.state = FeedState::Paused;
            inner.consecutive_valid = 0;
            inner.flow_since_ms = None;
            return;
        }

        if inner.state == FeedState::Cooldown && now_ms >= inner.cooldown_until_ms {
            inner.state = FeedState::Running;
            info!("feed cooldown complete — entries permitted");
        }
    }

    /// Flag a persistent feed failure. Clears on `clear_error`.
    pub fn set_error(&self, message: impl Into<String>) {
        let mut inner = self.inner.write();
        inner.state = FeedState::Error;
        inner.error = Some(message.into());
    }

    /// Leave ERROR; the feed must re-prove liveness from PAUSED.
    pub fn clear_error(&self, now_ms: i64) {
        let mut inner = self.inner.write();
        if inner.state == FeedState::Error {
            inner.state = FeedState::Paused;
            inner.error = None;
            inner.consecutive_valid = 0;
            inner.flow_since_ms = None;
            inner.last_signal_ms = now_ms;
        }
    }

    /// Only RUNNING permits opening positions.
    pub fn allows_entry(&self) -> bool {
        self.inner.read().state == FeedState::Running
    }

    pub fn state(&self) -> FeedState {
        self.inner.read().state
    }

    pub fn snapshot(&self, now_ms: i64) -> HeartbeatSnapshot {
        let inner = self.inner.read();
        HeartbeatSnapshot {
            state: inner.state,
            last_signal_age_s: (now_ms - inner.last_signal_ms).max(0) / 1000,
            error: inner.error.clone(),
        }
    }
}

impl std::fmt::Debug for FeedHeartbeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedHeartbeat")
            .field("state", &self.inner.read().state)
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

    #[test]
    fn boots_paused_and_blocks_entries() {
        let hb = FeedHeartbeat::new(T0);
        assert_eq!(hb.state(), FeedState::Paused);
        assert!(!hb.allows_entry());
    }

    #[test]
    fn three_valid_signals_then_cooldown_then_running() {
        let hb = FeedHeartbeat::new(T0);
        hb.on_signal(true, T0 + 1000);
        hb.on_signal(true, T0 + 2000);
        assert_eq!(hb.state(), FeedState::Paused);
        hb.on_signal(true, T0 + 3000);
        assert_eq!(hb.state(), FeedState::Cooldown);
        assert!(!hb.allows_entry());

        hb.tick(T0 + 3000 + 59_000);
        assert_eq!(hb.state(), FeedState::Cooldown);
        hb.tick(T0 + 3000 + 61_000);
        assert_eq!(hb.state(), FeedState::Running);
        assert!(hb.allows_entry());
    }

    #[test]
    fn invalid_signals_reset_the_valid_streak() {
        let hb = FeedHeartbeat::new(T0);
        hb.on_signal(true, T0 + 1000);
        hb.on_signal(true, T0 + 2000);
        hb.on_signal(false, T0 + 3000);
        hb.on_signal(true, T0 + 4000);
        hb.on_signal(true, T0 + 5000);
        assert_eq!(hb.state(), FeedState::Paused);
        hb.on_signal(true, T0 + 6000);
        assert_eq!(hb.state(), FeedState::Cooldown);
    }

    #[test]
    fn thirty_seconds_of_flow_recovers() {
        let hb = FeedHeartbeat::new(T0);
        // Mixed-validity but continuous flow (gaps < 10 s).
        let mut t = T0;
        for i in 0..7 {
            t += 5000;
            hb.on_signal(i % 2 == 0, t);
        }
        assert_eq!(hb.state(), FeedState::Cooldown);
    }

    #[test]
    fn silence_demotes_running_to_paused() {
        let hb = FeedHeartbeat::new(T0);
        for i in 1..=3 {
            hb.on_signal(true, T0 + i * 1000);
        }
        hb.tick(T0 + 3000 + 61_000);
        assert_eq!(hb.state(), FeedState::Running);

        hb.tick(T0 + 3000 + 61_000 + SILENCE_MS);
        assert_eq!(hb.state(), FeedState::Paused);
        assert!(!hb.allows_entry());
    }

    #[test]
    fn flow_gap_restarts_the_flow_clock() {
        let hb = FeedHeartbeat::new(T0);
        hb.on_signal(false, T0 + 1000);
        // 20 s gap breaks continuity; the next signal restarts the clock, so
        // 25 s later the 30 s flow requirement is still unmet.
        hb.on_signal(false, T0 + 21_000);
        hb.on_signal(false, T0 + 29_000);
        hb.on_signal(false, T0 + 38_000);
        hb.on_signal(false, T0 + 46_000);
        assert_eq!(hb.state(), FeedState::Paused);
        // Crossing 30 s since the restart recovers.
        hb.on_signal(false, T0 + 52_000);
        assert_eq!(hb.state(), FeedState::Cooldown);
    }

    #[test]
    fn error_state_is_sticky_until_cleared() {
        let hb = FeedHeartbeat::new(T0);
        hb.set_error("disk gone");
        assert_eq!(hb.state(), FeedState::Error);
        hb.tick(T0 + 1000);
        assert_eq!(hb.state(), FeedState::Error);

        hb.clear_error(T0 + 2000);
        assert_eq!(hb.state(), FeedState::Paused);
        assert!(hb.snapshot(T0 + 2000).error.is_none());
    }
}
