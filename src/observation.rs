// =============================================================================
// Observation Buffer — hold a qualified signal until the knife stops falling
// =============================================================================
//
// A LONG signal that passes the gates does not trade immediately. It enters
// observation: the buffer tracks the lowest price seen and confirms the entry
// only once price rebounds >= 0.3 % off that low, within a 120 s window.
// Entries that never stop falling expire instead of filling.
//
// At most one observation exists, and only while the machine is FLAT; a new
// LONG signal arriving while the slot is occupied is discarded upstream.
// =============================================================================

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::runtime_config::GateThresholds;
use crate::signal::Signal;

/// One signal under observation.
#[derive(Debug, Clone, Serialize)]
pub struct Observation {
    pub signal: Signal,
    pub trigger_price: f64,
    pub lowest_seen_price: f64,
    pub entered_at_ms: i64,
    pub expires_at_ms: i64,
}

/// Outcome of one 1 Hz evaluation.
#[derive(Debug, Clone)]
pub enum ObservationTick {
    /// Rebound confirmed; the observation is removed and returned.
    Confirmed(Observation),
    /// The window lapsed without a rebound; removed and returned.
    Expired(Observation),
    /// Still watching.
    Tracking { rebound_pct: f64 },
    /// Nothing under observation.
    Idle,
}

/// Single-slot buffer shared by the decision and observation tasks.
pub struct ObservationBuffer {
    slot: RwLock<Option<Observation>>,
    rebound_pct: f64,
    window_ms: i64,
}

impl ObservationBuffer {
    pub fn new(thresholds: &GateThresholds) -> Self {
        Self {
            slot: RwLock::new(None),
            rebound_pct: thresholds.rebound_pct,
            window_ms: (thresholds.observation_s as i64) * 1000,
        }
    }

    /// Install a qualified signal. Returns `false` when the slot is occupied
    /// (the caller discards the new signal).
    pub fn install(&self, signal: Signal, trigger_price: f64, now_ms: i64) -> bool {
        let mut slot = self.slot.write();
        if slot.is_some() {
            debug!(signal_id = %signal.id, "observation slot occupied — discarding signal");
            return false;
        }

        info!(
            signal_id = %signal.id,
            trigger_price,
            window_s = self.window_ms / 1000,
            "observation started"
        );

        *slot = Some(Observation {
            signal,
            trigger_price,
            lowest_seen_price: trigger_price,
            entered_at_ms: now_ms,
            expires_at_ms: now_ms + self.window_ms,
        });
        true
    }

    /// Evaluate the slot against the latest price.
    pub fn tick(&self, price: f64, now_ms: i64) -> ObservationTick {
        let mut slot = self.slot.write();
        let Some(mut obs) = slot.take() else {
            return ObservationTick::Idle;
        };

        if price > 0.0 && price < obs.lowest_seen_price {
            obs.lowest_seen_price = price;
        }

        let rebound_pct = if obs.lowest_seen_price > 0.0 {
            (price - obs.lowest_seen_price) / obs.lowest_seen_price * 100.0
        } else {
            0.0
        };

        if price > 0.0 && rebound_pct >= self.rebound_pct {
            info!(
                signal_id = %obs.signal.id,
                rebound_pct,
                low = obs.lowest_seen_price,
                price,
                "rebound confirmed"
            );
            return ObservationTick::Confirmed(obs);
        }

        if now_ms >= obs.expires_at_ms {
            info!(
                signal_id = %obs.signal.id,
                low = obs.lowest_seen_price,
                "observation expired without rebound"
            );
            return ObservationTick::Expired(obs);
        }

        *slot = Some(obs);
        ObservationTick::Tracking { rebound_pct }
    }

    pub fn is_occupied(&self) -> bool {
        self.slot.read().is_some()
    }

    /// Drop whatever is under observation (state-machine reset path).
    pub fn clear(&self) {
        let mut slot = self.slot.write();
        if let Some(obs) = slot.take() {
            info!(signal_id = %obs.signal.id, "observation cleared");
        }
    }

    pub fn snapshot(&self) -> Option<Observation> {
        self.slot.read().clone()
    }
}

impl std::fmt::Debug for ObservationBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservationBuffer")
            .field("occupied", &self.is_occupied())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, SignalKind};

    const T0: i64 = 1_700_000_000_000;

    fn sig() -> Signal {
        Signal {
            id: "obs-1".into(),
            kind: SignalKind::IcebergConfirmed,
            direction: Direction::Long,
            confidence: 75.0,
            confirm_ratio: Some(0.8),
            price: 0.128,
            volume: 0.0,
            timestamp_ms: T0,
            ttl_seconds: 60,
            symbol: "DOGE-USDT".into(),
            iceberg_level: None,
            market_state: None,
            k_god_status: None,
        }
    }

    fn buffer() -> ObservationBuffer {
        ObservationBuffer::new(&GateThresholds::default())
    }

    #[test]
    fn install_then_second_install_is_discarded() {
        let buf = buffer();
        assert!(buf.install(sig(), 0.128, T0));
        assert!(!buf.install(sig(), 0.129, T0 + 1000));
        assert_eq!(buf.snapshot().unwrap().trigger_price, 0.128);
    }

    #[test]
    fn rebound_from_low_confirms() {
        let buf = buffer();
        buf.install(sig(), 0.128, T0);

        // Dip first, then rebound 0.35 % off the dip.
        assert!(matches!(
            buf.tick(0.1275, T0 + 1000),
            ObservationTick::Tracking { .. }
        ));
        let confirm_price = 0.1275 * 1.0035;
        match buf.tick(confirm_price, T0 + 2000) {
            ObservationTick::Confirmed(obs) => {
                assert_eq!(obs.lowest_seen_price, 0.1275);
                assert_eq!(obs.trigger_price, 0.128);
            }
            other => panic!("expected confirmation, got {other:?}"),
        }
        assert!(!buf.is_occupied());
    }

    #[test]
    fn rebound_from_trigger_without_dip_also_confirms() {
        let buf = buffer();
        buf.install(sig(), 0.128, T0);
        // No dip: low stays at the trigger, so +0.35 % off the trigger fires.
        match buf.tick(0.128 * 1.0035, T0 + 1000) {
            ObservationTick::Confirmed(obs) => {
                assert_eq!(obs.lowest_seen_price, 0.128);
            }
            other => panic!("expected confirmation, got {other:?}"),
        }
    }

    #[test]
    fn sub_threshold_rebound_keeps_tracking() {
        let buf = buffer();
        buf.install(sig(), 0.128, T0);
        buf.tick(0.1270, T0 + 1000);
        match buf.tick(0.1270 * 1.002, T0 + 2000) {
            ObservationTick::Tracking { rebound_pct } => {
                assert!(rebound_pct < 0.3);
                assert!(rebound_pct > 0.0);
            }
            other => panic!("expected tracking, got {other:?}"),
        }
        assert!(buf.is_occupied());
    }

    #[test]
    fn window_lapse_expires_the_signal() {
        let buf = buffer();
        buf.install(sig(), 0.128, T0);
        buf.tick(0.1275, T0 + 1000);
        match buf.tick(0.1274, T0 + 121_000) {
            ObservationTick::Expired(obs) => assert_eq!(obs.signal.id, "obs-1"),
            other => panic!("expected expiry, got {other:?}"),
        }
        assert!(!buf.is_occupied());
        assert!(matches!(buf.tick(0.128, T0 + 122_000), ObservationTick::Idle));
    }

    #[test]
    fn falling_price_keeps_lowering_the_low() {
        let buf = buffer();
        buf.install(sig(), 0.128, T0);
        buf.tick(0.1276, T0 + 1000);
        buf.tick(0.1272, T0 + 2000);
        buf.tick(0.1268, T0 + 3000);
        assert_eq!(buf.snapshot().unwrap().lowest_seen_price, 0.1268);

        // The rebound is measured from the deepest low.
        match buf.tick(0.1268 * 1.003, T0 + 4000) {
            ObservationTick::Confirmed(_) => {}
            other => panic!("expected confirmation, got {other:?}"),
        }
    }

    #[test]
    fn clear_empties_the_slot() {
        let buf = buffer();
        buf.install(sig(), 0.128, T0);
        buf.clear();
        assert!(!buf.is_occupied());
        assert!(matches!(buf.tick(0.2, T0 + 1000), ObservationTick::Idle));
    }
}
