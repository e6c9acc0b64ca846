// =============================================================================
// Signal History — bounded ring of recent signals for dual-signal pairing
// =============================================================================
//
// A dual signal is an ICEBERG_CONFIRMED plus a STATE signal of the same
// direction within 60 seconds, each with confidence >= 50. The ring holds the
// last 64 signals; the pairing scan is O(n) over that tiny window.
// =============================================================================

use std::collections::VecDeque;

use crate::types::{Direction, SignalKind};

use super::normalizer::Signal;

const CAPACITY: usize = 64;
/// Pairing window.
const DUAL_WINDOW_MS: i64 = 60_000;
/// Minimum confidence for each half of the pair.
const DUAL_MIN_CONFIDENCE: f64 = 50.0;

#[derive(Debug, Clone, Copy)]
struct Entry {
    kind: SignalKind,
    direction: Direction,
    confidence: f64,
    ts_ms: i64,
}

/// Recent-signal ring owned by the decision task.
#[derive(Debug)]
pub struct SignalHistory {
    ring: VecDeque<Entry>,
}

impl SignalHistory {
    pub fn new() -> Self {
        Self {
            ring: VecDeque::with_capacity(CAPACITY),
        }
    }

    /// Record a normalized signal. Oldest entries fall off past capacity.
    pub fn push(&mut self, signal: &Signal) {
        if self.ring.len() == CAPACITY {
            self.ring.pop_front();
        }
        self.ring.push_back(Entry {
            kind: signal.kind,
            direction: signal.direction,
            confidence: signal.confidence,
            ts_ms: signal.timestamp_ms,
        });
    }

    /// Whether an iceberg+state pair of `direction` exists within the pairing
    /// window ending at `now_ms`. The incoming signal must already have been
    /// pushed; it counts as its own half of the pair.
    pub fn is_dual_signal(&self, direction: Direction, now_ms: i64) -> bool {
        let cutoff = now_ms - DUAL_WINDOW_MS;
        let mut iceberg = false;
        let mut state = false;

        for e in self.ring.iter().rev() {
            if e.ts_ms < cutoff {
                break;
            }
            if e.direction != direction || e.confidence < DUAL_MIN_CONFIDENCE {
                continue;
            }
            match e.kind {
                SignalKind::IcebergConfirmed => iceberg = true,
                SignalKind::State => state = true,
                _ => {}
            }
            if iceberg && state {
                return true;
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

impl Default for SignalHistory {
    fn default() -> Self {
        Self::new()
    }
}
