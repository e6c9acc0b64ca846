// =============================================================================
// Shadow Shorts — paper-only record of short signals we never trade
// =============================================================================
//
// The engine is long-only. A SHORT signal arriving while FLAT or PAUSED is
// recorded as a paper short: exactly one record is appended to the jsonl log
// at creation, and the in-memory tracker keeps marking open paper shorts to
// market for the status surface. No exchange order ever results from a
// shadow short.
// =============================================================================

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::signal::Signal;

/// How long a paper short is marked to market before it retires.
const TRACK_MS: i64 = 30 * 60 * 1000;
/// Minimum spacing between recorded checkpoints.
const CHECKPOINT_EVERY_MS: i64 = 60_000;
/// In-memory retention for the status surface.
const RECENT_CAPACITY: usize = 32;

/// A single price observation on an open paper short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub ts_ms: i64,
    pub price: f64,
    pub pnl_pct: f64,
}

/// One paper short.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowShort {
    pub id: String,
    pub signal_snapshot: Signal,
    pub entry_price: f64,
    pub simulated_pnl_pct: f64,
    pub price_checkpoints: Vec<Checkpoint>,
    pub created_at_ms: i64,
}

impl ShadowShort {
    /// Short PnL: positive when price fell below the entry.
    fn pnl_pct(entry: f64, price: f64) -> f64 {
        if entry <= 0.0 {
            return 0.0;
        }
        (entry - price) / entry * 100.0
    }
}

/// Append-only log plus the in-memory mark-to-market tracker.
pub struct ShadowLog {
    path: PathBuf,
    open: RwLock<Vec<ShadowShort>>,
}

impl ShadowLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            open: RwLock::new(Vec::new()),
        }
    }

    /// Record a new paper short. Appends exactly one line to the log; an I/O
    /// failure logs and the in-memory record still tracks.
    pub fn record(&self, signal: &Signal, entry_price: f64, now_ms: i64) {
        let short = ShadowShort {
            id: uuid::Uuid::new_v4().to_string(),
            signal_snapshot: signal.clone(),
            entry_price,
            simulated_pnl_pct: 0.0,
            price_checkpoints: vec![Checkpoint {
                ts_ms: now_ms,
                price: entry_price,
                pnl_pct: 0.0,
            }],
            created_at_ms: now_ms,
        };

        info!(
            id = %short.id,
            signal_id = %signal.id,
            entry_price,
            confidence = signal.confidence,
            "shadow short recorded (paper only)"
        );

        if let Err(e) = append_jsonl(&self.path, &short) {
            error!(path = %self.path.display(), error = %e, "shadow log append failed");
        }

        let mut open = self.open.write();
        open.push(short);
        let excess = open.len().saturating_sub(RECENT_CAPACITY);
        if excess > 0 {
            open.drain(..excess);
        }
    }

    /// Mark open paper shorts to market; retire the ones past their window.
    pub fn mark_price(&self, price: f64, now_ms: i64) {
        if price <= 0.0 {
            return;
        }
        let mut open = self.open.write();
        for short in open.iter_mut() {
            if now_ms - short.created_at_ms > TRACK_MS {
                continue;
            }
            short.simulated_pnl_pct = ShadowShort::pnl_pct(short.entry_price, price);
            let last_cp = short
                .price_checkpoints
                .last()
                .map(|c| c.ts_ms)
                .unwrap_or(short.created_at_ms);
            if now_ms - last_cp >= CHECKPOINT_EVERY_MS {
                short.price_checkpoints.push(Checkpoint {
                    ts_ms: now_ms,
                    price,
                    pnl_pct: short.simulated_pnl_pct,
                });
                debug!(id = %short.id, pnl_pct = short.simulated_pnl_pct, "shadow short checkpoint");
            }
        }
    }

    /// Recent paper shorts for the status surface, newest last.
    pub fn recent(&self) -> Vec<ShadowShort> {
        self.open.read().clone()
    }
}

fn append_jsonl(path: &Path, short: &ShadowShort) -> anyhow::Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let line = serde_json::to_string(short)?;
    writeln!(file, "{line}")?;
    Ok(())
}

impl std::fmt::Debug for ShadowLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowLog")
            .field("path", &self.path)
            .field("open", &self.open.read().len())
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
            id: "short-1".into(),
            kind: SignalKind::IcebergConfirmed,
            direction: Direction::Short,
            confidence: 65.0,
            confirm_ratio: Some(0.2),
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

    fn log_in_tempdir() -> (ShadowLog, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let log = ShadowLog::new(dir.path().join("shadow_shorts.jsonl"));
        (log, dir)
    }

    #[test]
    fn record_appends_exactly_one_line() {
        let (log, dir) = log_in_tempdir();
        log.record(&sig(), 0.128, T0);

        let content =
            std::fs::read_to_string(dir.path().join("shadow_shorts.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1);

        let parsed: ShadowShort = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.entry_price, 0.128);
        assert_eq!(parsed.signal_snapshot.id, "short-1");
        assert_eq!(parsed.price_checkpoints.len(), 1);
    }

    #[test]
    fn marking_does_not_append_more_lines() {
        let (log, dir) = log_in_tempdir();
        log.record(&sig(), 0.128, T0);
        log.mark_price(0.126, T0 + 61_000);
        log.mark_price(0.124, T0 + 122_000);

        let content =
            std::fs::read_to_string(dir.path().join("shadow_shorts.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[test]
    fn mark_price_updates_pnl_and_checkpoints() {
        let (log, _dir) = log_in_tempdir();
        log.record(&sig(), 0.128, T0);

        // Price fell 2 %: short paper-profit is +2 %.
        log.mark_price(0.128 * 0.98, T0 + 61_000);
        let shorts = log.recent();
        assert_eq!(shorts.len(), 1);
        assert!((shorts[0].simulated_pnl_pct - 2.0).abs() < 1e-9);
        assert_eq!(shorts[0].price_checkpoints.len(), 2);

        // Within the checkpoint spacing no extra checkpoint is taken.
        log.mark_price(0.128 * 0.97, T0 + 90_000);
        assert_eq!(log.recent()[0].price_checkpoints.len(), 2);
        assert!((log.recent()[0].simulated_pnl_pct - 3.0).abs() < 1e-9);
    }

    #[test]
    fn retired_shorts_stop_updating() {
        let (log, _dir) = log_in_tempdir();
        log.record(&sig(), 0.128, T0);
        log.mark_price(0.126, T0 + TRACK_MS + 60_000);
        let shorts = log.recent();
        assert_eq!(shorts[0].simulated_pnl_pct, 0.0);
        assert_eq!(shorts[0].price_checkpoints.len(), 1);
    }

    #[test]
    fn multiple_records_accumulate() {
        let (log, dir) = log_in_tempdir();
        log.record(&sig(), 0.128, T0);
        log.record(&sig(), 0.127, T0 + 1000);
        let content =
            std::fs::read_to_string(dir.path().join("shadow_shorts.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert_eq!(log.recent().len(), 2);
    }
}
