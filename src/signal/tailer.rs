// =============================================================================
// Signal Tailer — follows the producer's append-only daily signal file
// =============================================================================
//
// File resolution order for a given date:
//   1. <signals_root>/<YYYY-MM-DD>.jsonl
//   2. <events_root>/<SYMBOL>_<YYYY-MM-DD>.jsonl   (legacy layout)
//
// On start the tailer replays the last <=10 KiB of the file, emitting only
// records aged <=60 s. Afterwards it polls the file size every second and
// emits newly appended complete lines; a trailing partial line is buffered
// until its newline arrives. At local midnight the tailer switches to the new
// day's file. Rotated `.gz` archives are acknowledged but never consumed.
//
// Raw records are fanned out on a bounded broadcast channel; a lagging
// consumer drops the oldest entries and logs the count on its side.
// =============================================================================

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{Local, NaiveDate};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::normalizer::parse_timestamp_ms;

/// Poll cadence for file growth.
const POLL_INTERVAL_MS: u64 = 1000;
/// How much of the file tail is replayed on start.
const REPLAY_TAIL_BYTES: u64 = 10 * 1024;
/// Records older than this are skipped during replay.
const REPLAY_MAX_AGE_S: i64 = 60;

/// Shared counters for the status surface and error taxonomy.
#[derive(Debug, Default)]
pub struct TailerStats {
    pub lines_emitted: AtomicU64,
    pub malformed_lines: AtomicU64,
    pub read_errors: AtomicU64,
}

/// Consecutive read failures before the feed heartbeat flips to ERROR.
const ERROR_AFTER_FAILURES: u32 = 5;

/// Tails the signal producer's daily file and emits raw record maps.
pub struct SignalTailer {
    signals_root: PathBuf,
    events_root: PathBuf,
    /// Symbol prefix used by the legacy file layout (e.g. "DOGE-USDT").
    legacy_symbol: String,
    stats: Arc<TailerStats>,
    heartbeat: Arc<super::FeedHeartbeat>,
}

impl SignalTailer {
    pub fn new(
        signals_root: impl Into<PathBuf>,
        events_root: impl Into<PathBuf>,
        inst_id: &str,
        stats: Arc<TailerStats>,
        heartbeat: Arc<super::FeedHeartbeat>,
    ) -> Self {
        Self {
            signals_root: signals_root.into(),
            events_root: events_root.into(),
            legacy_symbol: inst_id.trim_end_matches("-SWAP").to_string(),
            stats,
            heartbeat,
        }
    }

    fn primary_file(&self, date: NaiveDate) -> PathBuf {
        self.signals_root.join(format!("{}.jsonl", date.format("%Y-%m-%d")))
    }

    fn legacy_file(&self, date: NaiveDate) -> PathBuf {
        self.events_root
            .join(format!("{}_{}.jsonl", self.legacy_symbol, date.format("%Y-%m-%d")))
    }

    /// Pick today's live file, preferring the primary layout.
    fn resolve_file(&self, date: NaiveDate) -> PathBuf {
        let primary = self.primary_file(date);
        if primary.exists() {
            return primary;
        }
        let legacy = self.legacy_file(date);
        if legacy.exists() {
            return legacy;
        }
        primary
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    /// Run until the shutdown signal flips. Emits raw JSON records in file
    /// order on `tx`.
    pub async fn run(self, tx: broadcast::Sender<Value>, mut shutdown: watch::Receiver<bool>) {
        let mut date = Local::now().date_naive();
        let mut path = self.resolve_file(date);
        let mut offset: u64 = 0;
        let mut partial = String::new();
        let mut gz_noticed = false;
        let mut consecutive_failures: u32 = 0;

        info!(path = %path.display(), "signal tailer starting");

        // Replay the recent tail before switching to live polling.
        match self.replay_tail(&path, &tx).await {
            Ok(end_offset) => offset = end_offset,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no replayable tail");
            }
        }

        let mut ticker = tokio::time::interval(tokio::time::Duration::from_millis(POLL_INTERVAL_MS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("signal tailer stopping");
                        return;
                    }
                }
            }

            // Date rollover: switch to the new day's file.
            let today = Local::now().date_naive();
            if today != date {
                info!(old = %date, new = %today, "signal file date rollover");
                date = today;
                path = self.resolve_file(date);
                offset = 0;
                partial.clear();
                gz_noticed = false;
            }

            if !path.exists() {
                // A rotated archive may exist while the live file has not
                // been created yet; wait for the uncompressed file.
                let gz = path.with_extension("jsonl.gz");
                if gz.exists() && !gz_noticed {
                    debug!(path = %gz.display(), "compressed archive present — waiting for live file");
                    gz_noticed = true;
                }
                // The legacy layout may appear later in the day.
                let resolved = self.resolve_file(date);
                if resolved != path {
                    path = resolved;
                    offset = 0;
                    partial.clear();
                }
                continue;
            }

            let len = match tokio::fs::metadata(&path).await {
                Ok(m) => m.len(),
                Err(e) => {
                    self.stats.read_errors.fetch_add(1, Ordering::Relaxed);
                    consecutive_failures += 1;
                    self.flag_persistent_failure(consecutive_failures, &path);
                    debug!(path = %path.display(), error = %e, "stat failed — retrying next tick");
                    continue;
                }
            };

            if len < offset {
                warn!(
                    path = %path.display(),
                    old_offset = offset,
                    new_len = len,
                    "signal file shrank — assuming rotation, restarting from zero"
                );
                offset = 0;
                partial.clear();
            }

            if len == offset {
                continue;
            }

            match read_range(&path, offset, len).await {
                Ok(bytes) => {
                    if consecutive_failures >= ERROR_AFTER_FAILURES {
                        self.heartbeat
                            .clear_error(chrono::Utc::now().timestamp_millis());
                        info!(path = %path.display(), "signal file readable again");
                    }
                    consecutive_failures = 0;
                    offset = len;
                    let chunk = String::from_utf8_lossy(&bytes).into_owned();
                    let combined = format!("{partial}{chunk}");
                    partial.clear();
                    self.emit_lines(&combined, &mut partial, &tx);
                }
                Err(e) => {
                    self.stats.read_errors.fetch_add(1, Ordering::Relaxed);
                    consecutive_failures += 1;
                    self.flag_persistent_failure(consecutive_failures, &path);
                    warn!(path = %path.display(), error = %e, "signal file read failed");
                }
            }
        }
    }

    /// Persistent read failure moves the feed heartbeat to ERROR so gate 3
    /// stops admitting entries.
    fn flag_persistent_failure(&self, consecutive_failures: u32, path: &Path) {
        if consecutive_failures == ERROR_AFTER_FAILURES {
            self.heartbeat
                .set_error(format!("signal file unreadable: {}", path.display()));
        }
    }

    /// Split `buffer` into complete lines, parking an unterminated tail in
    /// `partial`, and emit each parseable record.
    fn emit_lines(&self, buffer: &str, partial: &mut String, tx: &broadcast::Sender<Value>) {
        let ends_complete = buffer.ends_with('\n');
        let mut lines: Vec<&str> = buffer.split('\n').collect();

        if !ends_complete {
            if let Some(tail) = lines.pop() {
                partial.push_str(tail);
            }
        }

        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(record) => {
                    self.stats.lines_emitted.fetch_add(1, Ordering::Relaxed);
                    // Send only fails with zero receivers (shutdown path).
                    let _ = tx.send(record);
                }
                Err(e) => {
                    self.stats.malformed_lines.fetch_add(1, Ordering::Relaxed);
                    debug!(error = %e, "malformed signal line dropped");
                }
            }
        }
    }

    /// Replay recent records from the last <=10 KiB of `path`. Returns the
    /// offset live tailing should continue from.
    async fn replay_tail(&self, path: &Path, tx: &broadcast::Sender<Value>) -> anyhow::Result<u64> {
        let len = tokio::fs::metadata(path).await?.len();
        let start = len.saturating_sub(REPLAY_TAIL_BYTES);
        let bytes = read_range(path, start, len).await?;
        let mut text = String::from_utf8_lossy(&bytes).into_owned();

        // Seeking mid-file usually lands inside a line; drop the fragment.
        if start > 0 {
            if let Some(idx) = text.find('\n') {
                text = text.split_off(idx + 1);
            } else {
                text.clear();
            }
        }

        // An unterminated final line belongs to the live tail, not the replay.
        let mut trailing_partial = 0u64;
        if !text.ends_with('\n') && !text.is_empty() {
            match text.rfind('\n') {
                Some(idx) => {
                    trailing_partial = (text.len() - idx - 1) as u64;
                    text.truncate(idx + 1);
                }
                None => {
                    trailing_partial = text.len() as u64;
                    text.clear();
                }
            }
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut replayed = 0usize;
        let mut skipped = 0usize;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record: Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(_) => {
                    self.stats.malformed_lines.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            let fresh = parse_timestamp_ms(&record)
                .map(|ts| now_ms - ts <= REPLAY_MAX_AGE_S * 1000)
                .unwrap_or(false);
            if fresh {
                self.stats.lines_emitted.fetch_add(1, Ordering::Relaxed);
                let _ = tx.send(record);
                replayed += 1;
            } else {
                skipped += 1;
            }
        }

        info!(replayed, skipped, path = %path.display(), "startup replay complete");
        Ok(len - trailing_partial)
    }
}

/// Read `[start, end)` from `path`.
async fn read_range(path: &Path, start: u64, end: u64) -> anyhow::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = Vec::with_capacity((end - start) as usize);
    file.take(end - start).read_to_end(&mut buf).await?;
    Ok(buf)
}
