// =============================================================================
// Price Ring — ~5-minute rolling tick series with EMA20 and speed statistics
// =============================================================================
//
// The ring is written by the monitor task (which owns the exchange read path)
// and read by the decision and observation tasks. EMA20 prefers a 1-minute
// candle series handed in by the monitor; when that source is unavailable or
// stale the ring's own tick prices are used; the computed value is cached for
// 10 seconds.
// =============================================================================

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::indicators::ema_last;

/// Retention window for tick samples.
const WINDOW_MS: i64 = 300_000;
/// How long a computed EMA20 value is served from cache.
const EMA_CACHE: Duration = Duration::from_secs(10);
/// Candle closes older than this are treated as unavailable.
const CANDLE_STALE: Duration = Duration::from_secs(90);
/// A speed sample must sit within this distance of the window edge.
const SPEED_SAMPLE_TOLERANCE_MS: i64 = 10_000;

/// EMA look-back period.
const EMA_PERIOD: usize = 20;
/// Minimum candle closes for the candle-sourced EMA (seed + stabilisation).
const MIN_CANDLE_CLOSES: usize = 25;
/// Minimum tick samples for the fallback EMA.
const MIN_TICK_SAMPLES: usize = 20;

/// A single observed price.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PricePoint {
    pub price: f64,
    pub ts_ms: i64,
}

/// Rolling price series over the last five minutes.
#[derive(Debug)]
pub struct PriceRing {
    points: VecDeque<PricePoint>,
    candle_closes: Vec<f64>,
    candles_at: Option<Instant>,
    ema_cache: Option<(f64, Instant)>,
}

impl PriceRing {
    pub fn new() -> Self {
        Self {
            points: VecDeque::new(),
            candle_closes: Vec::new(),
            candles_at: None,
            ema_cache: None,
        }
    }

    // -------------------------------------------------------------------------
    // Tick samples
    // -------------------------------------------------------------------------

    /// Append a sample and evict everything older than the retention window.
    pub fn push(&mut self, price: f64, ts_ms: i64) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }
        self.points.push_back(PricePoint { price, ts_ms });
        let cutoff = ts_ms - WINDOW_MS;
        while let Some(front) = self.points.front() {
            if front.ts_ms < cutoff {
                self.points.pop_front();
            } else {
                break;
            }
        }
    }

    /// Most recent price, if any sample exists.
    pub fn latest(&self) -> Option<f64> {
        self.points.back().map(|p| p.price)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    // -------------------------------------------------------------------------
    // Candle source
    // -------------------------------------------------------------------------

    /// Replace the 1-minute candle closes (oldest first) used by `ema20`.
    /// Invalidates the EMA cache.
    pub fn update_candles(&mut self, closes: Vec<f64>) {
        self.candle_closes = closes;
        self.candles_at = Some(Instant::now());
        self.ema_cache = None;
    }

    /// Whether the candle series is recent enough to serve `ema20`.
    pub fn candles_fresh(&self) -> bool {
        self.candles_at
            .map(|at| at.elapsed() < CANDLE_STALE)
            .unwrap_or(false)
    }

    // -------------------------------------------------------------------------
    // Derived statistics
    // -------------------------------------------------------------------------

    /// EMA20 of the best available source.
    ///
    /// Preference order: cached value (<10 s old), fresh candle closes
    /// (>= 25), ring tick prices (>= 20). `None` when no source qualifies.
    pub fn ema20(&mut self) -> Option<f64> {
        if let Some((value, at)) = self.ema_cache {
            if at.elapsed() < EMA_CACHE {
                return Some(value);
            }
        }

        if self.candles_fresh() && self.candle_closes.len() >= MIN_CANDLE_CLOSES {
            if let Some(value) = ema_last(&self.candle_closes, EMA_PERIOD) {
                self.ema_cache = Some((value, Instant::now()));
                return Some(value);
            }
        }

        if self.points.len() >= MIN_TICK_SAMPLES {
            let ticks: Vec<f64> = self.points.iter().map(|p| p.price).collect();
            if let Some(value) = ema_last(&ticks, EMA_PERIOD) {
                self.ema_cache = Some((value, Instant::now()));
                return Some(value);
            }
        }

        None
    }

    /// Percentage drop over roughly the last `window_s` seconds:
    /// `(old − current) / old × 100`. Positive values mean the price fell.
    ///
    /// Returns `None` unless a sample exists within ±10 s of the window edge.
    pub fn speed_drop_pct(&self, window_s: u64, now_ms: i64) -> Option<f64> {
        let current = self.latest()?;
        let target = now_ms - (window_s as i64) * 1000;

        let old = self
            .points
            .iter()
            .min_by_key(|p| (p.ts_ms - target).abs())
            .filter(|p| (p.ts_ms - target).abs() <= SPEED_SAMPLE_TOLERANCE_MS)?;

        if old.price <= 0.0 {
            return None;
        }
        Some((old.price - current) / old.price * 100.0)
    }

    /// Minimum sample price over the last `window_s` seconds.
    pub fn min_in_window(&self, window_s: u64, now_ms: i64) -> Option<f64> {
        let cutoff = now_ms - (window_s as i64) * 1000;
        self.points
            .iter()
            .filter(|p| p.ts_ms >= cutoff)
            .map(|p| p.price)
            .fold(None, |acc, p| match acc {
                Some(m) if m <= p => Some(m),
                _ => Some(p),
            })
    }
}

impl Default for PriceRing {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000_000;

    fn filled_ring(prices: &[(f64, i64)]) -> PriceRing {
        let mut ring = PriceRing::new();
        for &(p, t) in prices {
            ring.push(p, t);
        }
        ring
    }

    #[test]
    fn push_evicts_old_samples() {
        let mut ring = PriceRing::new();
        ring.push(0.120, T0);
        ring.push(0.121, T0 + 200_000);
        ring.push(0.122, T0 + 400_000);
        // First sample is older than 300 s relative to the last push.
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.latest(), Some(0.122));
    }

    #[test]
    fn push_ignores_garbage() {
        let mut ring = PriceRing::new();
        ring.push(f64::NAN, T0);
        ring.push(-1.0, T0);
        ring.push(0.0, T0);
        assert!(ring.is_empty());
    }

    #[test]
    fn speed_drop_positive_when_falling() {
        let ring = filled_ring(&[(0.130, T0), (0.128, T0 + 30_000), (0.1274, T0 + 60_000)]);
        let drop = ring.speed_drop_pct(60, T0 + 60_000).unwrap();
        assert!((drop - 2.0).abs() < 1e-9);
    }

    #[test]
    fn speed_drop_negative_when_rising() {
        let ring = filled_ring(&[(0.128, T0), (0.130, T0 + 60_000)]);
        let drop = ring.speed_drop_pct(60, T0 + 60_000).unwrap();
        assert!(drop < 0.0);
    }

    #[test]
    fn speed_drop_requires_sample_near_window_edge() {
        // Only a 5-second-old sample exists; the 60 s edge has nothing close.
        let ring = filled_ring(&[(0.128, T0 + 55_000), (0.128, T0 + 60_000)]);
        assert!(ring.speed_drop_pct(60, T0 + 60_000).is_none());
    }

    #[test]
    fn min_in_window_scopes_by_time() {
        let ring = filled_ring(&[
            (0.120, T0),
            (0.126, T0 + 250_000),
            (0.127, T0 + 280_000),
            (0.128, T0 + 300_000),
        ]);
        // 60 s window from the last sample excludes the 0.120 print.
        let min = ring.min_in_window(60, T0 + 300_000).unwrap();
        assert!((min - 0.126).abs() < 1e-12);
    }

    #[test]
    fn ema20_none_without_any_source() {
        let mut ring = filled_ring(&[(0.128, T0)]);
        assert!(ring.ema20().is_none());
    }

    #[test]
    fn ema20_falls_back_to_ticks() {
        let mut ring = PriceRing::new();
        for i in 0..30 {
            ring.push(0.128, T0 + i * 1000);
        }
        let v = ring.ema20().unwrap();
        assert!((v - 0.128).abs() < 1e-12);
    }

    #[test]
    fn ema20_prefers_candles() {
        let mut ring = PriceRing::new();
        for i in 0..30 {
            ring.push(0.100, T0 + i * 1000);
        }
        ring.update_candles(vec![0.128; 30]);
        let v = ring.ema20().unwrap();
        assert!((v - 0.128).abs() < 1e-12);
    }

    #[test]
    fn ema20_cache_serves_stale_candle_swap() {
        let mut ring = PriceRing::new();
        ring.update_candles(vec![0.128; 30]);
        let first = ring.ema20().unwrap();
        // A second call within the cache window returns the same value even
        // though the tick ring is empty.
        let second = ring.ema20().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn ema20_ignores_short_candle_series() {
        let mut ring = PriceRing::new();
        ring.update_candles(vec![0.128; 10]);
        assert!(ring.ema20().is_none());
    }
}
