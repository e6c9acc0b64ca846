// =============================================================================
// Iceberg Statistics — rolling 5-minute buy/sell iceberg counters
// =============================================================================

use serde::Serialize;

use crate::types::{Direction, IcebergLevel};

/// Counter window length.
const WINDOW_MS: i64 = 300_000;

/// Rolling counts of iceberg detections, split by side and strength.
///
/// Owned exclusively by the decision task; the counters reset wholesale on the
/// first update after the window has elapsed.
#[derive(Debug, Clone, Serialize)]
pub struct IcebergStats {
    pub buy_confirmed: u64,
    pub sell_confirmed: u64,
    pub buy_detected: u64,
    pub sell_detected: u64,
    last_updated_ms: i64,
}

impl IcebergStats {
    pub fn new() -> Self {
        Self {
            buy_confirmed: 0,
            sell_confirmed: 0,
            buy_detected: 0,
            sell_detected: 0,
            last_updated_ms: 0,
        }
    }

    /// Record one iceberg observation.
    pub fn update(&mut self, direction: Direction, level: IcebergLevel, now_ms: i64) {
        if self.last_updated_ms > 0 && now_ms - self.last_updated_ms >= WINDOW_MS {
            self.reset();
        }
        self.last_updated_ms = now_ms;

        match (direction, level) {
            (Direction::Long, IcebergLevel::Confirmed) => self.buy_confirmed += 1,
            (Direction::Long, IcebergLevel::Activity) => self.buy_detected += 1,
            (Direction::Short, IcebergLevel::Confirmed) => self.sell_confirmed += 1,
            (Direction::Short, IcebergLevel::Activity) => self.sell_detected += 1,
            (Direction::Neutral, _) => {}
        }
    }

    /// Buy share of confirmed icebergs. Neutral 0.5 when nothing confirmed yet.
    pub fn confirm_ratio(&self) -> f64 {
        let denom = self.buy_confirmed + self.sell_confirmed;
        if denom == 0 {
            return 0.5;
        }
        self.buy_confirmed as f64 / denom as f64
    }

    fn reset(&mut self) {
        self.buy_confirmed = 0;
        self.sell_confirmed = 0;
        self.buy_detected = 0;
        self.sell_detected = 0;
    }
}

impl Default for IcebergStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000_000;

    #[test]
    fn neutral_ratio_with_no_data() {
        let stats = IcebergStats::new();
        assert!((stats.confirm_ratio() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn ratio_counts_confirmed_only() {
        let mut stats = IcebergStats::new();
        stats.update(Direction::Long, IcebergLevel::Confirmed, T0);
        stats.update(Direction::Long, IcebergLevel::Confirmed, T0 + 1000);
        stats.update(Direction::Long, IcebergLevel::Confirmed, T0 + 2000);
        stats.update(Direction::Short, IcebergLevel::Confirmed, T0 + 3000);
        stats.update(Direction::Short, IcebergLevel::Activity, T0 + 4000);
        assert!((stats.confirm_ratio() - 0.75).abs() < 1e-12);
        assert_eq!(stats.sell_detected, 1);
    }

    #[test]
    fn neutral_direction_is_ignored() {
        let mut stats = IcebergStats::new();
        stats.update(Direction::Neutral, IcebergLevel::Confirmed, T0);
        assert_eq!(stats.buy_confirmed + stats.sell_confirmed, 0);
        assert!((stats.confirm_ratio() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn window_elapse_resets_counters() {
        let mut stats = IcebergStats::new();
        stats.update(Direction::Long, IcebergLevel::Confirmed, T0);
        stats.update(Direction::Short, IcebergLevel::Confirmed, T0 + 1000);

        // First update after the window elapses wipes the old counts.
        stats.update(Direction::Long, IcebergLevel::Confirmed, T0 + WINDOW_MS + 1000);
        assert_eq!(stats.buy_confirmed, 1);
        assert_eq!(stats.sell_confirmed, 0);
        assert!((stats.confirm_ratio() - 1.0).abs() < 1e-12);
    }
}
