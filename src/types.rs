// =============================================================================
// Shared types used across the flow-radar trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Trade direction carried by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
    Neutral,
}

impl Default for Direction {
    fn default() -> Self {
        Self::Neutral
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
            Self::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// Canonical classification of a normalized signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    IcebergConfirmed,
    IcebergDetected,
    State,
    Resonance,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IcebergConfirmed => write!(f, "ICEBERG_CONFIRMED"),
            Self::IcebergDetected => write!(f, "ICEBERG_DETECTED"),
            Self::State => write!(f, "STATE"),
            Self::Resonance => write!(f, "RESONANCE"),
        }
    }
}

/// Detection strength of an iceberg signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IcebergLevel {
    Activity,
    Confirmed,
}

impl std::fmt::Display for IcebergLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Activity => write!(f, "ACTIVITY"),
            Self::Confirmed => write!(f, "CONFIRMED"),
        }
    }
}

/// Market-state classification emitted by the signal producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketState {
    TrendUp,
    TrendDown,
    Accumulating,
    Distributing,
    WashAccumulate,
    TrapDistribution,
    Neutral,
}

impl MarketState {
    /// Direction implied by the state classification.
    pub fn implied_direction(self) -> Direction {
        match self {
            Self::TrendUp | Self::Accumulating | Self::WashAccumulate => Direction::Long,
            Self::TrendDown | Self::Distributing | Self::TrapDistribution => Direction::Short,
            Self::Neutral => Direction::Neutral,
        }
    }
}

impl std::fmt::Display for MarketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TrendUp => "trend_up",
            Self::TrendDown => "trend_down",
            Self::Accumulating => "accumulating",
            Self::Distributing => "distributing",
            Self::WashAccumulate => "wash_accumulate",
            Self::TrapDistribution => "trap_distribution",
            Self::Neutral => "neutral",
        };
        write!(f, "{s}")
    }
}

/// Producer-level regime annotation carried on signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KGodStatus {
    Normal,
    Caution,
    NoEntry,
    NoEntryClose,
}

impl Default for KGodStatus {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for KGodStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Normal => "normal",
            Self::Caution => "caution",
            Self::NoEntry => "no_entry",
            Self::NoEntryClose => "no_entry_close",
        };
        write!(f, "{s}")
    }
}

/// Action the decision pipeline hands to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeAction {
    OpenLong,
    CloseAll,
    CloseHalf,
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenLong => write!(f, "OPEN_LONG"),
            Self::CloseAll => write!(f, "CLOSE_ALL"),
            Self::CloseHalf => write!(f, "CLOSE_HALF"),
        }
    }
}

/// Side of an exchange-reported position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}
