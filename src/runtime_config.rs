// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the flow trader. Hard caps and gate thresholds
// are grouped into two immutable records (`HardLimits`, `GateThresholds`) that
// every consumer reads from the same place; the caps are never duplicated in
// component code.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_inst_id() -> String {
    "DOGE-USDT-SWAP".to_string()
}

fn default_signals_root() -> String {
    "signals".to_string()
}

fn default_events_root() -> String {
    "events".to_string()
}

fn default_state_file() -> String {
    "storage/position_state.json".to_string()
}

fn default_shadow_log() -> String {
    "storage/shadow_shorts.jsonl".to_string()
}

fn default_trial_start_date() -> String {
    "2025-01-01".to_string()
}

fn default_bind_addr() -> String {
    "127.0.0.1:3001".to_string()
}

fn default_max_notional_usd() -> f64 {
    100.0
}

fn default_order_notional_cap_usd() -> f64 {
    50.0
}

fn default_min_notional_usd() -> f64 {
    5.0
}

fn default_max_contracts() -> u64 {
    50
}

fn default_max_position_pct() -> f64 {
    10.0
}

fn default_hard_stop_pct() -> f64 {
    4.0
}

fn default_trailing_trigger_pct() -> f64 {
    2.0
}

fn default_trailing_distance_pct() -> f64 {
    1.5
}

fn default_anti_jitter_s() -> u64 {
    15
}

fn default_main_confidence() -> f64 {
    50.0
}

fn default_exception_confidence() -> f64 {
    40.0
}

fn default_exception_confirm_ratio() -> f64 {
    0.75
}

fn default_exception_age_s() -> u64 {
    30
}

fn default_rebound_pct() -> f64 {
    0.3
}

fn default_observation_s() -> u64 {
    120
}

fn default_anti_chase_rise_pct() -> f64 {
    2.0
}

fn default_speed_drop_limit_pct() -> f64 {
    1.5
}

// =============================================================================
// HardLimits — non-negotiable execution caps
// =============================================================================

/// Hard execution caps consulted by the executor and the monitor. These apply
/// regardless of signal, context, or position state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardLimits {
    /// Absolute notional ceiling per order, in USD.
    #[serde(default = "default_max_notional_usd")]
    pub max_notional_usd: f64,

    /// Sizing clamp applied before contract rounding, in USD.
    #[serde(default = "default_order_notional_cap_usd")]
    pub order_notional_cap_usd: f64,

    /// Orders below this notional are rejected.
    #[serde(default = "default_min_notional_usd")]
    pub min_notional_usd: f64,

    /// Absolute ceiling on contracts per order.
    #[serde(default = "default_max_contracts")]
    pub max_contracts: u64,

    /// Ceiling on position size as a percentage of account equity.
    #[serde(default = "default_max_position_pct")]
    pub max_position_pct: f64,

    /// Full close when loss reaches this percentage.
    #[serde(default = "default_hard_stop_pct")]
    pub hard_stop_pct: f64,

    /// Profit percentage at which trailing activates.
    #[serde(default = "default_trailing_trigger_pct")]
    pub trailing_trigger_pct: f64,

    /// Give-back from the high-water profit that triggers a trailing close.
    #[serde(default = "default_trailing_distance_pct")]
    pub trailing_distance_pct: f64,

    /// Window after entry during which bearish-signal closes are suppressed.
    #[serde(default = "default_anti_jitter_s")]
    pub anti_jitter_s: u64,
}

impl Default for HardLimits {
    fn default() -> Self {
        Self {
            max_notional_usd: default_max_notional_usd(),
            order_notional_cap_usd: default_order_notional_cap_usd(),
            min_notional_usd: default_min_notional_usd(),
            max_contracts: default_max_contracts(),
            max_position_pct: default_max_position_pct(),
            hard_stop_pct: default_hard_stop_pct(),
            trailing_trigger_pct: default_trailing_trigger_pct(),
            trailing_distance_pct: default_trailing_distance_pct(),
            anti_jitter_s: default_anti_jitter_s(),
        }
    }
}

// =============================================================================
// GateThresholds — admission filter tuning
// =============================================================================

/// Thresholds for the three-gate admission filter and observation mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateThresholds {
    /// Main channel minimum confidence.
    #[serde(default = "default_main_confidence")]
    pub main_confidence: f64,

    /// Exception channel minimum confidence.
    #[serde(default = "default_exception_confidence")]
    pub exception_confidence: f64,

    /// Exception channel minimum confirm ratio.
    #[serde(default = "default_exception_confirm_ratio")]
    pub exception_confirm_ratio: f64,

    /// Exception channel maximum signal age in seconds.
    #[serde(default = "default_exception_age_s")]
    pub exception_age_s: u64,

    /// Rebound from the observed low that confirms an entry.
    #[serde(default = "default_rebound_pct")]
    pub rebound_pct: f64,

    /// Lifetime of an observation buffer entry.
    #[serde(default = "default_observation_s")]
    pub observation_s: u64,

    /// 60-second min-to-price rise that rejects a chased entry.
    #[serde(default = "default_anti_chase_rise_pct")]
    pub anti_chase_rise_pct: f64,

    /// 60-second price drop speed above which opens are rejected.
    #[serde(default = "default_speed_drop_limit_pct")]
    pub speed_drop_limit_pct: f64,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            main_confidence: default_main_confidence(),
            exception_confidence: default_exception_confidence(),
            exception_confirm_ratio: default_exception_confirm_ratio(),
            exception_age_s: default_exception_age_s(),
            rebound_pct: default_rebound_pct(),
            observation_s: default_observation_s(),
            anti_chase_rise_pct: default_anti_chase_rise_pct(),
            speed_drop_limit_pct: default_speed_drop_limit_pct(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the flow trader.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Instrument & feed ---------------------------------------------------
    /// Instrument the engine trades (exchange instId form).
    #[serde(default = "default_inst_id")]
    pub inst_id: String,

    /// Directory holding the producer's daily signal files.
    #[serde(default = "default_signals_root")]
    pub signals_root: String,

    /// Legacy per-symbol event directory (fallback file location).
    #[serde(default = "default_events_root")]
    pub events_root: String,

    // --- Persistence ---------------------------------------------------------
    /// Path of the serialized position state file.
    #[serde(default = "default_state_file")]
    pub state_file: String,

    /// Path of the append-only shadow-short log.
    #[serde(default = "default_shadow_log")]
    pub shadow_log: String,

    // --- Trial sizing --------------------------------------------------------
    /// First day of the sizing trial (YYYY-MM-DD). Day index is clamped to 1..7.
    #[serde(default = "default_trial_start_date")]
    pub trial_start_date: String,

    // --- Control surface -----------------------------------------------------
    /// Bind address for the control REST surface.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // --- Caps & thresholds ---------------------------------------------------
    #[serde(default)]
    pub hard_limits: HardLimits,

    #[serde(default)]
    pub gate_thresholds: GateThresholds,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            inst_id: default_inst_id(),
            signals_root: default_signals_root(),
            events_root: default_events_root(),
            state_file: default_state_file(),
            shadow_log: default_shadow_log(),
            trial_start_date: default_trial_start_date(),
            bind_addr: default_bind_addr(),
            hard_limits: HardLimits::default(),
            gate_thresholds: GateThresholds::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        config.validate()?;

        info!(
            path = %path.display(),
            inst_id = %config.inst_id,
            signals_root = %config.signals_root,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply `FLOW_*` environment overrides on top of the loaded file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(inst) = std::env::var("FLOW_INST_ID") {
            if !inst.trim().is_empty() {
                self.inst_id = inst.trim().to_uppercase();
            }
        }
        if let Ok(root) = std::env::var("FLOW_SIGNALS_ROOT") {
            if !root.trim().is_empty() {
                self.signals_root = root.trim().to_string();
            }
        }
        if let Ok(addr) = std::env::var("FLOW_BIND_ADDR") {
            if !addr.trim().is_empty() {
                self.bind_addr = addr.trim().to_string();
            }
        }
        if let Ok(date) = std::env::var("FLOW_TRIAL_START") {
            if NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").is_ok() {
                self.trial_start_date = date.trim().to_string();
            }
        }
    }

    /// Parsed trial start date.
    pub fn trial_start(&self) -> Result<NaiveDate> {
        NaiveDate::parse_from_str(&self.trial_start_date, "%Y-%m-%d").with_context(|| {
            format!("invalid trial_start_date '{}'", self.trial_start_date)
        })
    }

    /// Startup validation. Misconfiguration here is fatal.
    pub fn validate(&self) -> Result<()> {
        if self.inst_id.trim().is_empty() {
            anyhow::bail!("inst_id must not be empty");
        }
        self.trial_start()?;
        let hl = &self.hard_limits;
        if hl.max_notional_usd <= 0.0 || hl.order_notional_cap_usd <= 0.0 {
            anyhow::bail!("notional caps must be positive");
        }
        if hl.order_notional_cap_usd > hl.max_notional_usd {
            anyhow::bail!(
                "order_notional_cap_usd ({}) exceeds max_notional_usd ({})",
                hl.order_notional_cap_usd,
                hl.max_notional_usd
            );
        }
        if hl.max_contracts == 0 {
            anyhow::bail!("max_contracts must be at least 1");
        }
        if hl.max_position_pct <= 0.0 || hl.max_position_pct > 100.0 {
            anyhow::bail!("max_position_pct out of range");
        }
        let gt = &self.gate_thresholds;
        if gt.observation_s == 0 {
            anyhow::bail!("observation_s must be positive");
        }
        if !(0.0..=1.0).contains(&gt.exception_confirm_ratio) {
            anyhow::bail!("exception_confirm_ratio out of [0,1]");
        }
        Ok(())
    }
}
