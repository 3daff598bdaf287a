//! Backtest Configuration
//!
//! `BacktestConfig` captures everything a run needs that isn't pulled from
//! the tick/candle cache itself: symbols, timing mode, granularity,
//! strict-mode, account defaults, and the position-manager/risk policy
//! knobs. Grounded on the teacher's `performance::config::PerfConfig`
//! TOML-via-serde loading pattern (`toml::from_str` + `#[serde(default)]`
//! per field group), generalized from perf-monitor thresholds to backtest
//! parameters.

use crate::engine::barrier::{TimeGranularity, TimeMode};
use crate::engine::position_manager::PositionManagerConfig;
use crate::engine::risk::RiskConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeModeConfig {
    Realtime,
    Fast,
    MaxSpeed,
}

impl From<TimeModeConfig> for TimeMode {
    fn from(m: TimeModeConfig) -> Self {
        match m {
            TimeModeConfig::Realtime => TimeMode::Realtime,
            TimeModeConfig::Fast => TimeMode::Fast,
            TimeModeConfig::MaxSpeed => TimeMode::MaxSpeed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GranularityConfig {
    Tick,
    Minute,
}

impl From<GranularityConfig> for TimeGranularity {
    fn from(g: GranularityConfig) -> Self {
        match g {
            GranularityConfig::Tick => TimeGranularity::Tick,
            GranularityConfig::Minute => TimeGranularity::Minute,
        }
    }
}

fn default_chunk_size() -> usize {
    crate::engine::timeline::StreamingTickTimeline::DEFAULT_CHUNK_SIZE
}

fn default_initial_balance() -> f64 {
    10_000.0
}

fn default_account_currency() -> String {
    "USD".to_string()
}

fn default_time_mode() -> TimeModeConfig {
    TimeModeConfig::MaxSpeed
}

fn default_granularity() -> GranularityConfig {
    GranularityConfig::Tick
}

/// Top-level run configuration, loaded from TOML (`toml`/`serde`, the
/// teacher's config crate of choice) and layered with CLI flag overrides by
/// the `backtest_run` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub symbols: Vec<String>,
    pub tick_cache_root: String,
    pub candle_cache_root: String,

    #[serde(default = "default_time_mode")]
    pub time_mode: TimeModeConfig,

    #[serde(default = "default_granularity")]
    pub granularity: GranularityConfig,

    /// Per §7's "Strategy exception in `on_tick`": when `true`, a panicking
    /// strategy aborts the whole run instead of being logged and skipped.
    #[serde(default)]
    pub strict_mode: bool,

    #[serde(default = "default_initial_balance")]
    pub initial_balance: f64,

    #[serde(default = "default_account_currency")]
    pub account_currency: String,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub position_manager: PositionManagerConfig,

    /// Fixed slippage in points, applied against the filling side (§4.3).
    #[serde(default)]
    pub slippage_points: f64,

    /// Per-lot commission charged at open and again at close (§4.3).
    #[serde(default)]
    pub commission_per_lot: f64,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Path the position journal is written to (§6).
    #[serde(default = "default_journal_path")]
    pub journal_path: String,
}

fn default_journal_path() -> String {
    "positions.json".to_string()
}

impl BacktestConfig {
    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}
