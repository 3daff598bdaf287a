//! Candle (OHLCV) Data Model

use crate::engine::clock::Nanos;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bar timeframe tag, named after the minute count the original source uses
/// for its reference-candle ranges (§3 "Reference candle").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    H1,
    H4,
    D1,
}

impl Timeframe {
    /// Bar duration in nanoseconds.
    pub fn duration_nanos(&self) -> Nanos {
        use crate::engine::clock::{NANOS_PER_MINUTE, NANOS_PER_SEC};
        match self {
            Timeframe::M1 => NANOS_PER_MINUTE,
            Timeframe::M5 => 5 * NANOS_PER_MINUTE,
            Timeframe::M15 => 15 * NANOS_PER_MINUTE,
            Timeframe::H1 => 60 * NANOS_PER_MINUTE,
            Timeframe::H4 => 4 * 60 * NANOS_PER_MINUTE,
            Timeframe::D1 => 24 * 3600 * NANOS_PER_SEC,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Timeframe::M1 => "M1",
            Timeframe::M5 => "M5",
            Timeframe::M15 => "M15",
            Timeframe::H1 => "H1",
            Timeframe::H4 => "H4",
            Timeframe::D1 => "D1",
        };
        write!(f, "{s}")
    }
}

/// A single OHLCV bar. `time` is the bar's open time (§3).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: Nanos,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl Candle {
    /// The bar's close time given its timeframe — the boundary past which a
    /// strategy observing at `now` is allowed to see this candle (§4.2).
    pub fn close_time(&self, timeframe: Timeframe) -> Nanos {
        self.time + timeframe.duration_nanos()
    }
}
