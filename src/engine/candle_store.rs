//! Candle Store (C2)
//!
//! Serves per-symbol OHLCV series indexed by timeframe. All lookups are
//! deterministic functions of (simulated-now, timeframe, symbol): a
//! strategy observing at time T can never see a candle whose close time
//! exceeds T (no forward leakage, §4.2).

use crate::engine::candle::{Candle, Timeframe};
use crate::engine::clock::Nanos;
use crate::engine::tick::{QuoteSide, Symbol};
use std::collections::HashMap;

/// Per-symbol, per-timeframe OHLCV series, plus the current tick-derived
/// quote used to serve `current_price`.
#[derive(Debug, Default)]
pub struct CandleStore {
    /// Strictly increasing by bar-open time within each (symbol, timeframe).
    series: HashMap<(Symbol, Timeframe), Vec<Candle>>,
    current_quotes: HashMap<Symbol, (f64, f64)>,
}

impl CandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a symbol/timeframe series, e.g. with a historical lookback
    /// buffer loaded before the backtest start (§4.2 Initialization). Bars
    /// must already be sorted and strictly increasing in open time.
    pub fn load_series(&mut self, symbol: impl Into<String>, timeframe: Timeframe, bars: Vec<Candle>) {
        debug_assert!(
            bars.windows(2).all(|w| w[0].time < w[1].time),
            "candle series must be strictly increasing in open time"
        );
        self.series.insert((symbol.into(), timeframe), bars);
    }

    /// Append a single newly-closed bar to a series (used by the broker
    /// when rolling ticks into candles during a run).
    pub fn push_bar(&mut self, symbol: impl Into<String>, timeframe: Timeframe, bar: Candle) {
        let key = (symbol.into(), timeframe);
        let series = self.series.entry(key).or_default();
        debug_assert!(
            series.last().map(|last| last.time < bar.time).unwrap_or(true),
            "candle series must remain strictly increasing in open time"
        );
        series.push(bar);
    }

    pub fn update_quote(&mut self, symbol: impl Into<String>, bid: f64, ask: f64) {
        self.current_quotes.insert(symbol.into(), (bid, ask));
    }

    /// The `count` most recently *closed* candles up to `now`. The last
    /// entry is the most recently completed bar; any bar still forming at
    /// `now` is excluded.
    pub fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
        now: Nanos,
    ) -> Vec<Candle> {
        let Some(series) = self.series.get(&(symbol.to_string(), timeframe)) else {
            return Vec::new();
        };
        let closed_upto = series
            .iter()
            .rposition(|c| c.close_time(timeframe) <= now)
            .map(|idx| idx + 1)
            .unwrap_or(0);
        let start = closed_upto.saturating_sub(count);
        series[start..closed_upto].to_vec()
    }

    pub fn has_data_at(&self, symbol: &str, timeframe: Timeframe, time: Nanos) -> bool {
        self.series
            .get(&(symbol.to_string(), timeframe))
            .is_some_and(|s| s.iter().any(|c| c.time == time))
    }

    /// Current bid/ask for a symbol, derived from the broker's latest tick.
    pub fn current_price(&self, symbol: &str, side: QuoteSide) -> Option<f64> {
        self.current_quotes.get(symbol).map(|(bid, ask)| match side {
            QuoteSide::Bid => *bid,
            QuoteSide::Ask => *ask,
        })
    }

    /// Raw indexed access into a series, used by the minute-granularity
    /// time advance (§4.4) to walk bars in order independent of the
    /// no-forward-leakage `get_candles` query strategies use.
    pub fn bar_at(&self, symbol: &str, timeframe: Timeframe, idx: usize) -> Option<&Candle> {
        self.series.get(&(symbol.to_string(), timeframe))?.get(idx)
    }

    pub fn series_len(&self, symbol: &str, timeframe: Timeframe) -> usize {
        self.series
            .get(&(symbol.to_string(), timeframe))
            .map(Vec::len)
            .unwrap_or(0)
    }
}
