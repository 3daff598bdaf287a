//! Tick Data Model and Chunked Tick Sources
//!
//! A `Tick` is an immutable bid/ask/last quote update for one symbol.
//! `TickFile` abstracts the per-symbol-per-day cache file format (§6):
//! implementations pull bounded chunks so the streaming timeline (C1) never
//! materializes more than `chunk_size` resident ticks ahead of its merge
//! head per symbol.

use crate::engine::clock::Nanos;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;

/// Order side, reused across ticks, orders and positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[inline]
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Sign convention used in profit calculations: +1 for BUY, -1 for SELL.
    #[inline]
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

/// Which side of the quote a price lookup wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuoteSide {
    Bid,
    Ask,
}

pub type Symbol = String;
pub type Price = f64;

/// A single bid/ask/last quote update. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: Symbol,
    pub time: Nanos,
    pub bid: Price,
    pub ask: Price,
    pub last: Price,
    pub volume: u64,
    pub spread: Price,
}

impl Tick {
    /// Build a tick, deriving `last` from mid and `spread` from ask-bid when
    /// not supplied by the source file, per §6's optional-columns rule.
    pub fn new(
        symbol: impl Into<String>,
        time: Nanos,
        bid: Price,
        ask: Price,
        last: Option<Price>,
        volume: u64,
        spread: Option<Price>,
    ) -> Self {
        let mid = (bid + ask) / 2.0;
        Self {
            symbol: symbol.into(),
            time,
            bid,
            ask,
            last: last.unwrap_or(mid),
            volume,
            spread: spread.unwrap_or(ask - bid),
        }
    }

    #[inline]
    pub fn quote(&self, side: QuoteSide) -> Price {
        match side {
            QuoteSide::Bid => self.bid,
            QuoteSide::Ask => self.ask,
        }
    }
}

/// Per-symbol static instrument metadata (§6 Symbol info record).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    /// Smallest price increment, e.g. 0.00001 for a 5-digit FX pair.
    pub point: f64,
    pub digits: u32,
    pub min_lot: f64,
    pub max_lot: f64,
    pub lot_step: f64,
    /// Value of one point move for one lot, in `currency_profit`.
    pub tick_value: f64,
    pub contract_size: f64,
    pub currency_base: String,
    pub currency_profit: String,
    pub trade_allowed: bool,
}

impl SymbolInfo {
    /// A conventional 5-digit FX instrument (e.g. EURUSD), standard lot = 100,000 units.
    pub fn fx_5digit(currency_base: &str, currency_profit: &str) -> Self {
        Self {
            point: 0.00001,
            digits: 5,
            min_lot: 0.01,
            max_lot: 100.0,
            lot_step: 0.01,
            tick_value: 1.0,
            contract_size: 100_000.0,
            currency_base: currency_base.to_string(),
            currency_profit: currency_profit.to_string(),
            trade_allowed: true,
        }
    }

    /// Round `raw` down/up to the nearest `lot_step` using banker's rounding
    /// (round-half-to-even) on the step boundary, per spec.md §4.8 step 5.
    pub fn round_to_lot_step(&self, raw: f64) -> f64 {
        if self.lot_step <= 0.0 {
            return raw;
        }
        let steps = raw / self.lot_step;
        let rounded_steps = round_half_to_even(steps);
        (rounded_steps * self.lot_step * 1e8).round() / 1e8
    }
}

/// Round-half-to-even ("banker's rounding"), matching spec.md §4.8's lot
/// rounding rule so results are reproducible exactly on step boundaries.
pub fn round_half_to_even(x: f64) -> f64 {
    let floor = x.floor();
    let diff = x - floor;
    if (diff - 0.5).abs() < 1e-9 {
        if (floor as i64) % 2 == 0 {
            floor
        } else {
            floor + 1.0
        }
    } else {
        x.round()
    }
}

/// A bounded source of ticks for a single symbol, pulled in chunks so the
/// streaming timeline (C1) never holds more than one chunk resident.
pub trait TickFile {
    /// Pull up to `chunk_size` further ticks in time order. Returns an empty
    /// vec exactly once the source is exhausted.
    fn next_chunk(&mut self, chunk_size: usize) -> std::io::Result<Vec<Tick>>;

    /// Total remaining tick count, if known in advance (for progress, §4.1).
    fn remaining_hint(&self) -> Option<usize> {
        None
    }
}

/// An in-memory tick source, used for tests and small fixtures.
pub struct VecTickFile {
    ticks: std::collections::VecDeque<Tick>,
}

impl VecTickFile {
    pub fn new(ticks: Vec<Tick>) -> Self {
        Self {
            ticks: ticks.into(),
        }
    }
}

impl TickFile for VecTickFile {
    fn next_chunk(&mut self, chunk_size: usize) -> std::io::Result<Vec<Tick>> {
        let n = chunk_size.min(self.ticks.len());
        Ok(self.ticks.drain(..n).collect())
    }

    fn remaining_hint(&self) -> Option<usize> {
        Some(self.ticks.len())
    }
}

/// A CSV-backed tick source implementing the §6 columnar tick cache file
/// format (`time,bid,ask,last,volume,spread` with `last`/`spread` optional).
pub struct CsvTickFile {
    reader: csv::Reader<File>,
    symbol: Symbol,
    exhausted: bool,
}

#[derive(Debug, Deserialize)]
struct CsvTickRow {
    time: Nanos,
    bid: f64,
    ask: f64,
    last: Option<f64>,
    volume: Option<u64>,
    spread: Option<f64>,
}

impl CsvTickFile {
    pub fn open(path: impl AsRef<Path>, symbol: impl Into<String>) -> std::io::Result<Self> {
        let reader = csv::Reader::from_path(path)?;
        Ok(Self {
            reader,
            symbol: symbol.into(),
            exhausted: false,
        })
    }
}

impl TickFile for CsvTickFile {
    fn next_chunk(&mut self, chunk_size: usize) -> std::io::Result<Vec<Tick>> {
        if self.exhausted {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(chunk_size);
        for result in self.reader.deserialize::<CsvTickRow>().take(chunk_size) {
            let row = result.map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
            })?;
            out.push(Tick::new(
                self.symbol.clone(),
                row.time,
                row.bid,
                row.ask,
                row.last,
                row.volume.unwrap_or(0),
                row.spread,
            ));
        }
        if out.len() < chunk_size {
            self.exhausted = true;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_derives_last_and_spread_when_absent() {
        let t = Tick::new("EURUSD", 0, 1.1000, 1.1002, None, 0, None);
        assert!((t.last - 1.1001).abs() < 1e-9);
        assert!((t.spread - 0.0002).abs() < 1e-9);
    }

    #[test]
    fn lot_step_rounding_is_banker_on_boundary() {
        let info = SymbolInfo::fx_5digit("EUR", "USD");
        // 0.015 is exactly halfway between 0.01 and 0.02 lot steps.
        let rounded = info.round_to_lot_step(0.015);
        assert!((rounded - 0.02).abs() < 1e-9, "got {rounded}");
    }

    #[test]
    fn vec_tick_file_chunks_without_duplication() {
        let ticks: Vec<Tick> = (0..5)
            .map(|i| Tick::new("EURUSD", i, 1.1, 1.1001, None, 0, None))
            .collect();
        let mut file = VecTickFile::new(ticks);
        let first = file.next_chunk(2).unwrap();
        assert_eq!(first.len(), 2);
        let second = file.next_chunk(10).unwrap();
        assert_eq!(second.len(), 3);
        let third = file.next_chunk(10).unwrap();
        assert!(third.is_empty());
    }
}
