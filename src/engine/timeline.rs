//! Streaming Tick Timeline (C1)
//!
//! A k-way min-heap merge of per-symbol tick sources into one chronologically
//! ordered, lazy, non-restartable stream. Only the current chunk per symbol
//! is held in memory, so an N-day backtest over K symbols holds
//! O(K * chunk_size) ticks regardless of total data volume (§4.1, §9).
//!
//! Ties at identical timestamps are broken by symbol name ascending — this
//! secondary key is load-bearing for reproducibility (§9): without it,
//! concurrent ticks at the same instant would order by file-reader arrival
//! jitter.

use crate::engine::clock::Nanos;
use crate::engine::tick::{Symbol, Tick, TickFile};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

/// Total ordering key for the merge heap: earliest time first, then symbol
/// name ascending. Matches spec.md §4.1's "deterministic secondary key".
#[derive(Debug, Clone, PartialEq, Eq)]
struct HeapKey {
    time: Nanos,
    symbol: Symbol,
}

impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest (time, symbol)
        // pops first.
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.symbol.cmp(&self.symbol))
    }
}

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeapEntry {
    key: HeapKey,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct SymbolStream {
    symbol: Symbol,
    source: Box<dyn TickFile + Send>,
    buffer: VecDeque<Tick>,
    chunk_size: usize,
    exhausted: bool,
}

impl SymbolStream {
    fn refill_if_empty(&mut self) -> std::io::Result<()> {
        if self.buffer.is_empty() && !self.exhausted {
            let chunk = self.source.next_chunk(self.chunk_size)?;
            if chunk.is_empty() {
                self.exhausted = true;
            } else {
                self.buffer.extend(chunk);
            }
        }
        Ok(())
    }
}

/// Error raised when a tick source fails to read; per spec.md §4.1, this
/// aborts the stream — partial delivery is not permitted.
#[derive(Debug, thiserror::Error)]
#[error("tick timeline read error for symbol {symbol}: {source}")]
pub struct TimelineReadError {
    pub symbol: Symbol,
    #[source]
    pub source: std::io::Error,
}

/// The streaming k-way merge over all configured symbols.
pub struct StreamingTickTimeline {
    streams: Vec<SymbolStream>,
    heap: BinaryHeap<(HeapEntry, usize)>,
    started: bool,
    total_hint: Option<usize>,
    emitted: usize,
}

impl StreamingTickTimeline {
    /// Build a timeline from a symbol -> tick source mapping. `chunk_size`
    /// bounds the resident tick count per symbol (default 100k per spec.md
    /// §4.1; callers may choose smaller values, e.g. in tests).
    pub fn new(
        sources: Vec<(Symbol, Box<dyn TickFile + Send>)>,
        chunk_size: usize,
    ) -> Self {
        let total_hint = {
            let mut sum = 0usize;
            let mut known = true;
            for (_, s) in &sources {
                match s.remaining_hint() {
                    Some(n) => sum += n,
                    None => {
                        known = false;
                        break;
                    }
                }
            }
            if known { Some(sum) } else { None }
        };
        let streams = sources
            .into_iter()
            .map(|(symbol, source)| SymbolStream {
                symbol,
                source,
                buffer: VecDeque::new(),
                chunk_size,
                exhausted: false,
            })
            .collect();
        Self {
            streams,
            heap: BinaryHeap::new(),
            started: false,
            total_hint,
            emitted: 0,
        }
    }

    /// Default chunk size per spec.md §4.1.
    pub const DEFAULT_CHUNK_SIZE: usize = 100_000;

    /// Total tick count known in advance, if every source could report one
    /// (exposed for progress reporting, §4.1).
    pub fn total_hint(&self) -> Option<usize> {
        self.total_hint
    }

    pub fn emitted_count(&self) -> usize {
        self.emitted
    }

    /// Whether `symbol`'s own source has delivered its last tick and its
    /// buffer has drained — used by a symbol worker to tell "no more ticks
    /// will ever arrive for me" apart from "no tick happens to be due this
    /// instant" (§8 participant early exit).
    pub fn is_symbol_exhausted(&self, symbol: &str) -> bool {
        self.streams
            .iter()
            .find(|s| s.symbol == symbol)
            .is_some_and(|s| s.exhausted && s.buffer.is_empty())
    }

    fn prime(&mut self) -> Result<(), TimelineReadError> {
        for idx in 0..self.streams.len() {
            self.refill_and_push(idx)?;
        }
        self.started = true;
        Ok(())
    }

    fn refill_and_push(&mut self, idx: usize) -> Result<(), TimelineReadError> {
        let stream = &mut self.streams[idx];
        stream.refill_if_empty().map_err(|e| TimelineReadError {
            symbol: stream.symbol.clone(),
            source: e,
        })?;
        if let Some(tick) = stream.buffer.front() {
            let key = HeapKey {
                time: tick.time,
                symbol: stream.symbol.clone(),
            };
            self.heap.push((HeapEntry { key }, idx));
        }
        Ok(())
    }

    /// Pull the next tick in chronological order, or `None` once every
    /// symbol's source is exhausted. A read failure on any source aborts
    /// the whole stream (no partial delivery, §4.1 Failure).
    pub fn next(&mut self) -> Result<Option<Tick>, TimelineReadError> {
        if !self.started {
            self.prime()?;
        }
        let Some((_, idx)) = self.heap.pop() else {
            return Ok(None);
        };
        let tick = self.streams[idx]
            .buffer
            .pop_front()
            .expect("heap entry implies a buffered tick");
        self.refill_and_push(idx)?;
        self.emitted += 1;
        Ok(Some(tick))
    }
}
