//! Simulated Broker (C3)
//!
//! Single source of truth for prices, positions, and account state during a
//! backtest. All mutable state lives behind one `parking_lot::Mutex`
//! (§5's "position book held in the broker; all mutations under a single
//! mutex" — here widened to the whole broker, since the candle/quote map
//! has no independent readers once the mutex model is in place, and a
//! single lock keeps fill-then-SL/TP evaluation atomic per step without a
//! second lock-ordering concern). Grounded on `backtest_v2/matching.rs`'s
//! fill-at-quote, no-partial-fill posture and `backtest_v2/orchestrator.rs`'s
//! visibility/ordering discipline.

use crate::engine::account::AccountState;
use crate::engine::candle::{Candle, Timeframe};
use crate::engine::candle_store::CandleStore;
use crate::engine::clock::{Nanos, SimClock};
use crate::engine::comment;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::persistence::PositionJournal;
use crate::engine::position::{ClosedTrade, Position, Ticket};
use crate::engine::tick::{Price, QuoteSide, Side, Symbol, SymbolInfo};
use crate::engine::timeline::StreamingTickTimeline;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;

/// Timeframe the minute-granularity advance walks. Fixed at M1 — candle
/// series at other timeframes are still queryable by strategies via
/// `get_candles`, but the global clock only steps on M1 bar closes.
pub const MINUTE_DRIVER_TIMEFRAME: Timeframe = Timeframe::M1;

struct BrokerState {
    symbols: HashMap<Symbol, SymbolInfo>,
    symbol_order: Vec<Symbol>,
    positions: HashMap<Ticket, Position>,
    next_ticket: Ticket,
    closed_trades: Vec<ClosedTrade>,
    account: AccountState,
    candles: CandleStore,
    clock: SimClock,
    timeline: Option<StreamingTickTimeline>,
    minute_cursor: HashMap<Symbol, usize>,
    slippage_points: f64,
    commission_per_lot: f64,
    journal: PositionJournal,
}

/// The Simulated Broker. Cheap to clone as an `Arc<Broker>` handle across
/// worker threads — every public method takes `&self` and locks internally.
pub struct Broker {
    state: Mutex<BrokerState>,
}

impl Broker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        initial_balance: f64,
        account_currency: impl Into<String>,
        symbols: HashMap<Symbol, SymbolInfo>,
        start_time: Nanos,
        journal_path: impl Into<PathBuf>,
        slippage_points: f64,
        commission_per_lot: f64,
    ) -> Self {
        let mut symbol_order: Vec<Symbol> = symbols.keys().cloned().collect();
        symbol_order.sort();
        Self {
            state: Mutex::new(BrokerState {
                symbols,
                symbol_order,
                positions: HashMap::new(),
                next_ticket: 1,
                closed_trades: Vec::new(),
                account: AccountState::new(initial_balance, account_currency),
                candles: CandleStore::new(),
                clock: SimClock::new(start_time),
                timeline: None,
                minute_cursor: HashMap::new(),
                slippage_points,
                commission_per_lot,
                journal: PositionJournal::new(journal_path),
            }),
        }
    }

    /// Install the streaming tick timeline driving TICK-granularity advance.
    pub fn set_timeline(&self, timeline: StreamingTickTimeline) {
        self.state.lock().timeline = Some(timeline);
    }

    /// Seed a candle series, e.g. the historical lookback window (§4.2).
    pub fn load_candles(&self, symbol: impl Into<String>, timeframe: Timeframe, bars: Vec<Candle>) {
        self.state.lock().candles.load_series(symbol, timeframe, bars);
    }

    /// Seed the current bid/ask for a symbol directly, bypassing the tick
    /// timeline. Used to establish an initial quote before the first tick
    /// arrives (§4.2 Initialization) and by tests that don't need a full
    /// timeline.
    pub fn seed_quote(&self, symbol: impl Into<String>, bid: Price, ask: Price) {
        self.state.lock().candles.update_quote(symbol, bid, ask);
    }

    pub fn now(&self) -> Nanos {
        self.state.lock().clock.now()
    }

    // ---- C3 public operations (§4.3) -------------------------------------

    pub fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        volume: f64,
        sl: Price,
        tp: Price,
        magic_number: i64,
        comment: impl Into<String>,
    ) -> EngineResult<Ticket> {
        let comment = comment.into();
        let mut st = self.state.lock();
        let info = st
            .symbols
            .get(symbol)
            .cloned()
            .ok_or_else(|| EngineError::UnknownSymbol(symbol.to_string()))?;

        let quote_side = match side {
            Side::Buy => QuoteSide::Ask,
            Side::Sell => QuoteSide::Bid,
        };
        let raw_quote = st.candles.current_price(symbol, quote_side).ok_or_else(|| {
            EngineError::InvalidOrder {
                symbol: symbol.to_string(),
                reason: "no current price for symbol yet".to_string(),
            }
        })?;
        let fill_price = apply_slippage(side, raw_quote, info.point, st.slippage_points);

        if !Position::sl_is_valid(side, fill_price, sl) {
            return Err(EngineError::InvalidOrder {
                symbol: symbol.to_string(),
                reason: "stop-loss on wrong side of entry".to_string(),
            });
        }

        if has_duplicate(&st, symbol, side, &comment) {
            return Err(EngineError::DuplicatePosition {
                symbol: symbol.to_string(),
                side,
            });
        }

        let ticket = st.next_ticket;
        st.next_ticket += 1;
        let now = st.clock.now();
        let position = Position {
            ticket,
            symbol: symbol.to_string(),
            side,
            volume,
            open_price: fill_price,
            open_time: now,
            sl,
            tp,
            current_price: fill_price,
            profit: 0.0,
            magic_number,
            comment,
        };
        tracing::info!(symbol, ticket, ?side, fill_price, "position opened");
        st.positions.insert(ticket, position);
        write_journal(&mut st)?;
        Ok(ticket)
    }

    pub fn modify_position(&self, ticket: Ticket, sl: Option<Price>, tp: Option<Price>) -> EngineResult<()> {
        let mut st = self.state.lock();
        {
            let position = st
                .positions
                .get_mut(&ticket)
                .ok_or(EngineError::UnknownTicket(ticket))?;
            if let Some(sl) = sl {
                position.sl = sl;
            }
            if let Some(tp) = tp {
                position.tp = tp;
            }
        }
        write_journal(&mut st)
    }

    pub fn close_position(&self, ticket: Ticket) -> EngineResult<ClosedTrade> {
        let mut st = self.state.lock();
        let close_price = {
            let position = st
                .positions
                .get(&ticket)
                .ok_or(EngineError::UnknownTicket(ticket))?;
            let quote_side = match position.side {
                Side::Buy => QuoteSide::Bid,
                Side::Sell => QuoteSide::Ask,
            };
            st.candles
                .current_price(&position.symbol, quote_side)
                .ok_or_else(|| EngineError::InvalidOrder {
                    symbol: position.symbol.clone(),
                    reason: "no current price to close at".to_string(),
                })?
        };
        close_position_at(&mut st, ticket, close_price)
    }

    pub fn get_positions(&self, symbol: Option<&str>, magic: Option<i64>) -> Vec<Position> {
        let st = self.state.lock();
        st.positions
            .values()
            .filter(|p| symbol.is_none_or(|s| p.symbol == s))
            .filter(|p| magic.is_none_or(|m| p.magic_number == m))
            .cloned()
            .collect()
    }

    pub fn get_current_price(&self, symbol: &str, side: QuoteSide) -> Option<Price> {
        self.state.lock().candles.current_price(symbol, side)
    }

    pub fn get_candles(&self, symbol: &str, timeframe: Timeframe, count: usize) -> Vec<Candle> {
        let st = self.state.lock();
        st.candles.get_candles(symbol, timeframe, count, st.clock.now())
    }

    pub fn has_data_at_current_time(&self, symbol: &str) -> bool {
        let st = self.state.lock();
        st.candles.has_data_at(symbol, MINUTE_DRIVER_TIMEFRAME, st.clock.now())
            || st.candles.current_price(symbol, QuoteSide::Bid).is_some()
    }

    /// Whether `symbol` will never produce another tick or bar for the rest
    /// of the run, as distinct from `has_data_at_current_time` (which only
    /// asks about *this instant*). A symbol worker uses this to depart the
    /// barrier early once its own feed runs dry while others continue
    /// (§4.5, §8 "participant early exit").
    pub fn symbol_feed_exhausted(&self, symbol: &str) -> bool {
        let st = self.state.lock();
        match &st.timeline {
            Some(timeline) => timeline.is_symbol_exhausted(symbol),
            None => {
                let len = st.candles.series_len(symbol, MINUTE_DRIVER_TIMEFRAME);
                let idx = st.minute_cursor.get(symbol).copied().unwrap_or(0);
                len > 0 && idx >= len
            }
        }
    }

    /// Recompute `profit` for all open positions at current prices (§4.3).
    /// A no-op when there are no open positions (§8 boundary behavior).
    pub fn update_positions(&self) -> EngineResult<()> {
        let mut st = self.state.lock();
        let tickets: Vec<Ticket> = st.positions.keys().copied().collect();
        for ticket in tickets {
            let (symbol, side) = {
                let p = &st.positions[&ticket];
                (p.symbol.clone(), p.side)
            };
            let info = st
                .symbols
                .get(&symbol)
                .cloned()
                .ok_or_else(|| EngineError::UnknownSymbol(symbol.clone()))?;
            let quote_side = match side {
                Side::Buy => QuoteSide::Bid,
                Side::Sell => QuoteSide::Ask,
            };
            if let Some(mark) = st.candles.current_price(&symbol, quote_side) {
                st.positions.get_mut(&ticket).unwrap().mark(mark, info.contract_size);
            }
        }
        Ok(())
    }

    /// Consume the next tick from the installed timeline, update the
    /// symbol's current price, and evaluate SL/TP against bid/ask for that
    /// symbol's open positions (§4.3, §4.4 TICK granularity). Returns
    /// `false` once the timeline is exhausted.
    pub fn advance_global_time_tick_by_tick(&self) -> EngineResult<bool> {
        let mut st = self.state.lock();
        let tick = {
            let timeline = st
                .timeline
                .as_mut()
                .expect("TICK granularity requires a timeline installed via set_timeline");
            match timeline.next() {
                Ok(Some(tick)) => tick,
                Ok(None) => return Ok(false),
                Err(e) => {
                    return Err(EngineError::MalformedCacheFile {
                        path: e.symbol,
                        row: 0,
                        reason: e.source.to_string(),
                    })
                }
            }
        };
        st.clock.advance_to(tick.time);
        st.candles.update_quote(tick.symbol.clone(), tick.bid, tick.ask);
        evaluate_stops_tick(&mut st, &tick.symbol, tick.bid, tick.ask)?;
        Ok(true)
    }

    /// Advance to the next minute at which any symbol has a closed M1 bar,
    /// update that symbol's quote to the bar close, and evaluate SL/TP
    /// against the bar's high/low (§4.3 candle-mode variant, §4.4 MINUTE
    /// granularity). Returns `false` once every symbol's M1 series is
    /// exhausted.
    pub fn advance_global_time(&self) -> EngineResult<bool> {
        let mut st = self.state.lock();
        let symbols = st.symbol_order.clone();

        let mut target: Option<Nanos> = None;
        for symbol in &symbols {
            let idx = st.minute_cursor.get(symbol).copied().unwrap_or(0);
            if let Some(bar) = st.candles.bar_at(symbol, MINUTE_DRIVER_TIMEFRAME, idx) {
                target = Some(target.map_or(bar.time, |t| t.min(bar.time)));
            }
        }
        let Some(target) = target else {
            return Ok(false);
        };
        st.clock.advance_to(target);

        for symbol in &symbols {
            let idx = st.minute_cursor.get(symbol).copied().unwrap_or(0);
            let Some(bar) = st.candles.bar_at(symbol, MINUTE_DRIVER_TIMEFRAME, idx).copied() else {
                continue;
            };
            if bar.time != target {
                continue;
            }
            st.minute_cursor.insert(symbol.clone(), idx + 1);
            st.candles.update_quote(symbol.clone(), bar.close, bar.close);
            evaluate_stops_bar(&mut st, symbol, bar.high, bar.low, bar.close_time(MINUTE_DRIVER_TIMEFRAME))?;
        }
        Ok(true)
    }

    pub fn symbol_info(&self, symbol: &str) -> Option<SymbolInfo> {
        self.state.lock().symbols.get(symbol).cloned()
    }

    pub fn account_snapshot(&self) -> (AccountState, f64) {
        let st = self.state.lock();
        let floating: f64 = st.positions.values().map(|p| p.profit).sum();
        (st.account.clone(), floating)
    }

    pub fn closed_trades(&self) -> Vec<ClosedTrade> {
        self.state.lock().closed_trades.clone()
    }
}

fn apply_slippage(side: Side, quote: Price, point: f64, slippage_points: f64) -> Price {
    match side {
        Side::Buy => quote + slippage_points * point,
        Side::Sell => quote - slippage_points * point,
    }
}

fn has_duplicate(st: &BrokerState, symbol: &str, side: Side, new_comment: &str) -> bool {
    let key = comment::duplicate_key(symbol, side, new_comment);
    let live = st
        .positions
        .values()
        .any(|p| comment::duplicate_key(&p.symbol, p.side, &p.comment) == key);
    if live {
        return true;
    }
    // Union with the persisted book per §9: the process may have crashed
    // after creating a position but before this call's journal write landed.
    st.journal
        .read()
        .map(|book| {
            book.positions
                .iter()
                .any(|p| comment::duplicate_key(&p.symbol, p.side, &p.comment) == key)
        })
        .unwrap_or(false)
}

fn write_journal(st: &mut BrokerState) -> EngineResult<()> {
    let snapshot: Vec<Position> = st.positions.values().cloned().collect();
    st.journal.write(&snapshot)?;
    Ok(())
}

fn close_position_at(st: &mut BrokerState, ticket: Ticket, close_price: Price) -> EngineResult<ClosedTrade> {
    let position = st.positions.remove(&ticket).ok_or(EngineError::UnknownTicket(ticket))?;
    let info = st
        .symbols
        .get(&position.symbol)
        .cloned()
        .ok_or_else(|| EngineError::UnknownSymbol(position.symbol.clone()))?;
    let (rate, flagged) = conversion_rate(st, &info.currency_profit);
    if flagged {
        tracing::warn!(
            symbol = %position.symbol,
            ticket,
            quote_currency = %info.currency_profit,
            account_currency = %st.account.currency,
            "missing cross-rate; reporting profit in quote currency"
        );
    }
    let mut trade = ClosedTrade::from_position(&position, close_price, st.clock.now(), info.contract_size, rate);
    let commission = st.commission_per_lot * position.volume * 2.0;
    trade.profit -= commission;
    st.account.apply_realized_profit(trade.profit);
    tracing::info!(symbol = %trade.symbol, ticket, profit = trade.profit, "position closed");
    st.closed_trades.push(trade.clone());
    write_journal(st)?;
    Ok(trade)
}

/// Cross-rate from `currency_profit` into the account currency, sourced
/// from the same current-price state strategies see (§4.3, §9 "Currency
/// conversion of profit" — no look-ahead rate can leak into P&L). Returns
/// `(1.0, true)` — flagged, not silently converted — when no rate is
/// available.
fn conversion_rate(st: &BrokerState, currency_profit: &str) -> (f64, bool) {
    if currency_profit.eq_ignore_ascii_case(&st.account.currency) {
        return (1.0, false);
    }
    let direct = format!("{}{}", currency_profit, st.account.currency);
    if let Some(rate) = st.candles.current_price(&direct, QuoteSide::Ask) {
        return (rate, false);
    }
    let inverse = format!("{}{}", st.account.currency, currency_profit);
    if let Some(rate) = st.candles.current_price(&inverse, QuoteSide::Bid) {
        if rate > 0.0 {
            return (1.0 / rate, false);
        }
    }
    (1.0, true)
}

/// SL/TP evaluation for a single symbol against its tick-mode bid/ask
/// (§4.3). SL takes precedence when both would trigger on the same tick.
fn evaluate_stops_tick(st: &mut BrokerState, symbol: &str, bid: Price, ask: Price) -> EngineResult<()> {
    let tickets: Vec<Ticket> = st
        .positions
        .values()
        .filter(|p| p.symbol == symbol)
        .map(|p| p.ticket)
        .collect();
    for ticket in tickets {
        let trigger = {
            let Some(p) = st.positions.get(&ticket) else {
                continue;
            };
            match p.side {
                Side::Buy => {
                    if p.sl > 0.0 && bid <= p.sl {
                        Some(p.sl)
                    } else if p.tp > 0.0 && bid >= p.tp {
                        Some(p.tp)
                    } else {
                        None
                    }
                }
                Side::Sell => {
                    if p.sl > 0.0 && ask >= p.sl {
                        Some(p.sl)
                    } else if p.tp > 0.0 && ask <= p.tp {
                        Some(p.tp)
                    } else {
                        None
                    }
                }
            }
        };
        if let Some(level) = trigger {
            close_position_at(st, ticket, level)?;
        }
    }
    Ok(())
}

/// SL/TP evaluation against a closed bar's high/low (§4.3 candle-mode
/// variant). SL takes precedence when both would trigger within the bar.
/// The position's clock is advanced to the bar's close time before the
/// close is recorded, since the trigger is only known once the bar closes.
fn evaluate_stops_bar(
    st: &mut BrokerState,
    symbol: &str,
    high: Price,
    low: Price,
    bar_close_time: Nanos,
) -> EngineResult<()> {
    let tickets: Vec<Ticket> = st
        .positions
        .values()
        .filter(|p| p.symbol == symbol)
        .map(|p| p.ticket)
        .collect();
    for ticket in tickets {
        let trigger = {
            let Some(p) = st.positions.get(&ticket) else {
                continue;
            };
            match p.side {
                Side::Buy => {
                    if p.sl > 0.0 && low <= p.sl {
                        Some(p.sl)
                    } else if p.tp > 0.0 && high >= p.tp {
                        Some(p.tp)
                    } else {
                        None
                    }
                }
                Side::Sell => {
                    if p.sl > 0.0 && high >= p.sl {
                        Some(p.sl)
                    } else if p.tp > 0.0 && low <= p.tp {
                        Some(p.tp)
                    } else {
                        None
                    }
                }
            }
        };
        if let Some(level) = trigger {
            let saved_clock = st.clock;
            st.clock.advance_to(bar_close_time.max(st.clock.now()));
            let result = close_position_at(st, ticket, level);
            if result.is_err() {
                st.clock = saved_clock;
            }
            result?;
        }
    }
    Ok(())
}
