//! Position and Closed-Trade Data Model (§3)
//!
//! A `Position` is created by the broker on fill and mutated only by the
//! broker (price updates, SL/TP modification); it is destroyed on close,
//! at which point it becomes an immutable, append-only `ClosedTrade`.

use crate::engine::clock::Nanos;
use crate::engine::tick::{Price, Side, Symbol};
use serde::{Deserialize, Serialize};

/// Monotonically increasing, globally unique position identifier.
/// Once assigned, a ticket is immutable and never reused (§3 invariant).
pub type Ticket = u64;

/// An open position. Tickets are assigned by the broker at fill time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticket: Ticket,
    pub symbol: Symbol,
    pub side: Side,
    pub volume: f64,
    pub open_price: Price,
    pub open_time: Nanos,
    /// Zero means "no stop set".
    pub sl: Price,
    /// Zero means "no target set".
    pub tp: Price,
    pub current_price: Price,
    pub profit: f64,
    pub magic_number: i64,
    pub comment: String,
}

impl Position {
    /// Validate SL placement against §3's invariant: for BUY, `sl < open_price`
    /// when `sl > 0`; for SELL, `sl > open_price`.
    pub fn sl_is_valid(side: Side, open_price: Price, sl: Price) -> bool {
        if sl <= 0.0 {
            return true;
        }
        match side {
            Side::Buy => sl < open_price,
            Side::Sell => sl > open_price,
        }
    }

    /// Recompute `profit` from a fresh mark price, in quote-currency terms
    /// before any account-currency conversion (the broker applies the
    /// cross-rate separately, §4.3 Profit calculation).
    pub fn mark(&mut self, mark_price: Price, contract_size: f64) {
        self.current_price = mark_price;
        self.profit = (mark_price - self.open_price) * self.side.sign() * self.volume * contract_size;
    }

    /// The R-multiple distance used by the Position Manager and Risk Engine:
    /// the absolute distance between entry and the initial stop.
    pub fn risk_distance(&self) -> Option<f64> {
        if self.sl <= 0.0 {
            None
        } else {
            Some((self.open_price - self.sl).abs())
        }
    }

    /// Strategy-tag derived from the comment grammar (§6), used for
    /// duplicate-position prevention (§4.3).
    pub fn strategy_tag(&self) -> &str {
        crate::engine::comment::strategy_of(&self.comment)
    }
}

/// An immutable, append-only record of a closed position (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub ticket: Ticket,
    pub symbol: Symbol,
    pub side: Side,
    pub volume: f64,
    pub open_price: Price,
    pub close_price: Price,
    pub open_time: Nanos,
    pub close_time: Nanos,
    pub profit: f64,
    pub comment: String,
}

impl ClosedTrade {
    /// Close a position at `close_price`/`close_time`, converting its final
    /// profit to account currency via `conversion_rate` (1.0 if the quote
    /// currency already matches account currency, §4.3 Profit calculation).
    pub fn from_position(
        position: &Position,
        close_price: Price,
        close_time: Nanos,
        contract_size: f64,
        conversion_rate: f64,
    ) -> Self {
        let raw_profit =
            (close_price - position.open_price) * position.side.sign() * position.volume * contract_size;
        Self {
            ticket: position.ticket,
            symbol: position.symbol.clone(),
            side: position.side,
            volume: position.volume,
            open_price: position.open_price,
            close_price,
            open_time: position.open_time,
            close_time,
            profit: raw_profit * conversion_rate,
            comment: position.comment.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sl_validity_matches_side() {
        assert!(Position::sl_is_valid(Side::Buy, 1.1000, 1.0990));
        assert!(!Position::sl_is_valid(Side::Buy, 1.1000, 1.1010));
        assert!(Position::sl_is_valid(Side::Sell, 1.1000, 1.1010));
        assert!(!Position::sl_is_valid(Side::Sell, 1.1000, 1.0990));
        // sl == 0 means "no stop", always valid.
        assert!(Position::sl_is_valid(Side::Buy, 1.1000, 0.0));
    }

    #[test]
    fn mark_recomputes_profit() {
        let mut p = Position {
            ticket: 1,
            symbol: "EURUSD".into(),
            side: Side::Buy,
            volume: 0.10,
            open_price: 1.1001,
            open_time: 0,
            sl: 1.0990,
            tp: 1.1020,
            current_price: 1.1001,
            profit: 0.0,
            magic_number: 1,
            comment: "TB|buy".into(),
        };
        p.mark(1.1020, 100_000.0);
        assert!((p.profit - 19.0).abs() < 1e-6);
    }

    #[test]
    fn closed_trade_converts_profit_via_cross_rate() {
        let p = Position {
            ticket: 1,
            symbol: "EURUSD".into(),
            side: Side::Sell,
            volume: 0.10,
            open_price: 1.1001,
            open_time: 0,
            sl: 1.1011,
            tp: 1.0990,
            current_price: 1.1012,
            profit: 0.0,
            magic_number: 1,
            comment: "TB|sell".into(),
        };
        let closed = ClosedTrade::from_position(&p, 1.1011, 100, 100_000.0, 1.0);
        assert!((closed.profit - -10.0).abs() < 1e-6);
    }
}
