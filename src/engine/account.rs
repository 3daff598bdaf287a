//! Account State (§3)
//!
//! Balance changes only on position close (realized P&L added); equity is
//! always `balance + sum(open_position.profit)` — never stored
//! independently, so the equity identity invariant (§3, §8) cannot drift.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub balance: f64,
    pub free_margin: f64,
    pub currency: String,
    initial_balance: f64,
}

impl AccountState {
    pub fn new(initial_balance: f64, currency: impl Into<String>) -> Self {
        Self {
            balance: initial_balance,
            free_margin: initial_balance,
            currency: currency.into(),
            initial_balance,
        }
    }

    pub fn initial_balance(&self) -> f64 {
        self.initial_balance
    }

    /// Equity at a given instant: balance plus the sum of open positions'
    /// floating profit. Callers pass the current floating P&L rather than
    /// positions directly so this stays a pure function usable from both
    /// the broker and tests.
    pub fn equity(&self, floating_pnl: f64) -> f64 {
        self.balance + floating_pnl
    }

    /// Realize a closed trade's profit into the balance (§4.3 close_position).
    pub fn apply_realized_profit(&mut self, profit: f64) {
        self.balance += profit;
    }

    pub fn total_profit(&self, floating_pnl: f64) -> f64 {
        self.equity(floating_pnl) - self.initial_balance
    }

    pub fn profit_percent(&self, floating_pnl: f64) -> f64 {
        if self.initial_balance.abs() < f64::EPSILON {
            0.0
        } else {
            self.total_profit(floating_pnl) / self.initial_balance * 100.0
        }
    }
}
