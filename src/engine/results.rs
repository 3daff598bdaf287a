//! Results Output (§6)
//!
//! `BacktestResults` is the run-end record: final balance/equity, total
//! profit, an equity curve, and the closed-trade journal. Grounded on
//! `backtest_v2/equity_curve.rs`'s `EquityPoint` shape, simplified from
//! fixed-point ledger arithmetic (`AMOUNT_SCALE`) to plain `f64` account
//! currency since this crate has no binary-settlement ledger to share it
//! with.

use crate::engine::barrier::TimeGranularity;
use crate::engine::clock::Nanos;
use crate::engine::position::ClosedTrade;
use serde::{Deserialize, Serialize};

/// A single point on the equity curve, recorded once per barrier cycle by
/// the position-monitor (§6 Results output).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub time: Nanos,
    pub balance: f64,
    pub equity: f64,
    pub profit: f64,
    pub open_positions: usize,
}

/// Which SL/TP evaluation granularity produced this run, stamped into the
/// results record per §9's first resolved open question so a reader of the
/// JSON file never has to re-derive it from a separate config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlTpEvaluation {
    PerTick,
    PerBar,
}

impl From<TimeGranularity> for SlTpEvaluation {
    fn from(g: TimeGranularity) -> Self {
        match g {
            TimeGranularity::Tick => SlTpEvaluation::PerTick,
            TimeGranularity::Minute => SlTpEvaluation::PerBar,
        }
    }
}

/// The run-end results record (§6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResults {
    pub run_id: String,
    pub sl_tp_evaluation: SlTpEvaluation,
    pub final_balance: f64,
    pub final_equity: f64,
    pub total_profit: f64,
    pub profit_percent: f64,
    pub equity_curve: Vec<EquityPoint>,
    pub trade_log: Vec<ClosedTrade>,
}

impl BacktestResults {
    /// Realized P&L identity check (§3, §8): the sum of closed-trade profit
    /// plus any still-open floating profit must equal the change in equity
    /// from the initial balance. `open_floating_pnl` is the sum of open
    /// positions' profit at the moment the results are collected.
    pub fn realized_pnl_identity_holds(&self, initial_balance: f64, open_floating_pnl: f64, tolerance: f64) -> bool {
        let closed_sum: f64 = self.trade_log.iter().map(|t| t.profit).sum();
        let lhs = closed_sum + open_floating_pnl;
        let rhs = self.final_equity - initial_balance;
        (lhs - rhs).abs() <= tolerance
    }

    /// Write this record as pretty-printed JSON (§6 Results output), via
    /// `serde_json`, the teacher's serialization crate throughout
    /// `backtest_v2`.
    pub fn write_json(&self, path: impl AsRef<std::path::Path>) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed(profit: f64) -> ClosedTrade {
        ClosedTrade {
            ticket: 1,
            symbol: "EURUSD".into(),
            side: crate::engine::tick::Side::Buy,
            volume: 0.1,
            open_price: 1.1,
            close_price: 1.11,
            open_time: 0,
            close_time: 1,
            profit,
            comment: "TB|buy".into(),
        }
    }

    #[test]
    fn realized_pnl_identity_holds_with_matching_equity() {
        let results = BacktestResults {
            run_id: "test".into(),
            sl_tp_evaluation: SlTpEvaluation::PerTick,
            final_balance: 10_019.0,
            final_equity: 10_019.0,
            total_profit: 19.0,
            profit_percent: 0.19,
            equity_curve: vec![],
            trade_log: vec![closed(19.0)],
        };
        assert!(results.realized_pnl_identity_holds(10_000.0, 0.0, 1e-6));
    }

    #[test]
    fn realized_pnl_identity_detects_mismatch() {
        let results = BacktestResults {
            run_id: "test".into(),
            sl_tp_evaluation: SlTpEvaluation::PerTick,
            final_balance: 10_100.0,
            final_equity: 10_100.0,
            total_profit: 100.0,
            profit_percent: 1.0,
            equity_curve: vec![],
            trade_log: vec![closed(19.0)],
        };
        assert!(!results.realized_pnl_identity_holds(10_000.0, 0.0, 1e-6));
    }

    #[test]
    fn write_json_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        let results = BacktestResults {
            run_id: "test".into(),
            sl_tp_evaluation: SlTpEvaluation::PerBar,
            final_balance: 10_000.0,
            final_equity: 10_000.0,
            total_profit: 0.0,
            profit_percent: 0.0,
            equity_curve: vec![EquityPoint {
                time: 0,
                balance: 10_000.0,
                equity: 10_000.0,
                profit: 0.0,
                open_positions: 0,
            }],
            trade_log: vec![],
        };
        results.write_json(&path).unwrap();
        let loaded: BacktestResults = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(loaded, results);
    }
}
