//! Strategy Contract and Signal Validation Framework (C6)
//!
//! Grounded on `backtest_v2/strategy.rs`'s `Strategy`/`StrategyContext`
//! shape, retargeted from the teacher's book/trade-print callbacks to the
//! simpler tick-driven contract spec.md §4.6 describes: a strategy only
//! ever sees its own broker handle and is polled once per step.

use crate::engine::broker::Broker;
use crate::engine::position::Ticket;
use std::panic::UnwindSafe;
use std::sync::Arc;

/// A trade signal a strategy hands back from `on_tick`. The trading
/// controller does not act on this directly — strategies place orders
/// themselves via their broker handle during `on_tick`; the return value is
/// purely informational (used for comment/log correlation by callers that
/// want it), matching the "optional trade signal" wording of §4.6 without
/// inventing an order-routing layer the broker already owns.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeSignal {
    pub symbol: String,
    pub ticket: Option<Ticket>,
    pub note: String,
}

/// Arbitrary status record a strategy reports for monitoring (§4.6
/// `get_status`). Left as a string bag rather than a fixed struct since the
/// spec does not constrain its shape beyond "for reporting".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrategyStatus {
    pub name: String,
    pub fields: Vec<(String, String)>,
}

/// The capability set every strategy exposes (§4.6). Implementors must be
/// `UnwindSafe` so the controller can drive `on_tick` through
/// `catch_unwind` (§7 "strategy panic containment") without poisoning
/// shared state.
pub trait Strategy: UnwindSafe {
    fn name(&self) -> &str;

    /// Called once before any ticks. Returning `false` excludes this
    /// strategy's symbol worker from starting at all.
    fn initialize(&mut self, broker: &Arc<Broker>) -> bool;

    fn on_tick(&mut self, broker: &Arc<Broker>) -> Option<TradeSignal>;

    fn on_position_closed(&mut self, symbol: &str, profit: f64, volume: f64, comment: &str);

    fn get_status(&self) -> StrategyStatus;

    fn shutdown(&mut self) {}
}

/// Result of a single signal-validation predicate (§4.6).
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub passed: bool,
    pub name: String,
    pub reason: String,
}

/// How the configured predicates combine into a single go/no-go decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationPolicy {
    AllMustPass,
    AnyMustPass,
}

/// Minimal context a validation predicate needs: enough to judge spread,
/// volume, and trend alignment without depending on a specific strategy's
/// internal state.
pub struct StrategyCheckContext<'a> {
    pub symbol: &'a str,
    pub spread: f64,
    pub volume: u64,
    pub trend_is_up: Option<bool>,
}

pub type ValidationPredicate = Box<dyn Fn(&StrategyCheckContext) -> ValidationResult + Send + Sync>;

/// An ordered list of predicates plus the aggregate policy (§4.6). Keeps the
/// last evaluated batch so a strategy can fold the pass/fail breakdown into
/// its trade comment for post-hoc analysis.
pub struct SignalValidation {
    predicates: Vec<ValidationPredicate>,
    policy: ValidationPolicy,
    last_results: Vec<ValidationResult>,
}

impl SignalValidation {
    pub fn new(policy: ValidationPolicy) -> Self {
        Self {
            predicates: Vec::new(),
            policy,
            last_results: Vec::new(),
        }
    }

    pub fn with_predicate(mut self, predicate: ValidationPredicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Evaluate every predicate and combine per policy. Returns the overall
    /// pass/fail and the full per-predicate breakdown.
    pub fn evaluate(&mut self, ctx: &StrategyCheckContext) -> (bool, Vec<ValidationResult>) {
        let results: Vec<ValidationResult> = self.predicates.iter().map(|p| p(ctx)).collect();
        let overall = match self.policy {
            ValidationPolicy::AllMustPass => results.iter().all(|r| r.passed),
            ValidationPolicy::AnyMustPass => results.iter().any(|r| r.passed),
        };
        self.last_results = results.clone();
        (overall, results)
    }

    pub fn last_results(&self) -> &[ValidationResult] {
        &self.last_results
    }
}

/// How a strategy's retest-tolerance check widens around a reference level
/// (§9 resolved open question). Non-goal: the crate ships no strategy that
/// exercises every variant beyond `ReferenceBreakoutStrategy` below, but the
/// type exists so strategy authors have a typed knob rather than a float.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetestTolerance {
    Percent(f64),
    Points(f64),
    /// Smaller of a percent- and point-based tolerance, matching the
    /// original source's `min(percent_tolerance, point_tolerance)`.
    Auto { percent: f64, points: f64 },
}

impl RetestTolerance {
    pub fn resolve(&self, reference_price: f64, point: f64) -> f64 {
        match *self {
            RetestTolerance::Percent(p) => reference_price * p / 100.0,
            RetestTolerance::Points(p) => p * point,
            RetestTolerance::Auto { percent, points } => {
                let by_percent = reference_price * percent / 100.0;
                let by_points = points * point;
                by_percent.min(by_points)
            }
        }
    }
}

/// A minimal reference-breakout strategy exercising the contract and the
/// signal validation framework end to end (§4.6, §9 retest tolerance).
/// Buys when price closes above a fixed reference level by more than the
/// configured retest tolerance, with a spread-acceptability predicate.
pub struct ReferenceBreakoutStrategy {
    symbol: String,
    reference_price: f64,
    tolerance: RetestTolerance,
    max_spread: f64,
    volume: f64,
    sl_points: f64,
    tp_points: f64,
    validation: SignalValidation,
    triggered: bool,
}

impl ReferenceBreakoutStrategy {
    pub fn new(
        symbol: impl Into<String>,
        reference_price: f64,
        tolerance: RetestTolerance,
        max_spread: f64,
        volume: f64,
        sl_points: f64,
        tp_points: f64,
    ) -> Self {
        let max_spread_check = max_spread;
        let validation = SignalValidation::new(ValidationPolicy::AllMustPass).with_predicate(Box::new(
            move |ctx: &StrategyCheckContext| ValidationResult {
                passed: ctx.spread <= max_spread_check,
                name: "spread_acceptable".to_string(),
                reason: format!("spread {} vs max {}", ctx.spread, max_spread_check),
            },
        ));
        Self {
            symbol: symbol.into(),
            reference_price,
            tolerance,
            max_spread,
            volume,
            sl_points,
            tp_points,
            validation,
            triggered: false,
        }
    }
}

impl UnwindSafe for ReferenceBreakoutStrategy {}

impl Strategy for ReferenceBreakoutStrategy {
    fn name(&self) -> &str {
        "reference_breakout"
    }

    fn initialize(&mut self, _broker: &Arc<Broker>) -> bool {
        true
    }

    fn on_tick(&mut self, broker: &Arc<Broker>) -> Option<TradeSignal> {
        if self.triggered {
            return None;
        }
        let info = broker.symbol_info(&self.symbol)?;
        let ask = broker.get_current_price(&self.symbol, crate::engine::tick::QuoteSide::Ask)?;
        let bid = broker.get_current_price(&self.symbol, crate::engine::tick::QuoteSide::Bid)?;
        let spread = ask - bid;
        let tolerance = self.tolerance.resolve(self.reference_price, info.point);

        let ctx = StrategyCheckContext {
            symbol: &self.symbol,
            spread,
            volume: 0,
            trend_is_up: Some(ask > self.reference_price),
        };
        let (passed, results) = self.validation.evaluate(&ctx);
        if !passed || ask < self.reference_price + tolerance {
            return None;
        }

        let sl = bid - self.sl_points * info.point;
        let tp = ask + self.tp_points * info.point;
        let confirmations: String = results
            .iter()
            .filter(|r| r.passed)
            .map(|r| r.name.chars().next().unwrap_or('?'))
            .collect();
        let comment = crate::engine::comment::TradeComment::new("TB")
            .with_direction("buy")
            .with_confirmations(confirmations)
            .render();

        match broker.place_market_order(
            &self.symbol,
            crate::engine::tick::Side::Buy,
            self.volume,
            sl,
            tp,
            0,
            comment.clone(),
        ) {
            Ok(ticket) => {
                self.triggered = true;
                Some(TradeSignal {
                    symbol: self.symbol.clone(),
                    ticket: Some(ticket),
                    note: comment,
                })
            }
            Err(e) => {
                tracing::warn!(symbol = %self.symbol, error = %e, "breakout order rejected");
                None
            }
        }
    }

    fn on_position_closed(&mut self, symbol: &str, profit: f64, volume: f64, comment: &str) {
        tracing::info!(symbol, profit, volume, comment, "reference breakout position closed");
        self.triggered = false;
    }

    fn get_status(&self) -> StrategyStatus {
        StrategyStatus {
            name: self.name().to_string(),
            fields: vec![
                ("symbol".to_string(), self.symbol.clone()),
                ("triggered".to_string(), self.triggered.to_string()),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_all_must_pass_fails_if_any_predicate_fails() {
        let mut v = SignalValidation::new(ValidationPolicy::AllMustPass)
            .with_predicate(Box::new(|_| ValidationResult {
                passed: true,
                name: "a".into(),
                reason: String::new(),
            }))
            .with_predicate(Box::new(|_| ValidationResult {
                passed: false,
                name: "b".into(),
                reason: "nope".into(),
            }));
        let ctx = StrategyCheckContext {
            symbol: "EURUSD",
            spread: 0.0002,
            volume: 1,
            trend_is_up: None,
        };
        let (ok, results) = v.evaluate(&ctx);
        assert!(!ok);
        assert_eq!(results.len(), 2);
        assert_eq!(v.last_results().len(), 2);
    }

    #[test]
    fn validation_any_must_pass_succeeds_with_one_pass() {
        let mut v = SignalValidation::new(ValidationPolicy::AnyMustPass)
            .with_predicate(Box::new(|_| ValidationResult {
                passed: false,
                name: "a".into(),
                reason: String::new(),
            }))
            .with_predicate(Box::new(|_| ValidationResult {
                passed: true,
                name: "b".into(),
                reason: String::new(),
            }));
        let ctx = StrategyCheckContext {
            symbol: "EURUSD",
            spread: 0.0002,
            volume: 1,
            trend_is_up: None,
        };
        let (ok, _) = v.evaluate(&ctx);
        assert!(ok);
    }

    #[test]
    fn retest_tolerance_auto_picks_smaller() {
        let tol = RetestTolerance::Auto {
            percent: 0.01,
            points: 1000.0,
        };
        // 1.1000 * 0.01% = 0.00011; 1000 points * 0.00001 = 0.01 -> percent smaller.
        let resolved = tol.resolve(1.1000, 0.00001);
        assert!((resolved - 0.00011).abs() < 1e-9);
    }

    #[test]
    fn reference_breakout_does_not_retrigger_after_firing() {
        let dir = tempfile::tempdir().unwrap();
        let mut symbols = std::collections::HashMap::new();
        symbols.insert(
            "EURUSD".to_string(),
            crate::engine::tick::SymbolInfo::fx_5digit("EUR", "USD"),
        );
        let broker = Arc::new(Broker::new(
            10_000.0,
            "USD",
            symbols,
            0,
            dir.path().join("positions.json"),
            0.0,
            0.0,
        ));
        broker.load_candles("EURUSD", crate::engine::candle::Timeframe::M1, vec![]);
        let mut strat = ReferenceBreakoutStrategy::new(
            "EURUSD",
            1.1000,
            RetestTolerance::Points(5.0),
            0.0005,
            0.10,
            50.0,
            100.0,
        );
        assert!(strat.initialize(&broker));
        // With no quote loaded yet, on_tick must not panic and should return None.
        assert!(strat.on_tick(&broker).is_none());

        broker.seed_quote("EURUSD", 1.1010, 1.1011);
        let signal = strat.on_tick(&broker);
        assert!(signal.is_some());
        assert!(strat.on_tick(&broker).is_none(), "must not retrigger after firing");
    }
}
