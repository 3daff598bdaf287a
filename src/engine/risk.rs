//! Risk Engine (C8)
//!
//! Sizes positions so that the loss realized at the stop equals a fixed
//! percentage of account balance, subject to instrument and margin
//! constraints. Grounded on `backtest_v2/risk.rs`'s `RiskLimits`/sizing-result
//! struct shape (a typed config plus a blocked/reason outcome rather than a
//! bare `Option<f64>`) and on `risk_manager.py::calculate_lot_size`'s clamp
//! order: lot-step rounding, margin cap, then the min-lot risk-multiplier
//! filter, symbol clamp, and finally user overrides.

use crate::engine::tick::SymbolInfo;
use serde::{Deserialize, Serialize};

/// User-configurable overrides on top of the symbol's own lot bounds (§4.8
/// step 6). Zero or negative means "no override, use the symbol's bound".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    pub risk_percent_per_trade: f64,
    pub min_lot_override: f64,
    pub max_lot_override: f64,
    /// Fraction of free margin a sized position may consume before the lot
    /// is reduced proportionally (§4.8 step 7).
    pub max_margin_fraction: f64,
    /// Multiplier applied to `risk_percent_per_trade` when deciding whether
    /// the symbol-minimum lot's implied risk is still acceptable (§4.8 step 8).
    pub max_risk_multiplier: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_percent_per_trade: 1.0,
            min_lot_override: 0.0,
            max_lot_override: 0.0,
            max_margin_fraction: 0.80,
            max_risk_multiplier: 3.0,
        }
    }
}

/// Why a position was sized to zero (§4.8 step 8, §4.8 validation).
#[derive(Debug, Clone, PartialEq)]
pub enum RiskBlockReason {
    /// The symbol's minimum lot would itself exceed the acceptable risk
    /// multiple of the configured risk percent; the instrument is filtered
    /// out entirely rather than under- or over-sized.
    MinLotExceedsRiskBudget { implied_risk_percent: f64, max_acceptable_percent: f64 },
    /// The stop distance is zero, negative, or on the wrong side of entry.
    InvalidStopDistance,
    /// No current price/cross-rate was available to size against.
    MissingPriceData,
}

/// Outcome of a sizing attempt (§4.8). Mirrors the teacher's
/// approved/blocked split rather than collapsing to a bare float, so callers
/// can log *why* a symbol was skipped.
#[derive(Debug, Clone, PartialEq)]
pub enum SizingResult {
    Approved { lot_size: f64, risk_amount: f64 },
    Blocked(RiskBlockReason),
}

impl SizingResult {
    pub fn lot_size(&self) -> f64 {
        match self {
            SizingResult::Approved { lot_size, .. } => *lot_size,
            SizingResult::Blocked(_) => 0.0,
        }
    }
}

/// Lot sizing from risk percent (§4.8). `point_value_in_account_ccy` is the
/// value, in account currency, of one point move for one lot of `symbol` —
/// already converted via the current cross-rate (§4.8 step 3), matching the
/// no-look-ahead currency-conversion rule the broker itself follows.
pub fn size_position(
    side_entry: f64,
    sl: f64,
    balance: f64,
    free_margin: f64,
    symbol: &SymbolInfo,
    point_value_in_account_ccy: f64,
    config: &RiskConfig,
) -> SizingResult {
    if sl <= 0.0 || (side_entry - sl).abs() < f64::EPSILON {
        return SizingResult::Blocked(RiskBlockReason::InvalidStopDistance);
    }
    if point_value_in_account_ccy <= 0.0 {
        return SizingResult::Blocked(RiskBlockReason::MissingPriceData);
    }

    let risk_amount = balance * config.risk_percent_per_trade / 100.0;
    let sl_distance_points = (side_entry - sl).abs() / symbol.point;
    let raw_lots = risk_amount / (sl_distance_points * point_value_in_account_ccy);

    // Step 5: round to the instrument's lot step first, so the min-lot
    // filter below judges the same quantity a real order would place.
    let mut lot_size = symbol.round_to_lot_step(raw_lots);

    // Step 7: cap by margin before the min-lot filter, matching the
    // original's ordering (margin cap runs on the lot-step-rounded size).
    if lot_size > 0.0 {
        let margin_required = lot_size * symbol.contract_size * side_entry / leverage_proxy();
        let margin_limit = free_margin * config.max_margin_fraction;
        if margin_required > margin_limit && margin_required > 0.0 {
            let margin_ratio = margin_limit / margin_required;
            lot_size = symbol.round_to_lot_step(lot_size * margin_ratio);
        }
    }

    // Step 8: if the raw (pre-rounding) lot size was below the symbol
    // minimum, decide whether using the minimum anyway stays within the
    // acceptable risk multiple, or whether to filter the instrument out.
    if raw_lots < symbol.min_lot {
        let implied_risk_amount = sl_distance_points * point_value_in_account_ccy * symbol.min_lot;
        let implied_risk_percent = if balance.abs() < f64::EPSILON {
            f64::INFINITY
        } else {
            implied_risk_amount / balance * 100.0
        };
        let max_acceptable_percent = config.risk_percent_per_trade * config.max_risk_multiplier;
        if implied_risk_percent > max_acceptable_percent {
            return SizingResult::Blocked(RiskBlockReason::MinLotExceedsRiskBudget {
                implied_risk_percent,
                max_acceptable_percent,
            });
        }
        lot_size = symbol.min_lot;
    }

    // Step 6: clamp to the symbol's own bounds, then to user overrides.
    lot_size = lot_size.clamp(symbol.min_lot, symbol.max_lot);
    let user_min = if config.min_lot_override > 0.0 {
        config.min_lot_override
    } else {
        symbol.min_lot
    };
    let user_max = if config.max_lot_override > 0.0 {
        config.max_lot_override
    } else {
        symbol.max_lot
    };
    lot_size = lot_size.clamp(user_min.min(user_max), user_max);

    SizingResult::Approved {
        lot_size,
        risk_amount,
    }
}

/// A fixed notional-per-unit-leverage proxy used only to keep the margin
/// check's units consistent inside this crate — backtests never model a
/// broker's real leverage tiers (out of scope), so a constant divisor keeps
/// the 80%-of-free-margin check meaningful without inventing a leverage
/// config surface the spec does not ask for.
fn leverage_proxy() -> f64 {
    100.0
}

/// Validate an already-sized order's stop placement (§4.8 "Validation of an
/// already-sized order"): rejects a zero, negative, or wrong-side stop.
pub fn validate_stop_distance(side_entry: f64, sl: f64, is_buy: bool) -> Result<(), RiskBlockReason> {
    if sl <= 0.0 {
        return Err(RiskBlockReason::InvalidStopDistance);
    }
    let valid_side = if is_buy { sl < side_entry } else { sl > side_entry };
    if !valid_side {
        return Err(RiskBlockReason::InvalidStopDistance);
    }
    Ok(())
}
