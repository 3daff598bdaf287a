//! Trading Controller (C5)
//!
//! Owns one worker participant per symbol plus the position-monitor
//! participant, and composes them with the broker, time controller, and
//! strategies (§4.5). Grounded on `trading_controller.py`'s
//! worker-per-symbol threading model and on `backtest_v2/orchestrator.rs`'s
//! "own everything, drive the loop" shape — generalized here from a
//! single-threaded event loop to the spec's thread-per-participant barrier
//! model, since C4's coordinator-based barrier requires genuinely
//! concurrent participants to exercise its arrival/advance protocol.

use crate::engine::barrier::{TimeController, TimeGranularity, TimeMode};
use crate::engine::broker::Broker;
use crate::engine::position::ClosedTrade;
use crate::engine::position_manager::PositionManager;
use crate::engine::results::{BacktestResults, EquityPoint, SlTpEvaluation};
use crate::engine::strategy::Strategy;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread;

const POSITION_MONITOR_ID: &str = "position_monitor";

/// One symbol's strategy, not yet assigned a worker thread.
struct SymbolWorker {
    symbol: String,
    strategy: Box<dyn Strategy + Send>,
}

/// Owns the per-symbol workers, the position-monitor, and the wiring
/// between broker, time controller, and strategies for one backtest run.
pub struct TradingController {
    broker: Arc<Broker>,
    mode: TimeMode,
    granularity: TimeGranularity,
    workers: Vec<SymbolWorker>,
    position_manager: PositionManager,
    strict_mode: bool,
    run_id: String,
}

impl TradingController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<Broker>,
        mode: TimeMode,
        granularity: TimeGranularity,
        position_manager: PositionManager,
        strict_mode: bool,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            mode,
            granularity,
            workers: Vec::new(),
            position_manager,
            strict_mode,
            run_id: run_id.into(),
        }
    }

    pub fn add_strategy(&mut self, symbol: impl Into<String>, strategy: Box<dyn Strategy + Send>) {
        self.workers.push(SymbolWorker {
            symbol: symbol.into(),
            strategy,
        });
    }

    /// Run the backtest to completion: spawn one thread per symbol worker,
    /// drive the position-monitor as the coordinator on the calling thread,
    /// and collect the equity curve plus the closed-trade journal (§4.5).
    pub fn run(self) -> BacktestResults {
        let symbols: Vec<String> = self.workers.iter().map(|w| w.symbol.clone()).collect();
        let time_controller = Arc::new(TimeController::new(
            &symbols,
            self.mode,
            self.granularity,
            true,
            self.broker.clone(),
            POSITION_MONITOR_ID,
        ));
        time_controller.start();

        let strict_mode = self.strict_mode;
        let broker = self.broker.clone();
        let handles: Vec<_> = self
            .workers
            .into_iter()
            .map(|worker| {
                let tc = time_controller.clone();
                let broker = broker.clone();
                thread::spawn(move || run_symbol_worker(worker, tc, broker, strict_mode))
            })
            .collect();

        let (equity_curve, closed_trades) =
            run_position_monitor(&time_controller, &broker, &self.position_manager, self.granularity);

        for handle in handles {
            let _ = handle.join();
        }
        time_controller.stop();

        let (account, floating) = broker.account_snapshot();
        BacktestResults {
            run_id: self.run_id,
            sl_tp_evaluation: SlTpEvaluation::from(self.granularity),
            final_balance: account.balance,
            final_equity: account.equity(floating),
            total_profit: account.total_profit(floating),
            profit_percent: account.profit_percent(floating),
            equity_curve,
            trade_log: closed_trades,
        }
    }
}

/// A single symbol worker's loop (§4.5). `initialize` runs first; returning
/// `false` means this worker never joins the barrier at all, matching the
/// Strategy contract's "excludes this strategy's symbol worker from
/// starting" (§4.6) — it departs before ever arriving, via the same
/// `remove_participant` path used for mid-run data exhaustion. Otherwise,
/// each step: take this symbol's tick turn (so order placement across
/// symbols sharing a step happens in a fixed, name-ascending sequence
/// rather than thread-scheduling order), and while the broker has data at
/// the current simulated time, invoke `on_tick` (guarded by `catch_unwind`
/// per §7's strategy panic containment); then deliver any of this symbol's
/// trades the barrier step just closed, and arrive at the barrier. Leaves
/// the barrier as soon as its own symbol's feed is exhausted, even while
/// other symbols continue (§8 "participant early exit"), or once the
/// barrier signals the whole run should stop.
///
/// Closed-trade delivery reads `broker.closed_trades()` directly rather than
/// receiving a hand-off from the position-monitor thread: the coordinator
/// appends to that journal *inside* the very `wait_for_next_step` call that
/// performs the advance (§4.4 phase 3), so by the time this call returns,
/// any closure from the step that just completed is already visible —
/// there is no risk of this worker departing the barrier before a
/// same-step closure reaches it, which a position-monitor hand-off lagging
/// by one diff cycle could race with `symbol_feed_exhausted`.
fn run_symbol_worker(
    mut worker: SymbolWorker,
    time_controller: Arc<TimeController>,
    broker: Arc<Broker>,
    strict_mode: bool,
) {
    if !worker.strategy.initialize(&broker) {
        tracing::info!(symbol = %worker.symbol, "strategy declined to start");
        time_controller.remove_participant(&worker.symbol);
        return;
    }

    let mut closed_cursor = 0usize;
    deliver_closed_trades(&mut worker, &broker, &mut closed_cursor);

    loop {
        if broker.symbol_feed_exhausted(&worker.symbol) {
            tracing::info!(symbol = %worker.symbol, "symbol feed exhausted, leaving barrier early");
            break;
        }
        // Wait for this symbol's turn before touching the broker this step,
        // so that two symbols placing orders in the same step get tickets
        // in symbol-ascending order rather than thread-scheduling order
        // (§3, §8 "byte-identical by construction").
        time_controller.acquire_tick_turn(&worker.symbol);
        if broker.has_data_at_current_time(&worker.symbol) {
            let strategy = AssertUnwindSafe(&mut worker.strategy);
            let broker_ref = &broker;
            let result = std::panic::catch_unwind(move || strategy.0.on_tick(broker_ref));
            match result {
                Ok(_signal) => {}
                Err(payload) => {
                    let message = panic_message(&payload);
                    tracing::error!(symbol = %worker.symbol, error = %message, "strategy on_tick panicked");
                    if strict_mode {
                        // Stop the whole run before propagating: every other
                        // participant's `wait_for_next_step` is a generation-
                        // change predicate, not a timeout, so if this thread
                        // just unwound away without shrinking the barrier's
                        // participant count, the position-monitor (and any
                        // other symbol worker) would block forever waiting
                        // for an arrival that will never come. `stop()`
                        // wakes every waiter with `running = false` first, so
                        // "the exception aborts the run" (§7) actually ends
                        // the run instead of hanging it.
                        time_controller.stop();
                        time_controller.release_tick_turn(&worker.symbol);
                        std::panic::resume_unwind(payload);
                    }
                }
            }
        }
        time_controller.release_tick_turn(&worker.symbol);
        if !time_controller.wait_for_next_step(&worker.symbol) {
            deliver_closed_trades(&mut worker, &broker, &mut closed_cursor);
            break;
        }
        deliver_closed_trades(&mut worker, &broker, &mut closed_cursor);
    }
    worker.strategy.shutdown();
    time_controller.remove_participant(&worker.symbol);
}

/// Invoke `on_position_closed` (§4.6) for every entry this symbol owns in
/// `broker.closed_trades()` since `cursor`. The journal is append-only and
/// globally ordered (§3), so a monotonic cursor per worker never re-delivers
/// or misses a closure regardless of how many other symbols' trades closed
/// in between.
fn deliver_closed_trades(worker: &mut SymbolWorker, broker: &Broker, cursor: &mut usize) {
    let trades = broker.closed_trades();
    for trade in &trades[*cursor..] {
        if trade.symbol == worker.symbol {
            worker
                .strategy
                .on_position_closed(&trade.symbol, trade.profit, trade.volume, &trade.comment);
        }
    }
    *cursor = trades.len();
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// The position-monitor participant (§4.5): each cycle, for minute
/// granularity it recomputes mark-to-market (the broker already fires
/// SL/TP as part of its own global time advance), then runs the Position
/// Manager's `manage_positions` pass, records one equity-curve point, and
/// arrives at the barrier as the coordinator. Closed-trade delivery to
/// strategies is handled by each symbol worker directly (see
/// `deliver_closed_trades`), not here.
fn run_position_monitor(
    time_controller: &Arc<TimeController>,
    broker: &Arc<Broker>,
    position_manager: &PositionManager,
    granularity: TimeGranularity,
) -> (Vec<EquityPoint>, Vec<ClosedTrade>) {
    let mut equity_curve = Vec::new();

    loop {
        if granularity == TimeGranularity::Minute {
            let _ = broker.update_positions();
        }
        let open_positions = broker.get_positions(None, None);
        position_manager.manage_positions(broker, &open_positions);

        let (account, floating) = broker.account_snapshot();
        equity_curve.push(EquityPoint {
            time: broker.now(),
            balance: account.balance,
            equity: account.equity(floating),
            profit: account.total_profit(floating),
            open_positions: open_positions.len(),
        });

        if !time_controller.wait_for_next_step(POSITION_MONITOR_ID) {
            break;
        }
    }

    (equity_curve, broker.closed_trades())
}
