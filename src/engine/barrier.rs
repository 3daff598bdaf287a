//! Time Controller / Coordinator Barrier (C4)
//!
//! Synchronizes per-symbol worker threads (and the position-monitor thread)
//! so that simulated time only ever advances once every participant has
//! arrived at the current step. Grounded on the Python `TimeController`:
//! a *coordinator-based* barrier, not a plain `std::sync::Barrier` cyclic
//! barrier, because only one designated participant is allowed to perform
//! the side-effecting time advance. A plain cyclic barrier has every thread
//! race to decide whether it was "last to arrive"; here arrival and
//! advancement are split into distinct phases so exactly one thread ever
//! calls into the broker.
//!
//! A second, independent turnstile (`acquire_tick_turn`/`release_tick_turn`)
//! orders `on_tick` invocations within a step by symbol name rather than
//! thread-scheduling order, so ticket numbers stay reproducible even when
//! several symbols place orders in the same step.

use crate::engine::broker::Broker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Wall-clock pacing applied by the coordinator between steps. Only
/// meaningful for demos/replays; `MaxSpeed` is what a real backtest uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeMode {
    Realtime,
    Fast,
    MaxSpeed,
}

impl TimeMode {
    fn delay(self) -> Option<Duration> {
        match self {
            TimeMode::Realtime => Some(Duration::from_secs(1)),
            TimeMode::Fast => Some(Duration::from_millis(100)),
            TimeMode::MaxSpeed => None,
        }
    }
}

/// Which `Broker` advance method the coordinator calls each step (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeGranularity {
    Tick,
    Minute,
}

struct BarrierState {
    arrivals: usize,
    total_participants: usize,
    barrier_generation: u64,
    advance_needed: bool,
    total_steps: u64,
    turn_index: usize,
    departed: Vec<bool>,
}

/// Statistics snapshot for observability (§4.4, ambient logging).
#[derive(Debug, Clone, Copy)]
pub struct TimeControllerStats {
    pub total_steps: u64,
    pub running: bool,
    pub paused: bool,
}

/// Coordinates time advancement across every symbol worker plus the
/// position-monitor thread. Exactly one participant (`coordinator_id`)
/// performs the broker's global time advance each cycle; everyone else
/// only registers arrival and waits.
pub struct TimeController {
    mode: TimeMode,
    granularity: TimeGranularity,
    coordinator_id: String,
    broker: Arc<Broker>,
    tick_order: Vec<String>,
    state: Mutex<BarrierState>,
    condvar: Condvar,
    running: AtomicBool,
    paused: AtomicBool,
}

impl TimeController {
    /// `include_position_monitor` mirrors the Python default of `true`: the
    /// position-monitor thread is itself a barrier participant so positions
    /// are remarked/managed exactly once per step, in lockstep with ticks.
    pub fn new(
        symbols: &[String],
        mode: TimeMode,
        granularity: TimeGranularity,
        include_position_monitor: bool,
        broker: Arc<Broker>,
        coordinator_id: impl Into<String>,
    ) -> Self {
        let mut coordinator_id = coordinator_id.into();
        if !include_position_monitor
            && (coordinator_id == "position_monitor" || !symbols.contains(&coordinator_id))
        {
            coordinator_id = symbols.first().cloned().unwrap_or(coordinator_id);
        }
        let total_participants = symbols.len() + usize::from(include_position_monitor);
        let mut tick_order = symbols.to_vec();
        tick_order.sort();
        tracing::info!(
            symbols = symbols.len(),
            include_position_monitor,
            coordinator = %coordinator_id,
            ?mode,
            ?granularity,
            "time controller initialized"
        );
        let departed = vec![false; tick_order.len()];
        Self {
            mode,
            granularity,
            coordinator_id,
            broker,
            tick_order,
            state: Mutex::new(BarrierState {
                arrivals: 0,
                total_participants,
                barrier_generation: 0,
                advance_needed: false,
                total_steps: 0,
                turn_index: 0,
                departed,
            }),
            condvar: Condvar::new(),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        tracing::info!("time controller started");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _guard = self.state.lock().unwrap();
        self.condvar.notify_all();
        tracing::info!("time controller stopped");
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        let _guard = self.state.lock().unwrap();
        self.condvar.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Block until the whole barrier cycle completes: every participant
    /// arrives, the coordinator advances global time, and the generation
    /// counter increments. Returns `false` once the run should stop (either
    /// `stop()` was called, or the coordinator found the data exhausted).
    ///
    /// Four phases, matching the Python original exactly: (1) register
    /// arrival, detect whether this arrival completes the cycle; (2) every
    /// participant, coordinator included, waits for the generation to
    /// change; (3) only the coordinator performs the side-effecting advance
    /// and bumps the generation; (4) non-coordinators (and a coordinator
    /// that did not get to advance this call) wait again for the bump.
    pub fn wait_for_next_step(&self, participant: &str) -> bool {
        if !self.is_running() {
            return false;
        }
        let is_coordinator = participant == self.coordinator_id;
        let arrival_generation;

        // Phase 1: register arrival.
        {
            let mut st = self.state.lock().unwrap();
            st.arrivals += 1;
            arrival_generation = st.barrier_generation;
            if st.arrivals == st.total_participants {
                st.arrivals = 0;
                st.total_steps += 1;
                st.advance_needed = true;
                self.condvar.notify_all();
            }
        }

        // Phase 2: everyone waits for the generation to move past our arrival.
        {
            let mut st = self.state.lock().unwrap();
            loop {
                if !self.is_running() || self.paused.load(Ordering::SeqCst) {
                    break;
                }
                if st.barrier_generation != arrival_generation {
                    break;
                }
                if is_coordinator && st.advance_needed {
                    break;
                }
                st = self.condvar.wait(st).unwrap();
            }
        }

        // Phase 3: the coordinator alone advances global time.
        let mut advanced = false;
        if is_coordinator {
            let should_advance = {
                let mut st = self.state.lock().unwrap();
                if st.advance_needed && st.barrier_generation == arrival_generation {
                    st.advance_needed = false;
                    true
                } else {
                    false
                }
            };
            if should_advance {
                self.apply_time_delay();
                if !self.advance_broker() {
                    self.running.store(false, Ordering::SeqCst);
                }
                let mut st = self.state.lock().unwrap();
                st.barrier_generation += 1;
                self.condvar.notify_all();
                advanced = true;
            }
        }

        // Phase 4: whoever didn't just advance waits for the bump.
        if !advanced {
            let mut st = self.state.lock().unwrap();
            while self.is_running()
                && st.barrier_generation == arrival_generation
                && !self.paused.load(Ordering::SeqCst)
            {
                let (guard, _timeout) = self
                    .condvar
                    .wait_timeout(st, Duration::from_millis(10))
                    .unwrap();
                st = guard;
            }
        }

        self.is_running()
    }

    /// Blocks a symbol worker until it is its turn to run `on_tick` within
    /// the current barrier step, so that same-step order placement — and
    /// the ticket numbers it produces — follows a fixed symbol-ascending
    /// order instead of OS thread scheduling (§3, §8 "byte-identical by
    /// construction"). Every still-participating symbol in `tick_order`
    /// must call this exactly once per step, whether or not it ends up
    /// invoking `on_tick` that step, and pair it with `release_tick_turn`.
    pub fn acquire_tick_turn(&self, symbol: &str) {
        let Some(my_index) = self.tick_order.iter().position(|s| s == symbol) else {
            return;
        };
        let mut st = self.state.lock().unwrap();
        loop {
            if !self.is_running() || st.departed[my_index] || st.turn_index == my_index {
                return;
            }
            st = self.condvar.wait(st).unwrap();
        }
    }

    /// Hands the tick turn to the next non-departed symbol in `tick_order`,
    /// wrapping back to the front once every symbol has had its turn this
    /// step. Must be called by the same symbol that last returned from
    /// `acquire_tick_turn`.
    pub fn release_tick_turn(&self, symbol: &str) {
        let Some(my_index) = self.tick_order.iter().position(|s| s == symbol) else {
            return;
        };
        let mut st = self.state.lock().unwrap();
        if st.turn_index != my_index {
            return;
        }
        Self::advance_turn(&mut st, &self.tick_order);
        self.condvar.notify_all();
    }

    fn advance_turn(st: &mut BarrierState, tick_order: &[String]) {
        if tick_order.is_empty() {
            return;
        }
        for _ in 0..tick_order.len() {
            st.turn_index = (st.turn_index + 1) % tick_order.len();
            if !st.departed[st.turn_index] {
                break;
            }
        }
    }

    /// A participant departs mid-run (its data source is exhausted). If its
    /// departure completes the in-flight cycle, this thread performs the
    /// coordinator's advance as a surrogate so nobody is left waiting on a
    /// participant that will never arrive again (§4.4, §9).
    pub fn remove_participant(&self, participant: &str) {
        let should_advance = {
            let mut st = self.state.lock().unwrap();
            st.total_participants = st.total_participants.saturating_sub(1);
            if let Some(idx) = self.tick_order.iter().position(|s| s == participant) {
                st.departed[idx] = true;
                if st.turn_index == idx {
                    Self::advance_turn(&mut st, &self.tick_order);
                }
            }
            if self.is_running() && st.arrivals == st.total_participants {
                st.arrivals = 0;
                st.total_steps += 1;
                true
            } else {
                false
            }
        };

        if should_advance {
            self.apply_time_delay();
            if !self.advance_broker() {
                self.running.store(false, Ordering::SeqCst);
            }
            let mut st = self.state.lock().unwrap();
            st.advance_needed = false;
            st.barrier_generation += 1;
            self.condvar.notify_all();
        } else {
            self.condvar.notify_all();
        }

        let remaining = self.state.lock().unwrap().total_participants;
        tracing::info!(participant, remaining, "participant left the barrier");
    }

    fn advance_broker(&self) -> bool {
        let result = match self.granularity {
            TimeGranularity::Tick => self.broker.advance_global_time_tick_by_tick(),
            TimeGranularity::Minute => self.broker.advance_global_time(),
        };
        match result {
            Ok(more) => more,
            Err(e) => {
                tracing::error!(error = %e, "broker time advance failed; stopping run");
                false
            }
        }
    }

    fn apply_time_delay(&self) {
        if let Some(delay) = self.mode.delay() {
            std::thread::sleep(delay);
        }
    }

    pub fn statistics(&self) -> TimeControllerStats {
        let st = self.state.lock().unwrap();
        TimeControllerStats {
            total_steps: st.total_steps,
            running: self.is_running(),
            paused: self.paused.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tick::SymbolInfo;
    use std::collections::HashMap;

    fn test_broker() -> Arc<Broker> {
        let dir = tempfile::tempdir().unwrap();
        let mut symbols = HashMap::new();
        symbols.insert("EURUSD".to_string(), SymbolInfo::fx_5digit("EUR", "USD"));
        Arc::new(Broker::new(
            10_000.0,
            "USD",
            symbols,
            0,
            dir.path().join("positions.json"),
            0.0,
            0.0,
        ))
    }

    #[test]
    fn coordinator_auto_selected_when_position_monitor_excluded() {
        let symbols = vec!["EURUSD".to_string(), "GBPUSD".to_string()];
        let tc = TimeController::new(
            &symbols,
            TimeMode::MaxSpeed,
            TimeGranularity::Minute,
            false,
            test_broker(),
            "position_monitor",
        );
        assert_eq!(tc.coordinator_id, "EURUSD");
    }

    #[test]
    fn single_worker_plus_monitor_completes_one_cycle() {
        let symbols = vec!["EURUSD".to_string()];
        let broker = test_broker();
        broker.load_candles(
            "EURUSD",
            crate::engine::candle::Timeframe::M1,
            vec![crate::engine::candle::Candle {
                time: 0,
                open: 1.1,
                high: 1.1,
                low: 1.1,
                close: 1.1,
                volume: 1,
            }],
        );
        let tc = Arc::new(TimeController::new(
            &symbols,
            TimeMode::MaxSpeed,
            TimeGranularity::Minute,
            true,
            broker,
            "position_monitor",
        ));
        tc.start();
        let tc2 = tc.clone();
        let worker = std::thread::spawn(move || tc2.wait_for_next_step("EURUSD"));
        let monitor_result = tc.wait_for_next_step("position_monitor");
        let worker_result = worker.join().unwrap();
        assert!(monitor_result);
        assert!(worker_result);
        assert_eq!(tc.statistics().total_steps, 1);
    }

    #[test]
    fn remove_participant_unblocks_remaining_threads() {
        let symbols = vec!["EURUSD".to_string(), "GBPUSD".to_string()];
        let tc = Arc::new(TimeController::new(
            &symbols,
            TimeMode::MaxSpeed,
            TimeGranularity::Minute,
            true,
            test_broker(),
            "position_monitor",
        ));
        tc.start();
        // GBPUSD exhausts its data immediately and departs without arriving.
        tc.remove_participant("GBPUSD");
        let tc2 = tc.clone();
        let worker = std::thread::spawn(move || tc2.wait_for_next_step("EURUSD"));
        let monitor_result = tc.wait_for_next_step("position_monitor");
        assert!(worker.join().unwrap());
        assert!(monitor_result);
    }

    #[test]
    fn tick_turn_is_granted_in_symbol_ascending_order_regardless_of_arrival_order() {
        let symbols = vec!["GBPUSD".to_string(), "EURUSD".to_string(), "AUDUSD".to_string()];
        let tc = Arc::new(TimeController::new(
            &symbols,
            TimeMode::MaxSpeed,
            TimeGranularity::Minute,
            false,
            test_broker(),
            "AUDUSD",
        ));
        tc.start();

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        // Threads are spawned in descending-name order; the turnstile must
        // still grant turns ascending regardless of which thread gets
        // scheduled first.
        let handles: Vec<_> = ["GBPUSD", "EURUSD", "AUDUSD"]
            .into_iter()
            .map(|symbol| {
                let tc = tc.clone();
                let order = order.clone();
                let symbol = symbol.to_string();
                std::thread::spawn(move || {
                    tc.acquire_tick_turn(&symbol);
                    order.lock().unwrap().push(symbol.clone());
                    tc.release_tick_turn(&symbol);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["AUDUSD", "EURUSD", "GBPUSD"]);
    }

    #[test]
    fn departed_symbol_does_not_stall_the_remaining_turn_order() {
        let symbols = vec!["AUDUSD".to_string(), "EURUSD".to_string()];
        let tc = Arc::new(TimeController::new(
            &symbols,
            TimeMode::MaxSpeed,
            TimeGranularity::Minute,
            false,
            test_broker(),
            "EURUSD",
        ));
        tc.start();
        // AUDUSD sorts first but departs before ever taking its turn.
        tc.remove_participant("AUDUSD");
        // EURUSD must not block forever waiting for AUDUSD's turn.
        tc.acquire_tick_turn("EURUSD");
        tc.release_tick_turn("EURUSD");
    }
}
