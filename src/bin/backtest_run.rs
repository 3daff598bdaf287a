//! Backtest Runner CLI
//!
//! Drives `engine::controller::TradingController` against a CSV tick/candle
//! cache for a configured set of symbols and writes the resulting
//! `BacktestResults` record to disk (§1, §6).
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin backtest_run -- --config backtest.toml --output results.json
//! ```

use anyhow::{Context, Result};
use betterbot_backend::engine::barrier::TimeGranularity;
use betterbot_backend::engine::broker::Broker;
use betterbot_backend::engine::candle::Timeframe;
use betterbot_backend::engine::config::BacktestConfig;
use betterbot_backend::engine::controller::TradingController;
use betterbot_backend::engine::position_manager::PositionManager;
use betterbot_backend::engine::strategy::{ReferenceBreakoutStrategy, RetestTolerance};
use betterbot_backend::engine::tick::{CsvTickFile, QuoteSide, SymbolInfo, TickFile};
use betterbot_backend::engine::timeline::StreamingTickTimeline;
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Runs a deterministic multi-symbol backtest from a TOML configuration.
#[derive(Parser, Debug)]
#[command(name = "backtest_run")]
#[command(about = "Run a deterministic backtest against a CSV tick/candle cache")]
struct Args {
    /// Path to the backtest TOML configuration.
    #[arg(short, long)]
    config: PathBuf,

    /// Where to write the resulting BacktestResults JSON.
    #[arg(short, long, default_value = "results.json")]
    output: PathBuf,

    /// How many historical M1 bars to preload per symbol before ticks start.
    #[arg(long, default_value = "200")]
    lookback_bars: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("backtest_run=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let config = BacktestConfig::from_file(&args.config)
        .with_context(|| format!("loading backtest config from {:?}", args.config))?;

    let run_id = Uuid::new_v4().to_string();
    tracing::info!(run_id, symbols = ?config.symbols, "starting backtest");

    let symbols = load_symbol_infos(&config)?;
    let broker = Arc::new(Broker::new(
        config.initial_balance,
        config.account_currency.clone(),
        symbols,
        0,
        config.journal_path.clone(),
        config.slippage_points,
        config.commission_per_lot,
    ));

    for symbol in &config.symbols {
        let candle_path = PathBuf::from(&config.candle_cache_root).join(format!("{symbol}_M1.csv"));
        let bars = load_candles(&candle_path, args.lookback_bars)
            .with_context(|| format!("loading candle cache for {symbol}"))?;
        broker.load_candles(symbol.clone(), Timeframe::M1, bars);
    }

    let granularity: TimeGranularity = config.granularity.into();
    if granularity == TimeGranularity::Tick {
        let mut sources: Vec<(String, Box<dyn TickFile + Send>)> = Vec::new();
        for symbol in &config.symbols {
            let tick_path = PathBuf::from(&config.tick_cache_root).join(format!("{symbol}.csv"));
            let file = CsvTickFile::open(&tick_path, symbol.clone())
                .with_context(|| format!("opening tick cache for {symbol}"))?;
            sources.push((symbol.clone(), Box::new(file)));
        }
        broker.set_timeline(StreamingTickTimeline::new(sources, config.chunk_size));
    }

    let mut controller = TradingController::new(
        broker.clone(),
        config.time_mode.into(),
        granularity,
        PositionManager::new(config.position_manager),
        config.strict_mode,
        run_id,
    );

    for symbol in &config.symbols {
        let strategy = ReferenceBreakoutStrategy::new(
            symbol.clone(),
            broker.get_current_price(symbol, QuoteSide::Bid).unwrap_or(0.0),
            RetestTolerance::Points(5.0),
            0.0005,
            0.10,
            50.0,
            100.0,
        );
        controller.add_strategy(symbol.clone(), Box::new(strategy));
    }

    let results = controller.run();
    tracing::info!(
        run_id = %results.run_id,
        final_balance = results.final_balance,
        final_equity = results.final_equity,
        trades = results.trade_log.len(),
        "backtest complete"
    );
    results
        .write_json(&args.output)
        .with_context(|| format!("writing results to {:?}", args.output))?;
    println!("results written to {:?}", args.output);

    Ok(())
}

fn load_symbol_infos(config: &BacktestConfig) -> Result<HashMap<String, SymbolInfo>> {
    let mut symbols = HashMap::new();
    for symbol in &config.symbols {
        let base = &symbol[0..3];
        let quote = &symbol[3..6];
        symbols.insert(symbol.clone(), SymbolInfo::fx_5digit(base, quote));
    }
    Ok(symbols)
}

fn load_candles(
    path: &PathBuf,
    lookback_bars: usize,
) -> Result<Vec<betterbot_backend::engine::candle::Candle>> {
    use betterbot_backend::engine::candle::Candle;
    use betterbot_backend::engine::clock::parse_timestamp;

    let mut reader = csv::Reader::from_path(path)?;
    let mut bars = Vec::new();
    for record in reader.records() {
        let record = record?;
        let time = parse_timestamp(&record[0])
            .with_context(|| format!("invalid timestamp in candle cache: {}", &record[0]))?;
        bars.push(Candle {
            time,
            open: record[1].parse()?,
            high: record[2].parse()?,
            low: record[3].parse()?,
            close: record[4].parse()?,
            volume: record[5].parse()?,
        });
    }
    if bars.len() > lookback_bars {
        let start = bars.len() - lookback_bars;
        bars = bars.split_off(start);
    }
    Ok(bars)
}
