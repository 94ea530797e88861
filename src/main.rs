//! Process entry point: wires the Bridge Server, Trade Ledger, Circuit
//! Breaker, Trading Loop, and notifier together and drives them until
//! shutdown.

#[cfg(feature = "jemalloc")]
use tikv_jemallocator::Jemalloc;
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[cfg(feature = "jemalloc")]
fn jemalloc_purge() {
    use tikv_jemalloc_ctl::epoch;
    // Advancing the epoch causes jemalloc to evaluate all decay windows
    // and release dirty pages back to the OS via its background purge logic.
    if let Ok(e) = epoch::mib() {
        let _ = e.advance();
    }
    log::debug!("jemalloc: epoch advanced — dirty pages scheduled for release");
}

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use gold_sar_bridge::bridge::BridgeServer;
use gold_sar_bridge::cache::MarketDataCache;
use gold_sar_bridge::circuit_breaker::CircuitBreaker;
use gold_sar_bridge::config::Config;
use gold_sar_bridge::ledger::TradeLedger;
use gold_sar_bridge::notifier::Notifier;
use gold_sar_bridge::trading_loop::{LoopState, TradingLoop, TradingLoopConfig};

/// Single-instrument Parabolic-SAR trend-following bridge.
#[derive(Parser, Debug)]
#[command(name = "gold_sar_bridge", version)]
struct Cli {
    /// Log level: error, warn, info, debug, trace.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Construct the bridge and loop but never send BUY/SELL/CLOSE;
    /// only logs the decisions it would have made.
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

const EXIT_OK: i32 = 0;
const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_BRIDGE_FAILURE: i32 = 2;
const EXIT_SHUTDOWN_WITH_MANUAL_POSITIONS: i32 = 3;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.log_level.clone())).init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            log::error!("config error: {e}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    let exit_code = run(config, cli.dry_run).await;
    std::process::exit(exit_code);
}

async fn run(config: Config, dry_run: bool) -> i32 {
    let ledger = match TradeLedger::new(&config.logs_dir) {
        Ok(l) => Arc::new(l),
        Err(e) => {
            log::error!("failed to open trade ledger: {e}");
            return EXIT_CONFIG_ERROR;
        }
    };

    let cb_state_path = std::path::Path::new(&config.logs_dir).join("circuit_breaker_state.json");
    let circuit_breaker = match CircuitBreaker::load(&cb_state_path, config.protection_config()) {
        Ok(cb) => Arc::new(cb),
        Err(e) => {
            log::error!("failed to load circuit breaker state: {e}");
            return EXIT_CONFIG_ERROR;
        }
    };

    let cache = MarketDataCache::new();
    let (notify_tx, notify_rx) = tokio::sync::mpsc::channel(128);
    let notifier = Notifier::new(config.webhook_url.clone());
    let notifier_task = tokio::spawn(notifier.run(notify_rx));

    let account_mirror_path = std::path::Path::new(&config.logs_dir).join("account_info.json");
    let bridge = BridgeServer::with_symbol_aliases(cache.clone(), notify_tx.clone(), config.symbol_aliases.clone())
        .with_account_mirror(account_mirror_path);
    let addr: std::net::SocketAddr = match format!("{}:{}", config.bridge_host, config.bridge_port).parse() {
        Ok(a) => a,
        Err(e) => {
            log::error!("invalid BRIDGE_HOST/BRIDGE_PORT: {e}");
            return EXIT_CONFIG_ERROR;
        }
    };

    let bridge_for_server = bridge.clone();
    let mut server_task = tokio::spawn(async move {
        if let Err(e) = bridge_for_server.run(addr).await {
            log::error!("bridge server terminated: {e}");
        }
    });

    let loop_cfg = TradingLoopConfig {
        symbol: config.symbol.clone(),
        timeframe: config.timeframe.clone(),
        sar_acceleration: config.sar_acceleration,
        sar_maximum: config.sar_maximum,
        risk_percentage: config.risk_percentage,
        desired_signal: config.desired_signal,
        tick_max_age: config.tick_max_age(),
        account_max_age: config.account_max_age(),
        position_stale_after: config.position_stale_after(),
        monitor: config.monitor_config(),
        dry_run,
    };

    let mut trading_loop = TradingLoop::new(
        cache.clone(),
        bridge.clone(),
        ledger.clone(),
        circuit_breaker.clone(),
        notify_tx.clone(),
        loop_cfg,
    );

    // WAITING_FOR_SIGNAL and MONITORING each get their own cadence, per
    // the documented signal_check_interval/position_check_interval split
    // (the state machine only ever acts on the ticker matching its
    // current state, so an off-cadence tick is a harmless no-op).
    let mut signal_ticker = tokio::time::interval(config.signal_check_interval());
    let mut position_ticker = tokio::time::interval(config.position_check_interval());
    let mut bars_ticker = tokio::time::interval(Duration::from_secs(15));
    #[cfg(feature = "jemalloc")]
    let mut jemalloc_ticker = tokio::time::interval(Duration::from_secs(300));

    log::info!(
        "gold_sar_bridge starting: symbol={} timeframe={} dry_run={dry_run}",
        config.symbol,
        config.timeframe
    );

    loop {
        tokio::select! {
            _ = signal_ticker.tick() => {
                if matches!(trading_loop.state(), LoopState::WaitingForSignal) {
                    trading_loop.step().await;
                }
            }
            _ = position_ticker.tick() => {
                if matches!(trading_loop.state(), LoopState::Monitoring { .. }) {
                    trading_loop.step().await;
                }
            }
            _ = bars_ticker.tick() => {
                trading_loop.refresh_bars(200).await;
            }
            #[cfg(feature = "jemalloc")]
            _ = jemalloc_ticker.tick() => {
                jemalloc_purge();
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("shutdown signal received");
                break;
            }
            _ = &mut server_task => {
                log::error!("bridge server task exited unexpectedly");
                notifier_task.abort();
                return EXIT_BRIDGE_FAILURE;
            }
        }
    }

    let manual_intervention_needed = trading_loop.shutdown_close(Duration::from_secs(15)).await;
    drop(notify_tx);
    let _ = tokio::time::timeout(Duration::from_secs(2), notifier_task).await;
    server_task.abort();

    if manual_intervention_needed {
        EXIT_SHUTDOWN_WITH_MANUAL_POSITIONS
    } else {
        EXIT_OK
    }
}

