//! # backtest: Command line backtest runner
//!
//! Reads its settings from the environment (see [`autotrader::config`]),
//! replays the configured price history through the chosen strategy and
//! writes `backtesting_result.csv`.
//!
//! With `MONITOR_BIND_ADDR` set the monitor API is served during the run
//! and kept up afterwards until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use autotrader::broker::backtest::Backtest;
use autotrader::broker::report::ReportWriter;
use autotrader::broker::Broker;
use autotrader::config::Config;
use autotrader::engine::paper_wallet::PaperWallet;
use autotrader::engine::trader::Trader;
use autotrader::routes::router;
use autotrader::state::build_state;
use autotrader::store::{CandleStore, MemoryStore};
use autotrader::strategy::{Registry, StrategyParams};

// ─── Entry Point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Load .env (optional) ──────────────────────────────────────────────
    dotenvy::dotenv().ok();

    // ── 2. Initialise structured logging ─────────────────────────────────────
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env()
            .add_directive("autotrader=debug".parse()?)
            .add_directive("backtest=debug".parse()?)
            .add_directive("tower_http=info".parse()?))
        .init();

    info!(
        r#"

  ╔═══════════════════════════════════════════════╗
  ║          AUTOTRADER · Backtest Runner         ║
  ║      Candles · Paper Wallet · Strategies      ║
  ╚═══════════════════════════════════════════════╝"#
    );

    // ── 3. Configuration ─────────────────────────────────────────────────────
    let config = Config::from_env().context("invalid configuration")?;
    info!(
        instrument = %config.instrument,
        strategy   = %config.strategy,
        duration   = %autotrader::helper::format_duration(config.candle_duration),
        "⚙️ Configuration loaded"
    );

    // ── 4. Broker: price source + paper wallet + report ──────────────────────
    let store = Arc::new(MemoryStore::new());
    let wallet = Arc::new(PaperWallet::new(config.wallet.clone()));
    let report = ReportWriter::new(&config.result_csv, config.display_tz);
    let broker: Arc<dyn Broker> = Arc::new(Backtest::new(
        &config.instrument,
        wallet.clone(),
        config.candle_source(),
        report,
    ));

    // ── 5. Strategy + trader ─────────────────────────────────────────────────
    let params = StrategyParams::new(&config.instrument, config.candle_duration);
    let strategy = Registry::with_defaults().build(&config.strategy, &params)?;
    let trader = Trader::new(
        config.trader_config(),
        broker,
        strategy,
        Some(store.clone() as Arc<dyn CandleStore>),
    );

    // ── 6. Optional monitor API ──────────────────────────────────────────────
    let monitor = match config.monitor_bind_addr {
        Some(addr) => {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            let state = build_state(&config.instrument, wallet.clone(), store.clone(), trader.events());
            let app = router(state)
                .layer(TraceLayer::new_for_http())
                .layer(cors);

            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!(?addr, "🚀 Monitor API listening");
            Some(tokio::spawn(async move { axum::serve(listener, app).await }))
        }
        None => None,
    };

    // ── 7. Run the backtest ──────────────────────────────────────────────────
    trader.warm_up().await?;
    trader.start().await?;
    let run = trader.wait_for_feed().await;
    let stopped = trader.stop().await;
    if let Err(err) = run.and(stopped) {
        error!(error = %err, "💥 Backtest aborted");
        return Err(err.into());
    }

    // ── 8. Performance record ────────────────────────────────────────────────
    match trader.performance_record().await? {
        Some(mut record) => {
            record.config_json = Some(config.to_json());
            record.log_summary();
            trader.save_performance_record(&record).await?;
        }
        None => warn!("No closed positions, no performance record"),
    }
    info!(path = %config.result_csv.display(), "🏁 Backtest finished");

    // ── 9. Keep the monitor up until Ctrl-C ──────────────────────────────────
    if let Some(server) = monitor {
        info!("Monitor still serving, press Ctrl-C to exit");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            result = server => result??,
        }
    }

    Ok(())
}
