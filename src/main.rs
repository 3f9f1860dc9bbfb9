//! FudTrader entry point
//!
//! Loads config, wires the exchange, advisory, activity and persistence
//! collaborators, then runs one independent loop per configured pair until
//! Ctrl+C.

use anyhow::{Context, Result};
use futures_util::future::join_all;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use fudtrader::activity::HttpActivityClient;
use fudtrader::advisory::HttpAdvisory;
use fudtrader::config::AppConfig;
use fudtrader::engine::{Collaborators, StateBoard, SymbolTrader};
use fudtrader::exchange::{Exchange, PaperExchange, RestExchange};
use fudtrader::logging;
use fudtrader::persistence::CsvPersistence;

const PAPER_STATE_FILE: &str = "paper_exchange.json";

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    logging::init_tracing(&config.logging)?;

    info!("🚀 FudTrader starting");
    info!("⚙️ Config: {}", config.digest());
    config.validate_env()?;

    let exchange = build_exchange(&config)?;
    let store = Arc::new(
        CsvPersistence::new(&config.persistence.data_dir)
            .context("Failed to open persistence directory")?,
    );
    let deps = Collaborators {
        exchange,
        advisory: Arc::new(HttpAdvisory::new(&config.advisory)?),
        activity: Arc::new(HttpActivityClient::new(&config.activity)?),
        store: store.clone(),
    };

    let board = StateBoard::new();
    let config = Arc::new(config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    #[cfg(feature = "dashboard")]
    {
        if config.dashboard.enabled {
            let board = board.clone();
            let port = config.dashboard.port;
            tokio::spawn(async move {
                if let Err(e) = fudtrader::dashboard::start_server(board, store, port).await {
                    error!(error = %e, "Dashboard server stopped");
                }
            });
        }
    }
    #[cfg(not(feature = "dashboard"))]
    {
        drop(store);
        if config.dashboard.enabled {
            warn!("Dashboard enabled in config but the binary was built without the `dashboard` feature");
        }
    }

    let handles: Vec<_> = config
        .pairs
        .iter()
        .map(|pair| {
            let trader = SymbolTrader::new(pair.clone(), config.clone(), deps.clone(), board.clone());
            info!(symbol = %pair.symbol, community = %pair.community_id, "📈 Starting symbol loop");
            tokio::spawn(trader.run(shutdown_rx.clone()))
        })
        .collect();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("🛑 Shutdown requested, finishing in-flight cycles");
    let _ = shutdown_tx.send(true);

    for (pair, result) in config.pairs.iter().zip(join_all(handles).await) {
        if let Err(e) = result {
            error!(symbol = %pair.symbol, error = %e, "Symbol loop panicked");
        }
    }

    info!("👋 FudTrader stopped");
    Ok(())
}

/// Live REST venue, or a paper venue over its public market data in dry-run mode
fn build_exchange(config: &AppConfig) -> Result<Arc<dyn Exchange>> {
    if !config.bot.dry_run {
        let rest = RestExchange::from_env(&config.exchange)?;
        info!("🔴 LIVE trading on {}", config.exchange.base_url);
        return Ok(Arc::new(rest));
    }

    // market data endpoints are unsigned, so missing keys are fine here
    let api_key = std::env::var(&config.exchange.api_key_env).unwrap_or_default();
    let secret_key = std::env::var(&config.exchange.secret_key_env).unwrap_or_default();
    let market = Arc::new(RestExchange::new(&config.exchange, api_key, secret_key)?);

    std::fs::create_dir_all(&config.persistence.data_dir)
        .context("Failed to create data directory")?;
    let state_file = Path::new(&config.persistence.data_dir).join(PAPER_STATE_FILE);
    let paper = PaperExchange::new(market).with_state_file(state_file);
    paper.load_state()?;
    info!("📝 DRY RUN: orders are simulated against live mark prices");
    Ok(Arc::new(paper))
}
