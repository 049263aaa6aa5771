mod api;
mod config;
mod errors;
mod exchanges;
mod fetcher;
mod history;
mod models;
mod scheduler;
mod store;

use std::sync::Arc;

use tokio::sync::watch;

use api::{ApiServer, AppState};
use config::Config;
use fetcher::FetchOrchestrator;
use history::History;
use scheduler::RefreshScheduler;
use store::{FundingStore, RefreshCoordinator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    let store = FundingStore::new();

    tracing::info!(
        "fundwatch starting — default symbol {} on port {}",
        config.default_symbol,
        config.api_port
    );

    let orchestrator = Arc::new(FetchOrchestrator::with_default_venues(&config));
    let history = History::resolve(&config);
    let coordinator = Arc::new(RefreshCoordinator::new(
        orchestrator,
        store.clone(),
        Arc::clone(&history),
        config.history_limit,
    ));

    let (symbol_tx, symbol_rx) = watch::channel(config.default_symbol.clone());

    RefreshScheduler::new(
        Arc::clone(&coordinator),
        store.clone(),
        config.refresh_interval,
        symbol_rx,
    )
    .spawn();

    let state = Arc::new(AppState {
        store,
        coordinator,
        history,
        symbol_tx,
        quote_suffix: config.quote_suffix.clone(),
        cache_ttl_ms: config.refresh_interval.as_millis() as i64,
    });

    let server = ApiServer::new(state);

    tokio::select! {
        result = server.run(config.api_port) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }

    Ok(())
}
