pub mod handlers;
pub mod models;
pub mod router;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;

use crate::history::History;
use crate::store::{FundingStore, RefreshCoordinator};

/// Shared handler state. Holds only read accessors plus the symbol sender;
/// the cache itself is mutated exclusively by the refresh pipeline.
pub struct AppState {
    pub store: FundingStore,
    pub coordinator: Arc<RefreshCoordinator>,
    pub history: Arc<History>,
    /// Routes the background refresh loop to the most recently requested
    /// symbol.
    pub symbol_tx: watch::Sender<String>,
    pub quote_suffix: String,
    /// A cached snapshot younger than this is served without an on-demand
    /// fetch.
    pub cache_ttl_ms: i64,
}

pub struct ApiServer {
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Binds the server to the configured port and starts serving.
    pub async fn run(self, port: u16) -> anyhow::Result<()> {
        let app = router::build(Arc::clone(&self.state));
        let addr = SocketAddr::from(([0, 0, 0, 0], port));

        tracing::info!("API server listening on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}
