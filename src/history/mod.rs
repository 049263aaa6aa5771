#[cfg(feature = "parquet-history")]
pub mod parquet;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::errors::PersistError;
use crate::models::{ExchangeId, FundingHistoryEntry};

/// Durable copy of funding history, one dataset per (exchange, symbol).
/// The live snapshot is never persisted; memory stays authoritative.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(
        &self,
        exchange: ExchangeId,
        symbol: &str,
        entries: &[FundingHistoryEntry],
    ) -> Result<(), PersistError>;

    async fn load(
        &self,
        exchange: ExchangeId,
        symbol: &str,
    ) -> Result<Vec<FundingHistoryEntry>, PersistError>;
}

/// Stands in when persistence is unavailable; callers can't tell the
/// difference beyond durability across restarts.
pub struct NoopHistoryStore;

#[async_trait]
impl HistoryStore for NoopHistoryStore {
    async fn append(
        &self,
        _exchange: ExchangeId,
        _symbol: &str,
        _entries: &[FundingHistoryEntry],
    ) -> Result<(), PersistError> {
        Ok(())
    }

    async fn load(
        &self,
        _exchange: ExchangeId,
        _symbol: &str,
    ) -> Result<Vec<FundingHistoryEntry>, PersistError> {
        Ok(Vec::new())
    }
}

/// Persistence facade handed to the rest of the pipeline. Resolved once at
/// startup; absorbs write failures so a sick disk never interrupts the
/// refresh loop.
pub struct History {
    store: Arc<dyn HistoryStore>,
    enabled: bool,
    degraded: AtomicBool,
}

impl History {
    pub fn resolve(config: &Config) -> Arc<Self> {
        match open_backend(config) {
            Some(store) => {
                tracing::info!(data_dir = %config.data_dir, "funding history persistence enabled");
                Arc::new(Self {
                    store,
                    enabled: true,
                    degraded: AtomicBool::new(false),
                })
            }
            None => Self::disabled(),
        }
    }

    pub fn disabled() -> Arc<Self> {
        Arc::new(Self {
            store: Arc::new(NoopHistoryStore),
            enabled: false,
            degraded: AtomicBool::new(false),
        })
    }

    /// Appends entries to the durable copy. Failures are logged and tracked
    /// as a health flag, never propagated to the caller.
    pub async fn append(&self, exchange: ExchangeId, symbol: &str, entries: &[FundingHistoryEntry]) {
        match self.store.append(exchange, symbol, entries).await {
            Ok(()) => {
                self.degraded.store(false, Ordering::Relaxed);
            }
            Err(err) => {
                self.degraded.store(true, Ordering::Relaxed);
                tracing::warn!(%exchange, symbol, %err, "history persistence write failed");
            }
        }
    }

    pub async fn load(
        &self,
        exchange: ExchangeId,
        symbol: &str,
    ) -> Result<Vec<FundingHistoryEntry>, PersistError> {
        match self.store.load(exchange, symbol).await {
            Ok(entries) => Ok(entries),
            Err(err) => {
                self.degraded.store(true, Ordering::Relaxed);
                tracing::warn!(%exchange, symbol, %err, "history persistence read failed");
                Err(err)
            }
        }
    }

    pub fn status(&self) -> &'static str {
        if !self.enabled {
            "disabled"
        } else if self.degraded.load(Ordering::Relaxed) {
            "degraded"
        } else {
            "ok"
        }
    }
}

#[cfg(feature = "parquet-history")]
fn open_backend(config: &Config) -> Option<Arc<dyn HistoryStore>> {
    if !config.persistence_enabled {
        tracing::info!("funding history persistence disabled by config");
        return None;
    }
    match parquet::ParquetHistoryStore::open(&config.data_dir) {
        Ok(store) => Some(Arc::new(store)),
        Err(err) => {
            tracing::warn!(%err, "history persistence unavailable, continuing in-memory only");
            None
        }
    }
}

#[cfg(not(feature = "parquet-history"))]
fn open_backend(config: &Config) -> Option<Arc<dyn HistoryStore>> {
    if config.persistence_enabled {
        tracing::info!("built without parquet-history, funding history kept in memory only");
    }
    None
}
