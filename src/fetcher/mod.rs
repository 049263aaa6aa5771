use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;

use crate::config::Config;
use crate::errors::FetchError;
use crate::exchanges::{binance::Binance, bybit::Bybit, okx::Okx, Exchange};
use crate::models::{now_ms, CombinedSnapshot, ExchangeId, FundingHistoryEntry};

pub type HistoryResults = BTreeMap<ExchangeId, Result<Vec<FundingHistoryEntry>, FetchError>>;

/// Fans out to all configured exchange adapters concurrently and collects
/// each outcome independently. One venue failing or stalling never blocks or
/// discards another venue's result.
pub struct FetchOrchestrator {
    exchanges: Vec<Arc<dyn Exchange>>,
    timeout: Duration,
}

impl FetchOrchestrator {
    pub fn new(exchanges: Vec<Arc<dyn Exchange>>, timeout: Duration) -> Self {
        Self { exchanges, timeout }
    }

    pub fn with_default_venues(config: &Config) -> Self {
        let t = config.fetch_timeout;
        Self::new(
            vec![
                Arc::new(Binance::new(t)),
                Arc::new(Bybit::new(t)),
                Arc::new(Okx::new(t)),
            ],
            t,
        )
    }

    /// Fetches the current funding rate from every venue. Always produces a
    /// snapshot with exactly one outcome per exchange, even when all fail,
    /// so callers can tell "fetch attempted and failed" from "never fetched".
    pub async fn fetch_combined(&self, symbol: &str, seq: u64) -> CombinedSnapshot {
        let calls = self.exchanges.iter().map(|exchange| {
            let exchange = Arc::clone(exchange);
            let symbol = symbol.to_string();
            let timeout = self.timeout;
            async move {
                let outcome = match tokio::time::timeout(timeout, exchange.fetch_current(&symbol))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::Unreachable(format!(
                        "timed out after {}s",
                        timeout.as_secs()
                    ))),
                };
                (exchange.id(), outcome)
            }
        });

        let exchanges: BTreeMap<ExchangeId, _> = join_all(calls).await.into_iter().collect();

        for (id, outcome) in &exchanges {
            if let Err(err) = outcome {
                tracing::warn!(exchange = %id, symbol, %err, "funding fetch failed");
            }
        }

        CombinedSnapshot {
            symbol: symbol.to_string(),
            seq,
            fetched_at_ms: now_ms(),
            exchanges,
        }
    }

    /// History follows the same all-independent-outcomes policy; invoked on
    /// demand rather than every refresh tick.
    pub async fn fetch_history_combined(&self, symbol: &str, limit: u32) -> HistoryResults {
        let calls = self.exchanges.iter().map(|exchange| {
            let exchange = Arc::clone(exchange);
            let symbol = symbol.to_string();
            let timeout = self.timeout;
            async move {
                let outcome =
                    match tokio::time::timeout(timeout, exchange.fetch_history(&symbol, limit))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(FetchError::Unreachable(format!(
                            "timed out after {}s",
                            timeout.as_secs()
                        ))),
                    };
                (exchange.id(), outcome)
            }
        });

        join_all(calls).await.into_iter().collect()
    }
}
