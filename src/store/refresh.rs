use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;

use crate::fetcher::{FetchOrchestrator, HistoryResults};
use crate::history::History;
use crate::models::{CombinedSnapshot, ExchangeId};
use crate::store::FundingStore;

type SharedRefresh = Shared<BoxFuture<'static, Arc<CombinedSnapshot>>>;

/// Single entry point for refreshing the cache. Guarantees at most one
/// concurrent fetch per symbol: a refresh requested while one is in flight
/// awaits the same shared future instead of issuing duplicate venue calls.
pub struct RefreshCoordinator {
    orchestrator: Arc<FetchOrchestrator>,
    store: FundingStore,
    history: Arc<History>,
    history_limit: u32,
    next_seq: AtomicU64,
    inflight: Arc<DashMap<String, SharedRefresh>>,
}

impl RefreshCoordinator {
    pub fn new(
        orchestrator: Arc<FetchOrchestrator>,
        store: FundingStore,
        history: Arc<History>,
        history_limit: u32,
    ) -> Self {
        Self {
            orchestrator,
            store,
            history,
            history_limit,
            next_seq: AtomicU64::new(1),
            inflight: Arc::new(DashMap::new()),
        }
    }

    pub fn is_refreshing(&self, symbol: &str) -> bool {
        self.inflight.contains_key(symbol)
    }

    /// Fetches all venues for `symbol` and publishes the result. Concurrent
    /// callers for the same symbol observe the same eventual snapshot.
    pub async fn refresh(&self, symbol: &str) -> Arc<CombinedSnapshot> {
        if let Some(inflight) = self.inflight.get(symbol).map(|f| f.value().clone()) {
            return inflight.await;
        }

        // seq is allocated at initiation, so an earlier-initiated fetch that
        // finishes late can never clobber a fresher snapshot
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let orchestrator = Arc::clone(&self.orchestrator);
        let store = self.store.clone();
        let owned = symbol.to_string();
        let fresh: SharedRefresh = async move {
            let snapshot = Arc::new(orchestrator.fetch_combined(&owned, seq).await);
            store.publish(Arc::clone(&snapshot));
            snapshot
        }
        .boxed()
        .shared();

        let fut = match self.inflight.entry(symbol.to_string()) {
            // another caller won the insert race; coalesce into theirs
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                slot.insert(fresh.clone());
                // drive the fetch on its own task so a caller that goes away
                // (symbol switch) never cancels it, and clear the in-flight
                // marker exactly once when it lands
                let inflight = Arc::clone(&self.inflight);
                let key = symbol.to_string();
                let driver = fresh.clone();
                tokio::spawn(async move {
                    let _ = driver.await;
                    inflight.remove(&key);
                });
                fresh
            }
        };

        fut.await
    }

    /// On-demand history pipeline: seed from the on-disk cache on first
    /// touch, fetch fresh rows from every venue, merge into memory, then
    /// persist asynchronously. Persistence failures never surface here.
    pub async fn history(&self, symbol: &str) -> HistoryResults {
        for exchange in ExchangeId::ALL {
            if !self.store.has_history(exchange, symbol) {
                if let Ok(entries) = self.history.load(exchange, symbol).await {
                    if !entries.is_empty() {
                        let seeded = self.store.append_history(exchange, symbol, &entries);
                        tracing::debug!(%exchange, symbol, seeded, "seeded history from disk");
                    }
                }
            }
        }

        let fetched = self
            .orchestrator
            .fetch_history_combined(symbol, self.history_limit)
            .await;

        let mut results = HistoryResults::new();
        for (exchange, outcome) in fetched {
            match outcome {
                Ok(entries) => {
                    let changed = self.store.append_history(exchange, symbol, &entries);
                    if changed > 0 {
                        let merged = self.store.get_history(exchange, symbol);
                        let history = Arc::clone(&self.history);
                        let symbol_owned = symbol.to_string();
                        tokio::spawn(async move {
                            history.append(exchange, &symbol_owned, &merged).await;
                        });
                    }
                    results.insert(exchange, Ok(self.store.get_history(exchange, symbol)));
                }
                Err(err) => {
                    let cached = self.store.get_history(exchange, symbol);
                    if cached.is_empty() {
                        results.insert(exchange, Err(err));
                    } else {
                        tracing::warn!(
                            %exchange, symbol, %err,
                            "history fetch failed, serving cached rows"
                        );
                        results.insert(exchange, Ok(cached));
                    }
                }
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering as AtomicOrdering;
    use std::time::Duration;

    use super::*;
    use crate::errors::FetchError;
    use crate::fetcher::tests::{orchestrator_with, FakeExchange, Script};
    use crate::models::ExchangeId;

    fn coordinator_with(
        scripts: [(ExchangeId, Script); 3],
    ) -> (Arc<RefreshCoordinator>, FundingStore, Vec<Arc<FakeExchange>>) {
        let (orchestrator, fakes) = orchestrator_with(scripts, Duration::from_secs(5));
        let store = FundingStore::new();
        let coordinator = Arc::new(RefreshCoordinator::new(
            Arc::new(orchestrator),
            store.clone(),
            History::disabled(),
            50,
        ));
        (coordinator, store, fakes)
    }

    fn all_delayed() -> [(ExchangeId, Script); 3] {
        [
            (ExchangeId::Binance, Script::Delay(Duration::from_secs(1))),
            (ExchangeId::Bybit, Script::Delay(Duration::from_secs(1))),
            (ExchangeId::Okx, Script::Delay(Duration::from_secs(1))),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_refreshes_for_one_symbol_coalesce() {
        let (coordinator, _store, fakes) = coordinator_with(all_delayed());

        let first = tokio::spawn({
            let c = Arc::clone(&coordinator);
            async move { c.refresh("BTCUSDT").await }
        });
        let second = tokio::spawn({
            let c = Arc::clone(&coordinator);
            async move { c.refresh("BTCUSDT").await }
        });

        let (a, b) = tokio::join!(first, second);
        let (a, b) = (a.expect("task"), b.expect("task"));

        assert_eq!(a.seq, b.seq);
        for fake in &fakes {
            assert_eq!(fake.calls.load(AtomicOrdering::SeqCst), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_for_different_symbols_run_independently() {
        let (coordinator, store, fakes) = coordinator_with(all_delayed());

        coordinator.refresh("BTCUSDT").await;
        coordinator.refresh("ETHUSDT").await;

        assert!(store.get("BTCUSDT").is_some());
        assert!(store.get("ETHUSDT").is_some());
        for fake in &fakes {
            assert_eq!(fake.calls.load(AtomicOrdering::SeqCst), 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_refresh_still_lands_in_the_store() {
        let (coordinator, store, _fakes) = coordinator_with(all_delayed());

        let handle = tokio::spawn({
            let c = Arc::clone(&coordinator);
            async move { c.refresh("BTCUSDT").await }
        });

        while !coordinator.is_refreshing("BTCUSDT") {
            tokio::task::yield_now().await;
        }
        // the caller walks away mid-fetch (user switched symbols)
        handle.abort();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(store.get("BTCUSDT").is_some());
        assert!(!coordinator.is_refreshing("BTCUSDT"));
    }

    #[tokio::test(start_paused = true)]
    async fn history_serves_cached_rows_when_a_venue_fails() {
        let (coordinator, store, _fakes) = coordinator_with([
            (ExchangeId::Binance, Script::Ok),
            (
                ExchangeId::Bybit,
                Script::Fail(FetchError::Unreachable("down".into())),
            ),
            (ExchangeId::Okx, Script::Ok),
        ]);

        // bybit has rows from an earlier successful fetch
        store.append_history(
            ExchangeId::Bybit,
            "BTCUSDT",
            &[crate::models::FundingHistoryEntry {
                funding_time_ms: 1_699_000_000_000,
                funding_rate_percent: "0.03".to_string(),
            }],
        );

        let results = coordinator.history("BTCUSDT").await;

        assert!(results[&ExchangeId::Binance].is_ok());
        assert!(results[&ExchangeId::Okx].is_ok());
        let bybit = results[&ExchangeId::Bybit].as_ref().expect("cached rows");
        assert_eq!(bybit.len(), 1);
        assert_eq!(bybit[0].funding_rate_percent, "0.03");
    }

    #[tokio::test(start_paused = true)]
    async fn history_reports_error_when_venue_fails_with_no_cache() {
        let (coordinator, _store, _fakes) = coordinator_with([
            (ExchangeId::Binance, Script::Ok),
            (
                ExchangeId::Bybit,
                Script::Fail(FetchError::Unreachable("down".into())),
            ),
            (ExchangeId::Okx, Script::Ok),
        ]);

        let results = coordinator.history("BTCUSDT").await;

        assert!(matches!(
            results[&ExchangeId::Bybit],
            Err(FetchError::Unreachable(_))
        ));
    }
}
