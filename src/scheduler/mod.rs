use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::models::{now_ms, Countdown};
use crate::store::{FundingStore, RefreshCoordinator};

const COUNTDOWN_PERIOD: Duration = Duration::from_secs(1);

/// Drives the background refresh of the active symbol plus an independent
/// 1s countdown recomputation. The two loops share nothing but the store,
/// so a slow exchange never delays the countdown.
pub struct RefreshScheduler {
    coordinator: Arc<RefreshCoordinator>,
    store: FundingStore,
    refresh_interval: Duration,
    symbol_rx: watch::Receiver<String>,
}

impl RefreshScheduler {
    pub fn new(
        coordinator: Arc<RefreshCoordinator>,
        store: FundingStore,
        refresh_interval: Duration,
        symbol_rx: watch::Receiver<String>,
    ) -> Self {
        Self {
            coordinator,
            store,
            refresh_interval,
            symbol_rx,
        }
    }

    pub fn spawn(self) {
        tokio::spawn(refresh_loop(
            self.coordinator,
            self.refresh_interval,
            self.symbol_rx.clone(),
        ));
        tokio::spawn(countdown_loop(self.store, self.symbol_rx));
    }
}

/// Idle -> Fetching -> Idle on a fixed period. A tick that lands while a
/// fetch is still in flight is skipped outright; symbol switches trigger an
/// immediate out-of-cycle refresh without cancelling the previous symbol's
/// in-flight work.
async fn refresh_loop(
    coordinator: Arc<RefreshCoordinator>,
    period: Duration,
    symbol_rx: watch::Receiver<String>,
) {
    let mut change_rx = symbol_rx.clone();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let symbol = symbol_rx.borrow().clone();
                if coordinator.is_refreshing(&symbol) {
                    tracing::debug!(symbol, "refresh still in flight, skipping tick");
                    continue;
                }
                coordinator.refresh(&symbol).await;
            }
            changed = change_rx.changed() => {
                if changed.is_err() {
                    // sender dropped: process shutdown
                    break;
                }
                let symbol = change_rx.borrow_and_update().clone();
                tracing::info!(symbol, "active symbol changed, refreshing out of cycle");
                coordinator.refresh(&symbol).await;
            }
        }
    }
    tracing::info!("refresh loop stopped");
}

/// Recomputes the derived time-to-next-funding view from the cached
/// snapshot once a second. Pure in-memory work, no network.
async fn countdown_loop(store: FundingStore, symbol_rx: watch::Receiver<String>) {
    let mut ticker = tokio::time::interval(COUNTDOWN_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if symbol_rx.has_changed().is_err() {
            break;
        }
        let symbol = symbol_rx.borrow().clone();
        if let Some(snapshot) = store.get(&symbol) {
            store.put_countdown(Countdown::derive(&snapshot, now_ms()));
        }
    }
    tracing::info!("countdown loop stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::fetcher::tests::{orchestrator_with, Script};
    use crate::fetcher::FetchOrchestrator;
    use crate::history::History;
    use crate::models::ExchangeId;

    fn pipeline(
        scripts: [(ExchangeId, Script); 3],
    ) -> (
        Arc<RefreshCoordinator>,
        FundingStore,
        Vec<Arc<crate::fetcher::tests::FakeExchange>>,
    ) {
        let (orchestrator, fakes): (FetchOrchestrator, _) =
            orchestrator_with(scripts, Duration::from_secs(5));
        let store = FundingStore::new();
        let coordinator = Arc::new(RefreshCoordinator::new(
            Arc::new(orchestrator),
            store.clone(),
            History::disabled(),
            50,
        ));
        (coordinator, store, fakes)
    }

    fn all_ok() -> [(ExchangeId, Script); 3] {
        [
            (ExchangeId::Binance, Script::Ok),
            (ExchangeId::Bybit, Script::Ok),
            (ExchangeId::Okx, Script::Ok),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_active_symbol_on_each_period() {
        let (coordinator, store, fakes) = pipeline(all_ok());
        let (_tx, rx) = watch::channel("BTCUSDT".to_string());

        RefreshScheduler::new(
            Arc::clone(&coordinator),
            store.clone(),
            Duration::from_secs(15),
            rx,
        )
        .spawn();

        // first tick fires immediately, second after one period
        tokio::time::sleep(Duration::from_secs(16)).await;

        assert!(store.get("BTCUSDT").is_some());
        for fake in &fakes {
            assert_eq!(fake.calls.load(Ordering::SeqCst), 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn symbol_switch_triggers_immediate_refresh() {
        let (coordinator, store, _fakes) = pipeline(all_ok());
        let (tx, rx) = watch::channel("BTCUSDT".to_string());

        RefreshScheduler::new(
            Arc::clone(&coordinator),
            store.clone(),
            Duration::from_secs(15),
            rx,
        )
        .spawn();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(store.get("BTCUSDT").is_some());
        assert!(store.get("ETHUSDT").is_none());

        tx.send_replace("ETHUSDT".to_string());
        // well inside the 15s period; the switch alone drives the fetch
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(store.get("ETHUSDT").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_updates_without_a_new_fetch() {
        let (coordinator, store, fakes) = pipeline(all_ok());
        let (_tx, rx) = watch::channel("BTCUSDT".to_string());

        RefreshScheduler::new(
            Arc::clone(&coordinator),
            store.clone(),
            Duration::from_secs(3600),
            rx,
        )
        .spawn();

        tokio::time::sleep(Duration::from_secs(5)).await;
        let calls_after_first_fetch: usize =
            fakes.iter().map(|f| f.calls.load(Ordering::SeqCst)).sum();

        let first = store.get_countdown("BTCUSDT").expect("countdown present");
        tokio::time::sleep(Duration::from_secs(5)).await;
        let second = store.get_countdown("BTCUSDT").expect("countdown present");

        assert!(second.computed_at_ms >= first.computed_at_ms);
        let calls_now: usize = fakes.iter().map(|f| f.calls.load(Ordering::SeqCst)).sum();
        assert_eq!(calls_now, calls_after_first_fetch);
    }
}
