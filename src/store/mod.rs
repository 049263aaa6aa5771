pub mod refresh;

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;

pub use refresh::RefreshCoordinator;

use crate::models::{CombinedSnapshot, Countdown, ExchangeId, FundingHistoryEntry};

/// Process-wide funding cache. The scheduler/orchestrator pipeline is the
/// only writer; the serving layer reads. Snapshots are swapped as whole
/// `Arc` values so readers never observe a partial update.
#[derive(Clone)]
pub struct FundingStore {
    inner: Arc<Inner>,
}

struct Inner {
    snapshots: DashMap<String, Arc<CombinedSnapshot>>,
    history: DashMap<(ExchangeId, String), BTreeMap<i64, String>>,
    countdowns: DashMap<String, Arc<Countdown>>,
}

impl FundingStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                snapshots: DashMap::new(),
                history: DashMap::new(),
                countdowns: DashMap::new(),
            }),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<Arc<CombinedSnapshot>> {
        self.inner.snapshots.get(symbol).map(|r| Arc::clone(&r))
    }

    /// Installs a snapshot unless a later-initiated fetch already published.
    /// Fetches may complete out of order; a lower sequence number must never
    /// overwrite a higher one. Returns false when the snapshot was discarded.
    pub fn publish(&self, snapshot: Arc<CombinedSnapshot>) -> bool {
        use dashmap::mapref::entry::Entry;

        match self.inner.snapshots.entry(snapshot.symbol.clone()) {
            Entry::Occupied(mut occupied) => {
                if snapshot.seq < occupied.get().seq {
                    tracing::debug!(
                        symbol = snapshot.symbol,
                        stale_seq = snapshot.seq,
                        current_seq = occupied.get().seq,
                        "discarding out-of-order snapshot"
                    );
                    false
                } else {
                    occupied.insert(snapshot);
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(snapshot);
                true
            }
        }
    }

    /// Merges history entries, deduplicating by funding time. A repeated
    /// timestamp replaces the stored rate rather than duplicating the row.
    /// Returns the number of entries that were new or changed.
    pub fn append_history(
        &self,
        exchange: ExchangeId,
        symbol: &str,
        entries: &[FundingHistoryEntry],
    ) -> usize {
        let mut merged = self
            .inner
            .history
            .entry((exchange, symbol.to_string()))
            .or_default();

        let mut changed = 0;
        for entry in entries {
            let previous = merged.insert(entry.funding_time_ms, entry.funding_rate_percent.clone());
            if previous.as_deref() != Some(entry.funding_rate_percent.as_str()) {
                changed += 1;
            }
        }
        changed
    }

    /// Stored history, newest first.
    pub fn get_history(&self, exchange: ExchangeId, symbol: &str) -> Vec<FundingHistoryEntry> {
        self.inner
            .history
            .get(&(exchange, symbol.to_string()))
            .map(|rows| {
                rows.iter()
                    .rev()
                    .map(|(ts, rate)| FundingHistoryEntry {
                        funding_time_ms: *ts,
                        funding_rate_percent: rate.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_history(&self, exchange: ExchangeId, symbol: &str) -> bool {
        self.inner
            .history
            .get(&(exchange, symbol.to_string()))
            .map(|rows| !rows.is_empty())
            .unwrap_or(false)
    }

    pub fn put_countdown(&self, countdown: Countdown) {
        self.inner
            .countdowns
            .insert(countdown.symbol.clone(), Arc::new(countdown));
    }

    pub fn get_countdown(&self, symbol: &str) -> Option<Arc<Countdown>> {
        self.inner.countdowns.get(symbol).map(|r| Arc::clone(&r))
    }
}

impl Default for FundingStore {
    fn default() -> Self {
        Self::new()
    }
}
