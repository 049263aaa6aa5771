use std::collections::BTreeMap;

use serde::Serialize;

use crate::errors::FetchError;
use crate::models::{CombinedSnapshot, Countdown, ExchangeId, FundingHistoryEntry, FundingRecord};

/// Response for GET /api/funding
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingResponse {
    pub symbol: String,
    pub fetched_at_ms: i64,
    pub exchanges: BTreeMap<ExchangeId, ExchangeEntry>,
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum ExchangeEntry {
    Record(FundingView),
    Error(ErrorMarker),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingView {
    pub symbol: String,
    pub funding_rate_percent: String,
    pub next_funding_time_ms: i64,
    pub interval_hours: u32,
    pub stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_next_funding_secs: Option<i64>,
}

#[derive(Serialize)]
pub struct ErrorMarker {
    pub error: &'static str,
    pub detail: String,
}

impl From<&FetchError> for ErrorMarker {
    fn from(err: &FetchError) -> Self {
        Self {
            error: err.kind(),
            detail: err.to_string(),
        }
    }
}

impl FundingResponse {
    /// Builds the served view from the cached snapshot, preferring the 1s
    /// countdown board over recomputing from scratch.
    pub fn from_snapshot(
        snapshot: &CombinedSnapshot,
        countdown: Option<&Countdown>,
        now_ms: i64,
    ) -> Self {
        let exchanges = snapshot
            .exchanges
            .iter()
            .map(|(id, outcome)| {
                let entry = match outcome {
                    Ok(record) => ExchangeEntry::Record(funding_view(
                        *id, record, snapshot, countdown, now_ms,
                    )),
                    Err(err) => ExchangeEntry::Error(err.into()),
                };
                (*id, entry)
            })
            .collect();

        Self {
            symbol: snapshot.symbol.clone(),
            fetched_at_ms: snapshot.fetched_at_ms,
            exchanges,
        }
    }
}

fn funding_view(
    id: ExchangeId,
    record: &FundingRecord,
    snapshot: &CombinedSnapshot,
    countdown: Option<&Countdown>,
    now_ms: i64,
) -> FundingView {
    let from_board = countdown
        .filter(|c| c.symbol == snapshot.symbol)
        .and_then(|c| c.secs_to_next.get(&id).copied())
        .flatten();

    let time_to_next_funding_secs = from_board.or_else(|| {
        (!record.stale)
            .then(|| (record.next_funding_time_ms.saturating_sub(now_ms) / 1000).max(0))
    });

    FundingView {
        symbol: record.symbol.clone(),
        funding_rate_percent: record.funding_rate_percent.clone(),
        next_funding_time_ms: record.next_funding_time_ms,
        interval_hours: record.interval_hours,
        stale: record.stale,
        time_to_next_funding_secs,
    }
}

/// Response for GET /api/funding-history
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub symbol: String,
    pub exchanges: BTreeMap<ExchangeId, HistoryEntrySet>,
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum HistoryEntrySet {
    Entries(Vec<FundingHistoryEntry>),
    Error(ErrorMarker),
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub persistence: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
