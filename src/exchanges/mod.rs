use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::errors::FetchError;
use crate::models::{ExchangeId, FundingHistoryEntry, FundingRecord};

pub mod binance;
pub mod bybit;
pub mod okx;

/// Funding intervals default to 8h when a venue doesn't report one.
pub const DEFAULT_INTERVAL_HOURS: u32 = 8;

#[async_trait]
pub trait Exchange: Send + Sync {
    fn id(&self) -> ExchangeId;

    /// Fetches the current funding rate for an already-normalized symbol.
    /// Venue-specific instrument formatting happens inside the adapter.
    async fn fetch_current(&self, symbol: &str) -> Result<FundingRecord, FetchError>;

    /// Fetches past funding settlements, newest first or oldest first
    /// depending on the venue; the store reorders on merge.
    async fn fetch_history(
        &self,
        symbol: &str,
        limit: u32,
    ) -> Result<Vec<FundingHistoryEntry>, FetchError>;
}

pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

pub(crate) fn transport_error(err: reqwest::Error) -> FetchError {
    FetchError::Unreachable(err.to_string())
}

/// Issues a GET and hands back status plus raw body so each adapter can map
/// venue error envelopes itself. HTTP 429 is mapped here since every venue
/// signals rate limiting the same way.
pub(crate) async fn get_text(
    client: &reqwest::Client,
    url: &str,
    query: &[(&str, &str)],
) -> Result<(StatusCode, String), FetchError> {
    let response = client
        .get(url)
        .query(query)
        .send()
        .await
        .map_err(transport_error)?;

    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(FetchError::RateLimited);
    }

    let body = response.text().await.map_err(transport_error)?;
    Ok((status, body))
}

/// Some venues report timestamps in seconds; anything below 1e12 is treated
/// as seconds and promoted to milliseconds.
pub(crate) fn promote_to_ms(ts: i64) -> i64 {
    if ts > 0 && ts < 1_000_000_000_000 {
        ts * 1000
    } else {
        ts
    }
}

pub(crate) fn build_record(
    symbol: String,
    funding_rate_percent: String,
    next_funding_time_ms: i64,
    interval_hours: u32,
    now_ms: i64,
) -> FundingRecord {
    FundingRecord {
        symbol,
        funding_rate_percent,
        stale: next_funding_time_ms <= now_ms,
        next_funding_time_ms,
        interval_hours,
    }
}
