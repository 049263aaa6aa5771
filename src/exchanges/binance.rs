use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use super::{
    build_record, get_text, http_client, Exchange, DEFAULT_INTERVAL_HOURS,
};
use crate::errors::FetchError;
use crate::models::{now_ms, rate_to_percent, ExchangeId, FundingHistoryEntry, FundingRecord};

const PREMIUM_INDEX_URL: &str = "https://fapi.binance.com/fapi/v1/premiumIndex";
const FUNDING_INFO_URL: &str = "https://fapi.binance.com/fapi/v1/fundingInfo";
const FUNDING_HISTORY_URL: &str = "https://fapi.binance.com/fapi/v1/fundingRate";

/// Binance error code for an unknown instrument.
const INVALID_SYMBOL_CODE: i64 = -1121;

/// The raw JSON shape Binance sends back for premiumIndex
#[derive(Debug, Deserialize)]
struct PremiumIndexResponse {
    symbol: String,

    #[serde(rename = "lastFundingRate")]
    last_funding_rate: String,

    #[serde(rename = "nextFundingTime")]
    next_funding_time: i64,
}

#[derive(Debug, Deserialize)]
struct BinanceApiError {
    code: i64,
}

/// fundingInfo lists only symbols whose interval differs from the 8h default.
#[derive(Debug, Deserialize)]
struct FundingInfoEntry {
    symbol: String,

    #[serde(rename = "fundingIntervalHours", default = "default_interval")]
    funding_interval_hours: u32,
}

fn default_interval() -> u32 {
    DEFAULT_INTERVAL_HOURS
}

#[derive(Debug, Deserialize)]
struct FundingHistoryRow {
    #[serde(rename = "fundingTime")]
    funding_time: i64,

    #[serde(rename = "fundingRate")]
    funding_rate: String,
}

pub struct Binance {
    client: reqwest::Client,
}

impl Binance {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
        }
    }

    /// Funding interval lookup is best-effort: any failure falls back to 8h,
    /// which is what Binance uses for every symbol absent from fundingInfo.
    async fn fetch_interval(&self, symbol: &str) -> u32 {
        match get_text(&self.client, FUNDING_INFO_URL, &[]).await {
            Ok((status, body)) => {
                parse_funding_interval(status, &body, symbol).unwrap_or(DEFAULT_INTERVAL_HOURS)
            }
            Err(err) => {
                tracing::debug!(symbol, %err, "binance fundingInfo lookup failed, assuming 8h");
                DEFAULT_INTERVAL_HOURS
            }
        }
    }
}

fn parse_premium_index(
    status: StatusCode,
    body: &str,
) -> Result<(String, String, i64), FetchError> {
    if !status.is_success() {
        if let Ok(err) = serde_json::from_str::<BinanceApiError>(body) {
            if err.code == INVALID_SYMBOL_CODE {
                return Err(FetchError::SymbolNotFound);
            }
        }
        return Err(FetchError::Unreachable(format!("binance http {status}")));
    }

    let data: PremiumIndexResponse =
        serde_json::from_str(body).map_err(|e| FetchError::MalformedResponse(e.to_string()))?;

    let rate_percent = rate_to_percent(&data.last_funding_rate)?;
    Ok((data.symbol, rate_percent, data.next_funding_time))
}

fn parse_funding_interval(status: StatusCode, body: &str, symbol: &str) -> Option<u32> {
    if !status.is_success() {
        return None;
    }
    let entries: Vec<FundingInfoEntry> = serde_json::from_str(body).ok()?;
    entries
        .into_iter()
        .find(|e| e.symbol == symbol)
        .map(|e| e.funding_interval_hours)
}

fn parse_history(status: StatusCode, body: &str) -> Result<Vec<FundingHistoryEntry>, FetchError> {
    if !status.is_success() {
        if let Ok(err) = serde_json::from_str::<BinanceApiError>(body) {
            if err.code == INVALID_SYMBOL_CODE {
                return Err(FetchError::SymbolNotFound);
            }
        }
        return Err(FetchError::Unreachable(format!("binance http {status}")));
    }

    let rows: Vec<FundingHistoryRow> =
        serde_json::from_str(body).map_err(|e| FetchError::MalformedResponse(e.to_string()))?;

    rows.into_iter()
        .map(|row| {
            Ok(FundingHistoryEntry {
                funding_time_ms: row.funding_time,
                funding_rate_percent: rate_to_percent(&row.funding_rate)?,
            })
        })
        .collect()
}

#[async_trait]
impl Exchange for Binance {
    fn id(&self) -> ExchangeId {
        ExchangeId::Binance
    }

    async fn fetch_current(&self, symbol: &str) -> Result<FundingRecord, FetchError> {
        let (status, body) =
            get_text(&self.client, PREMIUM_INDEX_URL, &[("symbol", symbol)]).await?;
        let (venue_symbol, rate_percent, next_funding_ms) = parse_premium_index(status, &body)?;
        let interval_hours = self.fetch_interval(symbol).await;

        Ok(build_record(
            venue_symbol,
            rate_percent,
            next_funding_ms,
            interval_hours,
            now_ms(),
        ))
    }

    async fn fetch_history(
        &self,
        symbol: &str,
        limit: u32,
    ) -> Result<Vec<FundingHistoryEntry>, FetchError> {
        let limit = limit.to_string();
        let (status, body) = get_text(
            &self.client,
            FUNDING_HISTORY_URL,
            &[("symbol", symbol), ("limit", &limit)],
        )
        .await?;
        parse_history(status, &body)
    }
}
