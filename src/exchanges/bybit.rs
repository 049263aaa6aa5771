use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use super::{
    build_record, get_text, http_client, promote_to_ms, Exchange, DEFAULT_INTERVAL_HOURS,
};
use crate::errors::FetchError;
use crate::models::{now_ms, rate_to_percent, ExchangeId, FundingHistoryEntry, FundingRecord};

const TICKERS_URL: &str = "https://api.bybit.com/v5/market/tickers";
const FUNDING_HISTORY_URL: &str = "https://api.bybit.com/v5/market/funding/history";

/// Bybit signals "params error" (including unknown symbols) with this code.
const PARAMS_ERROR_CODE: i64 = 10001;

#[derive(Debug, Deserialize)]
struct BybitEnvelope<T> {
    #[serde(rename = "retCode")]
    ret_code: i64,

    #[serde(rename = "retMsg", default)]
    ret_msg: String,

    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TickerList {
    #[serde(default)]
    list: Vec<BybitTicker>,
}

#[derive(Debug, Deserialize)]
struct BybitTicker {
    symbol: String,

    #[serde(rename = "fundingRate")]
    funding_rate: String,

    #[serde(rename = "nextFundingTime")]
    next_funding_time: String,

    #[serde(rename = "fundingIntervalHour", default)]
    funding_interval_hour: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryList {
    #[serde(default)]
    list: Vec<BybitHistoryRow>,
}

#[derive(Debug, Deserialize)]
struct BybitHistoryRow {
    #[serde(rename = "fundingRateTimestamp")]
    funding_rate_timestamp: String,

    #[serde(rename = "fundingRate")]
    funding_rate: String,
}

pub struct Bybit {
    client: reqwest::Client,
}

impl Bybit {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
        }
    }
}

/// Unwraps Bybit's retCode envelope. Bybit reports errors via retCode, not
/// just HTTP status.
fn unwrap_envelope<T>(status: StatusCode, body: &str) -> Result<T, FetchError>
where
    T: for<'de> Deserialize<'de>,
{
    if !status.is_success() {
        return Err(FetchError::Unreachable(format!("bybit http {status}")));
    }

    let envelope: BybitEnvelope<T> =
        serde_json::from_str(body).map_err(|e| FetchError::MalformedResponse(e.to_string()))?;

    if envelope.ret_code == PARAMS_ERROR_CODE {
        return Err(FetchError::SymbolNotFound);
    }
    if envelope.ret_code != 0 {
        return Err(FetchError::MalformedResponse(format!(
            "bybit retCode {}: {}",
            envelope.ret_code, envelope.ret_msg
        )));
    }

    envelope.result.ok_or_else(|| {
        FetchError::MalformedResponse("bybit response missing result".to_string())
    })
}

fn parse_ticker(status: StatusCode, body: &str, now_ms: i64) -> Result<FundingRecord, FetchError> {
    let result: TickerList = unwrap_envelope(status, body)?;

    // an empty list for a concrete symbol means the instrument doesn't exist
    let ticker = result
        .list
        .into_iter()
        .next()
        .ok_or(FetchError::SymbolNotFound)?;

    let rate_percent = rate_to_percent(&ticker.funding_rate)?;

    let next_funding_ms = ticker
        .next_funding_time
        .parse::<i64>()
        .map(promote_to_ms)
        .map_err(|e| FetchError::MalformedResponse(format!("nextFundingTime: {e}")))?;

    let interval_hours = ticker
        .funding_interval_hour
        .as_deref()
        .and_then(|h| h.parse::<u32>().ok())
        .unwrap_or(DEFAULT_INTERVAL_HOURS);

    Ok(build_record(
        ticker.symbol,
        rate_percent,
        next_funding_ms,
        interval_hours,
        now_ms,
    ))
}

fn parse_history(status: StatusCode, body: &str) -> Result<Vec<FundingHistoryEntry>, FetchError> {
    let result: HistoryList = unwrap_envelope(status, body)?;

    result
        .list
        .into_iter()
        .map(|row| {
            let ts = row
                .funding_rate_timestamp
                .parse::<i64>()
                .map(promote_to_ms)
                .map_err(|e| FetchError::MalformedResponse(format!("fundingRateTimestamp: {e}")))?;
            Ok(FundingHistoryEntry {
                funding_time_ms: ts,
                funding_rate_percent: rate_to_percent(&row.funding_rate)?,
            })
        })
        .collect()
}

#[async_trait]
impl Exchange for Bybit {
    fn id(&self) -> ExchangeId {
        ExchangeId::Bybit
    }

    async fn fetch_current(&self, symbol: &str) -> Result<FundingRecord, FetchError> {
        let (status, body) = get_text(
            &self.client,
            TICKERS_URL,
            &[("category", "linear"), ("symbol", symbol)],
        )
        .await?;
        parse_ticker(status, &body, now_ms())
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
            &[("category", "linear"), ("symbol", symbol), ("limit", &limit)],
        )
        .await?;
        parse_history(status, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_699_990_000_000;

    #[test]
    fn parses_ticker() {
        let body = r#"{"retCode":0,"retMsg":"OK","result":{"category":"linear","list":[{"symbol":"BTCUSDT","fundingRate":"0.0001","nextFundingTime":"1700000000000","fundingIntervalHour":"8","markPrice":"43000.0"}]}}"#;
        let record = parse_ticker(StatusCode::OK, body, NOW).unwrap();
        assert_eq!(record.symbol, "BTCUSDT");
        assert_eq!(record.funding_rate_percent, "0.01");
        assert_eq!(record.next_funding_time_ms, 1700000000000);
        assert_eq!(record.interval_hours, 8);
        assert!(!record.stale);
    }

    #[test]
    fn missing_interval_defaults_to_8h() {
        let body = r#"{"retCode":0,"retMsg":"OK","result":{"list":[{"symbol":"BTCUSDT","fundingRate":"0.0001","nextFundingTime":"1700000000000"}]}}"#;
        let record = parse_ticker(StatusCode::OK, body, NOW).unwrap();
        assert_eq!(record.interval_hours, 8);
    }

    #[test]
    fn ret_code_error_maps_to_not_found() {
        let body = r#"{"retCode":10001,"retMsg":"params error: Symbol Is Invalid","result":{}}"#;
        assert_eq!(
            parse_ticker(StatusCode::OK, body, NOW),
            Err(FetchError::SymbolNotFound)
        );
    }

    #[test]
    fn empty_list_maps_to_not_found() {
        let body = r#"{"retCode":0,"retMsg":"OK","result":{"list":[]}}"#;
        assert_eq!(
            parse_ticker(StatusCode::OK, body, NOW),
            Err(FetchError::SymbolNotFound)
        );
    }

    #[test]
    fn past_next_funding_marks_record_stale() {
        let body = r#"{"retCode":0,"retMsg":"OK","result":{"list":[{"symbol":"BTCUSDT","fundingRate":"0.0001","nextFundingTime":"1699980000000"}]}}"#;
        let record = parse_ticker(StatusCode::OK, body, NOW).unwrap();
        assert!(record.stale);
    }

    #[test]
    fn history_promotes_second_scale_timestamps() {
        let body = r#"{"retCode":0,"retMsg":"OK","result":{"list":[{"symbol":"BTCUSDT","fundingRate":"0.000015","fundingRateTimestamp":"1699999000"}]}}"#;
        let entries = parse_history(StatusCode::OK, body).unwrap();
        assert_eq!(entries[0].funding_time_ms, 1699999000000);
        assert_eq!(entries[0].funding_rate_percent, "0.0015");
    }
}
