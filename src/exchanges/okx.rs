use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use super::{
    build_record, get_text, http_client, promote_to_ms, Exchange, DEFAULT_INTERVAL_HOURS,
};
use crate::errors::FetchError;
use crate::models::{now_ms, rate_to_percent, ExchangeId, FundingHistoryEntry, FundingRecord};

const FUNDING_URL: &str = "https://www.okx.com/api/v5/public/funding-rate";
const FUNDING_HISTORY_URL: &str = "https://www.okx.com/api/v5/public/funding-rate-history";

/// OKX "Instrument ID doesn't exist" code.
const INSTRUMENT_NOT_FOUND_CODE: &str = "51001";

const HOUR_MS: i64 = 3_600_000;

#[derive(Debug, Deserialize)]
struct OkxEnvelope<T> {
    code: String,

    #[serde(default)]
    msg: String,

    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct OkxFunding {
    #[serde(rename = "instId")]
    inst_id: String,

    #[serde(rename = "fundingRate", default)]
    funding_rate: String,

    #[serde(rename = "settFundingRate", default)]
    sett_funding_rate: String,

    #[serde(rename = "fundingTime", default)]
    funding_time: String,

    #[serde(rename = "nextFundingTime", default)]
    next_funding_time: String,
}

#[derive(Debug, Deserialize)]
struct OkxHistoryRow {
    #[serde(rename = "fundingTime", default)]
    funding_time: String,

    #[serde(rename = "fundingRate", default)]
    funding_rate: String,
}

pub struct Okx {
    client: reqwest::Client,
}

impl Okx {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
        }
    }
}

/// Converts a normalized symbol into an OKX swap instrument id:
/// `BTCUSDT` -> `BTC-USDT-SWAP`, `BTC-USDT` -> `BTC-USDT-SWAP`.
pub(crate) fn inst_id(symbol: &str) -> String {
    if let Some((base, quote)) = symbol.split_once('-') {
        return format!("{base}-{quote}-SWAP");
    }
    if symbol.len() >= 6 && symbol.ends_with("USDT") {
        let base = &symbol[..symbol.len() - 4];
        return format!("{base}-USDT-SWAP");
    }
    format!("{symbol}-SWAP")
}

/// OKX timestamps come as decimal strings, occasionally second-scale.
fn parse_ts_ms(raw: &str) -> i64 {
    raw.trim().parse::<i64>().map(promote_to_ms).unwrap_or(0)
}

fn unwrap_envelope<T>(status: StatusCode, body: &str) -> Result<Vec<T>, FetchError>
where
    T: for<'de> Deserialize<'de>,
{
    if !status.is_success() {
        return Err(FetchError::Unreachable(format!("okx http {status}")));
    }

    let envelope: OkxEnvelope<T> =
        serde_json::from_str(body).map_err(|e| FetchError::MalformedResponse(e.to_string()))?;

    if envelope.code == INSTRUMENT_NOT_FOUND_CODE {
        return Err(FetchError::SymbolNotFound);
    }
    if envelope.code != "0" {
        return Err(FetchError::MalformedResponse(format!(
            "okx code {}: {}",
            envelope.code, envelope.msg
        )));
    }

    Ok(envelope.data)
}

/// Derives the funding interval from the gap between the current and next
/// settlement, clamped to a sane 1..=24h range.
fn interval_hours(item: &OkxFunding) -> u32 {
    let next_ts = parse_ts_ms(&item.next_funding_time);
    let curr_ts = parse_ts_ms(&item.funding_time);
    if curr_ts > 0 && next_ts > curr_ts {
        let hours = (next_ts - curr_ts + HOUR_MS / 2) / HOUR_MS;
        if (1..=24).contains(&hours) {
            return hours as u32;
        }
    }
    DEFAULT_INTERVAL_HOURS
}

fn parse_funding(status: StatusCode, body: &str, now_ms: i64) -> Result<FundingRecord, FetchError> {
    let data = unwrap_envelope::<OkxFunding>(status, body)?;
    let item = data.into_iter().next().ok_or(FetchError::SymbolNotFound)?;

    let raw_rate = if item.funding_rate.is_empty() {
        &item.sett_funding_rate
    } else {
        &item.funding_rate
    };
    let rate_percent = rate_to_percent(raw_rate)?;

    let hours = interval_hours(&item);

    // OKX's nextFundingTime reports the settlement one interval out; pull it
    // back by one interval so the countdown matches the other venues.
    let mut next_ts_ms = parse_ts_ms(&item.next_funding_time);
    let interval_ms = i64::from(hours) * HOUR_MS;
    if next_ts_ms > interval_ms {
        next_ts_ms -= interval_ms;
    }

    Ok(build_record(
        item.inst_id,
        rate_percent,
        next_ts_ms,
        hours,
        now_ms,
    ))
}

fn parse_history(status: StatusCode, body: &str) -> Result<Vec<FundingHistoryEntry>, FetchError> {
    let rows = unwrap_envelope::<OkxHistoryRow>(status, body)?;

    rows.into_iter()
        .map(|row| {
            Ok(FundingHistoryEntry {
                funding_time_ms: parse_ts_ms(&row.funding_time),
                funding_rate_percent: rate_to_percent(&row.funding_rate)?,
            })
        })
        .collect()
}

#[async_trait]
impl Exchange for Okx {
    fn id(&self) -> ExchangeId {
        ExchangeId::Okx
    }

    async fn fetch_current(&self, symbol: &str) -> Result<FundingRecord, FetchError> {
        let inst = inst_id(symbol);
        let (status, body) = get_text(&self.client, FUNDING_URL, &[("instId", &inst)]).await?;
        parse_funding(status, &body, now_ms())
    }

    async fn fetch_history(
        &self,
        symbol: &str,
        limit: u32,
    ) -> Result<Vec<FundingHistoryEntry>, FetchError> {
        let inst = inst_id(symbol);
        let limit = limit.to_string();
        let (status, body) = get_text(
            &self.client,
            FUNDING_HISTORY_URL,
            &[("instId", &inst), ("limit", &limit)],
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
    fn maps_symbols_to_swap_instruments() {
        assert_eq!(inst_id("BTCUSDT"), "BTC-USDT-SWAP");
        assert_eq!(inst_id("BTC-USDT"), "BTC-USDT-SWAP");
        assert_eq!(inst_id("ETH-USDC"), "ETH-USDC-SWAP");
        assert_eq!(inst_id("BTC"), "BTC-SWAP");
    }

    #[test]
    fn parses_funding_and_subtracts_one_interval() {
        // fundingTime/nextFundingTime 8h apart; nextFundingTime is one
        // interval past the real settlement, so the record lands on
        // nextFundingTime - 8h == fundingTime.
        let body = r#"{"code":"0","msg":"","data":[{"instId":"BTC-USDT-SWAP","fundingRate":"0.0001","fundingTime":"1700000000000","nextFundingTime":"1700028800000"}]}"#;
        let record = parse_funding(StatusCode::OK, body, NOW).unwrap();
        assert_eq!(record.symbol, "BTC-USDT-SWAP");
        assert_eq!(record.funding_rate_percent, "0.01");
        assert_eq!(record.interval_hours, 8);
        assert_eq!(record.next_funding_time_ms, 1700000000000);
    }

    #[test]
    fn falls_back_to_settlement_rate() {
        let body = r#"{"code":"0","msg":"","data":[{"instId":"BTC-USDT-SWAP","fundingRate":"","settFundingRate":"0.0002","fundingTime":"1700000000000","nextFundingTime":"1700028800000"}]}"#;
        let record = parse_funding(StatusCode::OK, body, NOW).unwrap();
        assert_eq!(record.funding_rate_percent, "0.02");
    }

    #[test]
    fn unknown_instrument_maps_to_not_found() {
        let body = r#"{"code":"51001","msg":"Instrument ID doesn't exist.","data":[]}"#;
        assert_eq!(
            parse_funding(StatusCode::OK, body, NOW),
            Err(FetchError::SymbolNotFound)
        );
    }

    #[test]
    fn malformed_rate_is_rejected() {
        let body = r#"{"code":"0","msg":"","data":[{"instId":"BTC-USDT-SWAP","fundingRate":"n/a","fundingTime":"1700000000000","nextFundingTime":"1700028800000"}]}"#;
        assert!(matches!(
            parse_funding(StatusCode::OK, body, NOW),
            Err(FetchError::MalformedResponse(_))
        ));
    }

    #[test]
    fn history_promotes_second_scale_timestamps() {
        let body = r#"{"code":"0","msg":"","data":[{"instId":"BTC-USDT-SWAP","fundingRate":"0.0001","fundingTime":"1699999000"},{"instId":"BTC-USDT-SWAP","fundingRate":"-0.00002","fundingTime":"1699970200000"}]}"#;
        let entries = parse_history(StatusCode::OK, body).unwrap();
        assert_eq!(entries[0].funding_time_ms, 1699999000000);
        assert_eq!(entries[1].funding_rate_percent, "-0.002");
    }
}
