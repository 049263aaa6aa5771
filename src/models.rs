use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::errors::{FetchError, ValidationError};

/// The fixed set of venues we query. Ordered so combined views serialize
/// deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeId {
    Binance,
    Bybit,
    Okx,
}

impl ExchangeId {
    pub const ALL: [ExchangeId; 3] = [ExchangeId::Binance, ExchangeId::Bybit, ExchangeId::Okx];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeId::Binance => "binance",
            ExchangeId::Bybit => "bybit",
            ExchangeId::Okx => "okx",
        }
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized current funding data for one venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingRecord {
    /// Venue-native instrument name (e.g. `BTCUSDT`, `BTC-USDT-SWAP`).
    pub symbol: String,
    /// Funding rate as a percentage, decimal string (venue rate × 100).
    pub funding_rate_percent: String,
    pub next_funding_time_ms: i64,
    pub interval_hours: u32,
    /// Set when the venue reported a next funding time that was already in
    /// the past at fetch time.
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingHistoryEntry {
    pub funding_time_ms: i64,
    pub funding_rate_percent: String,
}

/// One venue's result inside a combined snapshot. Errors are kept per
/// exchange instead of failing the whole fetch.
pub type ExchangeOutcome = Result<FundingRecord, FetchError>;

/// Point-in-time result of querying all venues for one symbol. Immutable
/// once built; the store swaps whole `Arc<CombinedSnapshot>` values.
#[derive(Debug, Clone)]
pub struct CombinedSnapshot {
    pub symbol: String,
    /// Fetch initiation order. The store refuses to overwrite a snapshot
    /// with a lower sequence number.
    pub seq: u64,
    pub fetched_at_ms: i64,
    pub exchanges: BTreeMap<ExchangeId, ExchangeOutcome>,
}

impl CombinedSnapshot {
    /// Age of this snapshot relative to `now_ms`.
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.fetched_at_ms)
    }
}

/// Derived "time remaining until next funding" view, recomputed by the 1s
/// countdown ticker without touching the network.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Countdown {
    pub symbol: String,
    pub computed_at_ms: i64,
    /// `None` for venues that errored or whose record is stale.
    pub secs_to_next: BTreeMap<ExchangeId, Option<i64>>,
}

impl Countdown {
    pub fn derive(snapshot: &CombinedSnapshot, now_ms: i64) -> Self {
        let secs_to_next = snapshot
            .exchanges
            .iter()
            .map(|(id, outcome)| {
                let secs = match outcome {
                    Ok(record) if !record.stale => {
                        Some((record.next_funding_time_ms.saturating_sub(now_ms) / 1000).max(0))
                    }
                    _ => None,
                };
                (*id, secs)
            })
            .collect();

        Self {
            symbol: snapshot.symbol.clone(),
            computed_at_ms: now_ms,
            secs_to_next,
        }
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Normalizes caller input into the symbol shape adapters expect: trimmed,
/// uppercased, `[A-Z0-9-]` only, with bare tickers auto-suffixed by the
/// default quote (`ZIL` -> `ZILUSDT`).
pub fn normalize_symbol(input: &str, quote_suffix: &str) -> Result<String, ValidationError> {
    let symbol = input.trim().to_uppercase();

    if symbol.is_empty()
        || !symbol
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(ValidationError::InvalidSymbolChars(input.to_string()));
    }

    if !symbol.contains('-') && !symbol.ends_with(quote_suffix) {
        return Ok(format!("{symbol}{quote_suffix}"));
    }

    Ok(symbol)
}

/// Converts a venue-native funding rate ("0.0001") into a percentage string
/// ("0.01") by shifting the decimal point, so precision beyond what an f64
/// can represent survives unchanged.
pub fn rate_to_percent(raw: &str) -> Result<String, FetchError> {
    let trimmed = raw.trim();
    let (sign, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };

    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };

    let all_digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    if (int_part.is_empty() && frac_part.is_empty())
        || !all_digits(int_part)
        || !all_digits(frac_part)
    {
        return Err(FetchError::MalformedResponse(format!(
            "unparseable funding rate {raw:?}"
        )));
    }

    // x100 == move the decimal point two places right, textually.
    let point = int_part.len() + 2;
    let combined = format!("{int_part}{frac_part}");
    let padded = if combined.len() < point {
        format!("{combined:0<point$}")
    } else {
        combined
    };
    let (int_out, frac_out) = padded.split_at(point);

    let int_out = int_out.trim_start_matches('0');
    let int_out = if int_out.is_empty() { "0" } else { int_out };

    if frac_out.is_empty() {
        Ok(format!("{sign}{int_out}"))
    } else {
        Ok(format!("{sign}{int_out}.{frac_out}"))
    }
}
