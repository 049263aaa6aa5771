use std::env;
use std::time::Duration;

use crate::models::normalize_symbol;

#[derive(Debug, Clone)]
pub struct Config {
    pub api_port: u16,
    /// Period of the background refresh loop.
    pub refresh_interval: Duration,
    /// Independent timeout applied to each adapter call.
    pub fetch_timeout: Duration,
    /// Normalized symbol the refresh loop starts with.
    pub default_symbol: String,
    /// Quote suffix appended to bare tickers (ZIL -> ZILUSDT).
    pub quote_suffix: String,
    /// Rows requested per venue for funding history.
    pub history_limit: u32,
    /// Directory for the columnar history cache.
    pub data_dir: String,
    /// Master switch for on-disk history persistence.
    pub persistence_enabled: bool,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let api_port = env::var("FUNDING_API_PORT")
            .unwrap_or_else(|_| "8765".to_string())
            .parse::<u16>()
            .expect("FUNDING_API_PORT must be a valid port number (1-65535)");

        let refresh_secs = env::var("REFRESH_INTERVAL_SECS")
            .unwrap_or_else(|_| "15".to_string())
            .parse::<u64>()
            .expect("REFRESH_INTERVAL_SECS must be a positive integer");

        let timeout_secs = env::var("FETCH_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse::<u64>()
            .expect("FETCH_TIMEOUT_SECS must be a positive integer");

        let quote_suffix = env::var("QUOTE_SUFFIX")
            .unwrap_or_else(|_| "USDT".to_string())
            .trim()
            .to_uppercase();

        let default_symbol = normalize_symbol(
            &env::var("DEFAULT_SYMBOL").unwrap_or_else(|_| "BTCUSDT".to_string()),
            &quote_suffix,
        )
        .expect("DEFAULT_SYMBOL must contain only uppercase Latin letters, digits, hyphen");

        let history_limit = env::var("HISTORY_LIMIT")
            .unwrap_or_else(|_| "50".to_string())
            .parse::<u32>()
            .expect("HISTORY_LIMIT must be a positive integer");

        let data_dir = env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string());

        let persistence_enabled = env::var("HISTORY_PERSISTENCE")
            .map(|v| !matches!(v.trim(), "0" | "false" | "off"))
            .unwrap_or(true);

        Self {
            api_port,
            refresh_interval: Duration::from_secs(refresh_secs.max(1)),
            fetch_timeout: Duration::from_secs(timeout_secs.max(1)),
            default_symbol,
            quote_suffix,
            history_limit,
            data_dir,
            persistence_enabled,
        }
    }
}
