use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::{ArrayRef, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;

use super::HistoryStore;
use crate::errors::PersistError;
use crate::models::{ExchangeId, FundingHistoryEntry};

const TIME_COLUMN: &str = "fundingTimeMs";
const RATE_COLUMN: &str = "fundingRatePercent";

/// One parquet file per (exchange, symbol). Appends read the existing rows,
/// merge-dedupe by funding time and rewrite through a temp file + rename so
/// a crash mid-write never corrupts the dataset.
pub struct ParquetHistoryStore {
    dir: PathBuf,
}

impl ParquetHistoryStore {
    pub fn open(dir: &str) -> Result<Self, PersistError> {
        fs::create_dir_all(dir).map_err(|e| PersistError::Unavailable(e.to_string()))?;
        Ok(Self {
            dir: PathBuf::from(dir),
        })
    }

    fn dataset_path(&self, exchange: ExchangeId, symbol: &str) -> PathBuf {
        self.dir
            .join(format!("funding_history_{}_{symbol}.parquet", exchange.as_str()))
    }

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new(TIME_COLUMN, DataType::Int64, false),
            Field::new(RATE_COLUMN, DataType::Utf8, false),
        ]))
    }

    fn read_rows(path: &Path) -> Result<BTreeMap<i64, String>, PersistError> {
        let file = File::open(path).map_err(|e| PersistError::Unavailable(e.to_string()))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| PersistError::CorruptData(e.to_string()))?
            .build()
            .map_err(|e| PersistError::CorruptData(e.to_string()))?;

        let mut rows = BTreeMap::new();
        for batch in reader {
            let batch = batch.map_err(|e| PersistError::CorruptData(e.to_string()))?;
            let times = batch
                .column_by_name(TIME_COLUMN)
                .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
                .ok_or_else(|| {
                    PersistError::CorruptData(format!("missing {TIME_COLUMN} column"))
                })?;
            let rates = batch
                .column_by_name(RATE_COLUMN)
                .and_then(|c| c.as_any().downcast_ref::<StringArray>())
                .ok_or_else(|| {
                    PersistError::CorruptData(format!("missing {RATE_COLUMN} column"))
                })?;

            for i in 0..batch.num_rows() {
                rows.insert(times.value(i), rates.value(i).to_string());
            }
        }
        Ok(rows)
    }

    fn write_rows(path: &Path, rows: &BTreeMap<i64, String>) -> Result<(), PersistError> {
        let times = Int64Array::from_iter_values(rows.keys().copied());
        let rates = StringArray::from_iter_values(rows.values().map(String::as_str));

        let batch = RecordBatch::try_new(
            Self::schema(),
            vec![Arc::new(times) as ArrayRef, Arc::new(rates) as ArrayRef],
        )
        .map_err(|e| PersistError::WriteFailed(e.to_string()))?;

        let tmp = path.with_extension("parquet.tmp");
        let file = File::create(&tmp).map_err(|e| PersistError::WriteFailed(e.to_string()))?;
        let mut writer = ArrowWriter::try_new(file, Self::schema(), None)
            .map_err(|e| PersistError::WriteFailed(e.to_string()))?;
        writer
            .write(&batch)
            .map_err(|e| PersistError::WriteFailed(e.to_string()))?;
        writer
            .close()
            .map_err(|e| PersistError::WriteFailed(e.to_string()))?;

        fs::rename(&tmp, path).map_err(|e| PersistError::WriteFailed(e.to_string()))
    }

    fn merge_and_write(
        path: &Path,
        entries: Vec<FundingHistoryEntry>,
    ) -> Result<(), PersistError> {
        let mut rows = if path.exists() {
            match Self::read_rows(path) {
                Ok(rows) => rows,
                Err(err) => {
                    // unreadable dataset gets rebuilt from the fresh entries
                    tracing::warn!(?path, %err, "replacing unreadable history dataset");
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };

        for entry in entries {
            rows.insert(entry.funding_time_ms, entry.funding_rate_percent);
        }

        Self::write_rows(path, &rows)
    }
}

#[async_trait]
impl HistoryStore for ParquetHistoryStore {
    async fn append(
        &self,
        exchange: ExchangeId,
        symbol: &str,
        entries: &[FundingHistoryEntry],
    ) -> Result<(), PersistError> {
        if entries.is_empty() {
            return Ok(());
        }
        let path = self.dataset_path(exchange, symbol);
        let entries = entries.to_vec();

        tokio::task::spawn_blocking(move || Self::merge_and_write(&path, entries))
            .await
            .map_err(|e| PersistError::WriteFailed(e.to_string()))?
    }

    async fn load(
        &self,
        exchange: ExchangeId,
        symbol: &str,
    ) -> Result<Vec<FundingHistoryEntry>, PersistError> {
        let path = self.dataset_path(exchange, symbol);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let rows = tokio::task::spawn_blocking(move || Self::read_rows(&path))
            .await
            .map_err(|e| PersistError::CorruptData(e.to_string()))??;

        Ok(rows
            .into_iter()
            .map(|(ts, rate)| FundingHistoryEntry {
                funding_time_ms: ts,
                funding_rate_percent: rate,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::now_ms;

    fn temp_store(tag: &str) -> (ParquetHistoryStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "fundwatch-parquet-{tag}-{}-{}",
            std::process::id(),
            now_ms()
        ));
        let store = ParquetHistoryStore::open(dir.to_str().expect("utf8 temp path"))
            .expect("create data dir");
        (store, dir)
    }

    fn entry(ts: i64, rate: &str) -> FundingHistoryEntry {
        FundingHistoryEntry {
            funding_time_ms: ts,
            funding_rate_percent: rate.to_string(),
        }
    }

    #[tokio::test]
    async fn round_trips_entries() {
        let (store, dir) = temp_store("roundtrip");

        let entries = vec![
            entry(1_699_999_000_000, "0.01"),
            entry(1_699_970_200_000, "-0.0025"),
        ];
        store
            .append(ExchangeId::Binance, "BTCUSDT", &entries)
            .await
            .expect("append");

        let loaded = store
            .load(ExchangeId::Binance, "BTCUSDT")
            .await
            .expect("load");
        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains(&entries[0]));
        assert!(loaded.contains(&entries[1]));

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn append_dedupes_by_funding_time() {
        let (store, dir) = temp_store("dedupe");

        store
            .append(
                ExchangeId::Okx,
                "BTCUSDT",
                &[entry(1_699_999_000_000, "0.01")],
            )
            .await
            .expect("first append");
        store
            .append(
                ExchangeId::Okx,
                "BTCUSDT",
                &[entry(1_699_999_000_000, "0.02")],
            )
            .await
            .expect("second append");

        let loaded = store.load(ExchangeId::Okx, "BTCUSDT").await.expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].funding_rate_percent, "0.02");

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn datasets_are_keyed_by_exchange_and_symbol() {
        let (store, dir) = temp_store("keying");

        store
            .append(
                ExchangeId::Binance,
                "BTCUSDT",
                &[entry(1_699_999_000_000, "0.01")],
            )
            .await
            .expect("append");

        let other = store
            .load(ExchangeId::Bybit, "BTCUSDT")
            .await
            .expect("load");
        assert!(other.is_empty());

        let other_symbol = store
            .load(ExchangeId::Binance, "ETHUSDT")
            .await
            .expect("load");
        assert!(other_symbol.is_empty());

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn missing_dataset_loads_empty() {
        let (store, dir) = temp_store("missing");

        let loaded = store
            .load(ExchangeId::Okx, "NOPEUSDT")
            .await
            .expect("load");
        assert!(loaded.is_empty());

        let _ = fs::remove_dir_all(dir);
    }
}
