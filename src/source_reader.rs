use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::instrument;

use crate::ingester::{SourceReader, SourceRow};

/// Test/demo `SourceReader` that reads two CSV files (buy, sell) with the
/// header `symbol,exchange,order_type,price,date,time,quantity,lots`. Not
/// part of the core contract — a worked example of `SourceReader` for local
/// runs without a live spreadsheet API.
pub struct CsvSourceReader {
    buy_path: PathBuf,
    sell_path: PathBuf,
}

impl CsvSourceReader {
    pub fn new(buy_path: impl Into<PathBuf>, sell_path: impl Into<PathBuf>) -> Self {
        Self {
            buy_path: buy_path.into(),
            sell_path: sell_path.into(),
        }
    }

    fn read_file(path: &std::path::Path) -> anyhow::Result<Vec<SourceRow>> {
        let contents = std::fs::read_to_string(path)?;
        let mut rows = Vec::new();
        for line in contents.lines().skip(1) {
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').collect();
            if fields.len() < 7 {
                continue;
            }
            rows.push(SourceRow {
                symbol: fields[0].to_string(),
                exchange: (!fields[1].is_empty()).then(|| fields[1].to_string()),
                order_type: fields[2].to_string(),
                price: (!fields[3].is_empty()).then(|| fields[3].to_string()),
                date: fields[4].to_string(),
                time: fields[5].to_string(),
                quantity: fields[6].to_string(),
                lots: fields.get(7).filter(|s| !s.is_empty()).map(|s| s.to_string()),
            });
        }
        Ok(rows)
    }
}

#[async_trait]
impl SourceReader for CsvSourceReader {
    #[instrument(skip(self))]
    async fn fetch_rows(&self) -> anyhow::Result<(Vec<SourceRow>, Vec<SourceRow>)> {
        let buy = Self::read_file(&self.buy_path)?;
        let sell = Self::read_file(&self.sell_path)?;
        Ok((buy, sell))
    }
}

/// In-process `SourceReader` double for tests: returns a fixed pair of rows
/// once per call, or an error if armed to fail.
pub struct MockSourceReader {
    rows: Mutex<Option<(Vec<SourceRow>, Vec<SourceRow>)>>,
}

impl MockSourceReader {
    pub fn new(buy: Vec<SourceRow>, sell: Vec<SourceRow>) -> Self {
        Self {
            rows: Mutex::new(Some((buy, sell))),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

#[async_trait]
impl SourceReader for MockSourceReader {
    async fn fetch_rows(&self) -> anyhow::Result<(Vec<SourceRow>, Vec<SourceRow>)> {
        Ok(self.rows.lock().unwrap().clone().unwrap_or_default())
    }
}
