//! CSV daily-data adapter: bulk import source and in-memory data port.

use crate::domain::error::QuantscriptError;
use crate::domain::row::{HistoryPoint, ListQuery, RowPage, StockRow};
use crate::ports::data_port::DataPort;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// Column order of a daily-data file.
pub const HEADER: [&str; 13] = StockRow::FIELDS;

/// Rows grouped by symbol, each series sorted newest first.
pub struct CsvAdapter {
    series: BTreeMap<String, Vec<StockRow>>,
}

fn parse_error(line: u64, reason: impl std::fmt::Display) -> QuantscriptError {
    QuantscriptError::Database {
        reason: format!("CSV line {line}: {reason}"),
    }
}

fn required<'a>(record: &'a csv::StringRecord, idx: usize, line: u64) -> Result<&'a str, QuantscriptError> {
    match record.get(idx).map(str::trim) {
        Some(cell) if !cell.is_empty() => Ok(cell),
        _ => Err(parse_error(line, format!("missing {} column", HEADER[idx]))),
    }
}

fn number<T: std::str::FromStr>(
    record: &csv::StringRecord,
    idx: usize,
    line: u64,
) -> Result<T, QuantscriptError>
where
    T::Err: std::fmt::Display,
{
    required(record, idx, line)?
        .parse()
        .map_err(|e| parse_error(line, format!("invalid {} value: {e}", HEADER[idx])))
}

/// Empty cells are absent values.
fn optional(record: &csv::StringRecord, idx: usize, line: u64) -> Result<Option<f64>, QuantscriptError> {
    match record.get(idx).map(str::trim) {
        None | Some("") => Ok(None),
        Some(_) => number(record, idx, line).map(Some),
    }
}

fn parse_record(record: &csv::StringRecord) -> Result<StockRow, QuantscriptError> {
    let line = record.position().map_or(0, |p| p.line());
    let trade_date = NaiveDate::parse_from_str(required(record, 2, line)?, "%Y-%m-%d")
        .map_err(|e| parse_error(line, format!("invalid trade_date: {e}")))?;

    Ok(StockRow {
        symbol: required(record, 0, line)?.to_string(),
        stock_name: required(record, 1, line)?.to_string(),
        trade_date,
        open_price: optional(record, 3, line)?,
        high_price: optional(record, 4, line)?,
        low_price: optional(record, 5, line)?,
        close_price: number(record, 6, line)?,
        volume: number(record, 7, line)?,
        turnover: optional(record, 8, line)?.unwrap_or(0.0),
        price_change: optional(record, 9, line)?,
        price_change_pct: optional(record, 10, line)?,
        premium_rate: optional(record, 11, line)?,
        market_code: required(record, 12, line)?.to_string(),
    })
}

impl CsvAdapter {
    /// Parses every row of a daily-data file, in file order.
    pub fn read_rows<P: AsRef<Path>>(path: P) -> Result<Vec<StockRow>, QuantscriptError> {
        let path = path.as_ref();
        let mut rdr = csv::Reader::from_path(path).map_err(|e| QuantscriptError::Database {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;

        let mut rows = Vec::new();
        for result in rdr.records() {
            let record = result.map_err(|e| QuantscriptError::Database {
                reason: format!("CSV parse error: {e}"),
            })?;
            rows.push(parse_record(&record)?);
        }

        info!(path = %path.display(), rows = rows.len(), "read daily-data CSV");
        Ok(rows)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, QuantscriptError> {
        Ok(Self::from_rows(Self::read_rows(path)?))
    }

    /// Every symbol present in `rows` is active.
    pub fn from_rows(rows: Vec<StockRow>) -> Self {
        let mut series: BTreeMap<String, Vec<StockRow>> = BTreeMap::new();
        for row in rows {
            series.entry(row.symbol.clone()).or_default().push(row);
        }
        for rows in series.values_mut() {
            rows.sort_by(|a, b| b.trade_date.cmp(&a.trade_date));
            rows.dedup_by_key(|r| r.trade_date);
        }
        Self { series }
    }
}

impl DataPort for CsvAdapter {
    fn fetch_latest_row(&self, symbol: &str) -> Result<Option<StockRow>, QuantscriptError> {
        Ok(self
            .series
            .get(symbol)
            .and_then(|rows| rows.first())
            .cloned())
    }

    fn list_active_symbols(&self) -> Result<Vec<String>, QuantscriptError> {
        Ok(self.series.keys().cloned().collect())
    }

    fn fetch_history(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<HistoryPoint>, QuantscriptError> {
        let Some(rows) = self.series.get(symbol) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .iter()
            .take(limit)
            .map(|r| HistoryPoint {
                trade_date: r.trade_date,
                close_price: Some(r.close_price),
                volume: r.volume,
                price_change_pct: r.price_change_pct,
            })
            .collect())
    }

    fn list_rows(&self, query: &ListQuery) -> Result<RowPage, QuantscriptError> {
        let matching: Vec<&StockRow> = self
            .series
            .values()
            .filter_map(|rows| rows.first())
            .filter(|row| {
                query
                    .market_code
                    .as_deref()
                    .is_none_or(|m| row.market_code == m)
            })
            .collect();

        Ok(RowPage {
            total: matching.len(),
            rows: matching
                .into_iter()
                .skip(query.offset)
                .take(query.limit)
                .cloned()
                .collect(),
        })
    }
}
