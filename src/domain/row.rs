//! Daily data row and history point representation.

use chrono::NaiveDate;
use serde::Serialize;

/// One trading day for one entity, as handed to a script under `row`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StockRow {
    pub symbol: String,
    pub stock_name: String,
    #[serde(with = "date_format")]
    pub trade_date: NaiveDate,
    pub open_price: Option<f64>,
    pub high_price: Option<f64>,
    pub low_price: Option<f64>,
    pub close_price: f64,
    pub volume: i64,
    pub turnover: f64,
    pub price_change: Option<f64>,
    pub price_change_pct: Option<f64>,
    pub premium_rate: Option<f64>,
    pub market_code: String,
}

impl StockRow {
    /// Field names visible to scripts, in declaration order.
    pub const FIELDS: [&'static str; 13] = [
        "symbol",
        "stock_name",
        "trade_date",
        "open_price",
        "high_price",
        "low_price",
        "close_price",
        "volume",
        "turnover",
        "price_change",
        "price_change_pct",
        "premium_rate",
        "market_code",
    ];

    /// Market prefix of a `SH.600519` style symbol, if present.
    pub fn market_prefix(symbol: &str) -> Option<&str> {
        symbol.split_once('.').map(|(market, _)| market)
    }
}

/// One entry of a history series returned by `get_history`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPoint {
    #[serde(with = "date_format")]
    pub trade_date: NaiveDate,
    pub close_price: Option<f64>,
    pub volume: i64,
    pub price_change_pct: Option<f64>,
}

/// Pagination and filter parameters for listing rows.
#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery {
    pub market_code: Option<String>,
    pub active_only: bool,
    pub limit: usize,
    pub offset: usize,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            market_code: None,
            active_only: true,
            limit: 100,
            offset: 0,
        }
    }
}

/// A page of rows plus the total number of matching entities.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowPage {
    pub rows: Vec<StockRow>,
    pub total: usize,
}

/// Static entity metadata; only `is_active` entities form the default universe.
#[derive(Debug, Clone, PartialEq)]
pub struct StockInfo {
    pub symbol: String,
    pub stock_name: String,
    pub stock_code: String,
    pub market_code: String,
    pub is_active: bool,
}

impl StockInfo {
    /// Derives entity metadata from a daily row; the entity starts active.
    pub fn from_row(row: &StockRow) -> Self {
        let stock_code = row
            .symbol
            .split_once('.')
            .map_or(row.symbol.as_str(), |(_, code)| code);
        Self {
            symbol: row.symbol.clone(),
            stock_name: row.stock_name.clone(),
            stock_code: stock_code.to_string(),
            market_code: row.market_code.clone(),
            is_active: true,
        }
    }
}

pub(crate) mod date_format {
    use chrono::NaiveDate;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(date: &NaiveDate, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&date.format("%Y-%m-%d").to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row() -> StockRow {
        StockRow {
            symbol: "SH.600519".into(),
            stock_name: "Kweichow Moutai".into(),
            trade_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            open_price: Some(1700.0),
            high_price: Some(1720.0),
            low_price: Some(1690.0),
            close_price: 1710.5,
            volume: 25_000,
            turnover: 4.2e9,
            price_change: Some(10.5),
            price_change_pct: Some(0.62),
            premium_rate: None,
            market_code: "SH".into(),
        }
    }

    #[test]
    fn market_prefix_splits_symbol() {
        assert_eq!(StockRow::market_prefix("SZ.159998"), Some("SZ"));
        assert_eq!(StockRow::market_prefix("BHP"), None);
    }

    #[test]
    fn serializes_trade_date_as_iso_string() {
        let json = serde_json::to_value(sample_row()).unwrap();
        assert_eq!(json["trade_date"], "2024-01-15");
        assert!(json["premium_rate"].is_null());
        assert_eq!(json["volume"], 25_000);
    }

    #[test]
    fn info_from_row_strips_market_prefix() {
        let info = StockInfo::from_row(&sample_row());
        assert_eq!(info.stock_code, "600519");
        assert_eq!(info.market_code, "SH");
        assert!(info.is_active);
    }

    #[test]
    fn default_query_lists_active_first_page() {
        let q = ListQuery::default();
        assert!(q.active_only);
        assert_eq!(q.limit, 100);
        assert_eq!(q.offset, 0);
    }
}
