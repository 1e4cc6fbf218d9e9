//! Row data access port.
//!
//! The persistence layer resolves entity symbols to their latest daily row,
//! enumerates the active universe and serves bounded history series.

use crate::domain::error::QuantscriptError;
use crate::domain::row::{HistoryPoint, ListQuery, RowPage, StockRow};

pub trait DataPort: Send + Sync {
    /// Most recent daily row for `symbol`, or `None` if the store has none.
    fn fetch_latest_row(&self, symbol: &str) -> Result<Option<StockRow>, QuantscriptError>;

    /// Symbols of every active entity, in a stable order.
    fn list_active_symbols(&self) -> Result<Vec<String>, QuantscriptError>;

    /// Up to `limit` history points for `symbol`, most recent first.
    fn fetch_history(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<HistoryPoint>, QuantscriptError>;

    /// One page of latest rows per entity, plus the total number of matches.
    fn list_rows(&self, query: &ListQuery) -> Result<RowPage, QuantscriptError>;
}
