//! SQLite persistence adapter: daily rows, entity metadata and saved scripts.

use crate::domain::error::QuantscriptError;
use crate::domain::row::{HistoryPoint, ListQuery, RowPage, StockInfo, StockRow};
use crate::domain::script::{NewScript, ScriptLookup, ScriptUpdate, StoredScript, now_china};
use crate::ports::config_port::ConfigPort;
use crate::ports::data_port::DataPort;
use crate::ports::script_port::ScriptPort;
use chrono::{DateTime, FixedOffset, NaiveDate};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{OptionalExtension, params, params_from_iter};
use tracing::{debug, error, info};

const ROW_COLUMNS: &str = "symbol, stock_name, trade_date, open_price, high_price, low_price, \
     close_price, volume, turnover, price_change, price_change_pct, premium_rate, market_code";

const SCRIPT_COLUMNS: &str = "id, name, description, code, created_at, updated_at";

pub struct SqliteAdapter {
    pool: Pool<SqliteConnectionManager>,
}

fn pool_error(e: r2d2::Error) -> QuantscriptError {
    error!(error = %e, "sqlite pool unavailable");
    QuantscriptError::Database {
        reason: e.to_string(),
    }
}

fn query_error(e: rusqlite::Error) -> QuantscriptError {
    error!(error = %e, "sqlite query failed");
    QuantscriptError::DatabaseQuery {
        reason: e.to_string(),
    }
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn parse_date(idx: usize, text: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|e| conversion_error(idx, e))
}

fn parse_timestamp(idx: usize, text: &str) -> rusqlite::Result<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(text).map_err(|e| conversion_error(idx, e))
}

fn read_stock_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StockRow> {
    let trade_date: String = row.get(2)?;
    Ok(StockRow {
        symbol: row.get(0)?,
        stock_name: row.get(1)?,
        trade_date: parse_date(2, &trade_date)?,
        open_price: row.get(3)?,
        high_price: row.get(4)?,
        low_price: row.get(5)?,
        close_price: row.get(6)?,
        volume: row.get(7)?,
        turnover: row.get(8)?,
        price_change: row.get(9)?,
        price_change_pct: row.get(10)?,
        premium_rate: row.get(11)?,
        market_code: row.get(12)?,
    })
}

fn read_script(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredScript> {
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    Ok(StoredScript {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        code: row.get(3)?,
        created_at: parse_timestamp(4, &created_at)?,
        updated_at: parse_timestamp(5, &updated_at)?,
    })
}

impl SqliteAdapter {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, QuantscriptError> {
        let db_path =
            config
                .get_string("sqlite", "path")
                .ok_or_else(|| QuantscriptError::ConfigMissing {
                    section: "sqlite".into(),
                    key: "path".into(),
                })?;

        let pool_size = config.get_int("sqlite", "pool_size", 4).max(1) as u32;

        let manager = SqliteConnectionManager::file(&db_path);
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(pool_error)?;

        info!(path = %db_path, pool_size, "opened sqlite store");
        Ok(Self { pool })
    }

    /// A private in-memory database on a single pooled connection.
    pub fn in_memory() -> Result<Self, QuantscriptError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(pool_error)?;

        Ok(Self { pool })
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, QuantscriptError> {
        self.pool.get().map_err(pool_error)
    }

    pub fn initialize_schema(&self) -> Result<(), QuantscriptError> {
        let conn = self.conn()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS stock_daily_data (
                symbol TEXT NOT NULL,
                trade_date TEXT NOT NULL,
                stock_name TEXT NOT NULL,
                open_price REAL,
                high_price REAL,
                low_price REAL,
                close_price REAL NOT NULL,
                volume INTEGER NOT NULL DEFAULT 0,
                turnover REAL NOT NULL DEFAULT 0,
                price_change REAL,
                price_change_pct REAL,
                premium_rate REAL,
                market_code TEXT NOT NULL,
                PRIMARY KEY (symbol, trade_date)
            );
            CREATE INDEX IF NOT EXISTS idx_symbol_date ON stock_daily_data(symbol, trade_date);
            CREATE INDEX IF NOT EXISTS idx_market_code ON stock_daily_data(market_code);

            CREATE TABLE IF NOT EXISTS stock_info (
                symbol TEXT PRIMARY KEY,
                stock_name TEXT NOT NULL,
                stock_code TEXT NOT NULL,
                market_code TEXT NOT NULL,
                is_active TEXT NOT NULL DEFAULT 'Y'
            );
            CREATE INDEX IF NOT EXISTS idx_is_active ON stock_info(is_active);

            CREATE TABLE IF NOT EXISTS custom_scripts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT,
                code TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_custom_scripts_name ON custom_scripts(name);
            CREATE INDEX IF NOT EXISTS idx_custom_scripts_created_at ON custom_scripts(created_at);",
        )
        .map_err(query_error)?;

        info!("sqlite schema ready");
        Ok(())
    }

    /// Inserts or replaces daily rows keyed by (symbol, trade_date).
    pub fn insert_rows(&self, rows: &[StockRow]) -> Result<(), QuantscriptError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(query_error)?;

        for row in rows {
            tx.execute(
                "INSERT OR REPLACE INTO stock_daily_data (symbol, stock_name, trade_date, \
                 open_price, high_price, low_price, close_price, volume, turnover, \
                 price_change, price_change_pct, premium_rate, market_code)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    row.symbol,
                    row.stock_name,
                    row.trade_date.format("%Y-%m-%d").to_string(),
                    row.open_price,
                    row.high_price,
                    row.low_price,
                    row.close_price,
                    row.volume,
                    row.turnover,
                    row.price_change,
                    row.price_change_pct,
                    row.premium_rate,
                    row.market_code
                ],
            )
            .map_err(query_error)?;
        }

        tx.commit().map_err(query_error)?;
        debug!(rows = rows.len(), "inserted daily rows");
        Ok(())
    }

    pub fn upsert_stock_info(&self, infos: &[StockInfo]) -> Result<(), QuantscriptError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(query_error)?;

        for info in infos {
            tx.execute(
                "INSERT INTO stock_info (symbol, stock_name, stock_code, market_code, is_active)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(symbol) DO UPDATE SET
                    stock_name = excluded.stock_name,
                    stock_code = excluded.stock_code,
                    market_code = excluded.market_code,
                    is_active = excluded.is_active",
                params![
                    info.symbol,
                    info.stock_name,
                    info.stock_code,
                    info.market_code,
                    if info.is_active { "Y" } else { "N" }
                ],
            )
            .map_err(query_error)?;
        }

        tx.commit().map_err(query_error)?;
        debug!(entities = infos.len(), "upserted stock info");
        Ok(())
    }
}

impl DataPort for SqliteAdapter {
    fn fetch_latest_row(&self, symbol: &str) -> Result<Option<StockRow>, QuantscriptError> {
        let conn = self.conn()?;
        let query = format!(
            "SELECT {ROW_COLUMNS} FROM stock_daily_data
             WHERE symbol = ?1 ORDER BY trade_date DESC LIMIT 1"
        );
        conn.query_row(&query, params![symbol], read_stock_row)
            .optional()
            .map_err(query_error)
    }

    fn list_active_symbols(&self) -> Result<Vec<String>, QuantscriptError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT symbol FROM stock_info WHERE is_active = 'Y' ORDER BY symbol")
            .map_err(query_error)?;

        let rows = stmt
            .query_map([], |row| row.get(0))
            .map_err(query_error)?;

        rows.collect::<Result<Vec<String>, _>>().map_err(query_error)
    }

    fn fetch_history(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<HistoryPoint>, QuantscriptError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT trade_date, close_price, volume, price_change_pct
                 FROM stock_daily_data
                 WHERE symbol = ?1
                 ORDER BY trade_date DESC
                 LIMIT ?2",
            )
            .map_err(query_error)?;

        let rows = stmt
            .query_map(params![symbol, limit as i64], |row| {
                let trade_date: String = row.get(0)?;
                Ok(HistoryPoint {
                    trade_date: parse_date(0, &trade_date)?,
                    close_price: row.get(1)?,
                    volume: row.get(2)?,
                    price_change_pct: row.get(3)?,
                })
            })
            .map_err(query_error)?;

        rows.collect::<Result<Vec<_>, _>>().map_err(query_error)
    }

    fn list_rows(&self, query: &ListQuery) -> Result<RowPage, QuantscriptError> {
        let conn = self.conn()?;
        let filter = "FROM stock_info i
             JOIN stock_daily_data d ON d.symbol = i.symbol
             WHERE d.trade_date = (SELECT MAX(trade_date) FROM stock_daily_data
                                   WHERE symbol = i.symbol)
               AND (?1 IS NULL OR i.market_code = ?1)
               AND (?2 = 0 OR i.is_active = 'Y')";

        let total: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) {filter}"),
                params![query.market_code, query.active_only],
                |row| row.get(0),
            )
            .map_err(query_error)?;

        let columns = ROW_COLUMNS
            .split(", ")
            .map(|c| format!("d.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {columns} {filter} ORDER BY i.symbol LIMIT ?3 OFFSET ?4"
            ))
            .map_err(query_error)?;

        let rows = stmt
            .query_map(
                params![
                    query.market_code,
                    query.active_only,
                    query.limit as i64,
                    query.offset as i64
                ],
                read_stock_row,
            )
            .map_err(query_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_error)?;

        Ok(RowPage {
            rows,
            total: total as usize,
        })
    }
}

impl ScriptPort for SqliteAdapter {
    fn get_script(&self, id: i64) -> Result<Option<StoredScript>, QuantscriptError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {SCRIPT_COLUMNS} FROM custom_scripts WHERE id = ?1"),
            params![id],
            read_script,
        )
        .optional()
        .map_err(query_error)
    }

    fn get_scripts(&self, ids: &[i64]) -> Result<ScriptLookup, QuantscriptError> {
        if ids.is_empty() {
            return Ok(ScriptLookup::default());
        }
        let conn = self.conn()?;
        let placeholders = vec!["?"; ids.len()].join(", ");
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SCRIPT_COLUMNS} FROM custom_scripts WHERE id IN ({placeholders})"
            ))
            .map_err(query_error)?;

        let mut loaded = stmt
            .query_map(params_from_iter(ids.iter()), read_script)
            .map_err(query_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_error)?;

        let mut lookup = ScriptLookup::default();
        for id in ids {
            match loaded.iter().position(|s| s.id == *id) {
                Some(idx) => lookup.found.push(loaded.swap_remove(idx)),
                None if lookup.found.iter().any(|s| s.id == *id) => {}
                None => lookup.missing.push(*id),
            }
        }
        Ok(lookup)
    }

    fn create_script(&self, script: &NewScript) -> Result<StoredScript, QuantscriptError> {
        let conn = self.conn()?;
        let now = now_china();
        conn.execute(
            "INSERT INTO custom_scripts (name, description, code, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![script.name, script.description, script.code, now.to_rfc3339()],
        )
        .map_err(query_error)?;

        let id = conn.last_insert_rowid();
        info!(script_id = id, name = %script.name, "script saved");
        Ok(StoredScript {
            id,
            name: script.name.clone(),
            description: script.description.clone(),
            code: script.code.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    fn list_scripts(&self) -> Result<Vec<StoredScript>, QuantscriptError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SCRIPT_COLUMNS} FROM custom_scripts ORDER BY created_at DESC, id DESC"
            ))
            .map_err(query_error)?;

        let rows = stmt.query_map([], read_script).map_err(query_error)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(query_error)
    }

    fn update_script(
        &self,
        id: i64,
        update: &ScriptUpdate,
    ) -> Result<Option<StoredScript>, QuantscriptError> {
        let Some(mut script) = self.get_script(id)? else {
            return Ok(None);
        };

        if let Some(name) = &update.name {
            script.name = name.clone();
        }
        if let Some(code) = &update.code {
            script.code = code.clone();
        }
        if let Some(description) = &update.description {
            script.description = (!description.is_empty()).then(|| description.clone());
        }
        script.updated_at = now_china();

        let conn = self.conn()?;
        conn.execute(
            "UPDATE custom_scripts
             SET name = ?1, description = ?2, code = ?3, updated_at = ?4
             WHERE id = ?5",
            params![
                script.name,
                script.description,
                script.code,
                script.updated_at.to_rfc3339(),
                id
            ],
        )
        .map_err(query_error)?;

        info!(script_id = id, "script updated");
        Ok(Some(script))
    }

    fn delete_script(&self, id: i64) -> Result<bool, QuantscriptError> {
        let conn = self.conn()?;
        let deleted = conn
            .execute("DELETE FROM custom_scripts WHERE id = ?1", params![id])
            .map_err(query_error)?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::file_config_adapter::FileConfigAdapter;
    use crate::domain::evaluator::tests::sample_row;

    fn adapter() -> SqliteAdapter {
        let adapter = SqliteAdapter::in_memory().unwrap();
        adapter.initialize_schema().unwrap();
        adapter
    }

    fn row_on(symbol: &str, close: f64, day: u32) -> StockRow {
        let mut row = sample_row(symbol, close);
        row.trade_date = NaiveDate::from_ymd_opt(2024, 6, day).unwrap();
        row.market_code = StockRow::market_prefix(symbol).unwrap_or("SH").to_string();
        row
    }

    fn seeded() -> SqliteAdapter {
        let adapter = adapter();
        let rows = vec![
            row_on("SH.600519", 1700.0, 26),
            row_on("SH.600519", 1710.0, 27),
            row_on("SH.600519", 1720.0, 28),
            row_on("SZ.000001", 10.0, 28),
            row_on("SZ.159998", 1.2, 27),
        ];
        adapter.insert_rows(&rows).unwrap();
        let mut infos: Vec<StockInfo> = rows.iter().map(StockInfo::from_row).collect();
        infos.dedup_by(|a, b| a.symbol == b.symbol);
        infos[2].is_active = false;
        adapter.upsert_stock_info(&infos).unwrap();
        adapter
    }

    mod config {
        use super::*;

        #[test]
        fn from_config_missing_path() {
            let result = SqliteAdapter::from_config(&FileConfigAdapter::empty());
            match result {
                Err(QuantscriptError::ConfigMissing { section, key }) => {
                    assert_eq!(section, "sqlite");
                    assert_eq!(key, "path");
                }
                Err(other) => panic!("expected ConfigMissing, got: {other}"),
                Ok(_) => panic!("expected error, got Ok"),
            }
        }

        #[test]
        fn from_config_opens_file() {
            let dir = tempfile::TempDir::new().unwrap();
            let path = dir.path().join("quantscript.db");
            let ini = format!("[sqlite]\npath = {}\npool_size = 2\n", path.display());
            let adapter =
                SqliteAdapter::from_config(&FileConfigAdapter::from_string(&ini).unwrap())
                    .unwrap();
            adapter.initialize_schema().unwrap();
            adapter.initialize_schema().unwrap();
            assert!(path.exists());
        }
    }

    mod data {
        use super::*;

        #[test]
        fn latest_row_is_most_recent_date() {
            let adapter = seeded();
            let row = adapter.fetch_latest_row("SH.600519").unwrap().unwrap();
            assert_eq!(row.close_price, 1720.0);
            assert_eq!(row.trade_date, NaiveDate::from_ymd_opt(2024, 6, 28).unwrap());
            assert_eq!(row.low_price, None);
            assert!(adapter.fetch_latest_row("SH.999999").unwrap().is_none());
        }

        #[test]
        fn active_symbols_skip_inactive() {
            let adapter = seeded();
            assert_eq!(
                adapter.list_active_symbols().unwrap(),
                vec!["SH.600519", "SZ.000001"]
            );
        }

        #[test]
        fn history_is_newest_first_and_limited() {
            let adapter = seeded();
            let history = adapter.fetch_history("SH.600519", 2).unwrap();
            assert_eq!(history.len(), 2);
            assert_eq!(history[0].close_price, Some(1720.0));
            assert_eq!(history[1].close_price, Some(1710.0));
            assert!(adapter.fetch_history("NOPE", 10).unwrap().is_empty());
        }

        #[test]
        fn list_rows_pages_latest_rows() {
            let adapter = seeded();
            let page = adapter.list_rows(&ListQuery::default()).unwrap();
            assert_eq!(page.total, 2);
            assert_eq!(page.rows[0].symbol, "SH.600519");
            assert_eq!(page.rows[0].close_price, 1720.0);

            let all = ListQuery {
                active_only: false,
                limit: 1,
                offset: 2,
                ..ListQuery::default()
            };
            let page = adapter.list_rows(&all).unwrap();
            assert_eq!(page.total, 3);
            assert_eq!(page.rows.len(), 1);
            assert_eq!(page.rows[0].symbol, "SZ.159998");
        }

        #[test]
        fn list_rows_filters_market() {
            let adapter = seeded();
            let query = ListQuery {
                market_code: Some("SZ".into()),
                ..ListQuery::default()
            };
            let page = adapter.list_rows(&query).unwrap();
            assert_eq!(page.total, 1);
            assert_eq!(page.rows[0].symbol, "SZ.000001");
        }

        #[test]
        fn reinserting_replaces_row() {
            let adapter = seeded();
            adapter.insert_rows(&[row_on("SZ.000001", 11.0, 28)]).unwrap();
            let row = adapter.fetch_latest_row("SZ.000001").unwrap().unwrap();
            assert_eq!(row.close_price, 11.0);
        }
    }

    mod scripts {
        use super::*;

        fn new_script(name: &str) -> NewScript {
            NewScript::new(name, "result = row['close_price']", Some("latest close")).unwrap()
        }

        #[test]
        fn create_and_get() {
            let adapter = adapter();
            let created = adapter.create_script(&new_script("close")).unwrap();
            let loaded = adapter.get_script(created.id).unwrap().unwrap();
            assert_eq!(loaded, created);
            assert_eq!(loaded.created_at.offset().local_minus_utc(), 8 * 3600);
            assert!(adapter.get_script(created.id + 1).unwrap().is_none());
        }

        #[test]
        fn list_is_newest_first() {
            let adapter = adapter();
            let first = adapter.create_script(&new_script("a")).unwrap();
            let second = adapter.create_script(&new_script("b")).unwrap();
            let ids: Vec<i64> = adapter.list_scripts().unwrap().iter().map(|s| s.id).collect();
            assert_eq!(ids, vec![second.id, first.id]);
        }

        #[test]
        fn lookup_reports_missing_in_request_order() {
            let adapter = adapter();
            let a = adapter.create_script(&new_script("a")).unwrap();
            let b = adapter.create_script(&new_script("b")).unwrap();
            let lookup = adapter.get_scripts(&[b.id, 40, a.id, 41]).unwrap();
            let found: Vec<i64> = lookup.found.iter().map(|s| s.id).collect();
            assert_eq!(found, vec![b.id, a.id]);
            assert_eq!(lookup.missing, vec![40, 41]);
        }

        #[test]
        fn update_changes_supplied_fields() {
            let adapter = adapter();
            let created = adapter.create_script(&new_script("a")).unwrap();
            let update = ScriptUpdate::new(Some("renamed"), None, Some(""));
            let updated = adapter.update_script(created.id, &update).unwrap().unwrap();
            assert_eq!(updated.name, "renamed");
            assert_eq!(updated.code, created.code);
            assert_eq!(updated.description, None);
            assert!(updated.updated_at >= created.updated_at);
            assert_eq!(adapter.get_script(created.id).unwrap().unwrap(), updated);
            assert!(adapter.update_script(999, &update).unwrap().is_none());
        }

        #[test]
        fn delete_reports_presence() {
            let adapter = adapter();
            let created = adapter.create_script(&new_script("a")).unwrap();
            assert!(adapter.delete_script(created.id).unwrap());
            assert!(!adapter.delete_script(created.id).unwrap());
        }
    }
}
