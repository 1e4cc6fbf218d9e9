//! PostgreSQL (TimescaleDB) persistence adapter.
//!
//! Price columns are `DECIMAL` and timestamps are zone-less UTC+8 wall-clock
//! values, so every query casts to `double precision` and every timestamp is
//! re-attached to [`china_offset`] on read.

use crate::domain::error::QuantscriptError;
use crate::domain::row::{HistoryPoint, ListQuery, RowPage, StockInfo, StockRow};
use crate::domain::script::{
    NewScript, ScriptLookup, ScriptUpdate, StoredScript, china_offset, now_china,
};
use crate::ports::config_port::ConfigPort;
use crate::ports::data_port::DataPort;
use crate::ports::script_port::ScriptPort;
use chrono::{DateTime, FixedOffset, NaiveDateTime, NaiveTime, TimeDelta};
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use r2d2_postgres::postgres::types::ToSql;
use r2d2_postgres::postgres::{Config, NoTls, Row};
use tracing::{error, info};

const ROW_COLUMNS: &str = "d.symbol, d.stock_name, d.trade_date, \
     d.open_price::double precision, d.high_price::double precision, \
     d.low_price::double precision, d.close_price::double precision, \
     d.volume::bigint, d.turnover::double precision, \
     d.price_change::double precision, d.price_change_pct::double precision, \
     d.premium_rate::double precision, d.market_code";

const SCRIPT_COLUMNS: &str = "id, name, description, code, created_at, updated_at";

const LATEST_PER_ENTITY: &str = "FROM stock_info i
     JOIN LATERAL (
         SELECT * FROM stock_daily_data x
         WHERE x.symbol = i.symbol
         ORDER BY x.trade_date DESC
         LIMIT 1
     ) d ON TRUE
     WHERE ($1::text IS NULL OR i.market_code = $1)
       AND (NOT $2 OR i.is_active = 'Y')";

pub struct PostgresAdapter {
    pool: Pool<PostgresConnectionManager<NoTls>>,
}

fn pool_error(e: r2d2::Error) -> QuantscriptError {
    error!(error = %e, "postgres pool unavailable");
    QuantscriptError::Database {
        reason: e.to_string(),
    }
}

fn query_error(e: r2d2_postgres::postgres::Error) -> QuantscriptError {
    error!(error = %e, "postgres query failed");
    QuantscriptError::DatabaseQuery {
        reason: e.to_string(),
    }
}

fn stamp(naive: NaiveDateTime) -> DateTime<FixedOffset> {
    let offset = china_offset();
    DateTime::from_naive_utc_and_offset(
        naive - TimeDelta::seconds(i64::from(offset.local_minus_utc())),
        offset,
    )
}

fn stock_row(row: &Row) -> StockRow {
    let trade_date: NaiveDateTime = row.get(2);
    StockRow {
        symbol: row.get(0),
        stock_name: row.get(1),
        trade_date: trade_date.date(),
        open_price: row.get(3),
        high_price: row.get(4),
        low_price: row.get(5),
        close_price: row.get(6),
        volume: row.get(7),
        turnover: row.get(8),
        price_change: row.get(9),
        price_change_pct: row.get(10),
        premium_rate: row.get(11),
        market_code: row.get(12),
    }
}

fn stored_script(row: &Row) -> StoredScript {
    StoredScript {
        id: i64::from(row.get::<_, i32>(0)),
        name: row.get(1),
        description: row.get(2),
        code: row.get(3),
        created_at: stamp(row.get(4)),
        updated_at: stamp(row.get(5)),
    }
}

impl PostgresAdapter {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, QuantscriptError> {
        // [postgres] connection_string first, then [database] conninfo
        let connection_string = config
            .get_string("postgres", "connection_string")
            .or_else(|| config.get_string("database", "conninfo"))
            .ok_or_else(|| QuantscriptError::ConfigMissing {
                section: "postgres".into(),
                key: "connection_string".into(),
            })?;

        let pg_config: Config =
            connection_string
                .parse()
                .map_err(|e| QuantscriptError::ConfigInvalid {
                    section: "postgres".into(),
                    key: "connection_string".into(),
                    reason: format!("{e}"),
                })?;

        let pool_size = config.get_int("postgres", "pool_size", 4).max(1) as u32;
        let manager = PostgresConnectionManager::new(pg_config, NoTls);
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(pool_error)?;

        info!(pool_size, "opened postgres store");
        Ok(Self { pool })
    }

    fn conn(
        &self,
    ) -> Result<PooledConnection<PostgresConnectionManager<NoTls>>, QuantscriptError> {
        self.pool.get().map_err(pool_error)
    }

    /// Creates the script table; the daily-data hypertable is owned by ingestion.
    pub fn initialize_schema(&self) -> Result<(), QuantscriptError> {
        self.conn()?
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS custom_scripts (
                    id SERIAL PRIMARY KEY,
                    name VARCHAR(100) NOT NULL,
                    description TEXT,
                    code TEXT NOT NULL,
                    created_at TIMESTAMP NOT NULL,
                    updated_at TIMESTAMP NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_custom_scripts_name ON custom_scripts(name);
                CREATE INDEX IF NOT EXISTS idx_custom_scripts_created_at
                    ON custom_scripts(created_at);",
            )
            .map_err(query_error)?;
        info!("postgres schema ready");
        Ok(())
    }

    pub fn insert_rows(&self, rows: &[StockRow]) -> Result<(), QuantscriptError> {
        let mut conn = self.conn()?;
        let mut tx = conn.transaction().map_err(query_error)?;
        let stmt = tx
            .prepare(
                "INSERT INTO stock_daily_data (symbol, stock_name, trade_date, open_price,
                    high_price, low_price, close_price, volume, turnover, price_change,
                    price_change_pct, premium_rate, market_code, created_at, updated_at)
                 VALUES ($1, $2, $3, $4::float8::numeric, $5::float8::numeric,
                    $6::float8::numeric, $7::float8::numeric, $8, $9::float8::numeric,
                    $10::float8::numeric, $11::float8::numeric, $12::float8::numeric,
                    $13, $14, $14)
                 ON CONFLICT (symbol, trade_date) DO UPDATE SET
                    stock_name = excluded.stock_name,
                    open_price = excluded.open_price,
                    high_price = excluded.high_price,
                    low_price = excluded.low_price,
                    close_price = excluded.close_price,
                    volume = excluded.volume,
                    turnover = excluded.turnover,
                    price_change = excluded.price_change,
                    price_change_pct = excluded.price_change_pct,
                    premium_rate = excluded.premium_rate,
                    market_code = excluded.market_code,
                    updated_at = excluded.updated_at",
            )
            .map_err(query_error)?;

        let now = now_china().naive_local();
        for row in rows {
            let trade_date = row.trade_date.and_time(NaiveTime::MIN);
            let params: &[&(dyn ToSql + Sync)] = &[
                &row.symbol,
                &row.stock_name,
                &trade_date,
                &row.open_price,
                &row.high_price,
                &row.low_price,
                &row.close_price,
                &row.volume,
                &row.turnover,
                &row.price_change,
                &row.price_change_pct,
                &row.premium_rate,
                &row.market_code,
                &now,
            ];
            tx.execute(&stmt, params).map_err(query_error)?;
        }

        tx.commit().map_err(query_error)?;
        Ok(())
    }

    pub fn upsert_stock_info(&self, infos: &[StockInfo]) -> Result<(), QuantscriptError> {
        let mut conn = self.conn()?;
        let mut tx = conn.transaction().map_err(query_error)?;
        let now = now_china().naive_local();

        for info in infos {
            let active = if info.is_active { "Y" } else { "N" };
            tx.execute(
                "INSERT INTO stock_info (symbol, stock_name, stock_code, market_code, is_active,
                    created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $6)
                 ON CONFLICT (symbol) DO UPDATE SET
                    stock_name = excluded.stock_name,
                    stock_code = excluded.stock_code,
                    market_code = excluded.market_code,
                    is_active = excluded.is_active,
                    updated_at = excluded.updated_at",
                &[
                    &info.symbol,
                    &info.stock_name,
                    &info.stock_code,
                    &info.market_code,
                    &active,
                    &now,
                ],
            )
            .map_err(query_error)?;
        }

        tx.commit().map_err(query_error)?;
        Ok(())
    }
}

impl DataPort for PostgresAdapter {
    fn fetch_latest_row(&self, symbol: &str) -> Result<Option<StockRow>, QuantscriptError> {
        let query = format!(
            "SELECT {ROW_COLUMNS} FROM stock_daily_data d
             WHERE d.symbol = $1 ORDER BY d.trade_date DESC LIMIT 1"
        );
        let rows = self
            .conn()?
            .query(query.as_str(), &[&symbol])
            .map_err(query_error)?;
        Ok(rows.first().map(stock_row))
    }

    fn list_active_symbols(&self) -> Result<Vec<String>, QuantscriptError> {
        let rows = self
            .conn()?
            .query(
                "SELECT symbol FROM stock_info WHERE is_active = 'Y' ORDER BY symbol",
                &[],
            )
            .map_err(query_error)?;
        Ok(rows.into_iter().map(|row| row.get(0)).collect())
    }

    fn fetch_history(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<HistoryPoint>, QuantscriptError> {
        let query = "SELECT trade_date, close_price::double precision, volume::bigint, \
                            price_change_pct::double precision \
                     FROM stock_daily_data \
                     WHERE symbol = $1 \
                     ORDER BY trade_date DESC \
                     LIMIT $2";

        let rows = self
            .conn()?
            .query(query, &[&symbol, &(limit as i64)])
            .map_err(query_error)?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let trade_date: NaiveDateTime = row.get(0);
                HistoryPoint {
                    trade_date: trade_date.date(),
                    close_price: row.get(1),
                    volume: row.get(2),
                    price_change_pct: row.get(3),
                }
            })
            .collect())
    }

    fn list_rows(&self, query: &ListQuery) -> Result<RowPage, QuantscriptError> {
        let mut conn = self.conn()?;
        let market = query.market_code.as_deref();

        let total: i64 = conn
            .query_one(
                format!("SELECT COUNT(*) {LATEST_PER_ENTITY}").as_str(),
                &[&market, &query.active_only],
            )
            .map_err(query_error)?
            .get(0);

        let rows = conn
            .query(
                format!(
                    "SELECT {ROW_COLUMNS} {LATEST_PER_ENTITY} ORDER BY i.symbol LIMIT $3 OFFSET $4"
                )
                .as_str(),
                &[
                    &market,
                    &query.active_only,
                    &(query.limit as i64),
                    &(query.offset as i64),
                ],
            )
            .map_err(query_error)?;

        Ok(RowPage {
            rows: rows.iter().map(stock_row).collect(),
            total: total as usize,
        })
    }
}

impl ScriptPort for PostgresAdapter {
    fn get_script(&self, id: i64) -> Result<Option<StoredScript>, QuantscriptError> {
        let Ok(id) = i32::try_from(id) else {
            return Ok(None);
        };
        let rows = self
            .conn()?
            .query(
                format!("SELECT {SCRIPT_COLUMNS} FROM custom_scripts WHERE id = $1").as_str(),
                &[&id],
            )
            .map_err(query_error)?;
        Ok(rows.first().map(stored_script))
    }

    fn get_scripts(&self, ids: &[i64]) -> Result<ScriptLookup, QuantscriptError> {
        let wanted: Vec<i32> = ids.iter().filter_map(|id| i32::try_from(*id).ok()).collect();
        let rows = self
            .conn()?
            .query(
                format!("SELECT {SCRIPT_COLUMNS} FROM custom_scripts WHERE id = ANY($1)")
                    .as_str(),
                &[&wanted],
            )
            .map_err(query_error)?;
        let loaded: Vec<StoredScript> = rows.iter().map(stored_script).collect();

        let mut lookup = ScriptLookup::default();
        for id in ids {
            match loaded.iter().find(|s| s.id == *id) {
                Some(script) if !lookup.found.iter().any(|s| s.id == *id) => {
                    lookup.found.push(script.clone())
                }
                Some(_) => {}
                None => lookup.missing.push(*id),
            }
        }
        Ok(lookup)
    }

    fn create_script(&self, script: &NewScript) -> Result<StoredScript, QuantscriptError> {
        let now = now_china().naive_local();
        let row = self
            .conn()?
            .query_one(
                format!(
                    "INSERT INTO custom_scripts (name, description, code, created_at, updated_at)
                     VALUES ($1, $2, $3, $4, $4)
                     RETURNING {SCRIPT_COLUMNS}"
                )
                .as_str(),
                &[&script.name, &script.description, &script.code, &now],
            )
            .map_err(query_error)?;

        let stored = stored_script(&row);
        info!(script_id = stored.id, name = %stored.name, "script saved");
        Ok(stored)
    }

    fn list_scripts(&self) -> Result<Vec<StoredScript>, QuantscriptError> {
        let rows = self
            .conn()?
            .query(
                format!(
                    "SELECT {SCRIPT_COLUMNS} FROM custom_scripts ORDER BY created_at DESC, id DESC"
                )
                .as_str(),
                &[],
            )
            .map_err(query_error)?;
        Ok(rows.iter().map(stored_script).collect())
    }

    fn update_script(
        &self,
        id: i64,
        update: &ScriptUpdate,
    ) -> Result<Option<StoredScript>, QuantscriptError> {
        let Ok(id) = i32::try_from(id) else {
            return Ok(None);
        };
        let description = update
            .description
            .as_ref()
            .map(|d| (!d.is_empty()).then(|| d.clone()));
        let clear_description = matches!(description, Some(None));
        let now = now_china().naive_local();

        let rows = self
            .conn()?
            .query(
                format!(
                    "UPDATE custom_scripts SET
                        name = COALESCE($2, name),
                        code = COALESCE($3, code),
                        description = CASE WHEN $5 THEN NULL ELSE COALESCE($4, description) END,
                        updated_at = $6
                     WHERE id = $1
                     RETURNING {SCRIPT_COLUMNS}"
                )
                .as_str(),
                &[
                    &id,
                    &update.name,
                    &update.code,
                    &description.flatten(),
                    &clear_description,
                    &now,
                ],
            )
            .map_err(query_error)?;

        let updated = rows.first().map(stored_script);
        if updated.is_some() {
            info!(script_id = id, "script updated");
        }
        Ok(updated)
    }

    fn delete_script(&self, id: i64) -> Result<bool, QuantscriptError> {
        let Ok(id) = i32::try_from(id) else {
            return Ok(false);
        };
        let deleted = self
            .conn()?
            .execute("DELETE FROM custom_scripts WHERE id = $1", &[&id])
            .map_err(query_error)?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::file_config_adapter::FileConfigAdapter;
    use chrono::NaiveDate;

    #[test]
    fn from_config_missing_connection_string() {
        let result = PostgresAdapter::from_config(&FileConfigAdapter::empty());
        match result {
            Err(QuantscriptError::ConfigMissing { section, key }) => {
                assert_eq!(section, "postgres");
                assert_eq!(key, "connection_string");
            }
            Err(other) => panic!("expected ConfigMissing, got: {other}"),
            Ok(_) => panic!("expected error, got Ok"),
        }
    }

    #[test]
    fn from_config_rejects_malformed_connection_string() {
        let config =
            FileConfigAdapter::from_string("[postgres]\nconnection_string = host='unterminated\n")
                .unwrap();
        let result = PostgresAdapter::from_config(&config);
        assert!(matches!(result, Err(QuantscriptError::ConfigInvalid { .. })));
    }

    #[test]
    fn stamp_treats_naive_as_china_wall_clock() {
        let naive = NaiveDate::from_ymd_opt(2024, 6, 28)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap();
        let stamped = stamp(naive);
        assert_eq!(stamped.naive_local(), naive);
        assert_eq!(stamped.naive_utc().format("%H:%M").to_string(), "01:30");
    }
}
