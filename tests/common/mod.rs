#![allow(dead_code)]

use chrono::NaiveDate;
use quantscript::domain::error::QuantscriptError;
use quantscript::domain::operations::CalculationService;
use quantscript::domain::row::{HistoryPoint, ListQuery, RowPage, StockRow};
use quantscript::domain::sandbox_config::SandboxConfig;
use quantscript::domain::script::{
    NewScript, ScriptLookup, ScriptUpdate, StoredScript, now_china,
};
use quantscript::ports::data_port::DataPort;
use quantscript::ports::script_port::ScriptPort;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

pub const MOMENTUM: &str = include_str!("../../scripts/momentum_score.py");
pub const ACCELERATION: &str = include_str!("../../scripts/momentum_acceleration.py");

/// Daily rows per symbol, newest first.
#[derive(Default)]
pub struct MockDataPort {
    pub series: BTreeMap<String, Vec<StockRow>>,
    pub inactive: Vec<String>,
    pub errors: BTreeMap<String, String>,
}

impl MockDataPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(mut self, symbol: &str, mut rows: Vec<StockRow>) -> Self {
        rows.sort_by(|a, b| b.trade_date.cmp(&a.trade_date));
        self.series.insert(symbol.to_string(), rows);
        self
    }

    pub fn with_inactive(mut self, symbol: &str, rows: Vec<StockRow>) -> Self {
        self.inactive.push(symbol.to_string());
        self.with_rows(symbol, rows)
    }

    pub fn with_error(mut self, symbol: &str, reason: &str) -> Self {
        self.errors.insert(symbol.to_string(), reason.to_string());
        self
    }

    fn check(&self, symbol: &str) -> Result<(), QuantscriptError> {
        match self.errors.get(symbol) {
            Some(reason) => Err(QuantscriptError::Database {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

impl DataPort for MockDataPort {
    fn fetch_latest_row(&self, symbol: &str) -> Result<Option<StockRow>, QuantscriptError> {
        self.check(symbol)?;
        Ok(self.series.get(symbol).and_then(|rows| rows.first()).cloned())
    }

    fn list_active_symbols(&self) -> Result<Vec<String>, QuantscriptError> {
        Ok(self
            .series
            .keys()
            .filter(|s| !self.inactive.contains(s))
            .cloned()
            .collect())
    }

    fn fetch_history(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<HistoryPoint>, QuantscriptError> {
        self.check(symbol)?;
        Ok(self
            .series
            .get(symbol)
            .map(|rows| {
                rows.iter()
                    .take(limit)
                    .map(|r| HistoryPoint {
                        trade_date: r.trade_date,
                        close_price: Some(r.close_price),
                        volume: r.volume,
                        price_change_pct: r.price_change_pct,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn list_rows(&self, query: &ListQuery) -> Result<RowPage, QuantscriptError> {
        let matching: Vec<&StockRow> = self
            .series
            .iter()
            .filter(|(symbol, _)| !query.active_only || !self.inactive.contains(symbol))
            .filter_map(|(_, rows)| rows.first())
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

#[derive(Default)]
pub struct MockScriptStore {
    scripts: Mutex<Vec<StoredScript>>,
}

impl ScriptPort for MockScriptStore {
    fn get_script(&self, id: i64) -> Result<Option<StoredScript>, QuantscriptError> {
        Ok(self.scripts.lock().unwrap().iter().find(|s| s.id == id).cloned())
    }

    fn get_scripts(&self, ids: &[i64]) -> Result<ScriptLookup, QuantscriptError> {
        let all = self.scripts.lock().unwrap();
        let mut lookup = ScriptLookup::default();
        for id in ids {
            match all.iter().find(|s| s.id == *id) {
                Some(s) => lookup.found.push(s.clone()),
                None => lookup.missing.push(*id),
            }
        }
        Ok(lookup)
    }

    fn create_script(&self, script: &NewScript) -> Result<StoredScript, QuantscriptError> {
        let mut all = self.scripts.lock().unwrap();
        let now = now_china();
        let stored = StoredScript {
            id: all.iter().map(|s| s.id).max().unwrap_or(0) + 1,
            name: script.name.clone(),
            description: script.description.clone(),
            code: script.code.clone(),
            created_at: now,
            updated_at: now,
        };
        all.push(stored.clone());
        Ok(stored)
    }

    fn list_scripts(&self) -> Result<Vec<StoredScript>, QuantscriptError> {
        let mut all = self.scripts.lock().unwrap().clone();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(all)
    }

    fn update_script(
        &self,
        id: i64,
        update: &ScriptUpdate,
    ) -> Result<Option<StoredScript>, QuantscriptError> {
        let mut all = self.scripts.lock().unwrap();
        let Some(script) = all.iter_mut().find(|s| s.id == id) else {
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
        Ok(Some(script.clone()))
    }

    fn delete_script(&self, id: i64) -> Result<bool, QuantscriptError> {
        let mut all = self.scripts.lock().unwrap();
        let before = all.len();
        all.retain(|s| s.id != id);
        Ok(all.len() < before)
    }
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn make_row(symbol: &str, trade_date: NaiveDate, close: f64) -> StockRow {
    StockRow {
        symbol: symbol.to_string(),
        stock_name: format!("{symbol} Co"),
        trade_date,
        open_price: Some(close - 0.5),
        high_price: Some(close + 1.0),
        low_price: Some(close - 1.0),
        close_price: close,
        volume: 10_000,
        turnover: close * 10_000.0,
        price_change: Some(0.5),
        price_change_pct: Some(0.5),
        premium_rate: None,
        market_code: StockRow::market_prefix(symbol)
            .unwrap_or("SH")
            .to_string(),
    }
}

/// `days` consecutive rows ending on 2024-06-28, closes growing by `growth`
/// per day.
pub fn generate_series(symbol: &str, days: usize, start_close: f64, growth: f64) -> Vec<StockRow> {
    let last = date(2024, 6, 28);
    (0..days)
        .map(|i| {
            let age = (days - 1 - i) as i64;
            let close = start_close * growth.powi(i as i32);
            make_row(symbol, last - chrono::Duration::days(age), close)
        })
        .collect()
}

pub fn service_with(data: MockDataPort) -> CalculationService {
    service_with_limits(data, SandboxConfig::default())
}

pub fn service_with_limits(data: MockDataPort, limits: SandboxConfig) -> CalculationService {
    CalculationService::new(
        Arc::new(data),
        Arc::new(MockScriptStore::default()),
        limits,
    )
    .unwrap()
}

/// Three active symbols with a year of rising prices and one inactive one.
pub fn market() -> MockDataPort {
    MockDataPort::new()
        .with_rows("SH.600519", generate_series("SH.600519", 260, 100.0, 1.01))
        .with_rows("SZ.000001", generate_series("SZ.000001", 260, 10.0, 0.995))
        .with_rows("SZ.159998", generate_series("SZ.159998", 20, 1.0, 1.0))
        .with_inactive("SH.600000", generate_series("SH.600000", 5, 8.0, 1.0))
}
