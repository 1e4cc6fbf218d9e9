//! Batch Runner.
//!
//! Applies validated programs across rows on a dedicated rayon pool. Output
//! order always follows input order; each (script, row) failure stays in its
//! own slot.

use rayon::prelude::*;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use tracing::{info, warn};

use crate::domain::ast::Program;
use crate::domain::error::{CompileError, EvalError, QuantscriptError};
use crate::domain::evaluator::{Context, EVAL_STACK_SIZE, Evaluator, ScriptValue};
use crate::domain::row::StockRow;
use crate::ports::data_port::DataPort;

/// Most rows one execute request may name.
pub const MAX_BATCH_ROWS: usize = 200;

/// Most scripts one list request may attach.
pub const MAX_BATCH_SCRIPTS: usize = 50;

/// Why one row has no value.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RowError {
    #[error("data not found for {symbol}")]
    NotFound { symbol: String },

    #[error("failed to load row for {symbol}: {reason}")]
    Lookup { symbol: String, reason: String },

    #[error(transparent)]
    Eval(#[from] EvalError),
}

fn error_text<S: Serializer>(error: &Option<RowError>, s: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => s.serialize_some(&e.to_string()),
        None => s.serialize_none(),
    }
}

/// Outcome for one requested symbol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowResult {
    pub symbol: String,
    pub value: ScriptValue,
    #[serde(serialize_with = "error_text")]
    pub error: Option<RowError>,
}

impl RowResult {
    fn failed(symbol: &str, error: RowError) -> Self {
        Self {
            symbol: symbol.to_string(),
            value: ScriptValue::Absent,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    #[serde(rename = "successful")]
    pub succeeded: usize,
    pub failed: usize,
}

impl Summary {
    fn of(results: &[RowResult]) -> Self {
        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        Self {
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
        }
    }
}

/// Results of one script over many rows. The summary is only present when
/// more than one row was processed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult {
    pub results: Vec<RowResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
}

impl BatchResult {
    fn new(results: Vec<RowResult>) -> Self {
        let summary = (results.len() > 1).then(|| Summary::of(&results));
        Self { results, summary }
    }
}

/// Script id to value, in the order the scripts were requested. A failed
/// evaluation is `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptResults(Vec<(i64, Option<ScriptValue>)>);

impl ScriptResults {
    pub fn new(values: Vec<(i64, Option<ScriptValue>)>) -> Self {
        Self(values)
    }

    pub fn get(&self, script_id: i64) -> Option<Option<ScriptValue>> {
        self.0.iter().find(|(id, _)| *id == script_id).map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(i64, Option<ScriptValue>)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for ScriptResults {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (id, value) in &self.0 {
            map.serialize_entry(&id.to_string(), value)?;
        }
        map.end()
    }
}

/// A listed row carrying the value of every requested script.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AugmentedRow {
    #[serde(flatten)]
    pub row: StockRow,
    #[serde(skip_serializing_if = "ScriptResults::is_empty")]
    pub script_results: ScriptResults,
}

pub struct BatchRunner {
    evaluator: Evaluator,
    pool: rayon::ThreadPool,
}

impl BatchRunner {
    /// Builds the worker pool sized by `[sandbox] workers`.
    pub fn new(evaluator: Evaluator) -> Result<Self, QuantscriptError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(evaluator.limits().workers)
            .stack_size(EVAL_STACK_SIZE)
            .thread_name(|i| format!("quantscript-eval-{i}"))
            .build()
            .map_err(|e| QuantscriptError::Io(std::io::Error::other(e.to_string())))?;
        Ok(Self { evaluator, pool })
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    /// Runs `program` once per symbol. A missing row or a failed lookup
    /// becomes that symbol's error; the rest of the batch is unaffected.
    pub fn run_rows(&self, program: &Program, symbols: &[String], data: &dyn DataPort) -> BatchResult {
        let results: Vec<RowResult> = self.pool.install(|| {
            symbols
                .par_iter()
                .map(|symbol| self.run_row(program, symbol, data))
                .collect()
        });
        let batch = BatchResult::new(results);
        let summary = batch.summary.unwrap_or_else(|| Summary::of(&batch.results));
        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "batch finished"
        );
        batch
    }

    fn run_row(&self, program: &Program, symbol: &str, data: &dyn DataPort) -> RowResult {
        let row = match data.fetch_latest_row(symbol) {
            Ok(Some(row)) => row,
            Ok(None) => {
                warn!(symbol, "row not found");
                return RowResult::failed(
                    symbol,
                    RowError::NotFound {
                        symbol: symbol.to_string(),
                    },
                );
            }
            Err(e) => {
                warn!(symbol, error = %e, "row lookup failed");
                return RowResult::failed(
                    symbol,
                    RowError::Lookup {
                        symbol: symbol.to_string(),
                        reason: e.to_string(),
                    },
                );
            }
        };
        match self.evaluator.run(program, &Context::for_row(row)) {
            Ok(value) => RowResult {
                symbol: symbol.to_string(),
                value,
                error: None,
            },
            Err(e) => {
                warn!(symbol, error = %e, "evaluation failed");
                RowResult::failed(symbol, e.into())
            }
        }
    }

    /// Runs every script against every row. Per-slot failures, including a
    /// script that failed validation, degrade to `None`.
    pub fn augment_rows(
        &self,
        scripts: &[(i64, Result<Program, CompileError>)],
        rows: Vec<StockRow>,
    ) -> Vec<AugmentedRow> {
        let augmented: Vec<AugmentedRow> = self.pool.install(|| {
            rows.into_par_iter()
                .map(|row| {
                    let ctx = Context::for_row(row.clone());
                    let values = scripts
                        .iter()
                        .map(|(id, program)| match program {
                            Err(_) => (*id, None),
                            Ok(program) => match self.evaluator.run(program, &ctx) {
                                Ok(value) => (*id, Some(value)),
                                Err(e) => {
                                    warn!(script_id = *id, symbol = %row.symbol, error = %e, "script failed for row");
                                    (*id, None)
                                }
                            },
                        })
                        .collect();
                    AugmentedRow {
                        row,
                        script_results: ScriptResults(values),
                    }
                })
                .collect()
        });
        info!(rows = augmented.len(), scripts = scripts.len(), "rows augmented");
        augmented
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::capability::CapabilityRegistry;
    use crate::domain::error::ErrorKind;
    use crate::domain::evaluator::tests::sample_row;
    use crate::domain::history::HistoryProvider;
    use crate::domain::row::{HistoryPoint, ListQuery, RowPage};
    use crate::domain::sandbox_config::SandboxConfig;
    use std::sync::Arc;

    /// Every symbol has a row except those listed; `BROKEN` fails the lookup.
    struct Rows {
        missing: Vec<String>,
    }

    impl DataPort for Rows {
        fn fetch_latest_row(&self, symbol: &str) -> Result<Option<StockRow>, QuantscriptError> {
            if symbol == "BROKEN" {
                return Err(QuantscriptError::DatabaseQuery {
                    reason: "connection reset".into(),
                });
            }
            if self.missing.iter().any(|m| m == symbol) {
                return Ok(None);
            }
            Ok(Some(sample_row(symbol, 100.0)))
        }
        fn list_active_symbols(&self) -> Result<Vec<String>, QuantscriptError> {
            Ok(Vec::new())
        }
        fn fetch_history(&self, _: &str, _: usize) -> Result<Vec<HistoryPoint>, QuantscriptError> {
            Ok(Vec::new())
        }
        fn list_rows(&self, _: &ListQuery) -> Result<RowPage, QuantscriptError> {
            Ok(RowPage::default())
        }
    }

    fn runner() -> BatchRunner {
        let port = Arc::new(Rows { missing: Vec::new() });
        let registry = CapabilityRegistry::new(Arc::new(HistoryProvider::new(port)));
        let limits = SandboxConfig {
            workers: 3,
            ..SandboxConfig::default()
        };
        BatchRunner::new(Evaluator::new(Arc::new(registry), limits)).unwrap()
    }

    fn program(runner: &BatchRunner, source: &str) -> Program {
        runner.evaluator().validate(source).unwrap()
    }

    fn symbols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn missing_row_keeps_its_slot() {
        let r = runner();
        let p = program(&r, "result = row['close_price'] * 2");
        let data = Rows {
            missing: symbols(&["B"]),
        };
        let batch = r.run_rows(&p, &symbols(&["A", "B", "C"]), &data);

        let order: Vec<&str> = batch.results.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(order, ["A", "B", "C"]);
        assert_eq!(batch.results[0].value, ScriptValue::Float(200.0));
        assert_eq!(
            batch.results[1].error,
            Some(RowError::NotFound {
                symbol: "B".into()
            })
        );
        assert!(batch.results[2].is_ok());
        assert_eq!(
            batch.summary,
            Some(Summary {
                total: 3,
                succeeded: 2,
                failed: 1
            })
        );
    }

    #[test]
    fn two_hundred_rows_with_one_gap() {
        let r = runner();
        let p = program(&r, "result = len(row['symbol'])");
        let names: Vec<String> = (0..200).map(|i| format!("SZ.{i:06}")).collect();
        let data = Rows {
            missing: vec![names[150].clone()],
        };
        let batch = r.run_rows(&p, &names, &data);

        assert_eq!(batch.results.len(), 200);
        for (i, result) in batch.results.iter().enumerate() {
            assert_eq!(result.symbol, names[i]);
            assert_eq!(result.is_ok(), i != 150);
        }
        let summary = batch.summary.unwrap();
        assert_eq!(summary.total, 200);
        assert_eq!(summary.failed, 1);
    }

    #[test]
    fn lookup_and_runtime_failures_are_per_row() {
        let r = runner();
        let p = program(&r, "result = 1 / (len(row['symbol']) - 1)");
        let data = Rows { missing: Vec::new() };
        let batch = r.run_rows(&p, &symbols(&["X", "BROKEN", "XY"]), &data);

        match &batch.results[0].error {
            Some(RowError::Eval(e)) => assert_eq!(e.kind(), ErrorKind::RuntimeFailure),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(batch.results[1].error, Some(RowError::Lookup { .. })));
        assert_eq!(batch.results[2].value, ScriptValue::Float(1.0));
    }

    #[test]
    fn single_row_has_no_summary() {
        let r = runner();
        let p = program(&r, "result = 1");
        let batch = r.run_rows(&p, &symbols(&["A"]), &Rows { missing: Vec::new() });
        assert_eq!(batch.summary, None);
        let json = serde_json::to_value(&batch).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"results": [{"symbol": "A", "value": 1, "error": null}]})
        );
    }

    #[test]
    fn augmented_rows_keep_script_order_and_degrade_failures() {
        let r = runner();
        let scripts = vec![
            (7, Ok(program(&r, "result = row['volume']"))),
            (3, Ok(program(&r, "result = 1 / 0"))),
            (5, Ok(program(&r, "x = 1"))),
            (9, r.evaluator().validate("import os")),
        ];
        let rows = vec![sample_row("SH.600519", 10.0), sample_row("SZ.000001", 20.0)];
        let out = r.augment_rows(&scripts, rows);

        assert_eq!(out.len(), 2);
        assert_eq!(out[1].row.symbol, "SZ.000001");
        let results = &out[0].script_results;
        assert_eq!(results.get(7), Some(Some(ScriptValue::Integer(1_200))));
        assert_eq!(results.get(3), Some(None));
        assert_eq!(results.get(5), Some(Some(ScriptValue::Absent)));
        assert_eq!(results.get(9), Some(None));
        assert_eq!(results.get(1), None);

        let json = serde_json::to_string(&out[0].script_results).unwrap();
        assert_eq!(json, r#"{"7":1200,"3":null,"5":null,"9":null}"#);
        let row = serde_json::to_value(&out[0]).unwrap();
        assert_eq!(row["symbol"], "SH.600519");
        assert_eq!(row["trade_date"], "2024-06-28");
        assert_eq!(row["script_results"]["7"], 1200);
    }
}
