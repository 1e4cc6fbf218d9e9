//! Caller-facing operations: execute, list with script columns,
//! validate, script management and the function catalogue.
//!
//! Every whole-operation check runs before the first evaluation starts.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::domain::batch::{AugmentedRow, BatchResult, BatchRunner, MAX_BATCH_ROWS, MAX_BATCH_SCRIPTS, ScriptResults};
use crate::domain::capability::{CapabilityRegistry, FunctionCatalog};
use crate::domain::error::{CompileError, QuantscriptError};
use crate::domain::evaluator::Evaluator;
use crate::domain::history::HistoryProvider;
use crate::domain::row::ListQuery;
use crate::domain::sandbox_config::SandboxConfig;
use crate::domain::script::{MAX_NAME_LEN, NewScript, ScriptSource, ScriptUpdate, StoredScript};
use crate::ports::data_port::DataPort;
use crate::ports::script_port::ScriptPort;

/// Largest page a list request may ask for.
pub const MAX_LIST_LIMIT: usize = 10_000;

/// Parameters of the execute operation, as received from a caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecuteRequest {
    pub script: Option<String>,
    pub script_id: Option<i64>,
    pub column_name: Option<String>,
    /// Empty means every active entity.
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecuteResponse {
    pub column_name: String,
    #[serde(flatten)]
    pub batch: BatchResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowListing {
    pub rows: Vec<AugmentedRow>,
    pub total: usize,
    pub count: usize,
}

/// Verdict of a standalone validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

impl From<Result<(), CompileError>> for ValidationReport {
    fn from(result: Result<(), CompileError>) -> Self {
        match result {
            Ok(()) => Self {
                valid: true,
                error: None,
                line: None,
            },
            Err(e) => Self {
                valid: false,
                line: e.line(),
                error: Some(e.to_string()),
            },
        }
    }
}

/// The engine wired to its collaborators.
pub struct CalculationService {
    data: Arc<dyn DataPort>,
    scripts: Arc<dyn ScriptPort>,
    runner: BatchRunner,
}

impl CalculationService {
    /// Builds the registry, evaluator and worker pool over `data`.
    pub fn new(
        data: Arc<dyn DataPort>,
        scripts: Arc<dyn ScriptPort>,
        limits: SandboxConfig,
    ) -> Result<Self, QuantscriptError> {
        let history = Arc::new(HistoryProvider::new(Arc::clone(&data)));
        let registry = Arc::new(CapabilityRegistry::new(history));
        let runner = BatchRunner::new(Evaluator::new(registry, limits))?;
        Ok(Self {
            data,
            scripts,
            runner,
        })
    }

    pub fn evaluator(&self) -> &Evaluator {
        self.runner.evaluator()
    }

    fn check_size(&self, source: &str) -> Result<(), QuantscriptError> {
        let max = self.evaluator().limits().max_script_bytes;
        if source.len() > max {
            return Err(QuantscriptError::parameter(format!(
                "script exceeds the maximum size of {max} bytes"
            )));
        }
        Ok(())
    }

    fn load(&self, id: i64) -> Result<StoredScript, QuantscriptError> {
        self.scripts
            .get_script(id)?
            .ok_or(QuantscriptError::ScriptNotFound { id })
    }

    /// Runs one script over the requested symbols (or the active universe).
    pub fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResponse, QuantscriptError> {
        let inline = request.script.filter(|s| !s.is_empty());
        let source = match (inline, request.script_id) {
            (Some(_), Some(_)) => {
                return Err(QuantscriptError::parameter(
                    "provide either script or script_id, not both",
                ));
            }
            (None, None) => {
                return Err(QuantscriptError::parameter("script or script_id is required"));
            }
            (Some(code), None) => {
                self.check_size(&code)?;
                ScriptSource::Inline(code)
            }
            (None, Some(id)) => ScriptSource::Stored(id),
        };
        let code = match source {
            ScriptSource::Inline(code) => code,
            ScriptSource::Stored(id) => {
                let stored = self.load(id)?;
                info!(script_id = id, name = %stored.name, "loaded stored script");
                stored.code
            }
        };

        let column_name = request
            .column_name
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| QuantscriptError::parameter("column_name is required"))?;

        let symbols = if request.symbols.is_empty() {
            let all = self.data.list_active_symbols()?;
            if all.is_empty() {
                return Err(QuantscriptError::NoActiveEntities);
            }
            info!(count = all.len(), "using all active entities");
            all
        } else {
            request.symbols
        };
        if symbols.len() > MAX_BATCH_ROWS {
            return Err(QuantscriptError::parameter(format!(
                "at most {MAX_BATCH_ROWS} symbols per request"
            )));
        }

        let program = self.evaluator().validate(&code).inspect_err(|e| {
            warn!(error = %e, "script rejected");
        })?;
        info!(column = %column_name, symbols = symbols.len(), "executing script");
        let batch = self.runner.run_rows(&program, &symbols, self.data.as_ref());
        Ok(ExecuteResponse { column_name, batch })
    }

    /// One page of latest rows, each carrying the value of every requested
    /// script. Unknown script ids fail the whole request.
    pub fn list_rows(&self, query: &ListQuery, script_ids: &[i64]) -> Result<RowListing, QuantscriptError> {
        if query.limit == 0 || query.limit > MAX_LIST_LIMIT {
            return Err(QuantscriptError::parameter(format!(
                "limit must be between 1 and {MAX_LIST_LIMIT}"
            )));
        }
        if script_ids.len() > MAX_BATCH_SCRIPTS {
            return Err(QuantscriptError::parameter(format!(
                "at most {MAX_BATCH_SCRIPTS} scripts per request"
            )));
        }
        let mut ids: Vec<i64> = Vec::with_capacity(script_ids.len());
        for id in script_ids {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }

        let programs = if ids.is_empty() {
            Vec::new()
        } else {
            let lookup = self.scripts.get_scripts(&ids)?;
            if !lookup.missing.is_empty() {
                return Err(QuantscriptError::ScriptsNotFound {
                    ids: lookup.missing,
                });
            }
            ids.iter()
                .filter_map(|id| lookup.found.iter().find(|s| s.id == *id))
                .map(|script| {
                    let program = self.evaluator().validate(&script.code);
                    if let Err(e) = &program {
                        warn!(script_id = script.id, error = %e, "stored script no longer validates");
                    }
                    (script.id, program)
                })
                .collect()
        };

        let page = self.data.list_rows(query)?;
        let rows = if programs.is_empty() {
            page.rows
                .into_iter()
                .map(|row| AugmentedRow {
                    row,
                    script_results: ScriptResults::default(),
                })
                .collect()
        } else {
            self.runner.augment_rows(&programs, page.rows)
        };
        let count = rows.len();
        info!(count, total = page.total, scripts = programs.len(), "rows listed");
        Ok(RowListing {
            rows,
            total: page.total,
            count,
        })
    }

    /// Static check only; nothing is executed or stored.
    pub fn validate(&self, source: &str) -> Result<ValidationReport, QuantscriptError> {
        if source.trim().is_empty() {
            return Err(QuantscriptError::parameter("script must not be empty"));
        }
        self.check_size(source)?;
        Ok(self.evaluator().validate(source).map(|_| ()).into())
    }

    /// Number of active entities; doubles as a store connectivity check.
    pub fn active_entity_count(&self) -> Result<usize, QuantscriptError> {
        Ok(self.data.list_active_symbols()?.len())
    }

    pub fn functions(&self) -> FunctionCatalog {
        self.evaluator().registry().describe()
    }

    pub fn create_script(
        &self,
        name: &str,
        code: &str,
        description: Option<&str>,
    ) -> Result<StoredScript, QuantscriptError> {
        let script = NewScript::new(name, code, description)?;
        self.check_size(&script.code)?;
        self.evaluator().validate(&script.code)?;
        let stored = self.scripts.create_script(&script)?;
        info!(script_id = stored.id, name = %stored.name, "script created");
        Ok(stored)
    }

    pub fn list_scripts(&self) -> Result<Vec<StoredScript>, QuantscriptError> {
        self.scripts.list_scripts()
    }

    pub fn get_script(&self, id: i64) -> Result<StoredScript, QuantscriptError> {
        self.load(id)
    }

    /// Applies `update`, re-validating new code before anything is written.
    pub fn update_script(&self, id: i64, update: &ScriptUpdate) -> Result<StoredScript, QuantscriptError> {
        if let Some(name) = &update.name {
            if name.chars().count() > MAX_NAME_LEN {
                return Err(QuantscriptError::parameter(format!(
                    "name must be at most {MAX_NAME_LEN} characters"
                )));
            }
        }
        if let Some(code) = &update.code {
            self.check_size(code)?;
            self.evaluator().validate(code)?;
        }
        let stored = self
            .scripts
            .update_script(id, update)?
            .ok_or(QuantscriptError::ScriptNotFound { id })?;
        info!(script_id = id, "script updated");
        Ok(stored)
    }

    pub fn delete_script(&self, id: i64) -> Result<(), QuantscriptError> {
        if !self.scripts.delete_script(id)? {
            return Err(QuantscriptError::ScriptNotFound { id });
        }
        info!(script_id = id, "script deleted");
        Ok(())
    }
}
