//! Script Evaluator.
//!
//! Runs one validated [`Program`] against one row in a scope built fresh for
//! the call, then checks the `result` binding against the output contract.
//! Interpreter values never leave this module: callers only see
//! [`ScriptValue`] and [`EvalError`], both of which are `Send`.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, trace};

use crate::domain::ast::Program;
use crate::domain::capability::{CapabilityRegistry, RESULT_BINDING, ROW_BINDING};
use crate::domain::error::{CompileError, EvalError};
use crate::domain::interpreter::{Interpreter, Interrupt};
use crate::domain::row::StockRow;
use crate::domain::sandbox_config::SandboxConfig;
use crate::domain::validator;
use crate::domain::value::{Dict, Exception, Value};

/// A script's answer, restricted to the scalar types the host accepts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ScriptValue {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    /// `result` was never assigned, or was assigned `None`.
    Absent,
}

impl ScriptValue {
    fn from_value(value: &Value) -> Result<Self, EvalError> {
        match value {
            Value::None => Ok(ScriptValue::Absent),
            Value::Bool(b) => Ok(ScriptValue::Boolean(*b)),
            Value::Int(i) => Ok(ScriptValue::Integer(*i)),
            Value::Float(f) => Ok(ScriptValue::Float(*f)),
            other => Err(EvalError::Contract {
                type_name: other.type_name(),
            }),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, ScriptValue::Absent)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScriptValue::Integer(i) => Some(*i as f64),
            ScriptValue::Float(f) => Some(*f),
            ScriptValue::Boolean(b) => Some(f64::from(u8::from(*b))),
            ScriptValue::Absent => None,
        }
    }
}

/// Stack reserved for threads that run evaluations. The interpreter recurses
/// per nested expression and per script call.
pub const EVAL_STACK_SIZE: usize = 16 * 1024 * 1024;

/// Outcome of one (script, row) evaluation.
pub type ExecutionResult = Result<ScriptValue, EvalError>;

/// Per-call lifecycle, reported through `tracing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalPhase {
    Idle,
    Compiling,
    Running,
    Succeeded,
    CompileFailed,
    RuntimeFailed,
    TimedOut,
}

/// Bindings injected into a script's scope besides the registry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    pub row: Option<StockRow>,
}

impl Context {
    pub fn for_row(row: StockRow) -> Self {
        Self { row: Some(row) }
    }
}

/// The row as the dict a script sees. Built per call, so writes by the
/// script never reach the caller's record.
fn row_value(row: &StockRow) -> Result<Value, Exception> {
    let optional = |v: Option<f64>| v.map_or(Value::None, Value::Float);
    let fields = [
        Value::str(&row.symbol),
        Value::str(&row.stock_name),
        Value::str(&row.trade_date.format("%Y-%m-%d").to_string()),
        optional(row.open_price),
        optional(row.high_price),
        optional(row.low_price),
        Value::Float(row.close_price),
        Value::Int(row.volume),
        Value::Float(row.turnover),
        optional(row.price_change),
        optional(row.price_change_pct),
        optional(row.premium_rate),
        Value::str(&row.market_code),
    ];
    let mut dict = Dict::new();
    for (name, value) in StockRow::FIELDS.iter().zip(fields) {
        dict.insert(Value::str(name), value)?;
    }
    Ok(Value::dict(dict))
}

fn runtime_error(e: Exception) -> EvalError {
    EvalError::Runtime {
        class: e.kind.name().to_string(),
        message: e.message,
    }
}

/// Compiles and runs scripts against the shared capability registry.
///
/// Holds no per-call state; one evaluator serves any number of threads.
#[derive(Debug, Clone)]
pub struct Evaluator {
    registry: Arc<CapabilityRegistry>,
    limits: SandboxConfig,
}

impl Evaluator {
    pub fn new(registry: Arc<CapabilityRegistry>, limits: SandboxConfig) -> Self {
        Self { registry, limits }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn limits(&self) -> &SandboxConfig {
        &self.limits
    }

    pub fn validate(&self, source: &str) -> Result<Program, CompileError> {
        validator::validate(&self.registry, source)
    }

    /// Validates `source` and runs it once.
    pub fn execute(&self, source: &str, ctx: &Context) -> ExecutionResult {
        trace!(phase = ?EvalPhase::Compiling, bytes = source.len());
        let program = self.validate(source).map_err(|e| {
            debug!(phase = ?EvalPhase::CompileFailed, error = %e);
            EvalError::from(e)
        })?;
        self.run(&program, ctx)
    }

    /// Runs an already validated program in a fresh scope.
    pub fn run(&self, program: &Program, ctx: &Context) -> ExecutionResult {
        let started = Instant::now();
        let symbol = ctx.row.as_ref().map(|r| r.symbol.as_str()).unwrap_or("");
        trace!(phase = ?EvalPhase::Running, symbol);

        let outcome = {
            let mut interp =
                Interpreter::new(&self.registry, &self.limits, self.limits.deadline_from(started));
            let row = match &ctx.row {
                Some(row) => row_value(row).map_err(runtime_error)?,
                None => Value::None,
            };
            interp.bind_global(ROW_BINDING, row);
            match interp.run(program) {
                Ok(()) => match interp.global(RESULT_BINDING) {
                    Some(value) => ScriptValue::from_value(&value),
                    None => Ok(ScriptValue::Absent),
                },
                Err(Interrupt::Exception(e)) => Err(runtime_error(e)),
                Err(Interrupt::Timeout) => Err(EvalError::Timeout {
                    budget: self.limits.timeout,
                }),
            }
        };

        let phase = match &outcome {
            Ok(_) => EvalPhase::Succeeded,
            Err(EvalError::Timeout { .. }) => EvalPhase::TimedOut,
            Err(_) => EvalPhase::RuntimeFailed,
        };
        debug!(
            ?phase,
            symbol,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "evaluation finished"
        );
        outcome
    }
}
