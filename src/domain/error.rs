//! Domain error types.
//!
//! Two families: [`QuantscriptError`] aborts a whole operation before any
//! evaluation starts, [`EvalError`] describes the outcome of a single
//! (script, row) evaluation and never aborts a batch.

use serde::Serialize;
use std::time::Duration;

/// A syntax error with position information for script parsing.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("line {line}, column {column}: {message}")]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl ParseError {
    pub fn new(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            message: message.into(),
            line,
            column,
        }
    }

    /// Format the error with the offending source line and a caret under the column.
    pub fn display_with_context(&self, input: &str) -> String {
        let source_line = input.lines().nth(self.line.saturating_sub(1)).unwrap_or("");
        let caret = " ".repeat(self.column.saturating_sub(1)) + "^";
        format!(
            "{source_line}\n{caret}\n{err}",
            source_line = source_line,
            caret = caret,
            err = self
        )
    }
}

/// Static rejection of a script, either a syntax error or a construct outside
/// the capability surface.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error("SyntaxError: {0}")]
    Syntax(#[from] ParseError),

    #[error("line {line}: {message}")]
    Forbidden { message: String, line: usize },
}

impl CompileError {
    pub fn forbidden(message: impl Into<String>, line: usize) -> Self {
        CompileError::Forbidden {
            message: message.into(),
            line,
        }
    }

    pub fn line(&self) -> Option<usize> {
        match self {
            CompileError::Syntax(e) => Some(e.line),
            CompileError::Forbidden { line, .. } => Some(*line),
        }
    }
}

/// Failure category of a single evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum ErrorKind {
    CompileFailure,
    RuntimeFailure,
    TimeoutFailure,
    ContractViolation,
}

impl ErrorKind {
    /// Timeouts and contract violations report like runtime failures.
    pub fn is_runtime(self) -> bool {
        !matches!(self, ErrorKind::CompileFailure)
    }
}

/// Outcome error of one (script, row) evaluation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("Compilation error: {0}")]
    Compile(#[from] CompileError),

    #[error("{class}: {message}")]
    Runtime { class: String, message: String },

    #[error("TimeoutError: script exceeded the {}s execution budget", .budget.as_secs_f64())]
    Timeout { budget: Duration },

    #[error("Return value must be a number, bool, or None, got {type_name}")]
    Contract { type_name: String },
}

impl EvalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EvalError::Compile(_) => ErrorKind::CompileFailure,
            EvalError::Runtime { .. } => ErrorKind::RuntimeFailure,
            EvalError::Timeout { .. } => ErrorKind::TimeoutFailure,
            EvalError::Contract { .. } => ErrorKind::ContractViolation,
        }
    }
}

/// Top-level error type for quantscript.
#[derive(Debug, thiserror::Error)]
pub enum QuantscriptError {
    #[error("database error: {reason}")]
    Database { reason: String },

    #[error("database query error: {reason}")]
    DatabaseQuery { reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error("invalid parameter: {reason}")]
    Parameter { reason: String },

    #[error("script {id} not found")]
    ScriptNotFound { id: i64 },

    #[error("script IDs not found: {ids:?}")]
    ScriptsNotFound { ids: Vec<i64> },

    #[error("no active entities found")]
    NoActiveEntities,

    #[error("script validation failed: {0}")]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl QuantscriptError {
    pub fn parameter(reason: impl Into<String>) -> Self {
        QuantscriptError::Parameter {
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            QuantscriptError::ScriptNotFound { .. }
                | QuantscriptError::ScriptsNotFound { .. }
                | QuantscriptError::NoActiveEntities
        )
    }
}

impl From<&QuantscriptError> for std::process::ExitCode {
    fn from(err: &QuantscriptError) -> Self {
        let code: u8 = match err {
            QuantscriptError::Io(_) => 1,
            QuantscriptError::ConfigParse { .. }
            | QuantscriptError::ConfigMissing { .. }
            | QuantscriptError::ConfigInvalid { .. } => 2,
            QuantscriptError::Database { .. } | QuantscriptError::DatabaseQuery { .. } => 3,
            QuantscriptError::Compile(_) => 4,
            QuantscriptError::Parameter { .. } => 5,
            QuantscriptError::ScriptNotFound { .. }
            | QuantscriptError::ScriptsNotFound { .. }
            | QuantscriptError::NoActiveEntities => 6,
        };
        std::process::ExitCode::from(code)
    }
}
