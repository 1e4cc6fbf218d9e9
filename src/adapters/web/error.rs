//! JSON error responses for the web adapter.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::error;

use crate::domain::error::QuantscriptError;

use super::timestamp;

#[derive(Debug)]
pub struct WebError {
    pub status: StatusCode,
    pub message: String,
    pub detail: Option<String>,
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    code: u16,
    message: &'a str,
    timestamp: String,
    error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<&'a str>,
}

impl WebError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid parameter").with_detail(detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error").with_detail(detail)
    }
}

pub fn status_from_error(err: &QuantscriptError) -> StatusCode {
    match err {
        QuantscriptError::Parameter { .. } | QuantscriptError::Compile(_) => {
            StatusCode::BAD_REQUEST
        }
        QuantscriptError::ScriptNotFound { .. }
        | QuantscriptError::ScriptsNotFound { .. }
        | QuantscriptError::NoActiveEntities => StatusCode::NOT_FOUND,
        QuantscriptError::Database { .. }
        | QuantscriptError::DatabaseQuery { .. }
        | QuantscriptError::ConfigParse { .. }
        | QuantscriptError::ConfigMissing { .. }
        | QuantscriptError::ConfigInvalid { .. }
        | QuantscriptError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<QuantscriptError> for WebError {
    fn from(err: QuantscriptError) -> Self {
        let status = status_from_error(&err);
        let message = match &err {
            QuantscriptError::Parameter { .. } => "invalid parameter",
            QuantscriptError::Compile(_) => "script validation failed",
            QuantscriptError::ScriptNotFound { .. } | QuantscriptError::ScriptsNotFound { .. } => {
                "script not found"
            }
            QuantscriptError::NoActiveEntities => "no active entities",
            _ => "internal error",
        };
        let detail = match &err {
            QuantscriptError::Parameter { reason } => reason.clone(),
            QuantscriptError::ScriptsNotFound { ids } => format!("Script IDs not found: {ids:?}"),
            other => other.to_string(),
        };
        if status.is_server_error() {
            error!(error = %err, "request failed");
        }
        Self::new(status, message).with_detail(detail)
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            code: self.status.as_u16(),
            message: &self.message,
            timestamp: timestamp(),
            error: true,
            detail: self.detail.as_deref(),
        };
        (self.status, Json(body)).into_response()
    }
}
