//! HTTP request handlers for the web adapter.

use axum::{
    Json,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, PathRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use crate::domain::error::QuantscriptError;
use crate::domain::operations::{CalculationService, ExecuteRequest};
use crate::domain::row::ListQuery;
use crate::domain::script::ScriptUpdate;

use super::{AppState, Envelope, WebError};

/// Runs `f` on the blocking pool; every service call touches the store or
/// the evaluator.
async fn blocking<T, F>(state: &AppState, f: F) -> Result<T, WebError>
where
    F: FnOnce(&CalculationService) -> Result<T, QuantscriptError> + Send + 'static,
    T: Send + 'static,
{
    let service = Arc::clone(&state.service);
    tokio::task::spawn_blocking(move || f(&service))
        .await
        .map_err(|e| WebError::internal(format!("worker task failed: {e}")))?
        .map_err(WebError::from)
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, WebError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| WebError::bad_request(rejection.body_text()))
}

fn script_id(path: Result<Path<i64>, PathRejection>) -> Result<i64, WebError> {
    path.map(|Path(id)| id)
        .map_err(|rejection| WebError::bad_request(rejection.body_text()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ExecuteBody {
    pub script: Option<String>,
    pub script_id: Option<i64>,
    pub column_name: Option<String>,
    #[serde(alias = "symbols")]
    pub stock_symbols: Option<Vec<String>>,
}

pub async fn execute(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ExecuteBody>, JsonRejection>,
) -> Result<Response, WebError> {
    let payload = body(payload)?;
    let request = ExecuteRequest {
        script: payload.script,
        script_id: payload.script_id,
        column_name: payload.column_name,
        symbols: payload.stock_symbols.unwrap_or_default(),
    };

    let response = blocking(&state, move |service| service.execute(request)).await?;
    let message = format!("processed {} symbols", response.batch.results.len());
    Ok(Envelope::ok(response, message).into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ValidateBody {
    #[serde(alias = "code")]
    pub script: Option<String>,
}

pub async fn validate(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ValidateBody>, JsonRejection>,
) -> Result<Response, WebError> {
    let source = body(payload)?.script.unwrap_or_default();
    let report = blocking(&state, move |service| service.validate(&source)).await?;
    let message = if report.valid {
        "script is valid"
    } else {
        "script is invalid"
    };
    Ok(Envelope::ok(report, message).into_response())
}

pub async fn functions(State(state): State<Arc<AppState>>) -> Response {
    Envelope::ok(state.service.functions(), "success").into_response()
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ScriptBody {
    pub name: Option<String>,
    pub code: Option<String>,
    pub description: Option<String>,
}

pub async fn list_scripts(State(state): State<Arc<AppState>>) -> Result<Response, WebError> {
    let scripts = blocking(&state, |service| service.list_scripts()).await?;
    let message = format!("found {} scripts", scripts.len());
    Ok(Envelope::ok(scripts, message).into_response())
}

pub async fn create_script(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ScriptBody>, JsonRejection>,
) -> Result<Response, WebError> {
    let payload = body(payload)?;
    let script = blocking(&state, move |service| {
        service.create_script(
            payload.name.as_deref().unwrap_or_default(),
            payload.code.as_deref().unwrap_or_default(),
            payload.description.as_deref(),
        )
    })
    .await?;
    Ok(Envelope::ok(script, "script created").into_response())
}

pub async fn get_script(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> Result<Response, WebError> {
    let id = script_id(path)?;
    let script = blocking(&state, move |service| service.get_script(id)).await?;
    Ok(Envelope::ok(script, "success").into_response())
}

pub async fn update_script(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
    payload: Result<Json<ScriptBody>, JsonRejection>,
) -> Result<Response, WebError> {
    let id = script_id(path)?;
    let payload = body(payload)?;
    let update = ScriptUpdate::new(
        payload.name.as_deref(),
        payload.code.as_deref(),
        payload.description.as_deref(),
    );
    let script = blocking(&state, move |service| service.update_script(id, &update)).await?;
    Ok(Envelope::ok(script, "script updated").into_response())
}

pub async fn delete_script(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> Result<Response, WebError> {
    let id = script_id(path)?;
    blocking(&state, move |service| service.delete_script(id)).await?;
    Ok(Envelope::ok((), "script deleted").into_response())
}

/// Parses the list query string. `script_ids` may repeat, so the pairs are
/// read in order instead of into a struct.
fn list_params(pairs: &[(String, String)]) -> Result<(ListQuery, Vec<i64>), WebError> {
    let mut query = ListQuery::default();
    let mut script_ids = Vec::new();

    for (key, value) in pairs {
        match key.as_str() {
            "market_code" if !value.is_empty() => query.market_code = Some(value.clone()),
            "is_active" => query.active_only = value.eq_ignore_ascii_case("y"),
            "limit" => {
                let limit: i64 = value
                    .parse()
                    .map_err(|_| WebError::bad_request(format!("invalid limit '{value}'")))?;
                if limit <= 0 {
                    return Err(WebError::bad_request("limit must be greater than 0"));
                }
                query.limit = limit as usize;
            }
            "offset" => {
                let offset: i64 = value
                    .parse()
                    .map_err(|_| WebError::bad_request(format!("invalid offset '{value}'")))?;
                if offset < 0 {
                    return Err(WebError::bad_request("offset must not be negative"));
                }
                query.offset = offset as usize;
            }
            "script_ids" => {
                let id = value
                    .trim()
                    .parse()
                    .map_err(|_| WebError::bad_request(format!("Invalid script_ids: '{value}'")))?;
                script_ids.push(id);
            }
            _ => {}
        }
    }
    Ok((query, script_ids))
}

pub async fn list_rows(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Response, WebError> {
    let (query, script_ids) = list_params(&pairs)?;
    let listing =
        blocking(&state, move |service| service.list_rows(&query, &script_ids)).await?;
    let message = format!("found {} rows", listing.count);
    Ok(Envelope::ok(listing.rows, message)
        .with_total(listing.total, listing.count)
        .into_response())
}

pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let reachable = blocking(&state, |service| service.active_entity_count()).await;
    match reachable {
        Ok(active) => {
            let data = serde_json::json!({
                "status": "healthy",
                "database": "connected",
                "active_entities": active,
                "version": env!("CARGO_PKG_VERSION"),
            });
            Envelope::ok(data, "service is healthy").into_response()
        }
        Err(err) => {
            info!(detail = ?err.detail, "health check failed");
            WebError::new(StatusCode::SERVICE_UNAVAILABLE, "service unavailable")
                .with_detail(err.detail.unwrap_or(err.message))
                .into_response()
        }
    }
}

pub async fn not_found() -> WebError {
    WebError::new(StatusCode::NOT_FOUND, "not found")
}
