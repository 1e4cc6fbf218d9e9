//! Web server adapter: the JSON API over [`CalculationService`].
//!
//! Every response is wrapped in an envelope carrying `code`, `message` and
//! `timestamp`; successes add `data`, failures add `error: true` and `detail`.

mod error;
mod handlers;

pub use error::{WebError, status_from_error};
pub use handlers::*;

use axum::{
    Json, Router,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::domain::error::QuantscriptError;
use crate::domain::operations::CalculationService;
use crate::domain::script::now_china;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:5000";

pub struct AppState {
    pub service: Arc<CalculationService>,
}

/// Success envelope.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub code: u16,
    pub message: String,
    pub timestamp: String,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self {
            code: 200,
            message: message.into(),
            timestamp: timestamp(),
            data,
            total: None,
            count: None,
        }
    }

    pub fn with_total(mut self, total: usize, count: usize) -> Self {
        self.total = Some(total);
        self.count = Some(count);
        self
    }
}

impl<T: Serialize> IntoResponse for Envelope<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// Wall-clock time in UTC+8, second precision.
pub(crate) fn timestamp() -> String {
    now_china().format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/custom-calculations/execute", post(handlers::execute))
        .route("/api/custom-calculations/validate", post(handlers::validate))
        .route("/api/custom-calculations/functions", get(handlers::functions))
        .route(
            "/api/custom-calculations/scripts",
            get(handlers::list_scripts).post(handlers::create_script),
        )
        .route(
            "/api/custom-calculations/scripts/{id}",
            get(handlers::get_script)
                .put(handlers::update_script)
                .delete(handlers::delete_script),
        )
        .route("/api/stock-price/list", get(handlers::list_rows))
        .fallback(handlers::not_found)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(Arc::new(state))
}

/// Binds `listen` and serves until the process is stopped.
pub async fn serve(service: Arc<CalculationService>, listen: &str) -> Result<(), QuantscriptError> {
    let app = build_router(AppState { service });
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(listen = %listen, "web server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
