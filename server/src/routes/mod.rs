//! HTTP routes.
//!
//! Routes are organized by domain:
//! - `searches`: intake, triggering, cancel, retry, progress and events
//! - `jobs`: job listing
//! - `maintenance`: on-demand reaper sweep

pub mod jobs;
pub mod maintenance;
pub mod searches;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use leadscout::ServiceError;
use serde::Serialize;

use crate::state::AppState;

/// Response wrapper for API calls.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// A [`ServiceError`] rendered as an error envelope with a matching status.
pub struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ServiceError::NotFound(_) | ServiceError::JobNotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::InvalidState { .. } => StatusCode::CONFLICT,
            ServiceError::Store(_) => {
                log::error!("Request failed: {}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ApiResponse::<()>::err(self.0.to_string()))).into_response()
    }
}

pub type ApiResult<T> = Result<ApiResponse<T>, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/searches",
            get(searches::list_searches).post(searches::create_search),
        )
        .route("/searches/{id}", get(searches::get_search))
        .route("/searches/{id}/start", post(searches::start_search))
        .route("/searches/{id}/cancel", post(searches::cancel_search))
        .route("/searches/{id}/retry", post(searches::retry_search))
        .route("/searches/{id}/progress", get(searches::get_progress))
        .route("/searches/{id}/events", get(searches::search_events))
        .route("/jobs", get(jobs::list_jobs))
        .route("/jobs/{id}", get(jobs::get_job))
        .route("/maintenance/reap", post(maintenance::reap))
        .with_state(state)
}

async fn healthz() -> ApiResponse<serde_json::Value> {
    ApiResponse::ok(serde_json::json!({ "ok": true }))
}
