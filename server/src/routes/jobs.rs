//! Job routes.

use axum::extract::{Path, Query, State};
use leadscout::queue::{Job, JobFilter};
use leadscout::JobPage;

use super::{ApiResponse, ApiResult};
use crate::state::AppState;

/// Query jobs with filters and pagination.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(filter): Query<JobFilter>,
) -> ApiResult<JobPage> {
    Ok(ApiResponse::ok(state.service.list_jobs(&filter)?))
}

/// Get a single job by ID.
pub async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Job> {
    Ok(ApiResponse::ok(state.service.get_job(&id)?))
}
