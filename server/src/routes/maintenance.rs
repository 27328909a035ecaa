use axum::extract::State;
use leadscout::ReaperReport;

use super::ApiResponse;
use crate::state::AppState;

/// Runs one reaper sweep and reports what it did.
pub async fn reap(State(state): State<AppState>) -> ApiResponse<ReaperReport> {
    ApiResponse::ok(state.service.reap())
}
