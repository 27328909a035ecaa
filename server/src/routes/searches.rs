//! Search routes.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::stream::{self, Stream, StreamExt};
use leadscout::cancel::Cancelled;
use leadscout::progress::{Delivery, SearchSubscription};
use leadscout::{
    NewSearch, ProgressSnapshot, RunMode, Search, SearchService, SearchStatus, StartOutcome,
};
use serde::{Deserialize, Serialize};

use super::{ApiResponse, ApiResult};
use crate::state::AppState;

/// Body of start and retry requests.
#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub user_id: String,
    /// Run in the request instead of the worker pool.
    #[serde(default)]
    pub foreground: bool,
}

impl TriggerRequest {
    fn mode(&self) -> RunMode {
        if self.foreground {
            RunMode::Foreground
        } else {
            RunMode::Background
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub search_id: String,
    pub already_cancelled: bool,
}

pub async fn create_search(
    State(state): State<AppState>,
    Json(request): Json<NewSearch>,
) -> ApiResult<Search> {
    Ok(ApiResponse::ok(state.service.create_search(request)?))
}

/// Filters for listing searches.
#[derive(Debug, Deserialize)]
pub struct ListSearchesQuery {
    pub owner_id: String,
    pub status: Option<SearchStatus>,
}

/// Lists an owner's searches, newest first.
pub async fn list_searches(
    State(state): State<AppState>,
    Query(query): Query<ListSearchesQuery>,
) -> ApiResult<Vec<Search>> {
    Ok(ApiResponse::ok(
        state.service.list_searches(&query.owner_id, query.status)?,
    ))
}

pub async fn get_search(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Search> {
    Ok(ApiResponse::ok(state.service.get_search(&id)?))
}

pub async fn start_search(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<TriggerRequest>,
) -> ApiResult<StartOutcome> {
    let outcome = state
        .service
        .start_orchestration(&id, &request.user_id, request.mode())
        .await?;
    Ok(ApiResponse::ok(outcome))
}

pub async fn retry_search(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<TriggerRequest>,
) -> ApiResult<StartOutcome> {
    let outcome = state
        .service
        .retry(&id, &request.user_id, request.mode())
        .await?;
    Ok(ApiResponse::ok(outcome))
}

pub async fn cancel_search(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<CancelResponse> {
    let cancelled = state.service.cancel(&id)?;
    Ok(ApiResponse::ok(CancelResponse {
        search_id: id,
        already_cancelled: cancelled == Cancelled::Already,
    }))
}

pub async fn get_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ProgressSnapshot> {
    Ok(ApiResponse::ok(state.service.get_progress(&id)?))
}

/// Streams the search's events, starting with a snapshot. The stream ends
/// after a terminal event.
///
/// When the subscriber falls behind and events are dropped, a `resync` event
/// carrying a fresh snapshot takes their place.
pub async fn search_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, super::ApiError> {
    // Subscribe first so nothing lands between the snapshot and the stream.
    let subscription = state.service.subscribe(&id)?;
    let snapshot = state.service.get_progress(&id)?;
    let settled = snapshot.status.is_terminal();

    let initial = stream::once(async move {
        Ok::<Event, Infallible>(Event::default().event("snapshot").data(to_json(&snapshot)))
    });

    let feed = EventFeed {
        subscription,
        service: state.service.clone(),
    };
    let live = stream::unfold((!settled).then_some(feed), next_event);

    Ok(Sse::new(initial.chain(live)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("hb"),
    ))
}

struct EventFeed {
    subscription: SearchSubscription,
    service: SearchService,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Resync {
    skipped: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot: Option<ProgressSnapshot>,
}

async fn next_event(
    feed: Option<EventFeed>,
) -> Option<(Result<Event, Infallible>, Option<EventFeed>)> {
    let mut feed = feed?;
    match feed.subscription.next().await? {
        Delivery::Event(event) => {
            let sse = Event::default().event(event.kind.name()).data(to_json(&event));
            let next = if event.is_terminal() {
                None
            } else {
                Some(feed)
            };
            Some((Ok(sse), next))
        }
        Delivery::Lagged(skipped) => {
            let snapshot = match feed.service.get_progress(feed.subscription.search_id()) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    log::warn!("Resync snapshot failed: {}", e);
                    None
                }
            };
            // The dropped events may have included the terminal one.
            let settled = snapshot.as_ref().is_some_and(|s| s.status.is_terminal());
            let sse = Event::default()
                .event("resync")
                .data(to_json(&Resync { skipped, snapshot }));
            Some((Ok(sse), (!settled).then_some(feed)))
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}
