//! State-sync channel endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use skein_core::{ChannelSnapshot, SyncEvent};

use crate::AppState;

/// Build the state router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_channels).delete(clear_all))
        .route("/:channel", get(get_snapshot).delete(clear_channel))
        .route("/:channel/events", get(get_events))
        .route("/:channel/stream", get(stream_channel))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub since: u64,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub channel: String,
    pub events: Vec<SyncEvent>,
    /// Lowest seq still held for the channel
    pub earliest_seq: Option<u64>,
    /// True when events after `since` were already evicted
    pub truncated: bool,
}

async fn list_channels(State(state): State<AppState>) -> Json<Vec<ChannelSnapshot>> {
    Json(state.sync.list_channels())
}

async fn get_snapshot(
    State(state): State<AppState>,
    Path(channel): Path<String>,
) -> Json<ChannelSnapshot> {
    Json(state.sync.get_snapshot(&channel))
}

/// Replay retained events after the `since` cursor
async fn get_events(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Json<EventsResponse> {
    let limit = query.limit.unwrap_or_else(|| state.sync.max_events());
    let events = state.sync.get_events_since(&channel, query.since, limit);
    let earliest_seq = state.sync.earliest_retained_seq(&channel);
    let truncated = earliest_seq.is_some_and(|earliest| earliest > query.since.saturating_add(1));

    Json(EventsResponse {
        channel,
        events,
        earliest_seq,
        truncated,
    })
}

/// Server-sent events: the current snapshot, then every update
async fn stream_channel(
    State(state): State<AppState>,
    Path(channel): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    tracing::debug!(channel = %channel, "State stream opened");
    let stream = state
        .sync
        .stream(&channel)
        .map(|frame| Event::default().event(frame.kind()).json_data(&frame));

    Sse::new(stream).keep_alive(
        KeepAlive::new().interval(state.config.state_sync.stream_heartbeat()),
    )
}

async fn clear_channel(State(state): State<AppState>, Path(channel): Path<String>) -> StatusCode {
    state.sync.clear(Some(&channel));
    StatusCode::NO_CONTENT
}

async fn clear_all(State(state): State<AppState>) -> StatusCode {
    state.sync.clear(None);
    StatusCode::NO_CONTENT
}
