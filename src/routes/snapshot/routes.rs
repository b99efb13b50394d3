use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::{Stream, StreamExt};
use tracing::{error, info, warn};

use super::{find_environment, if_none_match_version, SnapshotQuery};
use crate::sdk::transport::SNAPSHOT_EVENT;
use crate::state::AppState;

/// Current snapshot of an environment, with conditional fetch
pub async fn fetch(
    State(state): State<AppState>,
    Path(environment_key): Path<String>,
    Query(query): Query<SnapshotQuery>,
    headers: HeaderMap,
) -> Result<Response, (StatusCode, String)> {
    let environment = find_environment(&state, &environment_key).await?;

    let snapshot = state
        .rooms
        .current(environment.id)
        .await
        .map_err(|e| {
            error!(environment_id = %environment.id, error = %e, "Room unavailable");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        })?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                format!("Environment '{}' has not been published", environment_key),
            )
        })?;

    let known = query.version.or_else(|| if_none_match_version(&headers));
    if known.is_some_and(|version| version >= snapshot.version) {
        return Ok((StatusCode::NOT_MODIFIED, [(header::ETAG, snapshot.etag())]).into_response());
    }

    Ok((
        [
            (header::ETAG, snapshot.etag()),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Json(snapshot.as_ref()),
    )
        .into_response())
}

/// Push channel: every snapshot the room holds or receives, as SSE
pub async fn stream(
    State(state): State<AppState>,
    Path(environment_key): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    let environment = find_environment(&state, &environment_key).await?;

    let subscription = state.rooms.subscribe(environment.id).await.map_err(|e| {
        error!(environment_id = %environment.id, error = %e, "Room unavailable");
        (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    })?;

    info!(
        environment_id = %environment.id,
        environment_key = %environment.key,
        "Client connected to snapshot stream"
    );

    let events = subscription
        .into_stream()
        .filter_map(|snapshot| async move {
            match serde_json::to_string(snapshot.as_ref()) {
                Ok(json) => Some(Ok(Event::default()
                    .event(SNAPSHOT_EVENT)
                    .id(snapshot.version.to_string())
                    .data(json))),
                Err(e) => {
                    warn!(version = snapshot.version, error = %e, "Failed to serialize snapshot");
                    None
                }
            }
        });

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(state.sse_keepalive)))
}
