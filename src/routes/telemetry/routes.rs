use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{validate_batch, IngestResponse, EVALUATION_EVENT, MAX_INGEST_BATCH};
use crate::state::AppState;
use crate::telemetry::TelemetryEvent;

/// Accept a batch of SDK-side evaluations and fan it out to observers
pub async fn ingest(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Json(events): Json<Vec<TelemetryEvent>>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    validate_batch(&events).map_err(|e| {
        let status = if events.len() > MAX_INGEST_BATCH {
            StatusCode::PAYLOAD_TOO_LARGE
        } else {
            StatusCode::UNPROCESSABLE_ENTITY
        };
        (status, e)
    })?;

    let accepted = events.len();
    state.telemetry.emit_all(project_id, events);
    debug!(project_id = %project_id, accepted, "Telemetry batch ingested");

    Ok((StatusCode::ACCEPTED, Json(IngestResponse { accepted })))
}

/// Live evaluation feed for a project's dashboard
pub async fn stream(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let observer = state.telemetry.subscribe(project_id);
    info!(
        project_id = %project_id,
        observers = state.telemetry.observer_count(project_id),
        "Telemetry observer connected"
    );

    let events = observer.into_stream().filter_map(|event| async move {
        match serde_json::to_string(&event) {
            Ok(json) => Some(Ok(Event::default().event(EVALUATION_EVENT).data(json))),
            Err(e) => {
                warn!(flag_key = %event.flag_key, error = %e, "Failed to serialize telemetry event");
                None
            }
        }
    });

    Sse::new(events).keep_alive(KeepAlive::new().interval(state.sse_keepalive))
}
