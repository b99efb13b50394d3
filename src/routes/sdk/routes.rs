use std::collections::BTreeMap;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tracing::{debug, error};

use super::{EvaluateRequest, EvaluateResponse};
use crate::evaluation::{self, EvaluationResult};
use crate::routes::snapshot::find_environment;
use crate::state::AppState;
use crate::telemetry::{Origin, TelemetryEvent};

/// Evaluate every flag server-side for clients that hold no snapshot
pub async fn evaluate(
    State(state): State<AppState>,
    Path(environment_key): Path<String>,
    Json(request): Json<EvaluateRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
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

    let context = request.context;
    let started = Instant::now();
    let results = evaluation::evaluate_all(&snapshot, &context);
    let elapsed_us = started.elapsed().as_micros() as u64;

    if !results.is_empty() && state.telemetry.has_observers(environment.project_id) {
        let per_flag_us = elapsed_us / results.len() as u64;
        let events: Vec<TelemetryEvent> = results
            .iter()
            .map(|result| {
                TelemetryEvent::new(
                    environment.id,
                    result.clone(),
                    &context,
                    per_flag_us,
                    Origin::Server,
                )
            })
            .collect();
        state.telemetry.emit_all(environment.project_id, events);
    }

    let flags: BTreeMap<String, EvaluationResult> = results
        .into_iter()
        .map(|result| (result.flag_key.clone(), result))
        .collect();

    debug!(
        environment_key = %environment.key,
        version = snapshot.version,
        flags = flags.len(),
        "Evaluated flags server-side"
    );

    Ok(Json(EvaluateResponse {
        environment_key: environment.key,
        version: snapshot.version,
        flags,
    }))
}
