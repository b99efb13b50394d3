use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::Value;
use tracing::{debug, error};
use uuid::Uuid;

use super::{preview_context, PreviewEntry, PreviewRequest, PreviewResponse};
use crate::evaluation;
use crate::state::AppState;

const MAX_PREVIEW_ENVIRONMENTS: usize = 50;

/// What would this flag return in each environment?
///
/// Evaluates against each environment's published snapshot, so unpublished
/// edits are not reflected.
pub async fn preview(
    State(state): State<AppState>,
    Path(flag_id): Path<Uuid>,
    Json(request): Json<PreviewRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if request.environment_ids.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "environment_ids cannot be empty".to_string(),
        ));
    }
    if request.environment_ids.len() > MAX_PREVIEW_ENVIRONMENTS {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("At most {} environments per preview", MAX_PREVIEW_ENVIRONMENTS),
        ));
    }

    let context = preview_context(request.context);
    let mut environments = Vec::with_capacity(request.environment_ids.len());

    for environment_id in request.environment_ids {
        let environment = state.sources.environment(environment_id).await.map_err(|e| {
            error!(environment_id = %environment_id, error = %e, "Failed to fetch environment");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to fetch environment".to_string(),
            )
        })?;
        if environment.is_none() {
            environments.push(PreviewEntry::failed(environment_id, "environment not found"));
            continue;
        }

        let snapshot = match state.rooms.current(environment_id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                environments.push(PreviewEntry::failed(environment_id, "environment not published"));
                continue;
            }
            Err(e) => {
                environments.push(PreviewEntry::failed(environment_id, e.to_string()));
                continue;
            }
        };

        let Some(flag) = snapshot.flag_by_id(flag_id) else {
            environments.push(PreviewEntry {
                environment_id,
                version: Some(snapshot.version),
                result: None,
                error: Some("flag not in published snapshot".to_string()),
            });
            continue;
        };

        let result = evaluation::evaluate(&snapshot, &flag.key, &context, &Value::Null);
        debug!(
            flag_id = %flag_id,
            environment_id = %environment_id,
            reason = result.reason.as_str(),
            "Preview evaluated"
        );
        environments.push(PreviewEntry {
            environment_id,
            version: Some(snapshot.version),
            result: Some(result),
            error: None,
        });
    }

    Ok(Json(PreviewResponse {
        flag_id,
        context,
        environments,
    }))
}
