use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tracing::error;
use uuid::Uuid;

use super::{DistributionStatsResponse, ProjectPublishResponse, PublishResponse};
use crate::state::AppState;

/// Build and distribute a new snapshot for one environment
pub async fn publish_environment(
    State(state): State<AppState>,
    Path(environment_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let snapshot = state
        .publisher
        .publish(environment_id)
        .await
        .map_err(|e| {
            error!(environment_id = %environment_id, error = %e, "Failed to publish environment");
            (e.status(), e.to_string())
        })?;

    let response = PublishResponse {
        environment_id,
        version: snapshot.version,
        flags: snapshot.flags.len(),
        segments: snapshot.segments.len(),
    };

    Ok((StatusCode::CREATED, Json(response)))
}

/// Publish every environment of a project
pub async fn publish_project(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let environments = state
        .publisher
        .publish_all(project_id)
        .await
        .map_err(|e| {
            error!(project_id = %project_id, error = %e, "Failed to publish project");
            (e.status(), e.to_string())
        })?;

    let status = if environments.iter().all(|r| r.error.is_none()) {
        StatusCode::CREATED
    } else {
        StatusCode::MULTI_STATUS
    };

    Ok((
        status,
        Json(ProjectPublishResponse {
            project_id,
            environments,
        }),
    ))
}

/// Version and subscriber count of each live room
pub async fn stats(State(state): State<AppState>) -> Json<DistributionStatsResponse> {
    let rooms = state.rooms.stats().await;
    let total_subscribers = rooms.iter().map(|r| r.subscribers).sum();
    Json(DistributionStatsResponse {
        rooms,
        total_subscribers,
    })
}
