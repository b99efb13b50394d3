use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthData {
    status: u16,
    rooms: usize,
    telemetry_events: u64,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthData> {
    let health_data = HealthData {
        status: StatusCode::OK.as_u16(),
        rooms: state.rooms.stats().await.len(),
        telemetry_events: state.telemetry.emitted(),
    };
    Json(health_data)
}
