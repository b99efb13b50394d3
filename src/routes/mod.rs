use axum::{
    routing::{get, post},
    Router,
};

mod health;
mod preview;
mod publish;
mod sdk;
mod snapshot;
mod telemetry;

pub use health::health;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    let distribution_router = Router::new()
        .route("/snapshot/{environment_key}", get(snapshot::routes::fetch))
        .route("/stream/{environment_key}", get(snapshot::routes::stream));

    let admin_router = Router::new()
        .route(
            "/environments/{environment_id}/publish",
            post(publish::routes::publish_environment),
        )
        .route(
            "/projects/{project_id}/publish",
            post(publish::routes::publish_project),
        )
        .route("/flags/{flag_id}/preview", post(preview::routes::preview))
        .route("/distribution/stats", get(publish::routes::stats));

    let telemetry_router = Router::new()
        .route("/{project_id}/events", post(telemetry::routes::ingest))
        .route("/{project_id}/stream", get(telemetry::routes::stream));

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .merge(distribution_router)
        .route("/sdk/evaluate/{environment_key}", post(sdk::routes::evaluate))
        .nest("/api", admin_router)
        .nest("/telemetry", telemetry_router)
}

async fn root() -> &'static str {
    "flagcast snapshot distribution"
}
