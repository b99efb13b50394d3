use std::sync::Arc;

use sqlx::PgPool;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flagcast::config::Config;
use flagcast::routes;
use flagcast::state::AppState;
use flagcast::store::{MemoryStore, PgStore, SnapshotStore, SourceStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    let (sources, snapshots): (Arc<dyn SourceStore>, Arc<dyn SnapshotStore>) =
        match &config.database_url {
            Some(url) => {
                let pool = PgPool::connect(url).await?;
                let store = Arc::new(PgStore::new(pool));
                store.migrate().await?;
                info!("Connected to Postgres, migrations applied");
                (store.clone() as Arc<dyn SourceStore>, store as Arc<dyn SnapshotStore>)
            }
            None => {
                warn!("DATABASE_URL not set, using the in-memory store");
                let store = Arc::new(MemoryStore::new());
                (store.clone() as Arc<dyn SourceStore>, store as Arc<dyn SnapshotStore>)
            }
        };

    let state = AppState::new(
        sources,
        snapshots,
        config.room_config(),
        config.telemetry_queue,
        config.snapshot_retain,
        config.sse_keepalive(),
    );

    let app = routes::routes()
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(config.addr()).await?;
    info!("Listening on http://{}", config.addr());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
