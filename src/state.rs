use std::sync::Arc;
use std::time::Duration;

use crate::distribution::{Publisher, RoomConfig, RoomRegistry};
use crate::store::{SnapshotStore, SourceStore};
use crate::telemetry::TelemetryHub;

#[derive(Clone)]
pub struct AppState {
    pub sources: Arc<dyn SourceStore>,
    pub rooms: Arc<RoomRegistry>,
    pub publisher: Arc<Publisher>,
    pub telemetry: Arc<TelemetryHub>,
    pub sse_keepalive: Duration,
}

impl AppState {
    pub fn new(
        sources: Arc<dyn SourceStore>,
        snapshots: Arc<dyn SnapshotStore>,
        room_config: RoomConfig,
        telemetry_queue: usize,
        snapshot_retain: usize,
        sse_keepalive: Duration,
    ) -> Self {
        let rooms = Arc::new(RoomRegistry::new(snapshots.clone(), room_config));
        let publisher = Arc::new(Publisher::new(
            sources.clone(),
            snapshots,
            rooms.clone(),
            snapshot_retain,
        ));

        Self {
            sources,
            rooms,
            publisher,
            telemetry: TelemetryHub::new(telemetry_queue),
            sse_keepalive,
        }
    }
}
