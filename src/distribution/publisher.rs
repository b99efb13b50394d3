use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::registry::RoomRegistry;
use super::room::PublishOutcome;
use crate::error::PublishError;
use crate::snapshot::{self, Snapshot};
use crate::store::{SnapshotStore, SourceStore};

/// Result of publishing one environment as part of a project-wide publish.
#[derive(Debug, Clone, Serialize)]
pub struct PublishReport {
    pub environment_id: Uuid,
    pub environment_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The publish workflow: build, persist, then push to the room.
pub struct Publisher {
    sources: Arc<dyn SourceStore>,
    snapshots: Arc<dyn SnapshotStore>,
    rooms: Arc<RoomRegistry>,
    retain: usize,
    /// One async lock per environment; version assignment needs strict order.
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl Publisher {
    pub fn new(
        sources: Arc<dyn SourceStore>,
        snapshots: Arc<dyn SnapshotStore>,
        rooms: Arc<RoomRegistry>,
        retain: usize,
    ) -> Self {
        Self {
            sources,
            snapshots,
            rooms,
            retain,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, environment_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(environment_id)
            .or_default()
            .clone()
    }

    pub async fn publish(&self, environment_id: Uuid) -> Result<Arc<Snapshot>, PublishError> {
        let environment = self
            .sources
            .environment(environment_id)
            .await?
            .ok_or(PublishError::EnvironmentNotFound(environment_id))?;

        let lock = self.lock_for(environment_id);
        let _guard = lock.lock().await;

        let previous = self.snapshots.latest(environment_id).await?;
        let records = self.sources.load_records(&environment).await?;
        let snapshot = Arc::new(snapshot::build(environment_id, records, previous.as_ref())?);

        // Durable first, so a room that respawns later sees this version
        self.snapshots.save(&snapshot).await?;

        match self.rooms.publish(snapshot.clone()).await {
            Ok(PublishOutcome::Applied { delivered, dropped }) => info!(
                environment_id = %environment_id,
                environment_key = %environment.key,
                version = snapshot.version,
                flags = snapshot.flags.len(),
                delivered,
                dropped,
                "Published snapshot"
            ),
            // A cold room loads the version just saved from storage
            Ok(PublishOutcome::Stale { current }) if current == snapshot.version => debug!(
                environment_id = %environment_id,
                version = snapshot.version,
                "Room recovered the snapshot from storage"
            ),
            Ok(PublishOutcome::Stale { current }) => warn!(
                environment_id = %environment_id,
                version = snapshot.version,
                current,
                "Room already holds a newer snapshot"
            ),
            Err(e) => warn!(
                environment_id = %environment_id,
                version = snapshot.version,
                error = %e,
                "Snapshot stored but not pushed; room will recover it"
            ),
        }

        match self.snapshots.prune(environment_id, self.retain).await {
            Ok(0) => {}
            Ok(removed) => info!(environment_id = %environment_id, removed, "Pruned superseded snapshots"),
            Err(e) => warn!(environment_id = %environment_id, error = %e, "Failed to prune snapshots"),
        }

        Ok(snapshot)
    }

    /// Publish every environment of a project concurrently.
    ///
    /// A failing environment does not stop the others; its error is in its report.
    pub async fn publish_all(&self, project_id: Uuid) -> Result<Vec<PublishReport>, PublishError> {
        let environments = self.sources.project_environments(project_id).await?;
        if environments.is_empty() {
            return Err(PublishError::ProjectNotFound(project_id));
        }

        let results = join_all(environments.iter().map(|e| self.publish(e.id))).await;

        let reports = environments
            .into_iter()
            .zip(results)
            .map(|(environment, result)| match result {
                Ok(snapshot) => PublishReport {
                    environment_id: environment.id,
                    environment_key: environment.key,
                    version: Some(snapshot.version),
                    error: None,
                },
                Err(e) => {
                    error!(
                        project_id = %project_id,
                        environment_id = %environment.id,
                        error = %e,
                        "Failed to publish environment"
                    );
                    PublishReport {
                        environment_id: environment.id,
                        environment_key: environment.key,
                        version: None,
                        error: Some(e.to_string()),
                    }
                }
            })
            .collect();

        Ok(reports)
    }
}
