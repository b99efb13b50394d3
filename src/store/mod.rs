pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::snapshot::{Snapshot, SourceRecords};

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct EnvironmentRecord {
    pub id: Uuid,
    pub project_id: Uuid,
    /// Globally unique; SDKs address environments by key.
    pub key: String,
}

/// Read-only view of the records the CRUD side owns.
#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn environment(&self, id: Uuid) -> Result<Option<EnvironmentRecord>>;
    async fn environment_by_key(&self, key: &str) -> Result<Option<EnvironmentRecord>>;
    async fn project_environments(&self, project_id: Uuid) -> Result<Vec<EnvironmentRecord>>;
    /// Flags, per-environment targeting and segments for one environment.
    async fn load_records(&self, environment: &EnvironmentRecord) -> Result<SourceRecords>;
}

/// Durable copy of published snapshots, so a cold room can recover.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn latest(&self, environment_id: Uuid) -> Result<Option<Snapshot>>;
    /// Fails with `StoreError::VersionConflict` if the version is already stored.
    async fn save(&self, snapshot: &Snapshot) -> Result<()>;
    /// Drop all but the newest `retain` snapshots; returns how many went.
    async fn prune(&self, environment_id: Uuid, retain: usize) -> Result<u64>;
}
