use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{EnvironmentRecord, Result, SnapshotStore, SourceStore};
use crate::error::StoreError;
use crate::snapshot::{Snapshot, SourceRecords};

#[derive(Default)]
struct Inner {
    environments: HashMap<Uuid, EnvironmentRecord>,
    records: HashMap<Uuid, SourceRecords>,
    /// Oldest first.
    snapshots: HashMap<Uuid, Vec<Snapshot>>,
}

/// Process-local store used when no database is configured, and in tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_environment(&self, environment: EnvironmentRecord) {
        self.inner
            .write()
            .environments
            .insert(environment.id, environment);
    }

    /// Replace the source records of an environment, as the CRUD side would.
    pub fn put_records(&self, environment_id: Uuid, records: SourceRecords) {
        self.inner.write().records.insert(environment_id, records);
    }

    pub fn snapshot_count(&self, environment_id: Uuid) -> usize {
        self.inner
            .read()
            .snapshots
            .get(&environment_id)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl SourceStore for MemoryStore {
    async fn environment(&self, id: Uuid) -> Result<Option<EnvironmentRecord>> {
        Ok(self.inner.read().environments.get(&id).cloned())
    }

    async fn environment_by_key(&self, key: &str) -> Result<Option<EnvironmentRecord>> {
        Ok(self
            .inner
            .read()
            .environments
            .values()
            .find(|e| e.key == key)
            .cloned())
    }

    async fn project_environments(&self, project_id: Uuid) -> Result<Vec<EnvironmentRecord>> {
        let mut environments: Vec<_> = self
            .inner
            .read()
            .environments
            .values()
            .filter(|e| e.project_id == project_id)
            .cloned()
            .collect();
        environments.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(environments)
    }

    async fn load_records(&self, environment: &EnvironmentRecord) -> Result<SourceRecords> {
        Ok(self
            .inner
            .read()
            .records
            .get(&environment.id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn latest(&self, environment_id: Uuid) -> Result<Option<Snapshot>> {
        Ok(self
            .inner
            .read()
            .snapshots
            .get(&environment_id)
            .and_then(|history| history.last().cloned()))
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let mut inner = self.inner.write();
        let history = inner.snapshots.entry(snapshot.environment_id).or_default();
        if history.iter().any(|s| s.version == snapshot.version) {
            return Err(StoreError::VersionConflict {
                environment_id: snapshot.environment_id,
                version: snapshot.version,
            });
        }
        history.push(snapshot.clone());
        history.sort_by_key(|s| s.version);
        Ok(())
    }

    async fn prune(&self, environment_id: Uuid, retain: usize) -> Result<u64> {
        let mut inner = self.inner.write();
        let Some(history) = inner.snapshots.get_mut(&environment_id) else {
            return Ok(0);
        };
        let excess = history.len().saturating_sub(retain.max(1));
        history.drain(..excess);
        Ok(excess as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(key: &str, project_id: Uuid) -> EnvironmentRecord {
        EnvironmentRecord {
            id: Uuid::new_v4(),
            project_id,
            key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_environment_lookup() {
        let store = MemoryStore::new();
        let project = Uuid::new_v4();
        let production = env("production", project);
        store.insert_environment(production.clone());
        store.insert_environment(env("staging", project));
        store.insert_environment(env("other", Uuid::new_v4()));

        assert_eq!(store.environment(production.id).await.unwrap(), Some(production.clone()));
        assert_eq!(
            store.environment_by_key("production").await.unwrap(),
            Some(production)
        );
        assert!(store.environment_by_key("missing").await.unwrap().is_none());

        let keys: Vec<_> = store
            .project_environments(project)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["production", "staging"]);
    }

    #[tokio::test]
    async fn test_latest_and_prune() {
        let store = MemoryStore::new();
        let env_id = Uuid::new_v4();
        assert!(store.latest(env_id).await.unwrap().is_none());

        for version in 1..=5 {
            let mut snapshot = Snapshot::empty(env_id);
            snapshot.version = version;
            store.save(&snapshot).await.unwrap();
        }
        assert_eq!(store.latest(env_id).await.unwrap().unwrap().version, 5);

        let removed = store.prune(env_id, 2).await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(store.snapshot_count(env_id), 2);
        assert_eq!(store.latest(env_id).await.unwrap().unwrap().version, 5);
    }

    #[tokio::test]
    async fn test_prune_keeps_latest_even_with_zero_retain() {
        let store = MemoryStore::new();
        let env_id = Uuid::new_v4();
        let mut snapshot = Snapshot::empty(env_id);
        snapshot.version = 1;
        store.save(&snapshot).await.unwrap();

        store.prune(env_id, 0).await.unwrap();
        assert_eq!(store.snapshot_count(env_id), 1);
    }

    #[tokio::test]
    async fn test_saved_version_is_immutable() {
        let store = MemoryStore::new();
        let env_id = Uuid::new_v4();
        let mut first = Snapshot::empty(env_id);
        first.version = 1;
        store.save(&first).await.unwrap();

        let mut rival = Snapshot::empty(env_id);
        rival.version = 1;
        rival.created_at = first.created_at + chrono::Duration::seconds(5);
        let err = store.save(&rival).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict { version: 1, .. }
        ));

        assert_eq!(store.snapshot_count(env_id), 1);
        assert_eq!(store.latest(env_id).await.unwrap().unwrap(), first);
    }
}
