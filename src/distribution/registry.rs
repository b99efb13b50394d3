use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::room::{self, PublishOutcome, RoomConfig, RoomHandle, RoomStats, Subscription};
use crate::error::RoomUnavailable;
use crate::snapshot::Snapshot;
use crate::store::SnapshotStore;

/// A room may stop between lookup and request; one respawn covers that.
const ATTEMPTS: usize = 2;

/// Addresses rooms by environment id, spawning (or respawning after
/// hibernation) on demand.
pub struct RoomRegistry {
    rooms: Mutex<HashMap<Uuid, RoomHandle>>,
    store: Arc<dyn SnapshotStore>,
    config: RoomConfig,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn SnapshotStore>, config: RoomConfig) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            store,
            config,
        }
    }

    /// The live room for an environment.
    pub fn room(&self, environment_id: Uuid) -> RoomHandle {
        let mut rooms = self.rooms.lock();
        if let Some(handle) = rooms.get(&environment_id) {
            if !handle.is_closed() {
                return handle.clone();
            }
            debug!(environment_id = %environment_id, "Respawning hibernated room");
        }

        let handle = room::spawn(environment_id, self.store.clone(), self.config.clone());
        rooms.insert(environment_id, handle.clone());
        handle
    }

    pub async fn subscribe(&self, environment_id: Uuid) -> Result<Subscription, RoomUnavailable> {
        let mut last = RoomUnavailable(environment_id);
        for _ in 0..ATTEMPTS {
            match self.room(environment_id).subscribe().await {
                Ok(subscription) => return Ok(subscription),
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    pub async fn publish(&self, snapshot: Arc<Snapshot>) -> Result<PublishOutcome, RoomUnavailable> {
        let environment_id = snapshot.environment_id;
        let mut last = RoomUnavailable(environment_id);
        for _ in 0..ATTEMPTS {
            match self.room(environment_id).publish(snapshot.clone()).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    /// Latest snapshot, recovered from storage if the room was cold.
    pub async fn current(&self, environment_id: Uuid) -> Result<Option<Arc<Snapshot>>, RoomUnavailable> {
        let mut last = RoomUnavailable(environment_id);
        for _ in 0..ATTEMPTS {
            match self.room(environment_id).current().await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    /// Stats for every running room. Hibernated rooms are forgotten here.
    pub async fn stats(&self) -> Vec<RoomStats> {
        let handles: Vec<RoomHandle> = {
            let mut rooms = self.rooms.lock();
            rooms.retain(|_, handle| !handle.is_closed());
            rooms.values().cloned().collect()
        };

        let mut stats = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(room_stats) = handle.stats().await {
                stats.push(room_stats);
            }
        }
        stats.sort_by_key(|s| s.environment_id);
        stats
    }
}
