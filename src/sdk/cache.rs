use std::sync::Arc;

use parking_lot::RwLock;

use crate::snapshot::Snapshot;

/// Locally cached snapshot.
///
/// The lock guards only the pointer: readers clone the `Arc` and evaluate
/// without holding it, so an update never blocks an evaluation in progress.
#[derive(Default)]
pub struct SnapshotCache {
    current: RwLock<Option<Arc<Snapshot>>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> Option<Arc<Snapshot>> {
        self.current.read().clone()
    }

    pub fn version(&self) -> Option<u64> {
        self.current.read().as_ref().map(|s| s.version)
    }

    /// Replace the cached snapshot if `snapshot` is strictly newer.
    ///
    /// Returns whether the cache changed; equal or older versions are no-ops,
    /// so duplicate and out-of-order delivery are harmless.
    pub fn apply(&self, snapshot: Arc<Snapshot>) -> bool {
        let mut current = self.current.write();
        if let Some(existing) = current.as_ref() {
            if snapshot.version <= existing.version {
                return false;
            }
        }
        *current = Some(snapshot);
        true
    }
}
