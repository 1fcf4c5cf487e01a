//! In-memory snapshot store implementation.

use std::{
    collections::HashMap,
    convert::Infallible,
    future::Future,
    sync::{Arc, RwLock},
};

use super::{Snapshot, SnapshotPolicy, SnapshotStore};
use crate::event::StudentId;

/// In-memory snapshot store with a configurable policy.
///
/// Keeps only the newest snapshot per student. Suitable for tests and
/// development.
///
/// ```ignore
/// let repo = Repository::new(store::inmemory::Store::new())
///     .with_snapshots(snapshot::inmemory::Store::every(100));
/// ```
#[derive(Debug, Clone)]
pub struct Store {
    snapshots: Arc<RwLock<HashMap<StudentId, Snapshot>>>,
    policy: SnapshotPolicy,
}

impl Store {
    #[must_use]
    pub fn with_policy(policy: SnapshotPolicy) -> Self {
        Self {
            snapshots: Arc::default(),
            policy,
        }
    }

    /// Snapshot after every commit.
    #[must_use]
    pub fn always() -> Self {
        Self::with_policy(SnapshotPolicy::Always)
    }

    /// Snapshot whenever the stream length is a multiple of `n`.
    #[must_use]
    pub fn every(n: u64) -> Self {
        Self::with_policy(SnapshotPolicy::EveryNEvents(n))
    }

    /// Never accept offers; snapshots saved directly are still served.
    #[must_use]
    pub fn never() -> Self {
        Self::with_policy(SnapshotPolicy::Never)
    }

    /// Number of students that currently have a snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots
            .read()
            .expect("snapshot store lock poisoned")
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::always()
    }
}

impl SnapshotStore for Store {
    type Error = Infallible;

    #[tracing::instrument(skip(self, id), fields(aggregate_id = %id))]
    fn load_latest<'a>(
        &'a self,
        id: &'a StudentId,
    ) -> impl Future<Output = Result<Option<Snapshot>, Self::Error>> + Send + 'a {
        let snapshot = self
            .snapshots
            .read()
            .expect("snapshot store lock poisoned")
            .get(id)
            .cloned();
        tracing::trace!(found = snapshot.is_some(), "snapshot lookup");
        std::future::ready(Ok(snapshot))
    }

    #[tracing::instrument(skip(self, id, snapshot), fields(aggregate_id = %id, version = snapshot.version))]
    fn save<'a>(
        &'a self,
        id: &'a StudentId,
        snapshot: Snapshot,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        let mut snapshots = self.snapshots.write().expect("snapshot store lock poisoned");
        match snapshots.get(id) {
            Some(existing) if existing.version >= snapshot.version => {
                tracing::trace!(stored = existing.version, "keeping newer snapshot");
            }
            _ => {
                snapshots.insert(*id, snapshot);
            }
        }
        drop(snapshots);
        std::future::ready(Ok(()))
    }

    fn policy(&self) -> SnapshotPolicy {
        self.policy
    }
}
