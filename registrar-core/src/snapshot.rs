//! Snapshot support for faster student loading.
//!
//! A snapshot pairs the exported fields of a student with the version they
//! were taken at, so loading only replays the events recorded after it. This
//! module provides:
//!
//! - [`Snapshot`] - point-in-time student state
//! - [`SnapshotStore`] - trait for snapshot persistence with a policy
//! - [`SnapshotPolicy`] - when offered snapshots are accepted
//! - [`NoSnapshots`] - no-op implementation; this is the default when
//!   [`Repository::with_snapshots`](crate::repository::Repository::with_snapshots)
//!   is not called
//! - [`inmemory`] - in-memory reference implementation

use std::{convert::Infallible, future::Future};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::event::StudentId;

pub mod inmemory;

/// Point-in-time snapshot of a student.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Version of the last event folded into `data`.
    pub version: u64,
    /// Timestamp of that event.
    pub timestamp: DateTime<Utc>,
    /// Output of [`Student::export_state`](crate::student::Student::export_state).
    pub data: Vec<u8>,
}

/// Snapshot (de)serialization failure.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to encode snapshot: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode snapshot: {0}")]
    Decode(#[source] serde_json::Error),
}

/// When a snapshot store accepts offered snapshots.
///
/// - [`SnapshotPolicy::Always`]: after every commit (minimal replay)
/// - [`SnapshotPolicy::EveryNEvents`]: whenever the stream length reaches a
///   multiple of N
/// - [`SnapshotPolicy::Never`]: load-only mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPolicy {
    Always,
    EveryNEvents(u64),
    Never,
}

impl SnapshotPolicy {
    /// Whether a snapshot should be taken once the event at `version` is
    /// committed.
    #[must_use]
    pub const fn should_snapshot(self, version: u64) -> bool {
        match self {
            Self::Always => true,
            Self::EveryNEvents(0) | Self::Never => false,
            Self::EveryNEvents(n) => (version + 1) % n == 0,
        }
    }
}

/// Result of offering a snapshot to a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOffer {
    Declined,
    Stored,
}

/// Error returned by [`SnapshotStore::offer_snapshot`].
#[derive(Debug, Error)]
pub enum OfferSnapshotError<E>
where
    E: std::error::Error + 'static,
{
    #[error("failed to create snapshot: {0}")]
    Create(#[source] SnapshotError),
    #[error("snapshot operation failed: {0}")]
    Snapshot(#[source] E),
}

/// Snapshot persistence with a built-in policy.
///
/// The repository calls [`offer_snapshot`](SnapshotStore::offer_snapshot)
/// after each successful append. Stores only ever need to keep the newest
/// snapshot per student; saving an older version than the stored one must not
/// replace it.
pub trait SnapshotStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Load the most recent snapshot, `Ok(None)` if there is none.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn load_latest<'a>(
        &'a self,
        id: &'a StudentId,
    ) -> impl Future<Output = Result<Option<Snapshot>, Self::Error>> + Send + 'a;

    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn save<'a>(
        &'a self,
        id: &'a StudentId,
        snapshot: Snapshot,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

    fn policy(&self) -> SnapshotPolicy;

    /// Store a snapshot if the policy asks for one at `version`.
    ///
    /// `create` is only invoked when the policy accepts, so declined offers
    /// cost nothing.
    ///
    /// # Errors
    ///
    /// Returns [`OfferSnapshotError::Create`] if `create` fails and
    /// [`OfferSnapshotError::Snapshot`] if persistence fails.
    fn offer_snapshot<'a, F>(
        &'a self,
        id: &'a StudentId,
        version: u64,
        create: F,
    ) -> impl Future<Output = Result<SnapshotOffer, OfferSnapshotError<Self::Error>>> + Send + 'a
    where
        F: FnOnce() -> Result<Option<Snapshot>, SnapshotError> + Send + 'a,
    {
        async move {
            if !self.policy().should_snapshot(version) {
                return Ok(SnapshotOffer::Declined);
            }
            let Some(snapshot) = create().map_err(OfferSnapshotError::Create)? else {
                return Ok(SnapshotOffer::Declined);
            };
            self.save(id, snapshot)
                .await
                .map_err(OfferSnapshotError::Snapshot)?;
            tracing::debug!(aggregate_id = %id, version, "snapshot stored");
            Ok(SnapshotOffer::Stored)
        }
    }
}

/// No-op snapshot store: never loads anything and declines every offer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSnapshots;

impl SnapshotStore for NoSnapshots {
    type Error = Infallible;

    fn load_latest<'a>(
        &'a self,
        _id: &'a StudentId,
    ) -> impl Future<Output = Result<Option<Snapshot>, Self::Error>> + Send + 'a {
        std::future::ready(Ok(None))
    }

    fn save<'a>(
        &'a self,
        _id: &'a StudentId,
        _snapshot: Snapshot,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        std::future::ready(Ok(()))
    }

    fn policy(&self) -> SnapshotPolicy {
        SnapshotPolicy::Never
    }
}
