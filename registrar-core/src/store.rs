//! Persistence layer abstractions.
//!
//! This module describes the storage contract for student event streams
//! ([`EventStore`]), the push-based extension used by projection workers
//! ([`SubscribableStore`]) and a reference in-memory implementation.

use std::{future::Future, pin::Pin};

use futures_core::Stream;
use thiserror::Error;

use crate::{
    concurrency::VersionConflict,
    event::{Envelope, StudentId},
};

pub mod inmemory;

/// Error from conditional appends.
#[derive(Debug, Error)]
pub enum AppendError<StoreError>
where
    StoreError: std::error::Error,
{
    /// Another writer modified the stream, or the envelope does not continue
    /// it.
    #[error(transparent)]
    Conflict(#[from] VersionConflict),
    /// The envelope belongs to a different stream than the one appended to.
    #[error("envelope for student {envelope} cannot be appended to stream {stream}")]
    StreamMismatch {
        stream: StudentId,
        envelope: StudentId,
    },
    #[error("store error: {0}")]
    Store(#[source] StoreError),
}

impl<StoreError: std::error::Error> AppendError<StoreError> {
    pub const fn store(err: StoreError) -> Self {
        Self::Store(err)
    }
}

/// Validate a conditional append against the stream's current version.
///
/// Shared by store implementations so they agree on the contract:
/// - the envelope must belong to `id`
/// - the stream must be at `expected` (`None` = empty)
/// - the envelope must carry the version right after `expected`
///
/// # Errors
///
/// Returns [`AppendError::StreamMismatch`] or [`AppendError::Conflict`].
pub fn check_append<E: std::error::Error>(
    id: &StudentId,
    expected: Option<u64>,
    current: Option<u64>,
    envelope: &Envelope,
) -> Result<(), AppendError<E>> {
    if envelope.aggregate_id() != id {
        return Err(AppendError::StreamMismatch {
            stream: *id,
            envelope: *envelope.aggregate_id(),
        });
    }
    if current != expected {
        return Err(VersionConflict {
            expected,
            actual: current,
        }
        .into());
    }
    if envelope.version() != expected.map_or(0, |v| v + 1) {
        return Err(VersionConflict {
            expected: envelope.version().checked_sub(1),
            actual: current,
        }
        .into());
    }
    Ok(())
}

/// Abstraction over the persistence layer for student event streams.
///
/// Stores must make [`append_if_version`](EventStore::append_if_version)
/// atomic: of two concurrent appends with the same expected version, exactly
/// one succeeds.
pub trait EventStore: Send + Sync {
    /// Store-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Append `envelope` if the stream is still at `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`AppendError::Conflict`] if the stream moved on (or the
    /// envelope would break contiguity), and [`AppendError::Store`] if
    /// persistence fails.
    fn append_if_version<'a>(
        &'a self,
        id: &'a StudentId,
        expected: Option<u64>,
        envelope: &'a Envelope,
    ) -> impl Future<Output = Result<(), AppendError<Self::Error>>> + Send + 'a;

    /// Load envelopes with `version >= from_version` (all when `None`) in
    /// ascending version order.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when loading fails.
    fn load_history<'a>(
        &'a self,
        id: &'a StudentId,
        from_version: Option<u64>,
    ) -> impl Future<Output = Result<Vec<Envelope>, Self::Error>> + Send + 'a;

    /// Version of the last stored envelope, `None` for an empty stream.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when the lookup fails.
    fn stream_version<'a>(
        &'a self,
        id: &'a StudentId,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send + 'a;

    /// Every student with at least one stored envelope.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when the lookup fails.
    fn aggregate_ids(&self) -> impl Future<Output = Result<Vec<StudentId>, Self::Error>> + Send + '_;
}

/// Boxed stream of committed envelopes returned by
/// [`SubscribableStore::subscribe`].
pub type EventStream<'a, E> = Pin<Box<dyn Stream<Item = Result<Envelope, E>> + Send + 'a>>;

/// A store that pushes envelopes to subscribers as they are committed.
///
/// Separate from [`EventStore`] because not every backend supports push
/// notifications.
pub trait SubscribableStore: EventStore {
    /// Subscribe to envelopes committed from now on.
    ///
    /// Envelopes of one student arrive in version order. A stream error means
    /// envelopes were missed; subscribers must resynchronise from the log.
    fn subscribe(&self) -> EventStream<'static, Self::Error>;
}
