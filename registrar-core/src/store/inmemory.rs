//! In-memory event store implementation for testing.
//!
//! This module provides [`Store`], a thread-safe in-memory implementation of
//! [`EventStore`](super::EventStore) and
//! [`SubscribableStore`](super::SubscribableStore) suitable for unit tests
//! and examples.
//!
//! # Example
//!
//! ```
//! use registrar_core::store::inmemory;
//!
//! let store = inmemory::Store::new();
//! ```

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, RwLock},
};

use tokio::sync::broadcast;
use tokio_stream::{
    StreamExt as _,
    wrappers::{BroadcastStream, errors::BroadcastStreamRecvError},
};

use crate::{
    event::{Envelope, StudentId},
    store::{AppendError, EventStore, EventStream, SubscribableStore, check_append},
};

const LIVE_BUFFER_CAPACITY: usize = 1024;

/// In-memory event store that keeps one vector of envelopes per student.
///
/// Committed envelopes are also published on a broadcast channel for
/// [`SubscribableStore::subscribe`]. Clones share the same streams.
#[derive(Debug, Clone)]
pub struct Store {
    streams: Arc<RwLock<HashMap<StudentId, Vec<Envelope>>>>,
    sender: broadcast::Sender<Envelope>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(LIVE_BUFFER_CAPACITY)
    }

    /// Store whose subscribers may fall at most `capacity` envelopes behind
    /// before they observe a lag error.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            streams: Arc::default(),
            sender,
        }
    }

    /// Total number of stored envelopes across all students.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.streams
            .read()
            .expect("in-memory store lock poisoned")
            .values()
            .map(Vec::len)
            .sum()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

/// Error type for the in-memory store.
#[derive(Debug, thiserror::Error)]
pub enum InMemoryError {
    #[error("subscriber lagged behind and missed {0} events")]
    Lagged(u64),
}

impl EventStore for Store {
    type Error = InMemoryError;

    #[tracing::instrument(skip(self, id, envelope), fields(aggregate_id = %id, version = envelope.version()))]
    fn append_if_version<'a>(
        &'a self,
        id: &'a StudentId,
        expected: Option<u64>,
        envelope: &'a Envelope,
    ) -> impl Future<Output = Result<(), AppendError<Self::Error>>> + Send + 'a {
        let result = (|| {
            let mut streams = self.streams.write().expect("in-memory store lock poisoned");
            let current = streams
                .get(id)
                .and_then(|stream| stream.last().map(Envelope::version));
            if let Err(err) = check_append::<InMemoryError>(id, expected, current, envelope) {
                tracing::debug!(?current, "append rejected");
                return Err(err);
            }
            streams.entry(*id).or_default().push(envelope.clone());
            // Publish under the lock so subscribers see each stream in order.
            let receivers = self.sender.send(envelope.clone()).unwrap_or(0);
            drop(streams);
            tracing::debug!(receivers, "envelope appended");
            Ok(())
        })();
        std::future::ready(result)
    }

    #[tracing::instrument(skip(self, id), fields(aggregate_id = %id))]
    fn load_history<'a>(
        &'a self,
        id: &'a StudentId,
        from_version: Option<u64>,
    ) -> impl Future<Output = Result<Vec<Envelope>, Self::Error>> + Send + 'a {
        let from = from_version.unwrap_or(0);
        let history: Vec<Envelope> = self
            .streams
            .read()
            .expect("in-memory store lock poisoned")
            .get(id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|e| e.version() >= from)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        tracing::trace!(events = history.len(), "loaded history");
        std::future::ready(Ok(history))
    }

    #[tracing::instrument(skip(self, id), fields(aggregate_id = %id))]
    fn stream_version<'a>(
        &'a self,
        id: &'a StudentId,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send + 'a {
        let version = self
            .streams
            .read()
            .expect("in-memory store lock poisoned")
            .get(id)
            .and_then(|stream| stream.last().map(Envelope::version));
        tracing::trace!(?version, "retrieved stream version");
        std::future::ready(Ok(version))
    }

    fn aggregate_ids(&self) -> impl Future<Output = Result<Vec<StudentId>, Self::Error>> + Send + '_ {
        let mut ids: Vec<StudentId> = self
            .streams
            .read()
            .expect("in-memory store lock poisoned")
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        std::future::ready(Ok(ids))
    }
}

impl SubscribableStore for Store {
    fn subscribe(&self) -> EventStream<'static, Self::Error> {
        let stream = BroadcastStream::new(self.sender.subscribe()).map(|item| {
            item.map_err(|BroadcastStreamRecvError::Lagged(missed)| InMemoryError::Lagged(missed))
        });
        Box::pin(stream)
    }
}
