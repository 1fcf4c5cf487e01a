//! Push-based projection worker.
//!
//! A [`ProjectionWorker`] keeps a read store current by consuming the
//! envelopes a [`SubscribableStore`] publishes as they are committed.
//!
//! # Overview
//!
//! Starting a worker:
//! 1. Attaches to the live stream (so nothing committed from now on is missed)
//! 2. Rebuilds every read row from the log (catch-up phase)
//! 3. Spawns a task that routes each live envelope through the
//!    [`ProjectionRouter`]
//!
//! Delivery is at-least-once. Envelopes already handled successfully for a
//! student (by version) are skipped; anything else is recomputed from current state, so
//! duplicates are harmless. If the stream reports that envelopes were missed,
//! the worker rebuilds the whole read model and carries on.
//!
//! # Example
//!
//! ```ignore
//! let worker = ProjectionWorker::new(store.clone(), ProjectionRouter::new(repo, rows))
//!     .on_catchup_complete(|| println!("ready"))
//!     .start()
//!     .await?;
//!
//! // Later, shut down gracefully
//! let stats = worker.stop().await?;
//! ```

use std::{collections::HashMap, marker::PhantomData};

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt as _;

use crate::{
    event::StudentId,
    projection::{Notification, ProjectionError, ProjectionRouter, ReadStore, StudentSource},
    store::SubscribableStore,
};

/// Errors that can occur during the worker lifecycle.
#[derive(Debug, Error)]
pub enum SubscriptionError<CatchupError>
where
    CatchupError: std::error::Error + 'static,
{
    /// The initial rebuild failed.
    #[error("catch-up failed: {0}")]
    Catchup(#[source] CatchupError),
    /// The worker task panicked.
    #[error("subscription task panicked")]
    TaskPanicked,
}

/// Catch-up error of a worker routing `Src` into `R`.
pub type CatchupError<Src, R> =
    ProjectionError<<Src as StudentSource>::Error, <R as ReadStore>::Error>;

/// Counters reported when a worker stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Notifications routed successfully.
    pub delivered: u64,
    /// Envelopes skipped because a newer version was already handled.
    pub duplicates: u64,
    /// Notifications whose routing failed (logged).
    pub failed: u64,
    /// Full rebuilds triggered by missed envelopes.
    pub rebuilds: u64,
}

/// Handle to a running worker.
///
/// Dropping the handle does **not** stop the worker. Call [`stop()`] for
/// graceful shutdown.
///
/// [`stop()`]: SubscriptionHandle::stop
#[derive(Debug)]
pub struct SubscriptionHandle<E> {
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
    task: JoinHandle<WorkerStats>,
    _error: PhantomData<fn() -> E>,
}

impl<E> SubscriptionHandle<E>
where
    E: std::error::Error + 'static,
{
    /// Stop the worker and wait for it to finish.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::TaskPanicked`] if the task panicked.
    pub async fn stop(mut self) -> Result<WorkerStats, SubscriptionError<E>> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        self.task.await.map_err(|_| SubscriptionError::TaskPanicked)
    }

    /// Check if the worker task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

type ProcessedCallback = Box<dyn Fn(&Notification) + Send + Sync + 'static>;

/// Builder for configuring and starting a projection worker.
pub struct ProjectionWorker<S, Src, R> {
    store: S,
    router: ProjectionRouter<Src, R>,
    on_processed: Option<ProcessedCallback>,
    on_catchup_complete: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl<S, Src, R> ProjectionWorker<S, Src, R>
where
    S: SubscribableStore + 'static,
    Src: StudentSource + 'static,
    R: ReadStore + 'static,
{
    pub fn new(store: S, router: ProjectionRouter<Src, R>) -> Self {
        Self {
            store,
            router,
            on_processed: None,
            on_catchup_complete: None,
        }
    }

    /// Register a callback invoked after each live notification is routed
    /// successfully.
    ///
    /// Callbacks must complete quickly; blocking stalls the worker.
    #[must_use]
    pub fn on_processed<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.on_processed = Some(Box::new(callback));
        self
    }

    /// Register a one-shot callback fired once the catch-up rebuild is done.
    #[must_use]
    pub fn on_catchup_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_catchup_complete = Some(Box::new(callback));
        self
    }

    /// Start the worker.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Catchup`] if the initial rebuild cannot
    /// list the students.
    pub async fn start(
        self,
    ) -> Result<SubscriptionHandle<CatchupError<Src, R>>, SubscriptionError<CatchupError<Src, R>>>
    {
        let Self {
            store,
            router,
            on_processed,
            on_catchup_complete,
        } = self;

        let mut stream = store.subscribe();
        let rows = router
            .rebuild()
            .await
            .map_err(SubscriptionError::Catchup)?;
        tracing::debug!(rows, "projection catch-up complete");
        if let Some(callback) = on_catchup_complete {
            callback();
        }

        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();

        let task = tokio::spawn(async move {
            let mut stats = WorkerStats::default();
            let mut high_water: HashMap<StudentId, u64> = HashMap::new();

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => {
                        tracing::debug!("projection worker stopped");
                        break;
                    }
                    next = stream.next() => {
                        let Some(result) = next else {
                            tracing::debug!("projection stream ended");
                            break;
                        };

                        let envelope = match result {
                            Ok(envelope) => envelope,
                            Err(error) => {
                                tracing::warn!(%error, "projection stream lagged, rebuilding");
                                stats.rebuilds += 1;
                                if let Err(error) = router.rebuild().await {
                                    tracing::error!(%error, "projection rebuild failed");
                                }
                                continue;
                            }
                        };

                        let notification = Notification::from(&envelope);
                        if high_water
                            .get(&notification.aggregate_id)
                            .is_some_and(|seen| *seen >= notification.version)
                        {
                            stats.duplicates += 1;
                            continue;
                        }
                        if router.handle(&notification).await {
                            high_water.insert(notification.aggregate_id, notification.version);
                            stats.delivered += 1;
                            if let Some(ref callback) = on_processed {
                                callback(&notification);
                            }
                        } else {
                            stats.failed += 1;
                        }
                    }
                }
            }

            stats
        });

        Ok(SubscriptionHandle {
            stop_tx: Some(stop_tx),
            task,
            _error: PhantomData,
        })
    }
}
