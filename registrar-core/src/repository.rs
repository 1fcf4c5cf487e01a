//! Application service orchestration.
//!
//! `Repository` loads students (snapshot first, then the remaining history),
//! issues new events on caller-owned instances, appends them with an
//! optimistic version check and then fans the committed envelope out to the
//! snapshot store and, when attached, the read-side projections.
//!
//! Snapshots and projections are both opt-in:
//!
//! ```ignore
//! let repo = Repository::new(store::inmemory::Store::new())
//!     .with_snapshots(snapshot::inmemory::Store::every(50))
//!     .with_projections(projection::inmemory::Store::new());
//! ```

use std::future::Future;

use thiserror::Error;

use crate::{
    concurrency::VersionConflict,
    domain::{InvariantViolation, StudentEvent},
    event::{Envelope, StudentId},
    projection::{Notification, ProjectionRouter, ReadStore, StudentSource},
    snapshot::{NoSnapshots, OfferSnapshotError, SnapshotStore},
    store::{AppendError, EventStore},
    student::{ApplyError, IssueError, Student},
};

/// Error returned when a student cannot be rebuilt from storage.
#[derive(Debug, Error)]
pub enum LoadError<StoreError>
where
    StoreError: std::error::Error + 'static,
{
    #[error("failed to load events: {0}")]
    Store(#[source] StoreError),
    #[error("failed to replay events: {0}")]
    Apply(#[from] ApplyError),
}

/// Error type for command execution.
#[derive(Debug, Error)]
pub enum CommandError<StoreError, SnapshotError>
where
    StoreError: std::error::Error + 'static,
    SnapshotError: std::error::Error + 'static,
{
    #[error("student rejected event: {0}")]
    Rejected(#[source] ApplyError),
    #[error(transparent)]
    Concurrency(VersionConflict),
    #[error("failed to rebuild student state: {0}")]
    Load(#[source] LoadError<StoreError>),
    #[error("failed to encode event: {0}")]
    Encode(#[source] IssueError),
    #[error("failed to persist event: {0}")]
    Store(#[source] AppendError<StoreError>),
    /// The envelope was committed but the snapshot could not be stored.
    #[error("snapshot operation failed: {0}")]
    Snapshot(#[source] OfferSnapshotError<SnapshotError>),
}

impl<StoreError, SnapshotError> CommandError<StoreError, SnapshotError>
where
    StoreError: std::error::Error + 'static,
    SnapshotError: std::error::Error + 'static,
{
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Concurrency(_))
    }

    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// The broken rule for [`CommandError::Rejected`].
    #[must_use]
    pub const fn invariant(&self) -> Option<&InvariantViolation> {
        match self {
            Self::Rejected(err) => err.invariant(),
            _ => None,
        }
    }

    fn from_issue(err: IssueError) -> Self {
        match err {
            IssueError::VersionConflict(conflict) => Self::Concurrency(conflict),
            IssueError::Apply(apply) if apply.invariant().is_some() => Self::Rejected(apply),
            IssueError::EncodeAndApply { kind, encode, apply } if apply.invariant().is_some() => {
                tracing::warn!(%kind, error = %encode, "rejected event also failed to encode");
                Self::Rejected(apply)
            }
            other => Self::Encode(other),
        }
    }
}

/// Convenience alias for repository command results.
pub type CommandResult<T, S, SS> = Result<
    T,
    CommandError<<S as EventStore>::Error, <SS as SnapshotStore>::Error>,
>;

/// Successful outcome of [`Repository::execute_with_retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome {
    pub envelope: Envelope,
    /// Number of commit attempts, starting at 1.
    pub attempts: usize,
}

/// Receives every envelope the repository commits.
pub trait CommitHook: Send + Sync {
    fn committed<'a, Src>(
        &'a self,
        source: &'a Src,
        envelope: &'a Envelope,
    ) -> impl Future<Output = ()> + Send + 'a
    where
        Src: StudentSource;
}

/// No read-side projections; the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProjections;

impl CommitHook for NoProjections {
    fn committed<'a, Src>(
        &'a self,
        _source: &'a Src,
        _envelope: &'a Envelope,
    ) -> impl Future<Output = ()> + Send + 'a
    where
        Src: StudentSource,
    {
        std::future::ready(())
    }
}

/// Inline projections into a read store, attached with
/// [`Repository::with_projections`].
#[derive(Debug, Clone)]
pub struct Projections<R>(R);

impl<R: ReadStore> CommitHook for Projections<R> {
    fn committed<'a, Src>(
        &'a self,
        source: &'a Src,
        envelope: &'a Envelope,
    ) -> impl Future<Output = ()> + Send + 'a
    where
        Src: StudentSource,
    {
        async move {
            let notification = Notification::from(envelope);
            ProjectionRouter::new(source, &self.0)
                .handle(&notification)
                .await;
        }
    }
}

/// Repository.
pub struct Repository<S, SS = NoSnapshots, P = NoProjections> {
    pub(crate) store: S,
    snapshots: SS,
    projections: P,
}

impl<S> Repository<S>
where
    S: EventStore,
{
    #[must_use]
    pub const fn new(store: S) -> Self {
        Self {
            store,
            snapshots: NoSnapshots,
            projections: NoProjections,
        }
    }
}

impl<S, SS, P> Repository<S, SS, P>
where
    S: EventStore,
    SS: SnapshotStore,
    P: CommitHook,
{
    #[must_use]
    pub const fn event_store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub const fn snapshot_store(&self) -> &SS {
        &self.snapshots
    }

    #[must_use]
    pub fn with_snapshots<SS2>(self, snapshots: SS2) -> Repository<S, SS2, P>
    where
        SS2: SnapshotStore,
    {
        Repository {
            store: self.store,
            snapshots,
            projections: self.projections,
        }
    }

    /// Project every committed envelope into `read_store`.
    ///
    /// Projection failures are logged and never undo the append.
    #[must_use]
    pub fn with_projections<R>(self, read_store: R) -> Repository<S, SS, Projections<R>>
    where
        R: ReadStore,
    {
        Repository {
            store: self.store,
            snapshots: self.snapshots,
            projections: Projections(read_store),
        }
    }

    /// Load a student using its latest snapshot when available.
    ///
    /// Unknown ids yield an empty shell. A snapshot that cannot be loaded or
    /// decoded is skipped in favour of a full replay.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError`] if the history cannot be loaded or replayed.
    #[tracing::instrument(skip(self, id), fields(aggregate_id = %id))]
    pub async fn load(&self, id: &StudentId) -> Result<Student, LoadError<S::Error>> {
        let snapshot = self
            .snapshots
            .load_latest(id)
            .await
            .inspect_err(|e| {
                tracing::warn!(
                    error = %e,
                    "failed to load snapshot, falling back to full replay"
                );
            })
            .ok()
            .flatten();

        let mut student = match snapshot {
            Some(snapshot) => Student::from_snapshot(*id, &snapshot).unwrap_or_else(|e| {
                tracing::warn!(
                    error = %e,
                    version = snapshot.version,
                    "failed to decode snapshot, falling back to full replay"
                );
                Student::new(*id)
            }),
            None => Student::new(*id),
        };

        let history = self
            .store
            .load_history(id, Some(student.next_version()))
            .await
            .map_err(LoadError::Store)?;
        student.apply_all(&history)?;

        tracing::trace!(
            replayed = history.len(),
            version = ?student.version(),
            "student loaded"
        );
        Ok(student)
    }

    /// Apply any envelopes committed after `student`'s version.
    ///
    /// On error `student` is left as it was.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError`] if the history cannot be loaded or replayed.
    #[tracing::instrument(skip(self, student), fields(aggregate_id = %student.id()))]
    pub async fn refresh(&self, student: &mut Student) -> Result<(), LoadError<S::Error>> {
        let history = self
            .store
            .load_history(student.id(), Some(student.next_version()))
            .await
            .map_err(LoadError::Store)?;
        let mut next = student.clone();
        next.apply_all(&history)?;
        *student = next;
        tracing::trace!(replayed = history.len(), "student refreshed");
        Ok(())
    }

    /// Issue `event` on `student` and append it.
    ///
    /// On success `student` reflects the new envelope. On a version conflict
    /// `student` is refreshed from the store so the caller can decide whether
    /// to retry; if that refresh fails the load error is returned instead.
    /// On any other failure it is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Concurrency`] if another writer got there
    /// first and [`CommandError::Rejected`] if the event breaks an invariant.
    /// [`CommandError::Snapshot`] is returned after a successful append.
    #[tracing::instrument(skip(self, student, event), fields(aggregate_id = %student.id()))]
    pub async fn commit(
        &self,
        student: &mut Student,
        event: impl Into<StudentEvent>,
    ) -> CommandResult<Envelope, S, SS> {
        let expected = student.version();
        let mut next = student.clone();
        let envelope = next
            .issue(event, expected)
            .map_err(CommandError::from_issue)?;

        match self
            .store
            .append_if_version(student.id(), expected, &envelope)
            .await
        {
            Ok(()) => {}
            Err(AppendError::Conflict(conflict)) => {
                tracing::debug!(%conflict, "append conflicted, refreshing student");
                self.refresh(student).await.map_err(CommandError::Load)?;
                return Err(CommandError::Concurrency(conflict));
            }
            Err(err) => return Err(CommandError::Store(err)),
        }
        *student = next;
        tracing::debug!(
            kind = envelope.kind(),
            version = envelope.version(),
            "event committed"
        );

        self.projections.committed(self, &envelope).await;

        let committed: &Student = student;
        self.snapshots
            .offer_snapshot(committed.id(), envelope.version(), || committed.snapshot())
            .await
            .map_err(CommandError::Snapshot)?;

        Ok(envelope)
    }

    /// Load a student and commit `event` against it.
    ///
    /// # Errors
    ///
    /// See [`Repository::commit`]; load failures are returned as
    /// [`CommandError::Load`].
    pub async fn execute(
        &self,
        id: &StudentId,
        event: impl Into<StudentEvent>,
    ) -> CommandResult<Envelope, S, SS> {
        let mut student = self.load(id).await.map_err(CommandError::Load)?;
        self.commit(&mut student, event).await
    }

    /// Like [`execute`](Repository::execute), retrying up to `max_retries`
    /// times on version conflicts.
    ///
    /// # Errors
    ///
    /// Returns the last conflict once retries are exhausted, or any other
    /// error immediately.
    pub async fn execute_with_retry(
        &self,
        id: &StudentId,
        event: impl Into<StudentEvent>,
        max_retries: usize,
    ) -> CommandResult<RetryOutcome, S, SS> {
        let event = event.into();
        let mut student = self.load(id).await.map_err(CommandError::Load)?;
        let mut attempts = 1;
        loop {
            match self.commit(&mut student, event.clone()).await {
                Ok(envelope) => return Ok(RetryOutcome { envelope, attempts }),
                Err(err) if err.is_conflict() && attempts <= max_retries => {
                    tracing::debug!(attempts, "retrying after version conflict");
                    attempts += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl<S, SS, R> Repository<S, SS, Projections<R>>
where
    S: EventStore,
    SS: SnapshotStore,
    R: ReadStore,
{
    #[must_use]
    pub const fn read_store(&self) -> &R {
        &self.projections.0
    }
}

impl<S, SS, P> StudentSource for Repository<S, SS, P>
where
    S: EventStore,
    SS: SnapshotStore,
    P: CommitHook,
{
    type Error = LoadError<S::Error>;

    fn load_student<'a>(
        &'a self,
        id: &'a StudentId,
    ) -> impl Future<Output = Result<Student, Self::Error>> + Send + 'a {
        self.load(id)
    }

    fn student_ids(&self) -> impl Future<Output = Result<Vec<StudentId>, Self::Error>> + Send + '_ {
        async move { self.store.aggregate_ids().await.map_err(LoadError::Store) }
    }
}
