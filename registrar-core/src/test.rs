//! Test utilities for the student aggregate.
//!
//! - [`TestFramework`]: given-when-then unit testing of the aggregate in
//!   isolation
//! - [`RepositoryTestExt`]: extension trait for integration tests against a
//!   real repository
//!
//! # Unit Testing with [`TestFramework`]
//!
//! ```ignore
//! use registrar::test::TestFramework;
//!
//! #[test]
//! fn blank_lookup_code_is_rejected() {
//!     TestFramework::given(&[added.into()])
//!         .when(LookupCodeSet { code: " ".into() })
//!         .then_expect_error_message("lookup code must not be empty");
//! }
//! ```
//!
//! # Integration Testing with [`RepositoryTestExt`]
//!
//! ```ignore
//! use registrar::test::RepositoryTestExt;
//!
//! // Seed initial history (e.g., for projection tests)
//! repo.seed_events(&id, vec![added.into()]).await?;
//!
//! // Simulate a concurrent writer
//! repo.inject_concurrent_event(&id, StudentStatusSet { status }.into()).await?;
//! ```

use std::{fmt, future::Future};

use chrono::Utc;
use thiserror::Error;

use crate::{
    domain::{StudentEvent, StudentFields},
    event::{Envelope, StudentId},
    repository::Repository,
    store::{AppendError, EventStore},
    student::{IssueError, Student},
};

/// Error type for seeding operations.
#[derive(Debug, Error)]
pub enum SeedError<StoreError>
where
    StoreError: std::error::Error + 'static,
{
    /// The event could not be encoded.
    #[error("failed to encode `{kind}` event: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    /// Failed to persist the event.
    #[error("failed to persist event: {0}")]
    Append(#[source] AppendError<StoreError>),
    /// Failed to read the current stream version.
    #[error("failed to read stream version: {0}")]
    Store(#[source] StoreError),
}

type SeedResult<S> = Result<(), SeedError<<S as EventStore>::Error>>;

/// Access to the event store behind a repository.
pub trait StoreAccess {
    type Store: EventStore;

    fn store(&self) -> &Self::Store;
}

impl<S, SS, P> StoreAccess for Repository<S, SS, P>
where
    S: EventStore,
{
    type Store = S;

    fn store(&self) -> &Self::Store {
        &self.store
    }
}

/// Extension trait providing fixture helpers for [`Repository`].
///
/// All methods bypass the aggregate: events are encoded and appended to the
/// end of the stream without running invariant checks, so tests can stage
/// histories (even invalid ones) directly.
pub trait RepositoryTestExt: StoreAccess + Sync {
    /// Append events to a student's stream, bypassing the aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`SeedError`] if encoding or persistence fails.
    fn seed_events<'a>(
        &'a self,
        id: &'a StudentId,
        events: Vec<StudentEvent>,
    ) -> impl Future<Output = SeedResult<Self::Store>> + Send + 'a {
        async move {
            for event in events {
                let kind = event.kind().as_str();
                let data = event
                    .encode()
                    .map_err(|source| SeedError::Encode { kind, source })?;
                self.inject_raw(id, kind, data).await?;
            }
            Ok(())
        }
    }

    /// Append a single event as if from a concurrent writer.
    ///
    /// Use this to provoke version conflicts on a student already loaded by
    /// the code under test.
    ///
    /// # Errors
    ///
    /// Returns [`SeedError`] if encoding or persistence fails.
    fn inject_concurrent_event<'a>(
        &'a self,
        id: &'a StudentId,
        event: StudentEvent,
    ) -> impl Future<Output = SeedResult<Self::Store>> + Send + 'a {
        self.seed_events(id, vec![event])
    }

    /// Append an envelope with an arbitrary tag and payload.
    ///
    /// Use this to stage unknown kinds or malformed payloads.
    ///
    /// # Errors
    ///
    /// Returns [`SeedError`] if persistence fails.
    fn inject_raw<'a>(
        &'a self,
        id: &'a StudentId,
        kind: &'a str,
        data: Vec<u8>,
    ) -> impl Future<Output = SeedResult<Self::Store>> + Send + 'a {
        async move {
            let current = self
                .store()
                .stream_version(id)
                .await
                .map_err(SeedError::Store)?;
            let version = current.map_or(0, |v| v + 1);
            let envelope = Envelope::from_parts(kind, data, version, *id, Utc::now());
            self.store()
                .append_if_version(id, current, &envelope)
                .await
                .map_err(SeedError::Append)
        }
    }
}

impl<T> RepositoryTestExt for T where T: StoreAccess + Sync {}

/// Given-when-then harness for the student aggregate.
///
/// Works on the aggregate alone, without persistence.
#[derive(Debug)]
pub struct TestFramework {
    student: Student,
}

impl TestFramework {
    /// Start a scenario with prior events already issued.
    ///
    /// Pass an empty slice to start from an unknown student.
    ///
    /// # Panics
    ///
    /// Panics if a given event is rejected by the aggregate.
    #[must_use]
    #[track_caller]
    pub fn given(events: &[StudentEvent]) -> Self {
        Self::for_student(StudentId::new()).and(events)
    }

    /// Start from an empty student with a chosen id.
    #[must_use]
    pub const fn for_student(id: StudentId) -> Self {
        Self {
            student: Student::new(id),
        }
    }

    /// Issue more events before the one under test.
    ///
    /// # Panics
    ///
    /// Panics if an event is rejected by the aggregate.
    #[must_use]
    #[track_caller]
    pub fn and(mut self, events: &[StudentEvent]) -> Self {
        for event in events {
            let expected = self.student.version();
            if let Err(error) = self.student.issue(event.clone(), expected) {
                panic!("given event {:?} was rejected: {error}", event.kind());
            }
        }
        self
    }

    /// Issue the event under test.
    #[must_use]
    pub fn when(mut self, event: impl Into<StudentEvent>) -> TestResult {
        let event = event.into();
        let expected = self.student.version();
        let result = self
            .student
            .issue(event.clone(), expected)
            .map(|envelope| (event, envelope));
        TestResult {
            student: self.student,
            result,
        }
    }
}

/// Outcome of [`TestFramework::when`], ready for assertions.
pub struct TestResult {
    student: Student,
    result: Result<(StudentEvent, Envelope), IssueError>,
}

impl TestResult {
    /// Assert that the event was accepted and equals `expected`.
    ///
    /// # Panics
    ///
    /// Panics if the event was rejected or differs from `expected`.
    #[track_caller]
    pub fn then_expect_events(self, expected: &[StudentEvent]) {
        match self.result {
            Ok((event, _)) => {
                assert_eq!(
                    std::slice::from_ref(&event),
                    expected,
                    "Expected events did not match actual events"
                );
            }
            Err(error) => panic!("Expected events but got error: {error}"),
        }
    }

    /// Assert that the event was accepted and produced `expected` state.
    ///
    /// # Panics
    ///
    /// Panics if the event was rejected or the state differs.
    #[track_caller]
    pub fn then_expect_fields(self, expected: &StudentFields) {
        if let Err(error) = self.result {
            panic!("Expected state but got error: {error}");
        }
        assert_eq!(
            self.student.fields(),
            Some(expected),
            "Expected state did not match actual state"
        );
    }

    /// Assert that the event was rejected.
    ///
    /// # Panics
    ///
    /// Panics if the event was accepted.
    #[track_caller]
    pub fn then_expect_error(self) {
        if let Ok((event, _)) = self.result {
            panic!("Expected error but got event: {event:?}");
        }
    }

    /// Assert that the event was rejected with a message containing
    /// `substring`.
    ///
    /// # Panics
    ///
    /// Panics if the event was accepted or the message does not match.
    #[track_caller]
    pub fn then_expect_error_message(self, substring: &str) {
        match self.result {
            Ok((event, _)) => panic!("Expected error but got event: {event:?}"),
            Err(error) => {
                let message = error.to_string();
                assert!(
                    message.contains(substring),
                    "Expected error message containing '{substring}', got '{message}'"
                );
            }
        }
    }

    /// The student after the scenario, for ad hoc assertions.
    #[must_use]
    pub const fn student(&self) -> &Student {
        &self.student
    }
}

impl fmt::Debug for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestResult")
            .field("student", &self.student)
            .field("accepted", &self.result.is_ok())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::{
        domain::{LookupCodeSet, StudentAdded, StudentStatus, StudentStatusSet},
        store::inmemory,
    };

    fn added() -> StudentAdded {
        StudentAdded {
            first_name: "Ana".into(),
            last_name: "Lima".into(),
            date_of_birth: NaiveDate::from_ymd_opt(2012, 4, 2).unwrap(),
            school_id: "S1".into(),
            date_of_enrollment: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
        }
    }

    #[test]
    fn accepted_event_is_reported() {
        let event = StudentStatusSet {
            status: StudentStatus::Inactive,
        };
        TestFramework::given(&[added().into()])
            .when(event.clone())
            .then_expect_events(&[event.into()]);
    }

    #[test]
    fn resulting_state_is_checked() {
        let result = TestFramework::given(&[added().into()]).when(LookupCodeSet {
            code: "AL-01".into(),
        });
        assert_eq!(result.student().version(), Some(1));
        let mut expected = result.student().fields().cloned().unwrap();
        expected.lookup_code = Some("AL-01".into());
        result.then_expect_fields(&expected);
    }

    #[test]
    fn rejected_event_is_reported() {
        TestFramework::given(&[])
            .when(StudentStatusSet {
                status: StudentStatus::Active,
            })
            .then_expect_error_message("student not found");
    }

    #[test]
    #[should_panic(expected = "was rejected")]
    fn invalid_history_panics() {
        let _ = TestFramework::given(&[added().into(), added().into()]);
    }

    #[tokio::test]
    async fn seeded_history_is_loadable() {
        let repo = Repository::new(inmemory::Store::new());
        let id = StudentId::new();
        repo.seed_events(&id, vec![added().into()]).await.unwrap();
        repo.inject_concurrent_event(
            &id,
            StudentStatusSet {
                status: StudentStatus::Inactive,
            }
            .into(),
        )
        .await
        .unwrap();

        let student = repo.load(&id).await.unwrap();
        assert_eq!(student.version(), Some(1));
        assert_eq!(
            student.fields().map(|f| f.status),
            Some(StudentStatus::Inactive)
        );
    }

    #[tokio::test]
    async fn raw_envelopes_reach_the_stream() {
        let repo = Repository::new(inmemory::Store::new());
        let id = StudentId::new();
        repo.inject_raw(&id, "GraduateStudent", b"{}".to_vec())
            .await
            .unwrap();
        assert_eq!(repo.store().stream_version(&id).await.unwrap(), Some(0));
        assert!(repo.load(&id).await.is_err());
    }
}
