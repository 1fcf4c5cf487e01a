//! Read-side projections of student state.
//!
//! Projections are derived caches: every notification about a committed
//! envelope makes the [`ProjectionRouter`] re-fetch the student from its
//! [`StudentSource`] and overwrite the whole read row. Because rows are always
//! recomputed from the authoritative aggregate, re-delivering a notification
//! (or delivering notifications late) never corrupts the read model.

use std::{future::Future, sync::Arc};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    domain::StudentStatus,
    event::{Envelope, EventKind, StudentId},
    student::Student,
};

pub mod inmemory;

/// Denormalized read row for one student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentRow {
    pub id: StudentId,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    pub school_id: Option<String>,
    pub date_of_enrollment: Option<NaiveDate>,
    pub status: StudentStatus,
    pub lookup_code: Option<String>,
    /// Version of the last event reflected in this row.
    pub version: u64,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

impl StudentRow {
    /// Build the row for a student, `None` for an empty shell.
    #[must_use]
    pub fn from_student(student: &Student) -> Option<Self> {
        let fields = student.fields()?;
        let version = student.version()?;
        Some(Self {
            id: *student.id(),
            first_name: fields.first_name.clone(),
            last_name: fields.last_name.clone(),
            date_of_birth: fields.date_of_birth,
            school_id: fields.school_id.clone(),
            date_of_enrollment: fields.date_of_enrollment,
            status: fields.status,
            lookup_code: fields.lookup_code.clone(),
            version,
            active: fields.status.is_active(),
            updated_at: student.updated_at().unwrap_or_default(),
        })
    }
}

/// Storage for student read rows and the lookup-code index.
///
/// [`upsert_student`](ReadStore::upsert_student) must ignore rows older than
/// the stored one (last writer wins by version).
pub trait ReadStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn upsert_student<'a>(
        &'a self,
        row: &'a StudentRow,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

    /// Point `code` at `id`. Writing the same pair twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the code already belongs to another student or
    /// the underlying storage fails.
    fn insert_lookup_code<'a>(
        &'a self,
        code: &'a str,
        id: &'a StudentId,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn get_student<'a>(
        &'a self,
        id: &'a StudentId,
    ) -> impl Future<Output = Result<Option<StudentRow>, Self::Error>> + Send + 'a;

    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn find_by_lookup_code<'a>(
        &'a self,
        code: &'a str,
    ) -> impl Future<Output = Result<Option<StudentId>, Self::Error>> + Send + 'a;
}

impl<T: ReadStore + ?Sized> ReadStore for &T {
    type Error = T::Error;

    fn upsert_student<'a>(
        &'a self,
        row: &'a StudentRow,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        (**self).upsert_student(row)
    }

    fn insert_lookup_code<'a>(
        &'a self,
        code: &'a str,
        id: &'a StudentId,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        (**self).insert_lookup_code(code, id)
    }

    fn get_student<'a>(
        &'a self,
        id: &'a StudentId,
    ) -> impl Future<Output = Result<Option<StudentRow>, Self::Error>> + Send + 'a {
        (**self).get_student(id)
    }

    fn find_by_lookup_code<'a>(
        &'a self,
        code: &'a str,
    ) -> impl Future<Output = Result<Option<StudentId>, Self::Error>> + Send + 'a {
        (**self).find_by_lookup_code(code)
    }
}

impl<T: ReadStore + ?Sized> ReadStore for Arc<T> {
    type Error = T::Error;

    fn upsert_student<'a>(
        &'a self,
        row: &'a StudentRow,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        (**self).upsert_student(row)
    }

    fn insert_lookup_code<'a>(
        &'a self,
        code: &'a str,
        id: &'a StudentId,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        (**self).insert_lookup_code(code, id)
    }

    fn get_student<'a>(
        &'a self,
        id: &'a StudentId,
    ) -> impl Future<Output = Result<Option<StudentRow>, Self::Error>> + Send + 'a {
        (**self).get_student(id)
    }

    fn find_by_lookup_code<'a>(
        &'a self,
        code: &'a str,
    ) -> impl Future<Output = Result<Option<StudentId>, Self::Error>> + Send + 'a {
        (**self).find_by_lookup_code(code)
    }
}

/// Pull-based access to the authoritative student state.
pub trait StudentSource: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Load the current state of a student (an empty shell if unknown).
    ///
    /// # Errors
    ///
    /// Returns an error if the student cannot be rebuilt.
    fn load_student<'a>(
        &'a self,
        id: &'a StudentId,
    ) -> impl Future<Output = Result<Student, Self::Error>> + Send + 'a;

    /// # Errors
    ///
    /// Returns an error if the ids cannot be listed.
    fn student_ids(&self) -> impl Future<Output = Result<Vec<StudentId>, Self::Error>> + Send + '_;
}

impl<T: StudentSource + ?Sized> StudentSource for &T {
    type Error = T::Error;

    fn load_student<'a>(
        &'a self,
        id: &'a StudentId,
    ) -> impl Future<Output = Result<Student, Self::Error>> + Send + 'a {
        (**self).load_student(id)
    }

    fn student_ids(&self) -> impl Future<Output = Result<Vec<StudentId>, Self::Error>> + Send + '_ {
        (**self).student_ids()
    }
}

impl<T: StudentSource + ?Sized> StudentSource for Arc<T> {
    type Error = T::Error;

    fn load_student<'a>(
        &'a self,
        id: &'a StudentId,
    ) -> impl Future<Output = Result<Student, Self::Error>> + Send + 'a {
        (**self).load_student(id)
    }

    fn student_ids(&self) -> impl Future<Output = Result<Vec<StudentId>, Self::Error>> + Send + '_ {
        (**self).student_ids()
    }
}

/// "Student `aggregate_id` changed through an event of `kind`".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub aggregate_id: StudentId,
    pub kind: String,
    pub version: u64,
}

impl From<&Envelope> for Notification {
    fn from(envelope: &Envelope) -> Self {
        Self {
            aggregate_id: *envelope.aggregate_id(),
            kind: envelope.kind().to_string(),
            version: envelope.version(),
        }
    }
}

/// Error raised while updating a read row.
#[derive(Debug, Error)]
pub enum ProjectionError<SourceError, StoreError>
where
    SourceError: std::error::Error + 'static,
    StoreError: std::error::Error + 'static,
{
    #[error("failed to load student {id}: {source}")]
    Load {
        id: StudentId,
        #[source]
        source: SourceError,
    },
    #[error("failed to list students: {0}")]
    List(#[source] SourceError),
    #[error("student {id} not found")]
    NotFound { id: StudentId },
    #[error("student {id} has no lookup code")]
    EmptyLookupCode { id: StudentId },
    #[error("read store error: {0}")]
    Store(#[source] StoreError),
}

/// Outcome of routing one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// The row was recomputed at `version`.
    Updated { version: u64 },
    /// The kind has no read-side effect.
    Ignored,
}

/// Convenience alias for router results.
pub type RouteResult<Src, R> = Result<
    Routed,
    ProjectionError<<Src as StudentSource>::Error, <R as ReadStore>::Error>,
>;

/// Dispatches notifications to read-row updates.
#[derive(Debug, Clone)]
pub struct ProjectionRouter<Src, R> {
    source: Src,
    store: R,
}

impl<Src, R> ProjectionRouter<Src, R>
where
    Src: StudentSource,
    R: ReadStore,
{
    pub const fn new(source: Src, store: R) -> Self {
        Self { source, store }
    }

    pub const fn read_store(&self) -> &R {
        &self.store
    }

    /// Apply one notification to the read model.
    ///
    /// Unknown kinds are ignored so older readers tolerate newer writers.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::EmptyLookupCode`] if a lookup-code
    /// notification finds no code on the student, and the load or store
    /// failure otherwise.
    #[tracing::instrument(
        skip(self, notification),
        fields(aggregate_id = %notification.aggregate_id, kind = %notification.kind, version = notification.version)
    )]
    pub async fn route(&self, notification: &Notification) -> RouteResult<Src, R> {
        let Some(kind) = EventKind::from_tag(&notification.kind) else {
            tracing::debug!("ignoring notification of unknown kind");
            return Ok(Routed::Ignored);
        };
        let id = notification.aggregate_id;

        let student = self
            .source
            .load_student(&id)
            .await
            .map_err(|source| ProjectionError::Load { id, source })?;
        let row = StudentRow::from_student(&student).ok_or(ProjectionError::NotFound { id })?;

        if kind == EventKind::SetLookupCode {
            let code = row
                .lookup_code
                .as_deref()
                .filter(|code| !code.trim().is_empty())
                .ok_or(ProjectionError::EmptyLookupCode { id })?;
            self.store
                .upsert_student(&row)
                .await
                .map_err(ProjectionError::Store)?;
            self.store
                .insert_lookup_code(code, &id)
                .await
                .map_err(ProjectionError::Store)?;
        } else {
            self.store
                .upsert_student(&row)
                .await
                .map_err(ProjectionError::Store)?;
        }

        tracing::trace!(row_version = row.version, "read row updated");
        Ok(Routed::Updated {
            version: row.version,
        })
    }

    /// Route a notification, logging failures instead of returning them.
    ///
    /// Returns `true` if the notification was handled.
    pub async fn handle(&self, notification: &Notification) -> bool {
        match self.route(notification).await {
            Ok(_) => true,
            Err(error) => {
                tracing::error!(
                    aggregate_id = %notification.aggregate_id,
                    kind = %notification.kind,
                    version = notification.version,
                    %error,
                    "failed to update student projection"
                );
                false
            }
        }
    }

    /// Recompute every read row from the source.
    ///
    /// Students that fail to project are logged and skipped. Returns the
    /// number of rows written.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::List`] if the students cannot be listed.
    #[tracing::instrument(skip(self))]
    pub async fn rebuild(
        &self,
    ) -> Result<usize, ProjectionError<Src::Error, R::Error>> {
        let ids = self
            .source
            .student_ids()
            .await
            .map_err(ProjectionError::List)?;

        let mut written = 0;
        for id in ids {
            match self.project(&id).await {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(error) => {
                    tracing::error!(aggregate_id = %id, %error, "failed to rebuild student projection");
                }
            }
        }
        tracing::debug!(written, "projection rebuilt");
        Ok(written)
    }

    async fn project(&self, id: &StudentId) -> Result<bool, ProjectionError<Src::Error, R::Error>> {
        let student = self
            .source
            .load_student(id)
            .await
            .map_err(|source| ProjectionError::Load { id: *id, source })?;
        let Some(row) = StudentRow::from_student(&student) else {
            return Ok(false);
        };
        self.store
            .upsert_student(&row)
            .await
            .map_err(ProjectionError::Store)?;
        if let Some(code) = row.lookup_code.as_deref() {
            self.store
                .insert_lookup_code(code, id)
                .await
                .map_err(ProjectionError::Store)?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        convert::Infallible,
        sync::Mutex,
    };

    use chrono::NaiveDate;

    use super::*;
    use crate::domain::StudentAdded;

    #[derive(Default)]
    struct Students(Mutex<HashMap<StudentId, Student>>);

    impl Students {
        fn put(&self, student: Student) {
            self.0.lock().unwrap().insert(*student.id(), student);
        }
    }

    impl StudentSource for Students {
        type Error = Infallible;

        fn load_student<'a>(
            &'a self,
            id: &'a StudentId,
        ) -> impl Future<Output = Result<Student, Self::Error>> + Send + 'a {
            let student = self
                .0
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .unwrap_or_else(|| Student::new(*id));
            std::future::ready(Ok(student))
        }

        fn student_ids(
            &self,
        ) -> impl Future<Output = Result<Vec<StudentId>, Self::Error>> + Send + '_ {
            std::future::ready(Ok(self.0.lock().unwrap().keys().copied().collect()))
        }
    }

    fn created() -> Student {
        let mut student = Student::new(StudentId::new());
        student
            .create(StudentAdded {
                first_name: "Ana".into(),
                last_name: "Lima".into(),
                date_of_birth: NaiveDate::from_ymd_opt(2012, 4, 2).unwrap(),
                school_id: "S1".into(),
                date_of_enrollment: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            })
            .unwrap();
        student
    }

    fn notify(student: &Student, kind: &str) -> Notification {
        Notification {
            aggregate_id: *student.id(),
            kind: kind.to_string(),
            version: student.version().unwrap_or(0),
        }
    }

    #[tokio::test]
    async fn routing_creates_the_row() {
        let source = Students::default();
        let student = created();
        source.put(student.clone());
        let router = ProjectionRouter::new(&source, inmemory::Store::new());

        let routed = router.route(&notify(&student, "AddStudent")).await.unwrap();
        assert_eq!(routed, Routed::Updated { version: 0 });

        let row = router.read_store().get_student(student.id()).await.unwrap().unwrap();
        assert_eq!(row.first_name, "Ana");
        assert!(row.active);
    }

    #[tokio::test]
    async fn redelivery_leaves_row_unchanged() {
        let source = Students::default();
        let student = created();
        source.put(student.clone());
        let router = ProjectionRouter::new(&source, inmemory::Store::new());
        let notification = notify(&student, "AddStudent");

        router.route(&notification).await.unwrap();
        let first = router.read_store().get_student(student.id()).await.unwrap();
        router.route(&notification).await.unwrap();
        let second = router.read_store().get_student(student.id()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn unknown_kind_is_ignored() {
        let source = Students::default();
        let router = ProjectionRouter::new(&source, inmemory::Store::new());
        let notification = Notification {
            aggregate_id: StudentId::new(),
            kind: "GraduateStudent".into(),
            version: 7,
        };
        assert_eq!(router.route(&notification).await.unwrap(), Routed::Ignored);
    }

    #[tokio::test]
    async fn missing_student_is_not_found() {
        let source = Students::default();
        let router = ProjectionRouter::new(&source, inmemory::Store::new());
        let notification = Notification {
            aggregate_id: StudentId::new(),
            kind: "SetStudentStatus".into(),
            version: 1,
        };
        assert!(matches!(
            router.route(&notification).await,
            Err(ProjectionError::NotFound { .. })
        ));
        assert!(!router.handle(&notification).await);
    }

    #[tokio::test]
    async fn lookup_code_notification_without_code_is_an_integrity_error() {
        let source = Students::default();
        let student = created();
        source.put(student.clone());
        let router = ProjectionRouter::new(&source, inmemory::Store::new());

        let err = router
            .route(&notify(&student, "SetLookupCode"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProjectionError::EmptyLookupCode { .. }));
        assert!(router.read_store().get_student(student.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lookup_code_is_indexed() {
        let source = Students::default();
        let mut student = created();
        student.set_lookup_code("AL-01").unwrap();
        source.put(student.clone());
        let router = ProjectionRouter::new(&source, inmemory::Store::new());

        router.route(&notify(&student, "SetLookupCode")).await.unwrap();
        assert_eq!(
            router.read_store().find_by_lookup_code("AL-01").await.unwrap(),
            Some(*student.id())
        );
    }

    #[tokio::test]
    async fn rebuild_projects_every_student() {
        let source = Students::default();
        let mut coded = created();
        coded.set_lookup_code("C-9").unwrap();
        source.put(created());
        source.put(coded.clone());
        source.put(Student::new(StudentId::new()));
        let router = ProjectionRouter::new(&source, inmemory::Store::new());

        assert_eq!(router.rebuild().await.unwrap(), 2);
        assert_eq!(router.read_store().len(), 2);
        assert_eq!(
            router.read_store().find_by_lookup_code("C-9").await.unwrap(),
            Some(*coded.id())
        );
    }

    #[test]
    fn row_mirrors_student_fields() {
        let mut student = created();
        student.set_status(StudentStatus::Inactive).unwrap();
        let row = StudentRow::from_student(&student).unwrap();
        assert_eq!(row.version, 1);
        assert!(!row.active);
        assert_eq!(row.updated_at, student.updated_at().unwrap());
        assert!(StudentRow::from_student(&Student::new(StudentId::new())).is_none());
    }
}
