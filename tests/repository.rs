//! End-to-end repository scenarios over the in-memory adapters.

use std::sync::Mutex;

use chrono::{NaiveDate, Utc};
use registrar::{
    Envelope, EventKind, InvariantViolation, LookupCodeSet, Repository, StudentAdded,
    Student, StudentEnrolled, StudentId, StudentStatus, StudentStatusSet,
    StudentUnenrolled, StudentUpdated,
    snapshot::{self, SnapshotStore},
    store::{AppendError, EventStore, inmemory},
};

fn ana() -> StudentAdded {
    StudentAdded {
        first_name: "Ana".into(),
        last_name: "Lima".into(),
        date_of_birth: NaiveDate::from_ymd_opt(2012, 4, 2).unwrap(),
        school_id: "S1".into(),
        date_of_enrollment: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
    }
}

/// Event store that lets a rival writer win the next `rivals` appends.
struct Racing {
    inner: inmemory::Store,
    rivals: Mutex<usize>,
}

impl Racing {
    fn new(rivals: usize) -> Self {
        Self {
            inner: inmemory::Store::new(),
            rivals: Mutex::new(rivals),
        }
    }

    fn take_rival(&self) -> bool {
        let mut rivals = self.rivals.lock().unwrap();
        if *rivals == 0 {
            return false;
        }
        *rivals -= 1;
        true
    }
}

impl EventStore for Racing {
    type Error = inmemory::InMemoryError;

    async fn append_if_version<'a>(
        &'a self,
        id: &'a StudentId,
        expected: Option<u64>,
        envelope: &'a Envelope,
    ) -> Result<(), AppendError<Self::Error>> {
        if self.take_rival() {
            let rival = Envelope::new(
                EventKind::SetStudentStatus,
                serde_json::to_vec(&StudentStatusSet {
                    status: StudentStatus::Active,
                })
                .unwrap(),
                envelope.version(),
                *id,
                Utc::now(),
            );
            self.inner.append_if_version(id, expected, &rival).await?;
        }
        self.inner.append_if_version(id, expected, envelope).await
    }

    async fn load_history<'a>(
        &'a self,
        id: &'a StudentId,
        from_version: Option<u64>,
    ) -> Result<Vec<Envelope>, Self::Error> {
        self.inner.load_history(id, from_version).await
    }

    async fn stream_version<'a>(&'a self, id: &'a StudentId) -> Result<Option<u64>, Self::Error> {
        self.inner.stream_version(id).await
    }

    async fn aggregate_ids(&self) -> Result<Vec<StudentId>, Self::Error> {
        self.inner.aggregate_ids().await
    }
}

#[tokio::test]
async fn full_lifecycle_replays_to_the_same_state() {
    let repo = Repository::new(inmemory::Store::new());
    let id = StudentId::new();

    repo.execute(&id, ana()).await.unwrap();
    repo.execute(&id, StudentUnenrolled {}).await.unwrap();
    repo.execute(
        &id,
        StudentEnrolled {
            school_id: "S2".into(),
            date_of_enrollment: NaiveDate::from_ymd_opt(2025, 9, 1).unwrap(),
        },
    )
    .await
    .unwrap();
    repo.execute(
        &id,
        StudentUpdated {
            first_name: "Ana Maria".into(),
            last_name: "Lima".into(),
            date_of_birth: NaiveDate::from_ymd_opt(2012, 4, 2).unwrap(),
            school_id: "S1".into(),
            date_of_enrollment: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
        },
    )
    .await
    .unwrap();
    repo.execute(&id, LookupCodeSet { code: "AL-01".into() })
        .await
        .unwrap();
    let last = repo
        .execute(
            &id,
            StudentStatusSet {
                status: StudentStatus::Inactive,
            },
        )
        .await
        .unwrap();
    assert_eq!(last.version(), 5);

    let student = repo.load(&id).await.unwrap();
    let fields = student.fields().unwrap();
    assert_eq!(student.version(), Some(5));
    assert_eq!(fields.first_name, "Ana Maria");
    assert_eq!(fields.school_id.as_deref(), Some("S1"));
    assert_eq!(fields.lookup_code.as_deref(), Some("AL-01"));
    assert_eq!(fields.status, StudentStatus::Inactive);

    let mut replayed = Student::new(id);
    replayed
        .apply_all(&repo.event_store().load_history(&id, None).await.unwrap())
        .unwrap();
    assert_eq!(replayed, student);
}

#[tokio::test]
async fn invariant_rejections_reach_the_caller() {
    let repo = Repository::new(inmemory::Store::new());
    let id = StudentId::new();

    let err = repo.execute(&id, StudentUnenrolled {}).await.unwrap_err();
    assert!(err.is_rejected());
    assert_eq!(err.invariant(), Some(&InvariantViolation::NotFound));

    repo.execute(&id, ana()).await.unwrap();
    let err = repo
        .execute(&id, LookupCodeSet { code: "  ".into() })
        .await
        .unwrap_err();
    assert_eq!(err.invariant(), Some(&InvariantViolation::EmptyLookupCode));
    assert_eq!(repo.event_store().stream_version(&id).await.unwrap(), Some(0));
}

#[tokio::test]
async fn retry_recovers_from_a_rival_writer() {
    let repo = Repository::new(Racing::new(0));
    let id = StudentId::new();
    repo.execute(&id, ana()).await.unwrap();
    *repo.event_store().rivals.lock().unwrap() = 1;

    let outcome = repo
        .execute_with_retry(
            &id,
            StudentStatusSet {
                status: StudentStatus::Inactive,
            },
            3,
        )
        .await
        .unwrap();

    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.envelope.version(), 2);
    let student = repo.load(&id).await.unwrap();
    assert_eq!(
        student.fields().map(|f| f.status),
        Some(StudentStatus::Inactive)
    );
}

#[tokio::test]
async fn retry_gives_up_after_the_limit() {
    let repo = Repository::new(Racing::new(0));
    let id = StudentId::new();
    repo.execute(&id, ana()).await.unwrap();
    *repo.event_store().rivals.lock().unwrap() = 10;

    let err = repo
        .execute_with_retry(
            &id,
            StudentStatusSet {
                status: StudentStatus::Inactive,
            },
            2,
        )
        .await
        .unwrap_err();

    assert!(err.is_conflict());
    // one initial attempt plus two retries, each beaten by a rival
    assert_eq!(repo.event_store().stream_version(&id).await.unwrap(), Some(3));
}

#[tokio::test]
async fn snapshots_do_not_change_loaded_state() {
    let events = inmemory::Store::new();
    let plain = Repository::new(events.clone());
    let snapshotting = Repository::new(events).with_snapshots(snapshot::inmemory::Store::every(2));
    let id = StudentId::new();

    snapshotting.execute(&id, ana()).await.unwrap();
    for status in [
        StudentStatus::Inactive,
        StudentStatus::Active,
        StudentStatus::Inactive,
        StudentStatus::Active,
    ] {
        snapshotting
            .execute(&id, StudentStatusSet { status })
            .await
            .unwrap();
    }

    let stored = snapshotting
        .snapshot_store()
        .load_latest(&id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.version, 3);

    let with_snapshot = snapshotting.load(&id).await.unwrap();
    let replayed = plain.load(&id).await.unwrap();
    assert_eq!(with_snapshot, replayed);
    assert_eq!(replayed.version(), Some(4));
}
