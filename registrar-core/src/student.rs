//! The student aggregate.
//!
//! A [`Student`] is rebuilt by folding its envelopes in version order through
//! [`Student::apply`], the only mutating entry point. New events are produced
//! with [`Student::issue`] (or one of the command helpers), which stamps the
//! envelope and applies it locally before handing it back for persistence.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use crate::{
    concurrency::VersionConflict,
    domain::{
        InvariantViolation, LookupCodeSet, StudentAdded, StudentEnrolled, StudentEvent,
        StudentFields, StudentStatus, StudentStatusSet, StudentUnenrolled, StudentUpdated,
    },
    event::{Envelope, EventDecodeError, EventKind, StudentId},
    registry::EventRegistry,
    snapshot::{Snapshot, SnapshotError},
};

/// Coarse lifecycle state of a student.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    Uninitialized,
    Active,
    Inactive,
}

/// What went wrong while applying one envelope.
#[derive(Debug, Error)]
pub enum ApplyFailure {
    #[error(transparent)]
    Decode(#[from] EventDecodeError),
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

/// An envelope could not be applied to a student.
#[derive(Debug, Error)]
#[error("when processing event `{kind}` for student {aggregate_id}: {source}")]
pub struct ApplyError {
    pub aggregate_id: StudentId,
    pub kind: String,
    #[source]
    pub source: ApplyFailure,
}

impl ApplyError {
    /// The broken rule, if this failure was a state-machine rejection.
    #[must_use]
    pub const fn invariant(&self) -> Option<&InvariantViolation> {
        match &self.source {
            ApplyFailure::Invariant(violation) => Some(violation),
            ApplyFailure::Decode(_) => None,
        }
    }
}

/// Error returned by [`Student::issue`].
#[derive(Debug, Error)]
pub enum IssueError {
    /// The caller's expected version does not match the aggregate.
    #[error(transparent)]
    VersionConflict(#[from] VersionConflict),
    #[error("failed to encode `{kind}` payload: {source}")]
    Encode {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Apply(#[from] ApplyError),
    /// Both the payload encoding and the handler failed.
    #[error("failed to encode `{kind}` payload ({encode}) and {apply}")]
    EncodeAndApply {
        kind: EventKind,
        encode: serde_json::Error,
        #[source]
        apply: ApplyError,
    },
}

impl IssueError {
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict(_))
    }

    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        self.invariant().is_some()
    }

    #[must_use]
    pub const fn invariant(&self) -> Option<&InvariantViolation> {
        match self {
            Self::Apply(err) | Self::EncodeAndApply { apply: err, .. } => err.invariant(),
            Self::VersionConflict(_) | Self::Encode { .. } => None,
        }
    }
}

/// Current state of one student, derived from its event history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Student {
    id: StudentId,
    version: Option<u64>,
    fields: Option<StudentFields>,
    updated_at: Option<DateTime<Utc>>,
}

impl Student {
    /// An empty shell with no history.
    #[must_use]
    pub const fn new(id: StudentId) -> Self {
        Self {
            id,
            version: None,
            fields: None,
            updated_at: None,
        }
    }

    /// Restore a student from a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Decode`] if the snapshot data is malformed.
    pub fn from_snapshot(id: StudentId, snapshot: &Snapshot) -> Result<Self, SnapshotError> {
        let mut student = Self::new(id);
        student.import_state(&snapshot.data)?;
        student.version = Some(snapshot.version);
        student.updated_at = Some(snapshot.timestamp);
        Ok(student)
    }

    #[must_use]
    pub const fn id(&self) -> &StudentId {
        &self.id
    }

    /// Version of the last applied event; `None` for an empty shell.
    #[must_use]
    pub const fn version(&self) -> Option<u64> {
        self.version
    }

    /// Version the next envelope must carry.
    #[must_use]
    pub fn next_version(&self) -> u64 {
        self.version.map_or(0, |v| v + 1)
    }

    #[must_use]
    pub const fn fields(&self) -> Option<&StudentFields> {
        self.fields.as_ref()
    }

    /// Timestamp of the last applied event.
    #[must_use]
    pub const fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    #[must_use]
    pub const fn exists(&self) -> bool {
        self.fields.is_some()
    }

    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        match self.fields.as_ref().map(|f| f.status) {
            None => Lifecycle::Uninitialized,
            Some(StudentStatus::Active) => Lifecycle::Active,
            Some(StudentStatus::Inactive) => Lifecycle::Inactive,
        }
    }

    /// Apply one stored envelope using the process-wide registry.
    ///
    /// On failure the student is left untouched.
    ///
    /// # Errors
    ///
    /// Returns an [`ApplyError`] if the envelope belongs to another student,
    /// is out of sequence, cannot be decoded, or breaks an invariant.
    pub fn apply(&mut self, envelope: &Envelope) -> Result<(), ApplyError> {
        self.apply_with(EventRegistry::global(), envelope)
    }

    /// Apply one stored envelope using `registry` to decode it.
    ///
    /// # Errors
    ///
    /// See [`Student::apply`].
    pub fn apply_with(
        &mut self,
        registry: &EventRegistry,
        envelope: &Envelope,
    ) -> Result<(), ApplyError> {
        let id = self.id;
        let fail = |source: ApplyFailure| ApplyError {
            aggregate_id: id,
            kind: envelope.kind().to_string(),
            source,
        };

        if envelope.aggregate_id() != &id {
            return Err(fail(
                InvariantViolation::WrongAggregate {
                    expected: id,
                    actual: *envelope.aggregate_id(),
                }
                .into(),
            ));
        }
        let expected = self.next_version();
        if envelope.version() != expected {
            return Err(fail(
                InvariantViolation::VersionGap {
                    expected,
                    actual: envelope.version(),
                }
                .into(),
            ));
        }

        let event = registry
            .decode(envelope)
            .map_err(|e| fail(e.into()))?;
        let next = event
            .apply_to(self.fields.as_ref())
            .map_err(|e| fail(e.into()))?;

        self.fields = Some(next);
        self.version = Some(envelope.version());
        self.updated_at = Some(envelope.timestamp());
        tracing::trace!(
            aggregate_id = %id,
            kind = envelope.kind(),
            version = envelope.version(),
            "event applied"
        );
        Ok(())
    }

    /// Replay envelopes in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first [`ApplyError`]; events before it stay applied.
    pub fn apply_all<'a, I>(&mut self, envelopes: I) -> Result<(), ApplyError>
    where
        I: IntoIterator<Item = &'a Envelope>,
    {
        envelopes.into_iter().try_for_each(|e| self.apply(e))
    }

    /// Produce and locally apply a new event.
    ///
    /// `expected_version` must equal [`Student::version`]. The envelope is
    /// stamped with the current time and version `expected_version + 1`
    /// (or 0 for a new student).
    ///
    /// # Errors
    ///
    /// Returns [`IssueError::VersionConflict`] for a stale expected version,
    /// and the encoding or handler failure otherwise. The student is untouched
    /// on error.
    pub fn issue(
        &mut self,
        event: impl Into<StudentEvent>,
        expected_version: Option<u64>,
    ) -> Result<Envelope, IssueError> {
        let event = event.into();
        if expected_version != self.version {
            return Err(VersionConflict {
                expected: expected_version,
                actual: self.version,
            }
            .into());
        }

        let kind = event.kind();
        let version = self.next_version();
        match event.encode() {
            Ok(data) => {
                let envelope = Envelope::new(kind, data, version, self.id, Utc::now());
                self.apply(&envelope)?;
                tracing::debug!(aggregate_id = %self.id, %kind, version, "event issued");
                Ok(envelope)
            }
            Err(encode) => Err(match event.apply_to(self.fields.as_ref()) {
                Ok(_) => IssueError::Encode {
                    kind,
                    source: encode,
                },
                Err(violation) => IssueError::EncodeAndApply {
                    kind,
                    encode,
                    apply: ApplyError {
                        aggregate_id: self.id,
                        kind: kind.as_str().to_string(),
                        source: violation.into(),
                    },
                },
            }),
        }
    }

    /// # Errors
    ///
    /// See [`Student::issue`].
    pub fn create(&mut self, event: StudentAdded) -> Result<Envelope, IssueError> {
        self.issue(event, self.version)
    }

    /// # Errors
    ///
    /// See [`Student::issue`].
    pub fn set_status(&mut self, status: StudentStatus) -> Result<Envelope, IssueError> {
        self.issue(StudentStatusSet { status }, self.version)
    }

    /// # Errors
    ///
    /// See [`Student::issue`].
    pub fn update(&mut self, event: StudentUpdated) -> Result<Envelope, IssueError> {
        self.issue(event, self.version)
    }

    /// # Errors
    ///
    /// See [`Student::issue`].
    pub fn enroll(
        &mut self,
        school_id: impl Into<String>,
        date_of_enrollment: NaiveDate,
    ) -> Result<Envelope, IssueError> {
        let event = StudentEnrolled {
            school_id: school_id.into(),
            date_of_enrollment,
        };
        self.issue(event, self.version)
    }

    /// # Errors
    ///
    /// See [`Student::issue`].
    pub fn unenroll(&mut self) -> Result<Envelope, IssueError> {
        self.issue(StudentUnenrolled {}, self.version)
    }

    /// # Errors
    ///
    /// See [`Student::issue`].
    pub fn set_lookup_code(&mut self, code: impl Into<String>) -> Result<Envelope, IssueError> {
        self.issue(LookupCodeSet { code: code.into() }, self.version)
    }

    /// Serialize the current fields (not the version).
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Encode`] if serialization fails.
    pub fn export_state(&self) -> Result<Vec<u8>, SnapshotError> {
        serde_json::to_vec(&self.fields).map_err(SnapshotError::Encode)
    }

    /// Replace the current fields with previously exported state.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Decode`] on malformed input, including state
    /// exported from an empty shell; the student is untouched.
    pub fn import_state(&mut self, data: &[u8]) -> Result<(), SnapshotError> {
        let fields: StudentFields = serde_json::from_slice(data).map_err(SnapshotError::Decode)?;
        self.fields = Some(fields);
        Ok(())
    }

    /// Capture the current state, or `None` for an empty shell.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Encode`] if serialization fails.
    pub fn snapshot(&self) -> Result<Option<Snapshot>, SnapshotError> {
        let Some(version) = self.version else {
            return Ok(None);
        };
        Ok(Some(Snapshot {
            version,
            timestamp: self.updated_at.unwrap_or_default(),
            data: self.export_state()?,
        }))
    }
}

impl fmt::Display for Student {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ID: {}, Version: ", self.id)?;
        match self.version {
            Some(version) => write!(f, "{version}")?,
            None => f.write_str("none")?,
        }
        write!(f, ", Data: {:?}", self.fields)
    }
}
