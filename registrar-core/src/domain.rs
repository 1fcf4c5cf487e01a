//! Student fields, event payloads and the pure handlers folding them.
//!
//! Every payload implements [`Apply`] for [`StudentFields`]: a pure function
//! from the current fields (or `None` for an empty shell) to the next fields.
//! Handlers never mutate in place, so a rejected event leaves nothing behind.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::{DomainEvent, EventKind, StudentId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StudentStatus {
    #[default]
    Active,
    Inactive,
}

impl StudentStatus {
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

/// Materialized attributes of one student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentFields {
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    pub school_id: Option<String>,
    pub date_of_enrollment: Option<NaiveDate>,
    pub status: StudentStatus,
    pub lookup_code: Option<String>,
}

/// A state-machine rule was broken by an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("student already exists")]
    AlreadyExists,
    #[error("student not found")]
    NotFound,
    #[error("lookup code must not be empty")]
    EmptyLookupCode,
    #[error("expected event version {expected}, got {actual}")]
    VersionGap { expected: u64, actual: u64 },
    #[error("event belongs to student {actual}, not {expected}")]
    WrongAggregate {
        expected: StudentId,
        actual: StudentId,
    },
}

/// Fold one event payload into the current fields.
///
/// ```ignore
/// impl Apply<StudentEnrolled> for StudentFields {
///     fn apply(current: Option<&Self>, event: &StudentEnrolled) -> Result<Self, InvariantViolation> {
///         let mut next = existing(current)?.clone();
///         next.school_id = Some(event.school_id.clone());
///         Ok(next)
///     }
/// }
/// ```
pub trait Apply<E>: Sized {
    /// # Errors
    ///
    /// Returns an [`InvariantViolation`] when `event` is not legal for
    /// `current`.
    fn apply(current: Option<&Self>, event: &E) -> Result<Self, InvariantViolation>;
}

fn existing(current: Option<&StudentFields>) -> Result<&StudentFields, InvariantViolation> {
    current.ok_or(InvariantViolation::NotFound)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentAdded {
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    pub school_id: String,
    pub date_of_enrollment: NaiveDate,
}

impl DomainEvent for StudentAdded {
    const KIND: EventKind = EventKind::AddStudent;
}

impl Apply<StudentAdded> for StudentFields {
    fn apply(current: Option<&Self>, event: &StudentAdded) -> Result<Self, InvariantViolation> {
        if current.is_some() {
            return Err(InvariantViolation::AlreadyExists);
        }
        Ok(Self {
            first_name: event.first_name.clone(),
            last_name: event.last_name.clone(),
            date_of_birth: event.date_of_birth,
            school_id: Some(event.school_id.clone()),
            date_of_enrollment: Some(event.date_of_enrollment),
            status: StudentStatus::Active,
            lookup_code: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentStatusSet {
    pub status: StudentStatus,
}

impl DomainEvent for StudentStatusSet {
    const KIND: EventKind = EventKind::SetStudentStatus;
}

impl Apply<StudentStatusSet> for StudentFields {
    fn apply(current: Option<&Self>, event: &StudentStatusSet) -> Result<Self, InvariantViolation> {
        Ok(Self {
            status: event.status,
            ..existing(current)?.clone()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentUpdated {
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    pub school_id: String,
    pub date_of_enrollment: NaiveDate,
}

impl DomainEvent for StudentUpdated {
    const KIND: EventKind = EventKind::UpdateStudent;
}

impl Apply<StudentUpdated> for StudentFields {
    fn apply(current: Option<&Self>, event: &StudentUpdated) -> Result<Self, InvariantViolation> {
        Ok(Self {
            first_name: event.first_name.clone(),
            last_name: event.last_name.clone(),
            date_of_birth: event.date_of_birth,
            school_id: Some(event.school_id.clone()),
            date_of_enrollment: Some(event.date_of_enrollment),
            ..existing(current)?.clone()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentEnrolled {
    pub school_id: String,
    pub date_of_enrollment: NaiveDate,
}

impl DomainEvent for StudentEnrolled {
    const KIND: EventKind = EventKind::EnrollStudent;
}

impl Apply<StudentEnrolled> for StudentFields {
    fn apply(current: Option<&Self>, event: &StudentEnrolled) -> Result<Self, InvariantViolation> {
        Ok(Self {
            school_id: Some(event.school_id.clone()),
            date_of_enrollment: Some(event.date_of_enrollment),
            ..existing(current)?.clone()
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentUnenrolled {}

impl DomainEvent for StudentUnenrolled {
    const KIND: EventKind = EventKind::UnenrollStudent;
}

impl Apply<StudentUnenrolled> for StudentFields {
    fn apply(current: Option<&Self>, _event: &StudentUnenrolled) -> Result<Self, InvariantViolation> {
        Ok(Self {
            school_id: None,
            date_of_enrollment: None,
            ..existing(current)?.clone()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupCodeSet {
    pub code: String,
}

impl DomainEvent for LookupCodeSet {
    const KIND: EventKind = EventKind::SetLookupCode;
}

impl Apply<LookupCodeSet> for StudentFields {
    fn apply(current: Option<&Self>, event: &LookupCodeSet) -> Result<Self, InvariantViolation> {
        let current = existing(current)?;
        if event.code.trim().is_empty() {
            return Err(InvariantViolation::EmptyLookupCode);
        }
        Ok(Self {
            lookup_code: Some(event.code.clone()),
            ..current.clone()
        })
    }
}

/// Sum type over every student event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StudentEvent {
    Added(StudentAdded),
    StatusSet(StudentStatusSet),
    Updated(StudentUpdated),
    Enrolled(StudentEnrolled),
    Unenrolled(StudentUnenrolled),
    LookupCodeSet(LookupCodeSet),
}

impl StudentEvent {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Added(_) => StudentAdded::KIND,
            Self::StatusSet(_) => StudentStatusSet::KIND,
            Self::Updated(_) => StudentUpdated::KIND,
            Self::Enrolled(_) => StudentEnrolled::KIND,
            Self::Unenrolled(_) => StudentUnenrolled::KIND,
            Self::LookupCodeSet(_) => LookupCodeSet::KIND,
        }
    }

    /// Serialize the payload of this event.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if the payload cannot be encoded.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Self::Added(e) => serde_json::to_vec(e),
            Self::StatusSet(e) => serde_json::to_vec(e),
            Self::Updated(e) => serde_json::to_vec(e),
            Self::Enrolled(e) => serde_json::to_vec(e),
            Self::Unenrolled(e) => serde_json::to_vec(e),
            Self::LookupCodeSet(e) => serde_json::to_vec(e),
        }
    }

    /// Compute the fields that result from applying this event.
    ///
    /// # Errors
    ///
    /// Returns an [`InvariantViolation`] when the event is not legal for
    /// `current`.
    pub fn apply_to(
        &self,
        current: Option<&StudentFields>,
    ) -> Result<StudentFields, InvariantViolation> {
        match self {
            Self::Added(e) => StudentFields::apply(current, e),
            Self::StatusSet(e) => StudentFields::apply(current, e),
            Self::Updated(e) => StudentFields::apply(current, e),
            Self::Enrolled(e) => StudentFields::apply(current, e),
            Self::Unenrolled(e) => StudentFields::apply(current, e),
            Self::LookupCodeSet(e) => StudentFields::apply(current, e),
        }
    }
}

macro_rules! impl_from_payload {
    ($($payload:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$payload> for StudentEvent {
                fn from(event: $payload) -> Self {
                    Self::$variant(event)
                }
            }
        )*
    };
}

impl_from_payload! {
    StudentAdded => Added,
    StudentStatusSet => StatusSet,
    StudentUpdated => Updated,
    StudentEnrolled => Enrolled,
    StudentUnenrolled => Unenrolled,
    LookupCodeSet => LookupCodeSet,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn added() -> StudentAdded {
        StudentAdded {
            first_name: "Ana".into(),
            last_name: "Lima".into(),
            date_of_birth: date(2012, 4, 2),
            school_id: "S1".into(),
            date_of_enrollment: date(2024, 2, 1),
        }
    }

    fn populated() -> StudentFields {
        StudentFields::apply(None, &added()).unwrap()
    }

    #[test]
    fn create_populates_an_empty_shell() {
        let fields = populated();
        assert_eq!(fields.first_name, "Ana");
        assert_eq!(fields.school_id.as_deref(), Some("S1"));
        assert_eq!(fields.status, StudentStatus::Active);
        assert_eq!(fields.lookup_code, None);
    }

    #[test]
    fn create_rejects_existing_student() {
        let fields = populated();
        assert_eq!(
            StudentFields::apply(Some(&fields), &added()),
            Err(InvariantViolation::AlreadyExists)
        );
    }

    #[test]
    fn mutations_require_an_existing_student() {
        let status = StudentStatusSet {
            status: StudentStatus::Inactive,
        };
        let enrolled = StudentEnrolled {
            school_id: "S2".into(),
            date_of_enrollment: date(2025, 1, 1),
        };
        assert_eq!(
            StudentFields::apply(None, &status),
            Err(InvariantViolation::NotFound)
        );
        assert_eq!(
            StudentFields::apply(None, &enrolled),
            Err(InvariantViolation::NotFound)
        );
        assert_eq!(
            StudentFields::apply(None, &StudentUnenrolled {}),
            Err(InvariantViolation::NotFound)
        );
    }

    #[test]
    fn status_only_touches_status() {
        let before = populated();
        let after = StudentFields::apply(
            Some(&before),
            &StudentStatusSet {
                status: StudentStatus::Inactive,
            },
        )
        .unwrap();
        assert_eq!(after.status, StudentStatus::Inactive);
        assert_eq!(
            StudentFields {
                status: StudentStatus::Active,
                ..after
            },
            before
        );
    }

    #[test]
    fn enroll_overwrites_school_and_date_only() {
        let before = populated();
        let after = StudentFields::apply(
            Some(&before),
            &StudentEnrolled {
                school_id: "S9".into(),
                date_of_enrollment: date(2025, 9, 1),
            },
        )
        .unwrap();
        assert_eq!(after.school_id.as_deref(), Some("S9"));
        assert_eq!(after.date_of_enrollment, Some(date(2025, 9, 1)));
        assert_eq!(after.first_name, before.first_name);
        assert_eq!(after.status, before.status);
    }

    #[test]
    fn unenroll_clears_school() {
        let after = StudentFields::apply(Some(&populated()), &StudentUnenrolled {}).unwrap();
        assert_eq!(after.school_id, None);
        assert_eq!(after.date_of_enrollment, None);
    }

    #[test]
    fn blank_lookup_code_is_rejected() {
        let fields = populated();
        assert_eq!(
            StudentFields::apply(
                Some(&fields),
                &LookupCodeSet {
                    code: "  ".into()
                }
            ),
            Err(InvariantViolation::EmptyLookupCode)
        );
    }

    #[test]
    fn lookup_code_on_missing_student_reports_not_found_first() {
        assert_eq!(
            StudentFields::apply(None, &LookupCodeSet { code: String::new() }),
            Err(InvariantViolation::NotFound)
        );
    }

    #[test]
    fn sum_type_reports_payload_kind() {
        let event: StudentEvent = LookupCodeSet {
            code: "X1".into(),
        }
        .into();
        assert_eq!(event.kind(), EventKind::SetLookupCode);
        assert_eq!(event.encode().unwrap(), br#"{"code":"X1"}"#);
    }
}
