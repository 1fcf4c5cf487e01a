//! Event envelope and the closed set of event kinds.
//!
//! An [`Envelope`] is the immutable unit of history: a kind tag, the opaque
//! serialized payload, the per-aggregate version, the owning student and the
//! time it was issued. Envelopes never change after they are built; stores
//! persist them as-is and replay hands them back in ascending version order.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Stable external identifier of a student aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StudentId(Uuid);

impl StudentId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for StudentId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for StudentId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for StudentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The closed set of event kinds a student stream may contain.
///
/// The string tag returned by [`EventKind::as_str`] is what gets persisted in
/// [`Envelope::kind`]; it is part of the storage format and must never change
/// for an existing variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    AddStudent,
    SetStudentStatus,
    UpdateStudent,
    EnrollStudent,
    UnenrollStudent,
    SetLookupCode,
}

impl EventKind {
    pub const ALL: [Self; 6] = [
        Self::AddStudent,
        Self::SetStudentStatus,
        Self::UpdateStudent,
        Self::EnrollStudent,
        Self::UnenrollStudent,
        Self::SetLookupCode,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AddStudent => "AddStudent",
            Self::SetStudentStatus => "SetStudentStatus",
            Self::UpdateStudent => "UpdateStudent",
            Self::EnrollStudent => "EnrollStudent",
            Self::UnenrollStudent => "UnenrollStudent",
            Self::SetLookupCode => "SetLookupCode",
        }
    }

    /// Resolve a persisted tag back to its kind.
    ///
    /// Returns `None` for tags outside the closed set.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Marker trait for typed event payloads.
///
/// Each payload struct names the [`EventKind`] it is persisted under, so the
/// registry can route stored bytes back to the right type.
pub trait DomainEvent {
    const KIND: EventKind;
}

/// Error returned when turning a stored envelope back into a typed event.
#[derive(Debug, Error)]
pub enum EventDecodeError {
    /// The envelope's tag has no registration.
    #[error("unknown event kind `{kind}`, expected one of {expected:?}")]
    UnknownKind {
        kind: String,
        expected: Vec<&'static str>,
    },
    /// The payload bytes do not match the schema registered for the tag.
    #[error("failed to decode `{kind}` payload: {source}")]
    Payload {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Immutable record of one state change of one student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    kind: String,
    data: Vec<u8>,
    version: u64,
    aggregate_id: StudentId,
    timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Build an envelope for a known event kind.
    #[must_use]
    pub fn new(
        kind: EventKind,
        data: Vec<u8>,
        version: u64,
        aggregate_id: StudentId,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::from_parts(kind.as_str(), data, version, aggregate_id, timestamp)
    }

    /// Rebuild an envelope from its stored columns.
    ///
    /// The tag is kept verbatim; it is only validated when the envelope is
    /// applied.
    #[must_use]
    pub fn from_parts(
        kind: impl Into<String>,
        data: Vec<u8>,
        version: u64,
        aggregate_id: StudentId,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: kind.into(),
            data,
            version,
            aggregate_id,
            timestamp,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub const fn aggregate_id(&self) -> &StudentId {
        &self.aggregate_id
    }

    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
