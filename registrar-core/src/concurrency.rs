//! Optimistic concurrency conflict.
//!
//! A writer records the version it last observed and appends on the condition
//! that the stream is still at that version. When another writer got there
//! first, the append fails with [`VersionConflict`] and the loser must reload
//! and retry.

use thiserror::Error;

/// Another writer advanced the stream past the expected version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{}", format_conflict(*.expected, *.actual))]
pub struct VersionConflict {
    /// The version the writer observed. `None` means it expected an empty
    /// stream.
    pub expected: Option<u64>,
    /// The version actually found. `None` means the stream is empty.
    pub actual: Option<u64>,
}

/// Build a human-readable message for a [`VersionConflict`], including an
/// actionable hint for the caller.
fn format_conflict(expected: Option<u64>, actual: Option<u64>) -> String {
    match (expected, actual) {
        (None, Some(actual)) => format!(
            "version conflict: expected new stream, found version {actual} (hint: another \
             process created this student; reload and retry)"
        ),
        (Some(expected), Some(actual)) => format!(
            "version conflict: expected version {expected}, found {actual} (hint: stream was \
             modified; reload and retry)"
        ),
        (Some(expected), None) => format!(
            "version conflict: expected version {expected}, found empty stream (hint: reload \
             and retry)"
        ),
        (None, None) => "version conflict: unexpected empty state".to_string(),
    }
}
