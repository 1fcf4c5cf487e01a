//! PostgreSQL-backed snapshot store implementation.
//!
//! This module provides [`Store`], an implementation of
//! [`registrar_core::snapshot::SnapshotStore`] for `PostgreSQL`.

use std::future::Future;

use chrono::{DateTime, Utc};
use registrar_core::{
    event::StudentId,
    snapshot::{Snapshot, SnapshotPolicy, SnapshotStore},
};
use sqlx::{PgPool, Row};

use crate::error::{from_column, to_column};

pub use crate::Error;

/// A PostgreSQL-backed snapshot store with configurable policy.
///
/// Snapshots live in `registrar_snapshots`, one row per student, next to the
/// event tables.
///
/// # Schema
///
/// The store uses the following table schema (created by [`migrate()`](Self::migrate)):
///
/// ```sql
/// CREATE TABLE IF NOT EXISTS registrar_snapshots (
///     aggregate_id UUID PRIMARY KEY,
///     version      BIGINT NOT NULL,
///     data         BYTEA NOT NULL,
///     taken_at     TIMESTAMPTZ NOT NULL
/// )
/// ```
///
/// # Example
///
/// ```ignore
/// use registrar_core::repository::Repository;
///
/// let pool = PgPool::connect("postgres://...").await?;
/// let event_store = registrar_postgres::Store::new(pool.clone());
/// let snapshot_store = registrar_postgres::snapshot::Store::every(pool, 100);
///
/// event_store.migrate().await?;
/// snapshot_store.migrate().await?;
///
/// let repo = Repository::new(event_store).with_snapshots(snapshot_store);
/// ```
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    policy: SnapshotPolicy,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Store {
    #[must_use]
    pub const fn with_policy(pool: PgPool, policy: SnapshotPolicy) -> Self {
        Self { pool, policy }
    }

    /// Create a snapshot store that saves after every command.
    #[must_use]
    pub const fn always(pool: PgPool) -> Self {
        Self::with_policy(pool, SnapshotPolicy::Always)
    }

    /// Create a snapshot store that saves whenever a stream reaches a
    /// multiple of `n` events.
    #[must_use]
    pub const fn every(pool: PgPool, n: u64) -> Self {
        Self::with_policy(pool, SnapshotPolicy::EveryNEvents(n))
    }

    /// Create a snapshot store that never saves (load-only).
    #[must_use]
    pub const fn never(pool: PgPool) -> Self {
        Self::with_policy(pool, SnapshotPolicy::Never)
    }

    /// Apply the snapshot schema (idempotent).
    ///
    /// # Errors
    ///
    /// Returns a `sqlx::Error` if the schema creation query fails.
    #[tracing::instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS registrar_snapshots (
                aggregate_id UUID PRIMARY KEY,
                version      BIGINT NOT NULL,
                data         BYTEA NOT NULL,
                taken_at     TIMESTAMPTZ NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

impl SnapshotStore for Store {
    type Error = Error;

    #[tracing::instrument(skip(self, id), fields(aggregate_id = %id))]
    async fn load_latest<'a>(&'a self, id: &'a StudentId) -> Result<Option<Snapshot>, Self::Error> {
        let row = sqlx::query(
            r"
            SELECT version, data, taken_at
            FROM registrar_snapshots
            WHERE aggregate_id = $1
            ",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        let snapshot = match row {
            Some(row) => {
                let version: i64 = row.try_get("version")?;
                let data: Vec<u8> = row.try_get("data")?;
                let timestamp: DateTime<Utc> = row.try_get("taken_at")?;
                Some(Snapshot {
                    version: from_column(version)?,
                    timestamp,
                    data,
                })
            }
            None => None,
        };

        tracing::trace!(found = snapshot.is_some(), "snapshot lookup");
        Ok(snapshot)
    }

    fn save<'a>(
        &'a self,
        id: &'a StudentId,
        snapshot: Snapshot,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        async move {
            let version = to_column(snapshot.version)?;

            // Only replace an existing snapshot with a newer one, so a slow
            // writer cannot roll the stored snapshot back.
            let result = sqlx::query(
                r"
                INSERT INTO registrar_snapshots (aggregate_id, version, data, taken_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (aggregate_id)
                DO UPDATE SET version = EXCLUDED.version, data = EXCLUDED.data, taken_at = EXCLUDED.taken_at
                WHERE registrar_snapshots.version < EXCLUDED.version
                ",
            )
            .bind(id.as_uuid())
            .bind(version)
            .bind(&snapshot.data)
            .bind(snapshot.timestamp)
            .execute(&self.pool)
            .await?;

            tracing::debug!(
                aggregate_id = %id,
                version = snapshot.version,
                replaced = result.rows_affected() > 0,
                "snapshot saved"
            );
            Ok(())
        }
    }

    fn policy(&self) -> SnapshotPolicy {
        self.policy
    }
}
