//! Postgres-backed stores for registrar.
//!
//! This crate provides `PostgreSQL` implementations of the core registrar
//! ports:
//!
//! - [`Store`] - An implementation of [`registrar_core::store::EventStore`]
//! - [`snapshot::Store`] - An implementation of
//!   [`registrar_core::snapshot::SnapshotStore`]
//! - [`projection::Store`] - An implementation of
//!   [`registrar_core::projection::ReadStore`]
//!
//! All of them can share a database and a connection pool.

mod error;
pub mod projection;
pub mod snapshot;

use chrono::{DateTime, Utc};
pub use error::Error;
use error::{from_column, to_column};
use registrar_core::{
    concurrency::VersionConflict,
    event::{Envelope, StudentId},
    store::{AppendError, EventStore, check_append},
};
use sqlx::{PgPool, Row};

/// A PostgreSQL-backed [`EventStore`].
///
/// Each student has one row in `registrar_streams` tracking the last
/// version; appends lock that row (`FOR UPDATE`) so the version check and the
/// insert happen atomically. `registrar_events` additionally carries a
/// primary key on `(aggregate_id, version)`.
#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the initial schema (idempotent).
    ///
    /// This uses `CREATE TABLE IF NOT EXISTS` style DDL so it can be run on
    /// startup.
    ///
    /// # Errors
    ///
    /// Returns a `sqlx::Error` if any of the schema creation queries fail.
    #[tracing::instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS registrar_streams (
                aggregate_id UUID PRIMARY KEY,
                last_version BIGINT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS registrar_events (
                aggregate_id UUID NOT NULL,
                version      BIGINT NOT NULL,
                event_kind   TEXT NOT NULL,
                data         BYTEA NOT NULL,
                recorded_at  TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (aggregate_id, version)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn append_failed(error: sqlx::Error) -> AppendError<Error> {
    AppendError::store(Error::Database(error))
}

impl EventStore for Store {
    type Error = Error;

    #[tracing::instrument(
        skip(self, id, envelope),
        fields(aggregate_id = %id, version = envelope.version())
    )]
    async fn append_if_version<'a>(
        &'a self,
        id: &'a StudentId,
        expected: Option<u64>,
        envelope: &'a Envelope,
    ) -> Result<(), AppendError<Self::Error>> {
        let version = to_column(envelope.version()).map_err(AppendError::store)?;

        let mut tx = self.pool.begin().await.map_err(append_failed)?;

        sqlx::query(
            r"
                INSERT INTO registrar_streams (aggregate_id, last_version)
                VALUES ($1, NULL)
                ON CONFLICT (aggregate_id) DO NOTHING
                ",
        )
        .bind(id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(append_failed)?;

        let current: Option<i64> = sqlx::query_scalar(
            r"
                SELECT last_version
                FROM registrar_streams
                WHERE aggregate_id = $1
                FOR UPDATE
                ",
        )
        .bind(id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(append_failed)?;
        let current = current
            .map(from_column)
            .transpose()
            .map_err(AppendError::store)?;

        // Dropping `tx` on rejection rolls back the placeholder stream row.
        check_append(id, expected, current, envelope)?;

        let inserted = sqlx::query(
            r"
                INSERT INTO registrar_events (aggregate_id, version, event_kind, data, recorded_at)
                VALUES ($1, $2, $3, $4, $5)
                ",
        )
        .bind(id.as_uuid())
        .bind(version)
        .bind(envelope.kind())
        .bind(envelope.data())
        .bind(envelope.timestamp())
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                tracing::debug!(?current, "append lost a version race");
                return Err(VersionConflict {
                    expected,
                    actual: Some(envelope.version()),
                }
                .into());
            }
            Err(e) => return Err(append_failed(e)),
        }

        sqlx::query(
            r"
                UPDATE registrar_streams
                SET last_version = $1
                WHERE aggregate_id = $2
                ",
        )
        .bind(version)
        .bind(id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(append_failed)?;

        tx.commit().await.map_err(append_failed)?;

        tracing::debug!("envelope appended");
        Ok(())
    }

    #[tracing::instrument(skip(self, id), fields(aggregate_id = %id))]
    async fn load_history<'a>(
        &'a self,
        id: &'a StudentId,
        from_version: Option<u64>,
    ) -> Result<Vec<Envelope>, Self::Error> {
        let from = to_column(from_version.unwrap_or(0))?;

        let rows = sqlx::query(
            r"
            SELECT event_kind, data, version, recorded_at
            FROM registrar_events
            WHERE aggregate_id = $1 AND version >= $2
            ORDER BY version ASC
            ",
        )
        .bind(id.as_uuid())
        .bind(from)
        .fetch_all(&self.pool)
        .await?;

        let mut history = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.try_get("event_kind")?;
            let data: Vec<u8> = row.try_get("data")?;
            let version: i64 = row.try_get("version")?;
            let recorded_at: DateTime<Utc> = row.try_get("recorded_at")?;
            history.push(Envelope::from_parts(
                kind,
                data,
                from_column(version)?,
                *id,
                recorded_at,
            ));
        }

        tracing::trace!(events = history.len(), "loaded history");
        Ok(history)
    }

    #[tracing::instrument(skip(self, id), fields(aggregate_id = %id))]
    async fn stream_version<'a>(&'a self, id: &'a StudentId) -> Result<Option<u64>, Self::Error> {
        let version: Option<i64> = sqlx::query_scalar(
            r"SELECT last_version FROM registrar_streams WHERE aggregate_id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .flatten();

        version.map(from_column).transpose()
    }

    async fn aggregate_ids(&self) -> Result<Vec<StudentId>, Self::Error> {
        let ids: Vec<uuid::Uuid> = sqlx::query_scalar(
            r"
            SELECT aggregate_id
            FROM registrar_streams
            WHERE last_version IS NOT NULL
            ORDER BY aggregate_id
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(StudentId::from_uuid).collect())
    }
}
