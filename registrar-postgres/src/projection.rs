//! PostgreSQL-backed read store.

use chrono::{DateTime, NaiveDate, Utc};
use registrar_core::{
    domain::StudentStatus,
    event::StudentId,
    projection::{ReadStore, StudentRow},
};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::error::{from_column, to_column};

/// Error type for the `PostgreSQL` read store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] crate::Error),
    #[error("lookup code `{code}` already belongs to student {owner}")]
    CodeTaken { code: String, owner: StudentId },
    #[error("unknown student status `{0}` in read model")]
    InvalidStatus(String),
}

impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        Self::Store(crate::Error::Database(error))
    }
}

/// [`ReadStore`] over the `registrar_students` and `registrar_student_codes`
/// tables.
#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the read model schema (idempotent).
    ///
    /// # Errors
    ///
    /// Returns a `sqlx::Error` if any of the schema creation queries fail.
    #[tracing::instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS registrar_students (
                id                 UUID PRIMARY KEY,
                first_name         TEXT NOT NULL,
                last_name          TEXT NOT NULL,
                date_of_birth      DATE NOT NULL,
                school_id          TEXT NULL,
                date_of_enrollment DATE NULL,
                status             TEXT NOT NULL,
                lookup_code        TEXT NULL,
                version            BIGINT NOT NULL,
                active             BOOLEAN NOT NULL,
                updated_at         TIMESTAMPTZ NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS registrar_student_codes (
                code       TEXT PRIMARY KEY,
                student_id UUID NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn decode_row(row: &PgRow) -> Result<StudentRow, Error> {
    let id: uuid::Uuid = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let version: i64 = row.try_get("version")?;
    let date_of_birth: NaiveDate = row.try_get("date_of_birth")?;
    let date_of_enrollment: Option<NaiveDate> = row.try_get("date_of_enrollment")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    Ok(StudentRow {
        id: StudentId::from_uuid(id),
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        date_of_birth,
        school_id: row.try_get("school_id")?,
        date_of_enrollment,
        status: StudentStatus::parse(&status).ok_or(Error::InvalidStatus(status))?,
        lookup_code: row.try_get("lookup_code")?,
        version: from_column(version)?,
        active: row.try_get("active")?,
        updated_at,
    })
}

impl ReadStore for Store {
    type Error = Error;

    #[tracing::instrument(skip(self, row), fields(aggregate_id = %row.id, version = row.version))]
    async fn upsert_student<'a>(&'a self, row: &'a StudentRow) -> Result<(), Self::Error> {
        let version = to_column(row.version)?;

        let result = sqlx::query(
            r"
            INSERT INTO registrar_students (
                id, first_name, last_name, date_of_birth, school_id, date_of_enrollment,
                status, lookup_code, version, active, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                first_name = EXCLUDED.first_name,
                last_name = EXCLUDED.last_name,
                date_of_birth = EXCLUDED.date_of_birth,
                school_id = EXCLUDED.school_id,
                date_of_enrollment = EXCLUDED.date_of_enrollment,
                status = EXCLUDED.status,
                lookup_code = EXCLUDED.lookup_code,
                version = EXCLUDED.version,
                active = EXCLUDED.active,
                updated_at = EXCLUDED.updated_at
            WHERE registrar_students.version <= EXCLUDED.version
            ",
        )
        .bind(row.id.as_uuid())
        .bind(&row.first_name)
        .bind(&row.last_name)
        .bind(row.date_of_birth)
        .bind(row.school_id.as_deref())
        .bind(row.date_of_enrollment)
        .bind(row.status.as_str())
        .bind(row.lookup_code.as_deref())
        .bind(version)
        .bind(row.active)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::trace!("skipping stale row");
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, id), fields(aggregate_id = %id))]
    async fn insert_lookup_code<'a>(
        &'a self,
        code: &'a str,
        id: &'a StudentId,
    ) -> Result<(), Self::Error> {
        let result = sqlx::query(
            r"
            INSERT INTO registrar_student_codes (code, student_id)
            VALUES ($1, $2)
            ON CONFLICT (code) DO NOTHING
            ",
        )
        .bind(code)
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let owner: uuid::Uuid =
            sqlx::query_scalar(r"SELECT student_id FROM registrar_student_codes WHERE code = $1")
                .bind(code)
                .fetch_one(&self.pool)
                .await?;
        let owner = StudentId::from_uuid(owner);
        if owner == *id {
            Ok(())
        } else {
            Err(Error::CodeTaken {
                code: code.to_string(),
                owner,
            })
        }
    }

    #[tracing::instrument(skip(self, id), fields(aggregate_id = %id))]
    async fn get_student<'a>(&'a self, id: &'a StudentId) -> Result<Option<StudentRow>, Self::Error> {
        let row = sqlx::query(r"SELECT * FROM registrar_students WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(decode_row).transpose()
    }

    #[tracing::instrument(skip(self))]
    async fn find_by_lookup_code<'a>(
        &'a self,
        code: &'a str,
    ) -> Result<Option<StudentId>, Self::Error> {
        let owner: Option<uuid::Uuid> =
            sqlx::query_scalar(r"SELECT student_id FROM registrar_student_codes WHERE code = $1")
                .bind(code)
                .fetch_optional(&self.pool)
                .await?;

        Ok(owner.map(StudentId::from_uuid))
    }
}
