/// Error type for `PostgreSQL` event store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Query execution or transaction failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A negative version was read from the database.
    #[error("invalid version value from database: {0}")]
    InvalidVersion(i64),
    /// A version too large for a `BIGINT` column was supplied.
    #[error("version {0} does not fit in a BIGINT column")]
    VersionOutOfRange(u64),
}

pub(crate) fn to_column(version: u64) -> Result<i64, Error> {
    i64::try_from(version).map_err(|_| Error::VersionOutOfRange(version))
}

pub(crate) fn from_column(version: i64) -> Result<u64, Error> {
    u64::try_from(version).map_err(|_| Error::InvalidVersion(version))
}
