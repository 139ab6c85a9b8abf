//! Postgres implementation of the storage gateway traits. All entity writes
//! are upserts keyed by their primary key, which is what makes replaying a
//! block after a restart safe.

use chainscan_common::storage::StorageError;
use diesel_async::{
    pooled_connection::{
        deadpool::{Object, Pool, PoolError},
        AsyncDieselConnectionManager,
    },
    AsyncPgConnection,
};

mod gateway;
pub(crate) mod orm;
pub(crate) mod schema;

pub use gateway::PgImporterGateway;

pub(crate) type PooledConnection = Object<AsyncPgConnection>;

/// Builds the connection pool and fails fast when the database is
/// unreachable.
pub async fn connect(database_url: &str) -> Result<Pool<AsyncPgConnection>, StorageError> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder(manager)
        .build()
        .map_err(|err| StorageError::Unexpected(format!("Failed to build pool: {err}")))?;
    pool.get().await.map_err(PostgresError::from)?;
    Ok(pool)
}

/// Maps driver errors onto the storage taxonomy; connection-level problems
/// become `Unavailable` so the retry layer treats them as transient.
pub(crate) struct PostgresError(pub StorageError);

impl From<PostgresError> for StorageError {
    fn from(err: PostgresError) -> Self {
        err.0
    }
}

impl From<diesel::result::Error> for PostgresError {
    fn from(err: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error};
        let storage_error = match &err {
            Error::NotFound => StorageError::NotFound("row".to_string(), String::new()),
            Error::DatabaseError(kind, info) => match kind {
                DatabaseErrorKind::UniqueViolation => StorageError::DuplicateEntry(
                    info.table_name().unwrap_or("unknown").to_string(),
                    info.message().to_string(),
                ),
                DatabaseErrorKind::SerializationFailure |
                DatabaseErrorKind::ClosedConnection => {
                    StorageError::Unavailable(info.message().to_string())
                }
                _ => StorageError::Unexpected(err.to_string()),
            },
            Error::BrokenTransactionManager => {
                StorageError::Unavailable("broken transaction manager".to_string())
            }
            _ => StorageError::Unexpected(err.to_string()),
        };
        PostgresError(storage_error)
    }
}

impl From<PoolError> for PostgresError {
    fn from(err: PoolError) -> Self {
        PostgresError(StorageError::Unavailable(format!("Failed to retrieve connection: {err}")))
    }
}
