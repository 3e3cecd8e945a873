use thiserror::Error;

/// Database layer errors
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),

    #[error("Pool error: {0}")]
    PoolError(#[from] diesel_async::pooled_connection::bb8::RunError),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Unique constraint or optimistic revision check failed.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    CoreError(#[from] klinik_core::error::CoreError),
}

impl DbError {
    /// Maps diesel's "no rows" into `NotFound` with a readable subject.
    pub(crate) fn not_found_or(err: diesel::result::Error, what: impl FnOnce() -> String) -> Self {
        match err {
            diesel::result::Error::NotFound => Self::NotFound(what()),
            diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation,
                info,
            ) => Self::Conflict(info.message().to_string()),
            other => Self::DatabaseError(other),
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;
