use thiserror::Error;

use klinik_core::error::CoreError;
use klinik_db::error::DbError;

use crate::session::token::TokenError;

/// Caller-facing classification of a failure. The HTTP layer maps each class
/// to one status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Missing, invalid, expired or revoked credential.
    Unauthorized,
    /// Valid credential, denied by policy.
    Forbidden,
    /// Route has no resource mapping. Answered like `Forbidden`, logged apart.
    NotConfigured,
    /// Optimistic check or uniqueness constraint lost a race.
    Conflict,
    NotFound,
    BadRequest,
    /// Durable store, cache or engine failure.
    Internal,
}

impl ErrorClass {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotConfigured => "not_configured",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::BadRequest => "bad_request",
            Self::Internal => "internal",
        }
    }
}

/// Service layer errors - combines all error types
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Casbin error: {0}")]
    CasbinError(#[from] casbin::Error),

    #[error(transparent)]
    DatabaseError(#[from] DbError),

    #[error(transparent)]
    CoreError(#[from] CoreError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Authorization error: {0}")]
    AuthorizationError(String),

    #[error("No resource mapping for {method} {path}")]
    NotConfigured { method: String, path: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Durable state committed but the engine could not be brought in line.
    #[error(
        "Policy engine out of sync for {target} after {attempts} attempts \
         (resources {resource_ids:?}): {reason}"
    )]
    EngineSync {
        target: String,
        resource_ids: Vec<i32>,
        attempts: u32,
        reason: String,
    },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(&'static str),
}

impl ServiceError {
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Token(_) | Self::NotAuthenticated => ErrorClass::Unauthorized,
            Self::AuthorizationError(_) => ErrorClass::Forbidden,
            Self::NotConfigured { .. } => ErrorClass::NotConfigured,
            Self::Conflict(_) | Self::DatabaseError(DbError::Conflict(_)) => ErrorClass::Conflict,
            Self::NotFound(_) | Self::DatabaseError(DbError::NotFound(_)) => ErrorClass::NotFound,
            Self::InvalidInput(_)
            | Self::CoreError(_)
            | Self::DatabaseError(DbError::CoreError(_)) => ErrorClass::BadRequest,
            Self::CasbinError(_)
            | Self::DatabaseError(_)
            | Self::EngineSync { .. }
            | Self::Cache(_)
            | Self::Serialization(_)
            | Self::InvalidConfiguration(_)
            | Self::InvariantViolation(_) => ErrorClass::Internal,
        }
    }
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_follow_taxonomy() {
        assert_eq!(
            ServiceError::Token(TokenError::Expired).class(),
            ErrorClass::Unauthorized
        );
        assert_eq!(
            ServiceError::NotConfigured {
                method: "GET".into(),
                path: "/api/x".into()
            }
            .class(),
            ErrorClass::NotConfigured
        );
        assert_eq!(
            ServiceError::DatabaseError(DbError::Conflict("revision".into())).class(),
            ErrorClass::Conflict
        );
        assert_eq!(
            ServiceError::EngineSync {
                target: "role:2".into(),
                resource_ids: vec![1],
                attempts: 3,
                reason: "save failed".into(),
            }
            .class(),
            ErrorClass::Internal
        );
        assert_eq!(
            ServiceError::DatabaseError(DbError::CoreError(CoreError::InvalidInput("x".into())))
                .class(),
            ErrorClass::BadRequest
        );
    }
}
