use salvo::http::StatusCode;
use salvo::writing::Json;
use salvo::{Depot, Request, Response, Writer, async_trait};
use serde::Serialize;
use thiserror::Error;

use klinik_core::error::CoreError;
use klinik_db::error::DbError;
use klinik_service::error::{ErrorClass, ServiceError};

/// Application-level errors (HTTP layer)
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    ServiceError(#[from] ServiceError),

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl From<DbError> for AppError {
    fn from(err: DbError) -> Self {
        Self::ServiceError(err.into())
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        Self::ServiceError(err.into())
    }
}

impl From<salvo::http::ParseError> for AppError {
    fn from(err: salvo::http::ParseError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

pub type AppResult<T> = std::result::Result<T, AppError>;

/// ## Summary
/// Error response payload
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

impl AppError {
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::ServiceError(err) => err.class(),
            Self::BadRequest(_) => ErrorClass::BadRequest,
        }
    }

    /// Machine-readable code: the token failure kind for credential errors,
    /// otherwise the error class.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ServiceError(ServiceError::Token(token)) => token.code(),
            _ => self.class().as_str(),
        }
    }

    /// Message safe to show a client. Internal failures are not described.
    fn public_message(&self) -> String {
        match self.class() {
            ErrorClass::Internal => "Internal server error".to_string(),
            ErrorClass::Forbidden | ErrorClass::NotConfigured => "Forbidden".to_string(),
            _ => self.to_string(),
        }
    }
}

#[must_use]
pub const fn status_for(class: ErrorClass) -> StatusCode {
    match class {
        ErrorClass::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorClass::Forbidden | ErrorClass::NotConfigured => StatusCode::FORBIDDEN,
        ErrorClass::Conflict => StatusCode::CONFLICT,
        ErrorClass::NotFound => StatusCode::NOT_FOUND,
        ErrorClass::BadRequest => StatusCode::BAD_REQUEST,
        ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Writes the error as JSON with the status of its class.
pub fn render_error(res: &mut Response, err: &AppError) {
    let class = err.class();
    match class {
        ErrorClass::Internal => tracing::error!(error = %err, "Request failed"),
        ErrorClass::NotConfigured => tracing::warn!(error = %err, "Request denied: unmapped route"),
        _ => tracing::debug!(error = %err, code = err.code(), "Request rejected"),
    }
    res.status_code(status_for(class));
    res.render(Json(ErrorResponse {
        error: err.public_message(),
        code: err.code(),
    }));
}

#[async_trait]
impl Writer for AppError {
    async fn write(self, _req: &mut Request, _depot: &mut Depot, res: &mut Response) {
        render_error(res, &self);
    }
}
