use thiserror::Error;

/// Errors raised while validating administrator input before it reaches a
/// store.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unsupported HTTP method: {0:?}")]
    UnsupportedMethod(String),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
