use thiserror::Error;

pub type Result<T> = std::result::Result<T, OriginatorError>;

/// Uniform error surface of the service API. Every variant carries a
/// verbatim diagnostic the caller owns.
#[derive(Debug, Error)]
pub enum OriginatorError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("storage error: {0}")]
    Storage(#[from] originator_store::StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}
