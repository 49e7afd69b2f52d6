use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode entity {entity_id}: {reason}")]
    Encode { entity_id: u64, reason: String },

    #[error("failed to decode {path}: {reason}")]
    Decode { path: String, reason: String },

    #[error("entity {0} not found")]
    NotFound(u64),

    #[error("entity {0} already has an identity")]
    AlreadyStored(u64),
}
