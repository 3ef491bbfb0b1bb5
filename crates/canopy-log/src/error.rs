//! Replication log errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("failed to encode payload: {0}")]
    EncodeFailed(String),

    #[error("failed to decode payload: {0}")]
    DecodeFailed(String),
}
