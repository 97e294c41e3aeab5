use thiserror::Error;

/// Errors from constructing core protocol values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error(transparent)]
    InvalidObject(#[from] InvalidObject),

    #[error(transparent)]
    InvalidVersion(#[from] InvalidVersion),

    #[error("client token is empty")]
    EmptyToken,

    #[error("nonce must be {expected} bytes, got {got}")]
    BadNonceLength { expected: usize, got: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidObject {
    #[error("object name is empty")]
    EmptyName,
    #[error("object name is {got} bytes, limit {max}")]
    NameTooLong { got: usize, max: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalidation version {0} is negative")]
pub struct InvalidVersion(pub i64);
