//! Error types for beenet.
//!
//! Mirrors the error kinds from the component design: a storage failure, a
//! cryptographic failure, a protocol-level wire violation, a discovery
//! start/stop failure, a transfer failure, or a validation failure on a
//! public operation. Protocol errors are absorbed at the packet boundary and
//! never reach a caller as a `Result::Err` from the public API - see the
//! discovery and noise modules.

use thiserror::Error;

/// Result type alias for beenet operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("cryptographic error: {0}")]
    Cryptographic(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("discovery error: {0}")]
    Discovery(String),

    #[error("transfer error: {0}")]
    Transfer(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("noise protocol error: {0}")]
    Noise(#[from] snow::Error),
}

impl Error {
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Cryptographic(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn transfer(msg: impl Into<String>) -> Self {
        Error::Transfer(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// True for errors a caller may reasonably retry (storage/network-ish
    /// failures); false for validation and cryptographic failures, which
    /// indicate a programming error or an adversarial input rather than a
    /// transient condition.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Discovery(_) | Error::Transfer(_) | Error::Io(_))
    }
}
