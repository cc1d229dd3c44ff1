//! Error types for polycache operations.

use thiserror::Error;

/// Backend I/O and capacity errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend I/O failure: {reason}")]
    Io { reason: String },

    #[error("quota exceeded after {attempts} cleanup attempt(s)")]
    QuotaExceeded { attempts: u32 },

    #[error("transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("entry corrupt or unparsable at key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// (De)serialization failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("failed to encode value: {reason}")]
    EncodeFailed { reason: String },

    #[error("failed to decode value: {reason}")]
    DecodeFailed { reason: String },

    #[error("value contains a cyclic reference and cannot be persisted")]
    CyclicReference,
}

/// Configuration validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("unknown eviction strategy: {name}")]
    UnknownEvictionStrategy { name: String },

    #[error("incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },
}

/// Opaque failure surfaced from the remote item API capability.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("api call failed: {message}")]
pub struct ApiError {
    pub message: String,
    pub retryable: bool,
}

impl ApiError {
    pub fn new(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            message: message.into(),
            retryable,
        }
    }
}

/// Event bus violations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("cannot subscribe: event bus has been destroyed")]
    Destroyed,
}

/// Master error type for all polycache operations.
#[derive(Debug, Clone, Error)]
pub enum PolycacheError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("api error: {0}")]
    Api(#[from] ApiError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

/// Result type alias for polycache operations.
pub type PolycacheResult<T> = Result<T, PolycacheError>;
