//! Error types for the Slidegate service.

use thiserror::Error;

use crate::ratelimit::KeyError;
use crate::store::StoreError;

/// Main error type for Slidegate operations.
#[derive(Error, Debug)]
pub enum SlidegateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Window store errors surfaced to admin tooling
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Rate limit key derivation errors
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Slidegate operations.
pub type Result<T> = std::result::Result<T, SlidegateError>;
