//! Error types for responsive image loading

use thiserror::Error;

/// Result type alias for crate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failure to load one image URL.
///
/// This is memoized by the resource cache and handed to every caller that
/// asks for the same URL, hence `Clone`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Cannot load image from source '{url}': {reason}")]
pub struct ImageError {
    /// The offending URL
    pub url: String,
    /// Human readable cause (network error, HTTP status, content type...)
    pub reason: String,
}

impl ImageError {
    pub fn new(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

/// Errors that can occur while configuring or driving image components
#[derive(Error, Debug)]
pub enum Error {
    /// An image failed to load
    #[error(transparent)]
    ImageLoad(#[from] ImageError),

    /// Failed to initialize a backend (HTTP client, global cache...)
    #[error("Initialization failed: {0}")]
    InitializationError(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}
