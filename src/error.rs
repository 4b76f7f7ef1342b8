//! Error types for the caching layer
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

// == Fetch Error Enum ==
/// Unified error type for the caching layer.
#[derive(Error, Debug)]
pub enum FetchError {
    /// The request URL could not be parsed
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The request URL has no authority to key an origin on
    #[error("Unsupported URL: {0}")]
    UnsupportedUrl(String),

    /// The underlying fetcher failed before producing a response
    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// An eviction weigher rejected an entry
    #[error("Weigher failed: {0}")]
    Weigher(String),

    /// An eviction pass this caller was waiting on did not complete
    #[error("Eviction pass interrupted")]
    GcInterrupted,
}

// == Result Type Alias ==
/// Convenience Result type for the caching layer.
pub type Result<T> = std::result::Result<T, FetchError>;
