use std::{sync::Arc, time::Duration};

use crate::cache_codec::ValidationError;

/// Represents a result type for operations in the flagwise client.
///
/// This `Result` type is a standard Rust `Result` type where the error variant is defined by the
/// [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur while talking to the flags service or to
/// local storage.
///
/// None of these errors reach callers of [`Client::get_flags`](crate::Client::get_flags) or
/// [`Client::initialize`](crate::Client::initialize): flag resolution always falls back to cached
/// or fallback flags. They are surfaced by the lower-level building blocks
/// ([`FlagsTransport`](crate::fetcher::FlagsTransport), [`Storage`](crate::storage::Storage)) and
/// show up in logs.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The request was unauthorized, possibly due to an invalid publishable key.
    #[error("unauthorized, publishable key is likely invalid")]
    Unauthorized,

    /// The server responded with a non-2xx status code.
    #[error("received non-2xx response: {0}")]
    Status(reqwest::StatusCode),

    /// The server response did not have the expected shape.
    #[error("invalid response from flags service")]
    InvalidResponse(#[source] Arc<ValidationError>),

    /// The request did not complete within the configured timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Serialization error.
    #[error(transparent)]
    Json(Arc<serde_json::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        // Query string carries the publishable key and user context, don't leak them to logs.
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(Arc::new(value))
    }
}

impl From<ValidationError> for Error {
    fn from(value: ValidationError) -> Self {
        Error::InvalidResponse(Arc::new(value))
    }
}
