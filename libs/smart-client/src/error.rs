//! Error types for the SMART client

use std::sync::Arc;

use reqwest::StatusCode;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// SMART client errors
#[derive(Error, Debug)]
pub enum Error {
    /// The server answered with a non-success HTTP status.
    #[error("HTTP {status} for {url}: {message}")]
    Transport {
        status: StatusCode,
        url: String,
        message: String,
    },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Refresh was requested but the session cannot support it.
    #[error("Unable to refresh: {0}")]
    RefreshPrecondition(&'static str),

    /// The token endpoint responded, but not with a usable access token.
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    /// A 401 with no access token ever granted.
    #[error("This app cannot be accessed directly; it must be launched as an authorized SMART app")]
    NotAuthorized,

    /// A 401 on a session that existed but could not be recovered.
    #[error("Session expired; please re-launch the app")]
    SessionExpired,

    /// A reference fetch failed with something other than "not found".
    #[error("Failed to resolve reference {reference}")]
    ReferenceFetch {
        reference: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Invalid reference path: {0}")]
    InvalidReferencePath(String),

    #[error("Invalid server URL: {0}")]
    InvalidServerUrl(String),

    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Request cancelled")]
    Cancelled,

    /// A failure observed through a shared in-flight operation (refresh
    /// single-flight or a deduplicated reference fetch).
    #[error("{0}")]
    Shared(Arc<Error>),
}

impl Error {
    /// The HTTP status behind this error, if any, looking through shared
    /// and reference-fetch wrappers.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Transport { status, .. } => Some(*status),
            Error::Network(err) => err.status(),
            Error::ReferenceFetch { source, .. } => source.status(),
            Error::Shared(inner) => inner.status(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }
}

impl From<Arc<Error>> for Error {
    fn from(err: Arc<Error>) -> Self {
        Error::Shared(err)
    }
}
