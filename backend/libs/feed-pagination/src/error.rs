//! Feed pagination error types

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// The cursor no longer resolves to a position in the feed (malformed, or
    /// the referenced item was deleted). Not retryable: restart or stop.
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    /// Transient transport/storage failure. Retryable.
    #[error("Source unavailable: {message}")]
    SourceUnavailable {
        status: Option<u16>,
        message: String,
    },

    /// Client-error class failure (bad request, unauthorized, ...). Not retryable.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The source answered, but not with a valid page. Retrying gets the same answer.
    #[error("Malformed page: {0}")]
    MalformedPage(String),

    /// A fetch result arrived after its feed was reset or torn down.
    #[error("Request superseded")]
    RequestSuperseded,

    #[error("Item {0} is not cached")]
    ItemNotCached(Uuid),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl FeedError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            status: None,
            message: message.into(),
        }
    }

    /// Whether an automatic retry may succeed.
    ///
    /// Only transient/server-class failures qualify; everything else would fail
    /// the same way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SourceUnavailable { status, .. } => match status {
                Some(code) => *code >= 500 || *code == 408 || *code == 429,
                None => true,
            },
            _ => false,
        }
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        if err.is_decode() {
            return Self::MalformedPage(err.to_string());
        }
        Self::SourceUnavailable {
            status,
            message: err.to_string(),
        }
    }
}

impl From<envy::Error> for FeedError {
    fn from(err: envy::Error) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FeedError>;
