use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("CRM API error (status code: {status}): {message}")]
    Api { status: u16, message: String },

    #[error("rate limit from CRM, retry after {0}s")]
    RateLimit(u64),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("report error: {0}")]
    Report(String),

    #[error("you have to specify CRM API credentials")]
    MissingCredentials,

    #[error("specify comparison criteria before combining")]
    EmptyCriteria,

    #[error("unknown blocking mode: {0}")]
    InvalidBlockingMode(String),

    #[error("invalid option {0}: {1}")]
    InvalidOption(String, String),

    #[error(transparent)]
    Core(#[from] combiner_core::CoreError),
}

impl EngineError {
    /// HTTP status to log alongside the message, when the failure came from the CRM.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::RateLimit(_) => Some(429),
            Self::Http(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
