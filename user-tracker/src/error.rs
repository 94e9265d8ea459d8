use thiserror::Error;

pub type TrackerResult<T> = Result<T, TrackerError>;

/// Message attached to responses whose `errors` field is populated.
pub const GRAPHQL_HAS_RETURNED_ERRORS: &str = "graphql has returned errors";

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("Response decoding failed: {0}")]
    DecodeError(#[from] serde_json::Error),

    #[error("graphql has returned errors")]
    GraphQlErrors,

    #[error("Authentication domain {0} missing from user page")]
    MissingDomain(String),

    #[error("Could not forward {target}: {message}")]
    FlushError {
        target: &'static str,
        message: String
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Units failed: {}", .0.join(", "))]
    UnitsFailed(Vec<&'static str>)
}

impl TrackerError {
    /// Network, HTTP status and body decoding failures.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::HttpError(_) | Self::ApiError { .. } | Self::DecodeError(_)
        )
    }
}
