use thiserror::Error;

/// Failures talking to the external platforms (Helix, YouTube Data API).
///
/// The engine never retries on any of these; it logs and carries on.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{endpoint} returned {status}: {body}")]
    Status {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("{0} returned no data")]
    Empty(&'static str),

    #[error("unexpected response: {0}")]
    Malformed(String),

    #[error("no API key accepted the request")]
    NoUsableKey,
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
