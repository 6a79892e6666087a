//! Errors surfaced by the completion client.

/// Failure of a chat, summary, or image request.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// The server rejected the credentials (HTTP 401). Never retried.
    #[error("unauthorized: check the API key or access code")]
    Unauthorized,
    /// Non-success HTTP status other than 401.
    #[error("api error {status}: {body}")]
    Stream { status: u16, body: String },
    /// Transport failure while sending or reading the body.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// No response headers within the request timeout.
    #[error("request timed out")]
    Timeout,
    /// The request was cancelled through its handle.
    #[error("request aborted")]
    Aborted,
    /// Malformed response body or stream frame.
    #[error("parse error: {0}")]
    Parse(String),
    /// Background topic or memory summarization failed.
    #[error("summarization failed: {0}")]
    Summarization(String),
}

impl ChatError {
    /// Cancellation is not an error from the user's point of view.
    pub fn is_aborted(&self) -> bool {
        matches!(self, ChatError::Aborted)
    }
}
