use crate::sink::Outcome;

/// Failure classification for a single request attempt.
///
/// The lifecycle engine never propagates these upward; every variant is
/// folded into a [`LifecycleRecord`](crate::sink::LifecycleRecord) with the
/// matching [`Outcome`] and a short detail tag. Only the report layer renders
/// human-readable strings.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// Per-request deadline expired before the response completed.
    #[error("request timed out")]
    Timeout,

    /// Connection-level failure: refused, reset, DNS, or TLS.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Server answered with a non-2xx status.
    #[error("HTTP {0}")]
    Http(u16),

    /// The response body or SSE stream could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The run-level cancellation token fired mid-request.
    #[error("request canceled")]
    Canceled,
}

impl RequestError {
    /// Map a transport error from reqwest into the right variant.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RequestError::Timeout
        } else if err.is_connect() {
            RequestError::Connection(err.to_string())
        } else if let Some(status) = err.status() {
            RequestError::Http(status.as_u16())
        } else if err.is_body() || err.is_decode() {
            RequestError::Malformed(err.to_string())
        } else {
            RequestError::Connection(err.to_string())
        }
    }

    pub fn outcome(&self) -> Outcome {
        match self {
            RequestError::Timeout => Outcome::Timeout,
            RequestError::Connection(_) => Outcome::ConnectionError,
            RequestError::Http(status) if (400..500).contains(status) => Outcome::ClientError,
            RequestError::Http(_) => Outcome::ServerError,
            RequestError::Malformed(_) => Outcome::ServerError,
            RequestError::Canceled => Outcome::Canceled,
        }
    }

    /// Short machine-readable tag stored in `error_detail`.
    pub fn detail(&self) -> String {
        match self {
            RequestError::Timeout => "timeout".to_string(),
            RequestError::Connection(_) => "connection".to_string(),
            RequestError::Http(status) => status.to_string(),
            RequestError::Malformed(_) => "malformed".to_string(),
            RequestError::Canceled => "canceled".to_string(),
        }
    }
}
