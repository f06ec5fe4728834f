use thiserror::Error;

/// Main error type for the Analysis Service client
#[derive(Error, Debug)]
pub enum ApiError {
    /// Service returned a non-success status with a parseable message
    #[error("analysis service error (HTTP {status}): {message}")]
    Service { status: u16, message: String },

    /// 429 or quota exhaustion for the calling credential
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The model reported the request exceeds its context window
    #[error("request too large for model context: {0}")]
    ContextExceeded(String),

    /// Resumable-upload initiation did not return an upload URL header
    #[error("upload initiation response missing {0} header")]
    MissingUploadUrl(&'static str),

    /// File intake ended in the FAILED state
    #[error("file processing failed: {0}")]
    FileFailed(String),

    /// Generation response carried no usable candidate text
    #[error("model response contained no candidate text")]
    EmptyCandidates,

    /// HTTP transport error (connect, timeout, body)
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid URL
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl ApiError {
    /// Classify a non-success HTTP response.
    pub fn from_status(status: u16, body: String) -> Self {
        let message = extract_message(&body).unwrap_or(body);
        if status == 429 || message.to_ascii_lowercase().contains("quota") {
            return ApiError::RateLimited(message);
        }
        if message.to_ascii_lowercase().contains("token count exceeds")
            || message.to_ascii_lowercase().contains("context length")
        {
            return ApiError::ContextExceeded(message);
        }
        ApiError::Service { status, message }
    }

    /// Rate-limit signals put the offending credential into cooldown.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ApiError::RateLimited(_))
    }

    /// Transient errors are worth one retry; terminal ones are not.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Service { status, .. } => *status >= 500,
            ApiError::Request(e) => e.is_timeout() || e.is_connect() || e.is_body(),
            ApiError::RateLimited(_) => true,
            _ => false,
        }
    }
}

/// Pull `error.message` out of a JSON error body, if there is one.
fn extract_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("error")?
        .get("message")?
        .as_str()
        .map(str::to_owned)
}

/// Result type alias for Analysis Service operations
pub type ApiResult<T> = Result<T, ApiError>;
