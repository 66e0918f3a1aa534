use thiserror::Error;

/// Type alias for Result with UnsubscribeError
pub type Result<T> = std::result::Result<T, UnsubscribeError>;

/// Error types for the unsubscribe tool
#[derive(Error, Debug)]
pub enum UnsubscribeError {
    /// Gmail API returned an error
    #[error("Gmail API error: {0}")]
    ApiError(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Rate limit exceeded - should retry after specified seconds
    #[error("Rate limit exceeded, retry after {retry_after} seconds")]
    RateLimitExceeded { retry_after: u64 },

    /// Transient failures persisted past the configured retry budget
    #[error("Gave up on '{operation}' after {attempts} attempts")]
    RetriesExhausted { operation: String, attempts: u32 },

    /// User cancelled the operation
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Network-related error (connection issues, timeouts, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Server returned 5xx error
    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// Resource not found (404)
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Bad request (400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Forbidden (403)
    #[error("Access forbidden: {0}")]
    Forbidden(String),

    /// Message payload could not be decoded or parsed
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// Unsubscribe mail could not be sent
    #[error("Send error: {0}")]
    SendError(String),

    /// Block filter creation failed
    #[error("Filter error: {0}")]
    FilterError(String),

    /// Workflow was driven into an invalid state
    #[error("Workflow error: {0}")]
    WorkflowError(String),

    /// IO error (file operations, etc.)
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic catch-all error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl UnsubscribeError {
    /// Check if the error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UnsubscribeError::RateLimitExceeded { .. }
                | UnsubscribeError::ServerError { .. }
                | UnsubscribeError::NetworkError(_)
        )
    }

    /// Check if the error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Check if the error must abort the whole batch rather than degrade
    /// a single sender (credential problems, explicit cancellation)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            UnsubscribeError::AuthError(_)
                | UnsubscribeError::Cancelled(_)
                | UnsubscribeError::ConfigError(_)
        )
    }
}

/// Parse the Retry-After header from an HTTP response
///
/// The Retry-After header can be specified in two formats:
/// 1. Delay-seconds: An integer indicating seconds to wait (e.g., "120")
/// 2. HTTP-date: An HTTP date format (e.g., "Wed, 21 Oct 2015 07:28:00 GMT")
///
/// Returns the number of seconds to wait. If the header is missing or invalid,
/// returns a default of 5 seconds.
pub(crate) fn parse_retry_after_header<B>(response: &hyper::Response<B>) -> u64 {
    const DEFAULT_RETRY_AFTER: u64 = 5;

    if let Some(retry_after_value) = response.headers().get("retry-after") {
        if let Ok(retry_after_str) = retry_after_value.to_str() {
            // Try to parse as integer (delay-seconds format)
            if let Ok(seconds) = retry_after_str.parse::<u64>() {
                return seconds;
            }

            // Try to parse as HTTP date format (RFC 2822 compatible)
            if let Ok(http_date) = chrono::DateTime::parse_from_rfc2822(retry_after_str) {
                let delta = http_date.signed_duration_since(chrono::Utc::now());
                if delta.num_seconds() > 0 {
                    return delta.num_seconds() as u64;
                }
            }
        }
    }

    DEFAULT_RETRY_AFTER
}

impl From<google_gmail1::Error> for UnsubscribeError {
    fn from(error: google_gmail1::Error) -> Self {
        match error {
            // HTTP response with status code (non-success responses)
            google_gmail1::Error::Failure(ref response) => {
                let status = response.status();
                let status_code = status.as_u16();
                let message = format!(
                    "HTTP {}: {}",
                    status_code,
                    status.canonical_reason().unwrap_or("Unknown")
                );

                match status_code {
                    // Rate limiting - transient
                    429 => {
                        let retry_after = parse_retry_after_header(response);
                        UnsubscribeError::RateLimitExceeded { retry_after }
                    }
                    // Not found
                    404 => UnsubscribeError::MessageNotFound("Resource not found".to_string()),
                    // Bad request
                    400 => UnsubscribeError::BadRequest(message),
                    // Forbidden
                    403 => UnsubscribeError::Forbidden(message),
                    // Server errors - transient
                    500..=599 => UnsubscribeError::ServerError {
                        status: status_code,
                        message,
                    },
                    // Other non-success status codes
                    _ => UnsubscribeError::ApiError(message),
                }
            }
            // BadRequest variant (request not understood by server)
            google_gmail1::Error::BadRequest(ref err) => {
                UnsubscribeError::BadRequest(format!("{}", err))
            }
            // Network/connection errors - transient
            google_gmail1::Error::HttpError(ref err) => {
                UnsubscribeError::NetworkError(format!("Connection error: {}", err))
            }
            // IO errors - transient
            google_gmail1::Error::Io(err) => UnsubscribeError::NetworkError(err.to_string()),
            // All other errors
            _ => UnsubscribeError::ApiError(error.to_string()),
        }
    }
}
