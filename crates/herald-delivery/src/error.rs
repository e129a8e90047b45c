//! Error types for alert dispatch.
//!
//! `DeliveryError` covers every failure a unit can hit on its way to a
//! destination: transform and format failures, transport errors, HTTP error
//! responses and breaker admission rejections. `ErrorCategory` is the closed
//! classification the retrier makes its decisions on.

use std::fmt;

use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Failure conditions during dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Transport-level failure (connection refused, reset, DNS).
    #[error("network error: {message}")]
    NetworkError {
        /// Error text from the transport.
        message: String,
    },

    /// The request exceeded its deadline.
    #[error("request timeout after {timeout_ms}ms")]
    Timeout {
        /// Deadline that was exceeded, in milliseconds.
        timeout_ms: u64,
    },

    /// The dispatch was cancelled before it finished.
    #[error("delivery cancelled")]
    Cancelled,

    /// Destination answered with a 4xx status.
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code (4xx).
        status_code: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// Destination answered with a 5xx status.
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code (5xx).
        status_code: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// The destination's breaker is open.
    #[error("circuit breaker open for destination {destination}")]
    CircuitOpen {
        /// Destination name.
        destination: String,
    },

    /// The destination's breaker is at its in-flight cap.
    #[error("too many concurrent calls for destination {destination} (limit {limit})")]
    TooManyConcurrentCalls {
        /// Destination name.
        destination: String,
        /// Configured cap.
        limit: u32,
    },

    /// All attempts failed.
    #[error("delivery failed after {attempts} attempts")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
    },

    /// Transform engine failed to compile or evaluate.
    #[error("transform error: {message}")]
    TransformError {
        /// Engine error text.
        message: String,
    },

    /// Formatter could not encode the transformed value.
    #[error("format error: {message}")]
    FormatError {
        /// Formatter error text.
        message: String,
    },

    /// Invalid destination or component configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// What is wrong.
        message: String,
    },

    /// Error text from an opaque source with no structure to inspect.
    #[error("{message}")]
    Unstructured {
        /// Raw error text.
        message: String,
    },

    /// Unexpected internal failure.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Error text.
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Creates a 4xx error.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates a 5xx error.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Maps a non-success HTTP status to the matching error.
    ///
    /// Anything outside 4xx is treated as a server-side failure.
    pub fn from_status(status_code: u16, body: impl Into<String>) -> Self {
        match status_code {
            400..=499 => Self::client_error(status_code, body),
            _ => Self::server_error(status_code, body),
        }
    }

    /// Creates a breaker-open error.
    pub fn circuit_open(destination: impl Into<String>) -> Self {
        Self::CircuitOpen { destination: destination.into() }
    }

    /// Creates a concurrency-cap error.
    pub fn too_many_concurrent_calls(destination: impl Into<String>, limit: u32) -> Self {
        Self::TooManyConcurrentCalls { destination: destination.into(), limit }
    }

    /// Creates a retries-exhausted error.
    pub fn retries_exhausted(attempts: u32) -> Self {
        Self::RetriesExhausted { attempts }
    }

    /// Creates a transform error.
    pub fn transform(message: impl Into<String>) -> Self {
        Self::TransformError { message: message.into() }
    }

    /// Creates a format error.
    pub fn format(message: impl Into<String>) -> Self {
        Self::FormatError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Wraps opaque error text.
    pub fn unstructured(message: impl Into<String>) -> Self {
        Self::Unstructured { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Classifies the error.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from(self)
    }

    /// Whether the error is worth retrying, ignoring any configured
    /// substring list.
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Whether this is a breaker admission rejection.
    pub fn is_breaker_rejection(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::TooManyConcurrentCalls { .. })
    }
}

/// Retry-relevant classification of a delivery error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Deadline exceeded or cancelled.
    Timeout,
    /// Connection-level failure.
    Connection,
    /// Name resolution failure.
    Dns,
    /// 4xx response.
    Http4xx,
    /// 5xx response.
    Http5xx,
    /// Breaker rejected the call.
    CircuitOpen,
    /// Anything else.
    Unknown,
}

impl ErrorCategory {
    /// Default retry decision for the category.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::Connection | Self::Dns | Self::Http5xx)
    }
}

const DNS_MARKERS: [&str; 4] =
    ["no such host", "dns error", "failed to lookup address", "name or service not known"];

fn looks_like_dns(message: &str) -> bool {
    let lowercase = message.to_lowercase();
    DNS_MARKERS.iter().any(|marker| lowercase.contains(marker))
}

fn looks_like_timeout(message: &str) -> bool {
    let lowercase = message.to_lowercase();
    lowercase.contains("timed out") || lowercase.contains("timeout")
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::Timeout { .. } | DeliveryError::Cancelled => Self::Timeout,
            DeliveryError::ServerError { .. } => Self::Http5xx,
            DeliveryError::ClientError { .. } => Self::Http4xx,
            DeliveryError::CircuitOpen { .. } | DeliveryError::TooManyConcurrentCalls { .. } => {
                Self::CircuitOpen
            },
            DeliveryError::NetworkError { message } => {
                if looks_like_dns(message) {
                    Self::Dns
                } else if looks_like_timeout(message) {
                    Self::Timeout
                } else {
                    Self::Connection
                }
            },
            DeliveryError::Unstructured { message } if looks_like_dns(message) => Self::Dns,
            DeliveryError::Unstructured { .. }
            | DeliveryError::RetriesExhausted { .. }
            | DeliveryError::TransformError { .. }
            | DeliveryError::FormatError { .. }
            | DeliveryError::ConfigurationError { .. }
            | DeliveryError::InternalError { .. } => Self::Unknown,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Connection => write!(f, "connection"),
            Self::Dns => write!(f, "dns"),
            Self::Http4xx => write!(f, "http_4xx"),
            Self::Http5xx => write!(f, "http_5xx"),
            Self::CircuitOpen => write!(f, "circuit_open"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}
