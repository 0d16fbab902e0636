use http::StatusCode;
use thiserror::Error;

/// Unified error type for the passthru proxy
#[derive(Error, Debug)]
pub enum PassthruError {
    // Protocol misuse
    #[error("{0}")]
    MethodMismatch(&'static str),

    // Capability errors
    #[error("response sink does not support hijacking")]
    HijackUnsupported,

    #[error("Hijack failed: {0}")]
    Hijack(String),

    // Origin errors
    #[error("Dial {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Round trip failed: {0}")]
    RoundTrip(String),

    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },

    #[error("Unsupported transfer coding: {0}")]
    UnsupportedTransferCoding(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),
}

/// Result type alias for passthru operations
pub type Result<T> = std::result::Result<T, PassthruError>;

/// Coarse failure classes a session can end with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Request routed to the operation that cannot handle its method
    ProtocolMisuse,
    /// The response sink cannot yield a raw connection
    CapabilityUnavailable,
    /// Dial or round trip to the origin failed
    OriginUnreachable,
    /// A copy or write failed after the exchange had begun
    TransferFailed,
    /// The inbound request could not be understood
    BadRequest,
    /// Process configuration is invalid
    Config,
}

impl PassthruError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            PassthruError::MethodMismatch(_) => ErrorCategory::ProtocolMisuse,

            PassthruError::HijackUnsupported | PassthruError::Hijack(_) => {
                ErrorCategory::CapabilityUnavailable
            }

            PassthruError::Dial { .. }
            | PassthruError::RoundTrip(_)
            | PassthruError::UnsupportedScheme(_)
            | PassthruError::Http(_) => ErrorCategory::OriginUnreachable,

            PassthruError::InvalidRequest(_)
            | PassthruError::HeadTooLarge { .. }
            | PassthruError::UnsupportedTransferCoding(_) => ErrorCategory::BadRequest,

            PassthruError::InvalidConfig(_) => ErrorCategory::Config,

            PassthruError::Io(_) => ErrorCategory::TransferFailed,
        }
    }

    /// Get the HTTP status code the listener answers with for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            PassthruError::InvalidRequest(_) | PassthruError::MethodMismatch(_) => {
                StatusCode::BAD_REQUEST
            }

            // 431 Request Header Fields Too Large
            PassthruError::HeadTooLarge { .. } => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,

            // 501 Not Implemented
            PassthruError::UnsupportedTransferCoding(_)
            | PassthruError::UnsupportedScheme(_)
            | PassthruError::HijackUnsupported => StatusCode::NOT_IMPLEMENTED,

            // 502 Bad Gateway
            PassthruError::Dial { .. }
            | PassthruError::RoundTrip(_)
            | PassthruError::Http(_) => StatusCode::BAD_GATEWAY,

            // 500 Internal Server Error
            PassthruError::Hijack(_) | PassthruError::InvalidConfig(_) | PassthruError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

// Convert from hyper errors
impl From<hyper::Error> for PassthruError {
    fn from(err: hyper::Error) -> Self {
        PassthruError::Http(err.to_string())
    }
}

// Convert from request building errors
impl From<http::Error> for PassthruError {
    fn from(err: http::Error) -> Self {
        PassthruError::InvalidRequest(err.to_string())
    }
}
