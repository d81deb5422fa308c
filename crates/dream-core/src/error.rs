//! Error types shared across the Dream crates

/// Result type alias for Dream operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for Dream
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("operation timed out")]
    Timeout,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("no registered endpoint matches '{uri}'")]
    NoEndpoint { uri: String },

    #[error("'{key}' is already registered")]
    DuplicateRegistration { key: String },

    #[error("malformed URI '{input}': {message}")]
    MalformedUri { input: String, message: String },

    #[error("expectation failure: {message}")]
    Expectation { message: String },

    #[error("queue corruption: {message}")]
    QueueCorruption { message: String },

    #[error("service error: {message}")]
    Service { message: String },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("{0}")]
    Generic(String),
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Self::Generic(message)
    }
}

impl Error {
    /// Create a no-endpoint error for the given URI
    pub fn no_endpoint<S: Into<String>>(uri: S) -> Self {
        Self::NoEndpoint { uri: uri.into() }
    }

    /// Create a duplicate-registration error
    pub fn duplicate<S: Into<String>>(key: S) -> Self {
        Self::DuplicateRegistration { key: key.into() }
    }

    /// Create a malformed-URI error
    pub fn malformed_uri<S: Into<String>, M: Into<String>>(input: S, message: M) -> Self {
        Self::MalformedUri {
            input: input.into(),
            message: message.into(),
        }
    }

    /// Create an expectation-failure error
    pub fn expectation<S: Into<String>>(message: S) -> Self {
        Self::Expectation {
            message: message.into(),
        }
    }

    /// Create a queue-corruption error
    pub fn corruption<S: Into<String>>(message: S) -> Self {
        Self::QueueCorruption {
            message: message.into(),
        }
    }

    /// Create a service error
    pub fn service<S: Into<String>>(message: S) -> Self {
        Self::Service {
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        Self::Generic(message.into())
    }

    /// True when this error is a deadline lapse
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}
