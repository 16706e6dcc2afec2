use thiserror::Error;

/// Main error type for the command relay
#[derive(Error, Debug)]
pub enum RelayError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Dictionary error: {0}")]
    Dictionary(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Exchange-side business errors
    #[error("Exchange error: {0}")]
    Exchange(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    // Request/response correlation defects
    #[error("Protocol violation: {0}")]
    Protocol(String),

    // Submission errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        RelayError::Protocol(msg.into())
    }

    /// Errors that indicate a defect or a broken deployment rather than a
    /// runtime condition. These are never retried and terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::Protocol(_)
                | RelayError::Dictionary(_)
                | RelayError::InvalidConfig(_)
                | RelayError::Config(_)
                | RelayError::Migration(_)
        )
    }
}

/// Result type alias for RelayError
pub type Result<T> = std::result::Result<T, RelayError>;
