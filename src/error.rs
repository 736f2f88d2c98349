use thiserror::Error;

/// Main error type for the account synchronization pipeline
#[derive(Error, Debug)]
pub enum TradeSyncError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Terminal messaging error: {0}")]
    Messaging(#[from] zeromq::ZmqError),

    /// Terminal or store unreachable
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed inbound data
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Terminal rejected a request (bad credentials, unknown command)
    #[error("Terminal rejected request: {0}")]
    TerminalRejected(String),

    #[error("Partial batch failure: {failed} of {total} accounts failed")]
    PartialBatchFailure { failed: usize, total: usize },

    #[error("Consistency violation in {check}: {message}")]
    ConsistencyViolation { check: String, message: String },

    #[error("Remediation trigger failed: {0}")]
    Remediation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl TradeSyncError {
    /// Transport-level failures (terminal or store unreachable, timeouts)
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            TradeSyncError::Connection(_)
                | TradeSyncError::Messaging(_)
                | TradeSyncError::Timeout(_)
                | TradeSyncError::Http(_)
        ) || matches!(self, TradeSyncError::Database(sqlx::Error::PoolTimedOut))
            || matches!(self, TradeSyncError::Database(sqlx::Error::Io(_)))
    }
}

/// Result type alias for TradeSyncError
pub type Result<T> = std::result::Result<T, TradeSyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_are_classified() {
        assert!(TradeSyncError::Connection("refused".into()).is_connection());
        assert!(TradeSyncError::Timeout("login".into()).is_connection());
        assert!(!TradeSyncError::Validation("missing balance".into()).is_connection());
    }

    #[test]
    fn partial_batch_failure_message_has_counts() {
        let err = TradeSyncError::PartialBatchFailure {
            failed: 1,
            total: 4,
        };
        assert_eq!(
            err.to_string(),
            "Partial batch failure: 1 of 4 accounts failed"
        );
    }
}
