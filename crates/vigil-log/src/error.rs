//! Error types for vigil-log

use thiserror::Error;

/// Errors that can occur in durable-log operations
#[derive(Debug, Error)]
pub enum LogError {
    /// Underlying storage engine error
    #[error("Database error: {0}")]
    Database(String),

    /// Error serializing a record for appending
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error decoding a stored record
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// A partition outside the configured range was referenced
    #[error("Unknown partition: {0}")]
    UnknownPartition(u32),
}

impl LogError {
    /// Create a new Database error
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database(message.into())
    }
}

impl From<postcard::Error> for LogError {
    fn from(err: postcard::Error) -> Self {
        LogError::Deserialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for LogError {
    fn from(err: tokio::task::JoinError) -> Self {
        LogError::Database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_partition_display() {
        let err = LogError::UnknownPartition(9);
        assert!(err.to_string().contains('9'));
    }

    #[test]
    fn test_database_helper() {
        let err = LogError::database("broken");
        assert!(matches!(err, LogError::Database(_)));
        assert!(err.to_string().contains("broken"));
    }
}
