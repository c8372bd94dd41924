//! Error types for vigil-store

use thiserror::Error;

/// Errors that can occur in storage operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying storage engine error
    #[error("Database error: {0}")]
    Database(String),

    /// Error serializing an event for persistence
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error decoding a stored row
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// The month partition an event targets does not exist
    #[error("Missing partition: {0}")]
    MissingPartition(String),

    /// A timestamp outside the representable calendar range
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_partition_names_the_partition() {
        let err = StoreError::MissingPartition("audit_logs_2024_03".into());
        assert!(err.to_string().contains("audit_logs_2024_03"));
    }
}
