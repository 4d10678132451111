use thiserror::Error;

/// Application-wide error types for the harvester.
#[derive(Error, Debug)]
pub enum HarvestError {
    /// HTTP request failed at the transport or protocol level.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Network/connection error.
    #[error("Network error: {0}")]
    Network(String),

    /// Upstream answered 429.
    #[error("Rate limited (retry after {retry_after}s)")]
    RateLimited { retry_after: u64 },

    /// The circuit for a source is open; no request was attempted.
    #[error("Source '{0}' is unavailable (circuit open)")]
    CircuitOpen(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Checkpoint read/write failed.
    #[error("Checkpoint I/O error: {0}")]
    Checkpoint(String),

    /// An exporter rejected a record or failed to flush.
    #[error("Export error: {0}")]
    Export(String),

    /// The task universe could not be enumerated.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl HarvestError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            HarvestError::Network(_)
            | HarvestError::Timeout(_)
            | HarvestError::RateLimited { .. } => true,
            HarvestError::Http(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Returns true if this error should count against a source's circuit.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            HarvestError::Network(_)
            | HarvestError::Timeout(_)
            | HarvestError::RateLimited { .. } => true,
            HarvestError::Http(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("connection")
            }
            _ => false,
        }
    }
}
