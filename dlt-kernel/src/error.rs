use std::time::Duration;

/// Erreurs du collaborateur de persistance
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Store operation '{operation}' timed out after {limit:?}")]
    Timeout {
        operation: &'static str,
        limit: Duration,
    },
    #[error("Invalid status transition for load test {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: crate::models::LoadTestStatus,
        to: crate::models::LoadTestStatus,
    },
    #[error("Summary already exists for load test {0}")]
    SummaryExists(String),
}

/// Erreurs du transport pub/sub
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Publish to '{topic}' failed: {message}")]
    Publish { topic: String, message: String },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Payload heartbeat inexploitable
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    #[error("Heartbeat is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("Invalid heartbeat JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Heartbeat is missing ng_id")]
    MissingNodeGroupId,
}

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Heartbeat(#[from] HeartbeatError),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

pub type KernelResult<T> = Result<T, KernelError>;
