// ===================================================================================================
// Error Handling System - Typed Failure Categories for the Compute Fabric
// ===================================================================================================
//
// Every public operation in ComputeMesh returns `MeshResult<T>`. The variants below map 1:1 to
// the failure categories of the coordination engine: transport and connection failures, query
// deadlines, dispatch candidate shortages, verification shortfalls, and the guards that protect
// downstream services.
//
// Propagation rules:
// - Transport/connect errors surface to the caller and are retried by the resilience layer.
// - `QueryTimeout` is local and non-fatal; callers treat it as "no result".
// - `NoSuitableCandidates` is fatal to a submit call; no task is recorded.
// - Inbound frames that fail to parse are dropped with a counter and never become errors.
//
// ===================================================================================================

use thiserror::Error;

use crate::identity::NodeId;

/// Error type covering every subsystem of the compute fabric.
#[derive(Debug, Error)]
pub enum MeshError {
    /// The transport primitive refused or lost a connection.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Three connection attempts to the peer failed; a replacement search is triggered.
    #[error("connect attempts exhausted for peer {0}")]
    ConnectAttemptsExhausted(NodeId),

    /// A frame was addressed to a peer without an open channel.
    #[error("peer {0} is not connected")]
    NotConnected(NodeId),

    /// A remote query did not answer within its deadline. Local and non-fatal.
    #[error("query timed out")]
    QueryTimeout,

    /// Candidate filtering for a task submission produced an empty set.
    #[error("no suitable candidates for task requirements")]
    NoSuitableCandidates,

    /// The per-task watchdog fired before a result arrived.
    #[error("task {0} timed out")]
    TaskTimeout(uuid::Uuid),

    /// Fewer than the minimum number of verifier responses arrived by the deadline.
    #[error("verification {0} received only {1} responses")]
    VerificationInsufficient(uuid::Uuid, usize),

    /// A frame carried a signature that does not verify against the sender's key.
    #[error("invalid signature from peer {0}")]
    SignatureInvalid(NodeId),

    /// The circuit breaker for a downstream service is open.
    #[error("circuit breaker open for service {0}")]
    CircuitBreakerOpen(String),

    /// The external telemetry source has no capability snapshot available.
    #[error("local telemetry source unavailable")]
    TelemetryUnavailable,

    /// A subsystem command channel or actor has shut down.
    #[error("subsystem channel closed: {0}")]
    ChannelClosed(String),

    /// Canonical encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Key handling or signing failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Invalid or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A referenced task, verification, or peer is unknown.
    #[error("not found: {0}")]
    NotFound(String),

    /// Catch-all for failures that do not fit a category above.
    #[error("{0}")]
    Internal(String),
}

impl From<bincode::Error> for MeshError {
    fn from(error: bincode::Error) -> Self {
        MeshError::Serialization(error.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(error: serde_json::Error) -> Self {
        MeshError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for MeshError {
    fn from(error: std::io::Error) -> Self {
        MeshError::TransportUnavailable(error.to_string())
    }
}

impl From<hex::FromHexError> for MeshError {
    fn from(error: hex::FromHexError) -> Self {
        MeshError::Serialization(format!("hex decode error: {}", error))
    }
}

/// Result type alias for fabric operations.
pub type MeshResult<T> = Result<T, MeshError>;
