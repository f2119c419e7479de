//! Error types for kvmesh
//!
//! This module defines the common error type used throughout the system,
//! along with the stable codes used to carry errors across the wire.

use thiserror::Error;

/// Common result type for kvmesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for kvmesh
#[derive(Debug, Error)]
pub enum Error {
    // Cluster state errors
    #[error("cannot be reached cluster quorum to operate")]
    ClusterQuorum,

    #[error("node is not bootstrapped yet")]
    NotBootstrapped,

    #[error("server is gone")]
    ServerGone,

    // Request errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("key not found")]
    KeyNotFound,

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    // Storage and transfer errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("incompatible snapshot: {0}")]
    IncompatibleSnapshot(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    // Network/RPC errors
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("operation timeout")]
    Timeout,

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::ServiceUnavailable(_)
                | Self::ConnectionFailed(_)
                | Self::ClusterQuorum
                | Self::NotBootstrapped
        )
    }

    /// Stable code used in wire error payloads
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ClusterQuorum => "CLUSTER_QUORUM",
            Self::NotBootstrapped => "NOT_BOOTSTRAPPED",
            Self::ServerGone => "SERVER_GONE",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::KeyNotFound => "KEY_NOT_FOUND",
            Self::UnknownOperation(_) => "UNKNOWN_OPERATION",
            Self::Storage(_) => "STORAGE",
            Self::IncompatibleSnapshot(_) => "INCOMPATIBLE_SNAPSHOT",
            Self::Serialization(_) => "SERIALIZATION",
            Self::Deserialization(_) => "DESERIALIZATION",
            Self::ConnectionFailed(_) => "CONNECTION_FAILED",
            Self::Timeout => "TIMEOUT",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::NotImplemented(_) => "NOT_IMPLEMENTED",
            Self::Configuration(_) => "CONFIGURATION",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Detail text carried next to the code in wire error payloads
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::InvalidArgument(s)
            | Self::UnknownOperation(s)
            | Self::Storage(s)
            | Self::IncompatibleSnapshot(s)
            | Self::Serialization(s)
            | Self::Deserialization(s)
            | Self::ConnectionFailed(s)
            | Self::ServiceUnavailable(s)
            | Self::NotImplemented(s)
            | Self::Configuration(s)
            | Self::Internal(s) => s.clone(),
            Self::ClusterQuorum
            | Self::NotBootstrapped
            | Self::ServerGone
            | Self::KeyNotFound
            | Self::Timeout => String::new(),
        }
    }

    /// Rebuild an error from a wire error payload
    #[must_use]
    pub fn from_code(code: &str, detail: &str) -> Self {
        let detail = detail.to_string();
        match code {
            "CLUSTER_QUORUM" => Self::ClusterQuorum,
            "NOT_BOOTSTRAPPED" => Self::NotBootstrapped,
            "SERVER_GONE" => Self::ServerGone,
            "INVALID_ARGUMENT" => Self::InvalidArgument(detail),
            "KEY_NOT_FOUND" => Self::KeyNotFound,
            "UNKNOWN_OPERATION" => Self::UnknownOperation(detail),
            "STORAGE" => Self::Storage(detail),
            "INCOMPATIBLE_SNAPSHOT" => Self::IncompatibleSnapshot(detail),
            "SERIALIZATION" => Self::Serialization(detail),
            "DESERIALIZATION" => Self::Deserialization(detail),
            "CONNECTION_FAILED" => Self::ConnectionFailed(detail),
            "TIMEOUT" => Self::Timeout,
            "SERVICE_UNAVAILABLE" => Self::ServiceUnavailable(detail),
            "NOT_IMPLEMENTED" => Self::NotImplemented(detail),
            "CONFIGURATION" => Self::Configuration(detail),
            _ => Self::Internal(format!("{code}: {detail}")),
        }
    }

    /// Get HTTP status code for the public data API
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::InvalidArgument(_)
            | Self::UnknownOperation(_)
            | Self::Deserialization(_)
            | Self::IncompatibleSnapshot(_) => 400,
            Self::KeyNotFound => 404,
            Self::NotImplemented(_) => 501,
            Self::ClusterQuorum
            | Self::NotBootstrapped
            | Self::ServerGone
            | Self::ConnectionFailed(_)
            | Self::ServiceUnavailable(_) => 503,
            Self::Timeout => 504,
            Self::Storage(_)
            | Self::Serialization(_)
            | Self::Configuration(_)
            | Self::Internal(_) => 500,
        }
    }
}
