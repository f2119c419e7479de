//! Storage engine errors

/// Errors returned by a storage engine
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("key not found")]
    KeyNotFound,

    /// The write was applied but the engine spans more than one table and
    /// wants a compaction pass
    #[error("storage is fragmented")]
    Fragmented,

    #[error("snapshot encode error: {0}")]
    Encode(String),

    #[error("snapshot decode error: {0}")]
    Decode(String),

    #[error("unsupported snapshot: engine {engine} version {version}")]
    UnsupportedSnapshot { engine: String, version: u32 },
}

impl StorageError {
    /// Check if this is the fragmentation signal rather than a failure
    #[must_use]
    pub const fn is_fragmented(&self) -> bool {
        matches!(self, Self::Fragmented)
    }
}

impl From<StorageError> for kvmesh_common::Error {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::KeyNotFound => Self::KeyNotFound,
            StorageError::UnsupportedSnapshot { .. } => Self::IncompatibleSnapshot(e.to_string()),
            StorageError::Decode(msg) => Self::Deserialization(msg),
            StorageError::Encode(msg) => Self::Serialization(msg),
            StorageError::Fragmented => Self::storage(e.to_string()),
        }
    }
}
