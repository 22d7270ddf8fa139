use thiserror::Error;

/// Errors that can arise while reading or writing the node registry.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Wrapper around sled's error type.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// Wrapper around bincode serialization and deserialization errors.
    #[error("serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// Wrapper around IO errors (directory creation, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A record was rejected before it reached the tree.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// A stored key did not have the expected layout.
    #[error("corrupt key in tree {tree}: {len} bytes")]
    CorruptKey { tree: &'static str, len: usize },
}
