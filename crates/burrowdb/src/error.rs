//! The engine's error taxonomy.

use thiserror::Error;

/// Result type alias used across the engine.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("db is closed")]
    DbClosed,

    #[error("bucket not found")]
    BucketNotFound,

    #[error("key not found")]
    KeyNotFound,

    /// Configured index mode disagrees with the on-disk state, or a record
    /// needs value residency the mode does not provide.
    #[error("entry index mode: {0}")]
    IndexMode(&'static str),

    #[error("merge unsupported: {0}")]
    MergeUnsupported(&'static str),

    /// A mutating operation on a read-only transaction.
    #[error("transaction is read-only")]
    TxReadOnly,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] logfile::CodecError),

    #[error("structure error: {0}")]
    Structure(#[from] structures::StructureError),
}
