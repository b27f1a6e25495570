//! # logfile
//!
//! Append-only segment files and the record codec for the BurrowDB storage
//! engine.
//!
//! A BurrowDB database directory holds a set of numbered segment files
//! (`0.dat`, `1.dat`, ...). Every mutation the engine performs is serialized
//! as an [`Entry`] and appended to the highest-numbered (active) segment.
//! This crate owns everything that touches those bytes:
//!
//! - the [`Entry`] record codec (header + bucket/key/value payloads, CRC32
//!   guarded),
//! - [`DataFile`] for the writable active segment and [`EntryStream`] for
//!   sequential scans during recovery and merge,
//! - the file-set helpers in [`fileset`] that enumerate segment ids and
//!   resolve on-disk paths,
//! - the composite-key codec in [`compose`] (sorted-set and list operations
//!   smuggle a score or index through the entry key at the storage boundary),
//! - the sparse-mode root-index codec in [`rootidx`].
//!
//! Higher layers never parse bytes themselves; they speak [`Entry`], [`Hint`]
//! and [`Record`].

use thiserror::Error;

pub mod compose;
pub mod datafile;
pub mod entry;
pub mod fileset;
pub mod rootidx;

pub use datafile::{read_entry_at, DataFile, EntryStream};
pub use entry::{DataStructure, Entry, Flag, Hint, Meta, Record, Status, PERSISTENT};
pub use rootidx::RootIndex;

/// Errors surfaced by the codec layer.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A fully-present record whose checksum does not match its payload.
    #[error("corrupt record")]
    Corrupt,

    #[error("unknown flag ordinal {0}")]
    UnknownFlag(u16),

    #[error("unknown data structure ordinal {0}")]
    UnknownDataStructure(u16),

    #[error("unknown status ordinal {0}")]
    UnknownStatus(u16),

    #[error("bucket name is not valid utf-8")]
    BucketName,

    /// A sorted-set or list entry key without its separator.
    #[error("composite key is missing its separator")]
    CompositeKey,

    /// A structural field (score, index, count) that fails to parse.
    #[error("malformed numeric field: {0:?}")]
    Numeric(String),
}

/// I/O strategy for sequential segment reads.
///
/// `FileIo` issues reads straight against the file descriptor; `Buffered`
/// wraps the scan in a [`std::io::BufReader`]. The engine picks one per
/// context (`rw_mode` for merge scans, `start_file_loading_mode` for
/// recovery).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoMode {
    #[default]
    FileIo,
    Buffered,
}
