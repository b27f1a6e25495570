//! Engine configuration.

use std::path::PathBuf;

use logfile::IoMode;

/// Returned-row cap meaning "no limit" for scans.
pub const SCAN_NO_LIMIT: i64 = -1;

/// How much of each record the rebuilt indexes keep resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryIdxMode {
    /// Keys and values in RAM. Reads never touch disk.
    #[default]
    KeyValRam,

    /// Keys and hints in RAM; reads fetch values back through the log.
    /// Only the ordered-map structure supports recovery in this mode.
    KeyRam,

    /// Sparse: only the newest segment's records are kept in RAM; sealed
    /// segments persist root pointers under `bpt/`.
    BptSparse,
}

/// Options for [`crate::Db::open`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Database directory. Created if absent.
    pub dir: PathBuf,

    /// Soft cap on a segment file's serialized length. The active segment
    /// rolls when the next record would push past it.
    pub segment_size: u64,

    pub entry_idx_mode: EntryIdxMode,

    /// I/O strategy for merge scans over writable files.
    pub rw_mode: IoMode,

    /// I/O strategy for recovery reads.
    pub start_file_loading_mode: IoMode,

    /// fsync the active segment at every commit.
    pub sync_writes: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./burrowdb_data"),
            segment_size: 8 * 1024 * 1024,
            entry_idx_mode: EntryIdxMode::default(),
            rw_mode: IoMode::FileIo,
            start_file_loading_mode: IoMode::Buffered,
            sync_writes: false,
        }
    }
}

impl Options {
    /// Defaults rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }
}
