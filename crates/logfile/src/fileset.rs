//! File-set layout: segment enumeration and path resolution.

use std::io;
use std::path::{Path, PathBuf};

/// Segment file extension.
pub const DATA_SUFFIX: &str = ".dat";

/// Directory holding sparse-mode persisted indexes.
pub const BPT_DIR: &str = "bpt";

/// Per-segment root-index file extension (sparse mode).
pub const ROOT_INDEX_SUFFIX: &str = ".ridx";

/// Per-segment committed-txid file extension (sparse mode).
pub const TXID_INDEX_SUFFIX: &str = ".tidx";

/// Returns the ids of all segment files under `dir`, sorted ascending.
/// Non-segment files are ignored.
pub fn segment_ids(dir: &Path) -> io::Result<Vec<u64>> {
    let mut ids = Vec::new();
    for dent in std::fs::read_dir(dir)? {
        let dent = dent?;
        let name = dent.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stem) = name.strip_suffix(DATA_SUFFIX) else {
            continue;
        };
        if let Ok(id) = stem.parse::<u64>() {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// The largest segment id in `ids`, or 0 when there are none.
pub fn max_segment_id(ids: &[u64]) -> u64 {
    ids.last().copied().unwrap_or(0)
}

/// Whether `dir` contains any segment files.
pub fn has_segment_files(dir: &Path) -> io::Result<bool> {
    Ok(!segment_ids(dir)?.is_empty())
}

/// Whether `dir` contains the sparse-mode index directory.
pub fn has_bpt_dir(dir: &Path) -> bool {
    dir.join(BPT_DIR).is_dir()
}

/// Canonical path of segment `id`.
pub fn data_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id}{DATA_SUFFIX}"))
}

pub fn bpt_root_dir(dir: &Path) -> PathBuf {
    dir.join(BPT_DIR).join("root")
}

pub fn bpt_txid_dir(dir: &Path) -> PathBuf {
    dir.join(BPT_DIR).join("txid")
}

/// Path of the serialized root index for sealed segment `id`.
pub fn root_index_path(dir: &Path, id: u64) -> PathBuf {
    bpt_root_dir(dir).join(format!("{id}{ROOT_INDEX_SUFFIX}"))
}

/// Path of the serialized committed-txid index for sealed segment `id`.
pub fn txid_index_path(dir: &Path, id: u64) -> PathBuf {
    bpt_txid_dir(dir).join(format!("{id}{TXID_INDEX_SUFFIX}"))
}
