//! Merge: rewrite sealed segments, keeping only reachable records.
//!
//! For each sealed segment in ascending id order, records are streamed and
//! classified: destructive opcodes and expired records are dropped
//! outright, everything else is kept only if the live in-memory indexes
//! still reach it. Survivors are appended, through a fresh transaction id
//! and committed together, to a brand-new active segment (`max_file_id + 1`),
//! and the source file is deleted afterwards. A merge that fails midway
//! leaves a valid database: already-rewritten sources are gone, the rest
//! merge on the next run.

use std::sync::atomic::{AtomicU64, Ordering};

use logfile::{
    compose, fileset, CodecError, DataFile, DataStructure, Entry, EntryStream, Flag, Hint, Record,
    Status,
};
use tracing::{debug, info};

use crate::db::{roll_active, Db, DbInner};
use crate::error::{Error, Result};
use crate::options::{EntryIdxMode, Options};
use crate::tx::unix_now;

impl Db {
    /// Compacts all sealed segments. Requires at least two segment files
    /// and a non-sparse index mode; runs under the exclusive lock, so no
    /// reader or writer observes a half-merged state.
    pub fn merge(&self) -> Result<()> {
        let mut guard = self.state.write();
        let inner = guard.as_mut().ok_or(Error::DbClosed)?;

        if self.opts.entry_idx_mode == EntryIdxMode::BptSparse {
            return Err(Error::MergeUnsupported("sparse index mode"));
        }
        if inner.is_merging {
            return Err(Error::MergeUnsupported("merge already in progress"));
        }
        let ids = fileset::segment_ids(&self.opts.dir)?;
        if ids.len() < 2 {
            return Err(Error::MergeUnsupported("fewer than two segment files"));
        }

        inner.is_merging = true;
        let sealed = &ids[..ids.len() - 1];
        let result = merge_segments(inner, &self.opts, sealed, &self.tx_counter);
        inner.is_merging = false;
        result
    }
}

fn merge_segments(
    inner: &mut DbInner,
    opts: &Options,
    sealed: &[u64],
    tx_counter: &AtomicU64,
) -> Result<()> {
    let now = unix_now();

    for &id in sealed {
        let path = fileset::data_path(&opts.dir, id);
        let mut survivors = Vec::new();
        let mut dropped = 0usize;

        let mut stream = EntryStream::open(&path, opts.segment_size, opts.rw_mode)?;
        while let Some((offset, entry)) = stream.next_entry()? {
            if entry.meta.flag.is_destructive() || entry.meta.is_expired_at(now) {
                prune_tree_record(inner, &entry, id, offset)?;
                dropped += 1;
                continue;
            }
            if is_reachable(inner, &entry, id, offset)? {
                survivors.push(entry);
            } else {
                dropped += 1;
            }
        }

        let kept = survivors.len();
        rewrite_survivors(inner, opts, survivors, tx_counter.fetch_add(1, Ordering::SeqCst))?;
        std::fs::remove_file(&path)?;
        debug!(segment = id, kept, dropped, "merged segment");
    }

    info!(segments = sealed.len(), "merge complete");
    Ok(())
}

/// When a destructive or expired record being dropped is the very record
/// the ordered-map index points at, the index entry is dead weight (a
/// tombstone whose log record is about to disappear) and is removed.
fn prune_tree_record(inner: &mut DbInner, entry: &Entry, file_id: u64, offset: u64) -> Result<()> {
    if entry.meta.ds != DataStructure::Tree {
        return Ok(());
    }
    let bucket = bucket_str(entry)?;
    if let Some(tree) = inner.indexes.tree.get_mut(bucket) {
        let is_live_record = tree
            .get(&entry.key)
            .is_some_and(|r| r.hint.file_id == file_id && r.hint.offset == offset);
        if is_live_record {
            tree.remove(&entry.key);
        }
    }
    Ok(())
}

/// Consults the current in-memory indexes for reachability.
///
/// An ordered-map record survives only if it *is* the live record for its
/// key (same log position, `set` flag): stale overwritten versions must not
/// be rewritten behind newer segments, or replay order would resurrect
/// them. Structure records survive on membership: a set pair still present,
/// a sorted-set member with this exact score and payload, a pushed value
/// the list still contains.
fn is_reachable(inner: &DbInner, entry: &Entry, file_id: u64, offset: u64) -> Result<bool> {
    let bucket = bucket_str(entry)?;
    Ok(match entry.meta.ds {
        DataStructure::Tree => inner
            .indexes
            .tree
            .get(bucket)
            .and_then(|tree| tree.get(&entry.key))
            .is_some_and(|r| {
                r.hint.meta.flag == Flag::Set
                    && r.hint.file_id == file_id
                    && r.hint.offset == offset
            }),
        DataStructure::Set => inner
            .indexes
            .set
            .get(bucket)
            .is_some_and(|set| set.sis_member(&entry.key, &entry.value)),
        DataStructure::SortedSet => {
            let (key, score) = compose::decode_zset_key(&entry.key)?;
            inner
                .indexes
                .sorted_set
                .get(bucket)
                .and_then(|zset| zset.get(&key))
                .is_some_and(|(live_score, live_value)| {
                    live_score == score && live_value == &entry.value
                })
        }
        DataStructure::List => {
            matches!(entry.meta.flag, Flag::LPush | Flag::RPush)
                && inner.indexes.list.get(bucket).is_some_and(|list| {
                    list.lrange(&entry.key, 0, -1)
                        .iter()
                        .any(|value| value == &entry.value)
                })
        }
    })
}

/// Appends the survivors of one source segment to a fresh active segment
/// under a single new transaction id, then refreshes the indexes so every
/// hint points at the rewritten location.
fn rewrite_survivors(
    inner: &mut DbInner,
    opts: &Options,
    mut survivors: Vec<Entry>,
    tx_id: u64,
) -> Result<()> {
    inner.active_file.sync()?;
    inner.max_file_id += 1;
    inner.active_file = DataFile::open(
        &fileset::data_path(&opts.dir, inner.max_file_id),
        inner.max_file_id,
    )?;

    if survivors.is_empty() {
        return Ok(());
    }

    let count = survivors.len();
    let mut positions = Vec::with_capacity(count);
    for (i, entry) in survivors.iter_mut().enumerate() {
        entry.meta.tx_id = tx_id;
        entry.meta.status = if i + 1 == count {
            Status::Committed
        } else {
            Status::Uncommitted
        };

        let size = entry.size();
        if inner.active_file.write_off > 0 && inner.active_file.write_off + size > opts.segment_size
        {
            roll_active(inner, opts)?;
        }
        let offset = inner.active_file.write_off;
        inner.active_file.append(entry)?;
        positions.push((inner.active_file.file_id, offset));
    }
    inner.active_file.sync()?;
    inner.committed_txs.insert(tx_id);

    for (entry, (file_id, offset)) in survivors.into_iter().zip(positions) {
        // List values are already live in RAM; re-applying a push here
        // would duplicate them. Their log records are rewritten above and
        // replay correctly at the next open.
        if entry.meta.ds == DataStructure::List {
            continue;
        }
        let bucket = String::from_utf8(entry.bucket.clone()).map_err(|_| CodecError::BucketName)?;
        let hint = Hint {
            key: entry.key.clone(),
            file_id,
            offset,
            meta: entry.meta.clone(),
        };
        inner.indexes.apply(
            &bucket,
            Record {
                hint,
                entry: Some(entry),
            },
            opts.entry_idx_mode,
        )?;
    }
    Ok(())
}

fn bucket_str(entry: &Entry) -> Result<&str> {
    std::str::from_utf8(&entry.bucket).map_err(|_| CodecError::BucketName.into())
}
