//! Index reconstruction from the log.
//!
//! Recovery is a pure function from `(directory, segment ids, options)` to
//! an [`IndexSnapshot`]: it reads the log and produces fresh in-memory
//! state without touching the live engine, which makes it directly
//! testable and trivially idempotent.

use std::collections::{BTreeSet, HashMap};

use logfile::{
    compose, fileset, rootidx, CodecError, EntryStream, Hint, Record, RootIndex, Status,
};
use tracing::debug;

use crate::error::Result;
use crate::indexes::Indexes;
use crate::options::{EntryIdxMode, Options};

/// Everything `open` needs to bring a database live.
pub(crate) struct IndexSnapshot {
    pub indexes: Indexes,
    /// Ordered set of committed transaction ids discovered in the log.
    pub committed_txs: BTreeSet<u64>,
    /// Sparse mode: `bucket‖key` → on-file offset for every parsed entry.
    pub entry_positions: HashMap<Vec<u8>, u64>,
    /// Sparse mode: fence-key pointers loaded for every sealed segment.
    pub root_indexes: Vec<RootIndex>,
    /// Recovered write offset of the highest-numbered segment.
    pub active_write_off: u64,
    /// Seed for the next write transaction id.
    pub next_tx_id: u64,
}

struct UnconfirmedRecord {
    bucket: String,
    record: Record,
}

/// Rebuilds all index state from the segments named by `ids`.
pub(crate) fn build(opts: &Options, ids: &[u64]) -> Result<IndexSnapshot> {
    let (records, last_status, entry_positions, active_write_off) = parse_data_files(opts, ids)?;

    // A transaction is committed iff the last record carrying its id is
    // marked committed. A well-formed log marks only each transaction's
    // final record, so this also drops transactions whose tails never made
    // it to disk.
    let committed: BTreeSet<u64> = last_status
        .iter()
        .filter(|(_, status)| **status == Status::Committed)
        .map(|(tx_id, _)| *tx_id)
        .collect();

    let mut indexes = Indexes::new();
    for unconfirmed in records {
        if !committed.contains(&unconfirmed.record.hint.meta.tx_id) {
            continue;
        }
        indexes.apply(&unconfirmed.bucket, unconfirmed.record, opts.entry_idx_mode)?;
    }

    let mut committed_txs = committed;
    let mut root_indexes = Vec::new();
    if opts.entry_idx_mode == EntryIdxMode::BptSparse {
        for &id in ids.iter().take(ids.len().saturating_sub(1)) {
            root_indexes.extend(rootidx::load_root_index(&fileset::root_index_path(
                &opts.dir, id,
            ))?);
            committed_txs.extend(rootidx::load_txid_index(&fileset::txid_index_path(
                &opts.dir, id,
            ))?);
        }
    }

    let next_tx_id = committed_txs.iter().next_back().copied().unwrap_or(0) + 1;
    debug!(
        segments = ids.len(),
        applied = indexes.key_count,
        committed = committed_txs.len(),
        "rebuilt indexes from log"
    );

    Ok(IndexSnapshot {
        indexes,
        committed_txs,
        entry_positions,
        root_indexes,
        active_write_off,
        next_tx_id,
    })
}

type ParseOutput = (
    Vec<UnconfirmedRecord>,
    HashMap<u64, Status>,
    HashMap<Vec<u8>, u64>,
    u64,
);

/// Streams every segment in ascending id order (sparse mode: only the
/// newest) and collects unconfirmed records plus per-transaction status.
fn parse_data_files(opts: &Options, ids: &[u64]) -> Result<ParseOutput> {
    let mut records = Vec::new();
    let mut last_status: HashMap<u64, Status> = HashMap::new();
    let mut entry_positions = HashMap::new();
    let mut active_write_off = 0u64;

    let sparse = opts.entry_idx_mode == EntryIdxMode::BptSparse;
    let parse_ids: &[u64] = if sparse && !ids.is_empty() {
        &ids[ids.len() - 1..]
    } else {
        ids
    };
    let max_id = fileset::max_segment_id(ids);

    for &id in parse_ids {
        let path = fileset::data_path(&opts.dir, id);
        let mut stream = EntryStream::open(&path, opts.segment_size, opts.start_file_loading_mode)?;

        while let Some((offset, entry)) = stream.next_entry()? {
            last_status.insert(entry.meta.tx_id, entry.meta.status);

            let bucket =
                String::from_utf8(entry.bucket.clone()).map_err(|_| CodecError::BucketName)?;
            if sparse {
                entry_positions.insert(compose::composite_key(&entry.bucket, &entry.key), offset);
            }
            if id == max_id {
                active_write_off = offset + entry.size();
            }

            let hint = Hint {
                key: entry.key.clone(),
                file_id: id,
                offset,
                meta: entry.meta.clone(),
            };
            let resident = (opts.entry_idx_mode == EntryIdxMode::KeyValRam).then_some(entry);
            records.push(UnconfirmedRecord {
                bucket,
                record: Record {
                    hint,
                    entry: resident,
                },
            });
        }
    }

    Ok((records, last_status, entry_positions, active_write_off))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use logfile::{DataFile, DataStructure, Entry, Flag, Meta, PERSISTENT};
    use tempfile::tempdir;

    fn raw_entry(tx_id: u64, key: &[u8], value: &[u8], status: Status) -> Entry {
        Entry {
            bucket: b"u".to_vec(),
            key: key.to_vec(),
            value: value.to_vec(),
            meta: Meta {
                flag: Flag::Set,
                ds: DataStructure::Tree,
                status,
                tx_id,
                ttl: PERSISTENT,
                timestamp: 1_700_000_000,
            },
        }
    }

    fn write_segment(opts: &Options, id: u64, entries: &[Entry]) -> Result<()> {
        let mut df = DataFile::open(&fileset::data_path(&opts.dir, id), id)?;
        for entry in entries {
            df.append(entry)?;
        }
        df.sync()?;
        Ok(())
    }

    fn test_opts(dir: &std::path::Path) -> Options {
        Options::new(dir)
    }

    // -------------------- Commit filtering --------------------

    #[test]
    fn committed_records_are_applied() -> Result<()> {
        let dir = tempdir()?;
        let opts = test_opts(dir.path());
        write_segment(
            &opts,
            0,
            &[
                raw_entry(1, b"a", b"1", Status::Uncommitted),
                raw_entry(1, b"b", b"2", Status::Committed),
            ],
        )?;

        let snapshot = build(&opts, &[0])?;
        let tree = &snapshot.indexes.tree["u"];
        assert!(tree.contains_key(b"a"));
        assert!(tree.contains_key(b"b"));
        assert_eq!(snapshot.indexes.key_count, 2);
        assert!(snapshot.committed_txs.contains(&1));
        assert_eq!(snapshot.next_tx_id, 2);
        Ok(())
    }

    #[test]
    fn uncommitted_tail_drops_whole_transaction() -> Result<()> {
        // Two records share tx 7 but the final one is uncommitted: the
        // transaction never completed, so neither record may surface.
        let dir = tempdir()?;
        let opts = test_opts(dir.path());
        write_segment(
            &opts,
            0,
            &[
                raw_entry(7, b"a", b"1", Status::Committed),
                raw_entry(7, b"b", b"2", Status::Uncommitted),
            ],
        )?;

        let snapshot = build(&opts, &[0])?;
        assert!(!snapshot.committed_txs.contains(&7));
        assert!(snapshot.indexes.tree.get("u").is_none());
        assert_eq!(snapshot.indexes.key_count, 0);
        Ok(())
    }

    #[test]
    fn later_records_supersede_earlier_ones() -> Result<()> {
        let dir = tempdir()?;
        let opts = test_opts(dir.path());
        write_segment(&opts, 0, &[raw_entry(1, b"k", b"old", Status::Committed)])?;
        write_segment(&opts, 1, &[raw_entry(2, b"k", b"new", Status::Committed)])?;

        let snapshot = build(&opts, &[0, 1])?;
        let record = snapshot.indexes.tree["u"].get(b"k").unwrap();
        assert_eq!(record.entry.as_ref().unwrap().value, b"new");
        assert_eq!(record.hint.file_id, 1);
        // Both operations counted.
        assert_eq!(snapshot.indexes.key_count, 2);
        Ok(())
    }

    // -------------------- Torn tails & offsets --------------------

    #[test]
    fn torn_tail_is_tolerated() -> Result<()> {
        use std::io::Write;

        let dir = tempdir()?;
        let opts = test_opts(dir.path());
        let good = raw_entry(1, b"a", b"1", Status::Committed);
        write_segment(&opts, 0, &[good.clone()])?;

        let partial = raw_entry(2, b"b", b"2", Status::Committed).encode()?;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(fileset::data_path(&opts.dir, 0))?;
        file.write_all(&partial[..partial.len() / 2])?;

        let snapshot = build(&opts, &[0])?;
        assert!(snapshot.indexes.tree["u"].contains_key(b"a"));
        assert!(!snapshot.indexes.tree["u"].contains_key(b"b"));
        // The torn tail is not part of the recovered write offset.
        assert_eq!(snapshot.active_write_off, good.size());
        Ok(())
    }

    #[test]
    fn active_write_off_tracks_newest_segment() -> Result<()> {
        let dir = tempdir()?;
        let opts = test_opts(dir.path());
        let a = raw_entry(1, b"a", b"1", Status::Committed);
        let b = raw_entry(2, b"b", b"22", Status::Committed);
        write_segment(&opts, 0, &[a])?;
        write_segment(&opts, 1, &[b.clone()])?;

        let snapshot = build(&opts, &[0, 1])?;
        assert_eq!(snapshot.active_write_off, b.size());
        Ok(())
    }

    #[test]
    fn empty_id_list_yields_empty_snapshot() -> Result<()> {
        let dir = tempdir()?;
        let opts = test_opts(dir.path());
        let snapshot = build(&opts, &[])?;
        assert_eq!(snapshot.indexes.key_count, 0);
        assert_eq!(snapshot.active_write_off, 0);
        assert_eq!(snapshot.next_tx_id, 1);
        Ok(())
    }

    // -------------------- Idempotence --------------------

    #[test]
    fn recovery_is_idempotent() -> Result<()> {
        let dir = tempdir()?;
        let opts = test_opts(dir.path());
        write_segment(
            &opts,
            0,
            &[
                raw_entry(1, b"a", b"1", Status::Committed),
                raw_entry(2, b"a", b"2", Status::Committed),
                raw_entry(3, b"b", b"3", Status::Uncommitted),
            ],
        )?;

        let first = build(&opts, &[0])?;
        let second = build(&opts, &[0])?;
        assert_eq!(first.indexes.tree["u"], second.indexes.tree["u"]);
        assert_eq!(first.committed_txs, second.committed_txs);
        assert_eq!(first.indexes.key_count, second.indexes.key_count);
        assert_eq!(first.active_write_off, second.active_write_off);
        Ok(())
    }

    // -------------------- Mode interactions --------------------

    #[test]
    fn key_ram_mode_keeps_pointers_only() -> Result<()> {
        let dir = tempdir()?;
        let mut opts = test_opts(dir.path());
        opts.entry_idx_mode = EntryIdxMode::KeyRam;
        write_segment(&opts, 0, &[raw_entry(1, b"a", b"1", Status::Committed)])?;

        let snapshot = build(&opts, &[0])?;
        let record = snapshot.indexes.tree["u"].get(b"a").unwrap();
        assert!(record.entry.is_none());
        assert_eq!(record.hint.offset, 0);
        Ok(())
    }

    #[test]
    fn key_ram_mode_rejects_structural_records() -> Result<()> {
        let dir = tempdir()?;
        let mut opts = test_opts(dir.path());
        opts.entry_idx_mode = EntryIdxMode::KeyRam;

        let mut entry = raw_entry(1, b"s", b"member", Status::Committed);
        entry.meta.ds = DataStructure::Set;
        write_segment(&opts, 0, &[entry])?;

        assert!(matches!(
            build(&opts, &[0]),
            Err(crate::Error::IndexMode(_))
        ));
        Ok(())
    }

    #[test]
    fn sparse_mode_parses_only_newest_segment() -> Result<()> {
        let dir = tempdir()?;
        let mut opts = test_opts(dir.path());
        opts.entry_idx_mode = EntryIdxMode::BptSparse;
        std::fs::create_dir_all(fileset::bpt_root_dir(&opts.dir))?;
        std::fs::create_dir_all(fileset::bpt_txid_dir(&opts.dir))?;

        write_segment(&opts, 0, &[raw_entry(1, b"old", b"1", Status::Committed)])?;
        write_segment(&opts, 1, &[raw_entry(2, b"new", b"2", Status::Committed)])?;

        let snapshot = build(&opts, &[0, 1])?;
        assert!(snapshot
            .indexes
            .active_tree
            .contains_key(&compose::composite_key(b"u", b"new")));
        assert!(!snapshot
            .indexes
            .active_tree
            .contains_key(&compose::composite_key(b"u", b"old")));
        assert_eq!(
            snapshot.entry_positions.get(&compose::composite_key(b"u", b"new")),
            Some(&0)
        );
        Ok(())
    }

    #[test]
    fn malformed_structural_key_surfaces_as_codec_error() -> Result<()> {
        let dir = tempdir()?;
        let opts = test_opts(dir.path());

        // A zadd whose key lacks the score separator.
        let mut entry = raw_entry(1, b"apple-no-sep", b"A", Status::Committed);
        entry.meta.ds = DataStructure::SortedSet;
        entry.meta.flag = Flag::ZAdd;
        write_segment(&opts, 0, &[entry])?;

        assert!(matches!(build(&opts, &[0]), Err(crate::Error::Codec(_))));
        Ok(())
    }
}
