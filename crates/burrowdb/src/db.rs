//! The database facade: open/close, managed transactions, backup.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info};

use logfile::{fileset, rootidx, DataFile, RootIndex};

use crate::error::{Error, Result};
use crate::indexes::Indexes;
use crate::options::{EntryIdxMode, Options};
use crate::recovery;
use crate::tx::Tx;

/// Everything behind the header lock. `close` takes it out of the `Option`,
/// dropping the active file handle and the indexes, so every later access
/// observes [`Error::DbClosed`] instead of stale state.
pub(crate) struct DbInner {
    pub active_file: DataFile,
    pub max_file_id: u64,
    pub indexes: Indexes,
    /// Ordered set of committed transaction ids.
    pub committed_txs: BTreeSet<u64>,
    /// Sparse mode: `bucket‖key` → on-file offset for the newest segment.
    pub entry_positions: HashMap<Vec<u8>, u64>,
    /// Sparse mode: loaded fence-key pointers for sealed segments.
    pub root_indexes: Vec<RootIndex>,
    pub is_merging: bool,
}

/// An open BurrowDB database.
///
/// One `Db` owns its directory exclusively. A single reader/writer lock
/// protects the header state: write transactions and merge hold it
/// exclusively, read transactions share it.
pub struct Db {
    pub(crate) opts: Options,
    pub(crate) tx_counter: AtomicU64,
    pub(crate) state: RwLock<Option<DbInner>>,
}

impl Db {
    /// Opens the database at `opts.dir`, creating the directory if needed
    /// and rebuilding all in-memory indexes from the log.
    pub fn open(opts: Options) -> Result<Db> {
        std::fs::create_dir_all(&opts.dir)?;
        check_entry_idx_mode(&opts)?;

        if opts.entry_idx_mode == EntryIdxMode::BptSparse {
            std::fs::create_dir_all(fileset::bpt_root_dir(&opts.dir))?;
            std::fs::create_dir_all(fileset::bpt_txid_dir(&opts.dir))?;
        }

        let ids = fileset::segment_ids(&opts.dir)?;
        let snapshot = recovery::build(&opts, &ids)?;

        let max_file_id = fileset::max_segment_id(&ids);
        let mut active_file = DataFile::open(&fileset::data_path(&opts.dir, max_file_id), max_file_id)?;
        active_file.write_off = snapshot.active_write_off;

        info!(
            dir = %opts.dir.display(),
            max_file_id,
            key_count = snapshot.indexes.key_count,
            "opened database"
        );

        Ok(Db {
            tx_counter: AtomicU64::new(snapshot.next_tx_id),
            state: RwLock::new(Some(DbInner {
                active_file,
                max_file_id,
                indexes: snapshot.indexes,
                committed_txs: snapshot.committed_txs,
                entry_positions: snapshot.entry_positions,
                root_indexes: snapshot.root_indexes,
                is_merging: false,
            })),
            opts,
        })
    }

    /// Runs `f` inside a read-only transaction. Multiple views may run in
    /// parallel; mutating operations fail with [`Error::TxReadOnly`].
    pub fn view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Tx) -> Result<T>,
    {
        let guard = self.state.read();
        let inner = guard.as_ref().ok_or(Error::DbClosed)?;
        let mut tx = Tx::read(inner, &self.opts);
        f(&mut tx)
    }

    /// Runs `f` inside a managed write transaction: commits on `Ok`, rolls
    /// back on `Err` and on commit failure. Write transactions serialize.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Tx) -> Result<T>,
    {
        let mut guard = self.state.write();
        let inner = guard.as_mut().ok_or(Error::DbClosed)?;
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        let mut tx = Tx::write(inner, &self.opts, tx_id);
        match f(&mut tx) {
            Ok(value) => match tx.commit() {
                Ok(()) => Ok(value),
                Err(e) => {
                    tx.rollback();
                    Err(e)
                }
            },
            Err(e) => {
                tx.rollback();
                Err(e)
            }
        }
    }

    /// Releases all resources. Any later operation, including a second
    /// `close`, returns [`Error::DbClosed`].
    pub fn close(&self) -> Result<()> {
        let mut guard = self.state.write();
        let inner = guard.take().ok_or(Error::DbClosed)?;
        inner.active_file.sync()?;
        info!(dir = %self.opts.dir.display(), "closed database");
        Ok(())
    }

    /// Copies the whole database directory to `target`. Runs under the
    /// exclusive lock so the copy is a consistent snapshot: no writer can
    /// extend the active segment mid-copy.
    pub fn backup(&self, target: &Path) -> Result<()> {
        let mut guard = self.state.write();
        let inner = guard.as_mut().ok_or(Error::DbClosed)?;
        inner.active_file.sync()?;
        copy_dir(&self.opts.dir, target)?;
        Ok(())
    }

    /// Total applied operations, including deletes and overwrites.
    pub fn key_count(&self) -> Result<u64> {
        let guard = self.state.read();
        let inner = guard.as_ref().ok_or(Error::DbClosed)?;
        Ok(inner.indexes.key_count)
    }

    /// Id of the active segment file.
    pub fn max_file_id(&self) -> Result<u64> {
        let guard = self.state.read();
        let inner = guard.as_ref().ok_or(Error::DbClosed)?;
        Ok(inner.max_file_id)
    }
}

/// Open-time compatibility check between the configured index mode and the
/// on-disk state. Switching an existing database into or out of sparse
/// mode is not supported.
fn check_entry_idx_mode(opts: &Options) -> Result<()> {
    let has_data = fileset::has_segment_files(&opts.dir)?;
    let has_bpt = fileset::has_bpt_dir(&opts.dir);
    let sparse = opts.entry_idx_mode == EntryIdxMode::BptSparse;

    if has_data && has_bpt && !sparse {
        return Err(Error::IndexMode("cannot switch away from the sparse index mode"));
    }
    if has_data && !has_bpt && sparse {
        return Err(Error::IndexMode("cannot switch existing data to the sparse index mode"));
    }
    Ok(())
}

/// Seals the active segment and opens `max_file_id + 1` as the new active
/// file. In sparse mode the sealed segment's fence keys and the committed
/// transaction ids are persisted first, then the in-RAM view resets to
/// cover only the new segment.
pub(crate) fn roll_active(inner: &mut DbInner, opts: &Options) -> Result<()> {
    inner.active_file.sync()?;

    if opts.entry_idx_mode == EntryIdxMode::BptSparse {
        let sealed = inner.active_file.file_id;
        // Fence keys span every record persisted in the sealed segment,
        // committed or not, so the side map is the authority here rather
        // than the committed-only active tree.
        let fences = (
            inner.entry_positions.keys().min().cloned(),
            inner.entry_positions.keys().max().cloned(),
        );
        if let (Some(start_key), Some(end_key)) = fences {
            let root = RootIndex {
                file_id: sealed,
                start_key,
                end_key,
            };
            rootidx::append_root_index(&fileset::root_index_path(&opts.dir, sealed), &root)?;
        }
        rootidx::write_txid_index(
            &fileset::txid_index_path(&opts.dir, sealed),
            inner.committed_txs.iter().copied(),
        )?;
        inner.indexes.active_tree.clear();
        inner.entry_positions.clear();
    }

    inner.max_file_id += 1;
    let path = fileset::data_path(&opts.dir, inner.max_file_id);
    inner.active_file = DataFile::open(&path, inner.max_file_id)?;
    debug!(file_id = inner.max_file_id, "rolled active segment");
    Ok(())
}

fn copy_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for dent in std::fs::read_dir(src)? {
        let dent = dent?;
        let target = dst.join(dent.file_name());
        if dent.file_type()?.is_dir() {
            copy_dir(&dent.path(), &target)?;
        } else {
            std::fs::copy(dent.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use logfile::PERSISTENT;
    use tempfile::tempdir;

    fn open_at(dir: &Path) -> crate::Result<Db> {
        Db::open(Options::new(dir))
    }

    // -------------------- Open --------------------

    #[test]
    fn open_empty_dir_bootstraps() -> Result<()> {
        let dir = tempdir()?;
        let db_dir = dir.path().join("db");

        let db = open_at(&db_dir)?;
        assert!(db_dir.is_dir());
        assert!(fileset::data_path(&db_dir, 0).is_file());
        assert_eq!(db.max_file_id()?, 0);
        assert_eq!(db.key_count()?, 0);
        db.view(|tx| {
            assert!(matches!(tx.get("u", b"a"), Err(Error::BucketNotFound)));
            Ok(())
        })?;
        Ok(())
    }

    // -------------------- Write, read, recover --------------------

    #[test]
    fn write_read_recover() -> Result<()> {
        let dir = tempdir()?;

        let db = open_at(dir.path())?;
        db.update(|tx| {
            tx.put("u", b"a", b"1", PERSISTENT)?;
            tx.put("u", b"a", b"2", PERSISTENT)
        })?;
        assert_eq!(db.view(|tx| tx.get("u", b"a"))?, b"2");
        db.close()?;

        let db = open_at(dir.path())?;
        assert_eq!(db.view(|tx| tx.get("u", b"a"))?, b"2");
        // Both puts were operations.
        assert_eq!(db.key_count()?, 2);
        Ok(())
    }

    #[test]
    fn reopen_reconstructs_every_structure() -> Result<()> {
        let dir = tempdir()?;

        let db = open_at(dir.path())?;
        db.update(|tx| {
            tx.put("kv", b"k", b"v", PERSISTENT)?;
            tx.sadd("s", b"tags", b"red")?;
            tx.sadd("s", b"tags", b"blue")?;
            tx.srem("s", b"tags", b"red")?;
            tx.zadd("z", b"apple", 1.0, b"A")?;
            tx.rpush("l", b"q", b"a")?;
            tx.rpush("l", b"q", b"b")
        })?;
        db.close()?;

        let db = open_at(dir.path())?;
        db.view(|tx| {
            assert_eq!(tx.get("kv", b"k")?, b"v");
            assert_eq!(tx.smembers("s", b"tags")?, vec![b"blue".to_vec()]);
            assert_eq!(tx.zscore("z", b"apple")?, 1.0);
            assert_eq!(tx.lrange("l", b"q", 0, -1)?, vec![b"a".to_vec(), b"b".to_vec()]);
            Ok(())
        })?;
        Ok(())
    }

    #[test]
    fn list_reconstruction_after_pops() -> Result<()> {
        let dir = tempdir()?;

        let db = open_at(dir.path())?;
        db.update(|tx| {
            tx.rpush("L", b"q", b"a")?;
            tx.rpush("L", b"q", b"b")
        })?;
        db.update(|tx| {
            tx.lpop("L", b"q").map(|popped| assert_eq!(popped, b"a"))
        })?;
        db.close()?;

        let db = open_at(dir.path())?;
        assert_eq!(db.view(|tx| tx.lrange("L", b"q", 0, -1))?, vec![b"b".to_vec()]);
        Ok(())
    }

    #[test]
    fn sorted_set_reconstruction_after_zrem() -> Result<()> {
        let dir = tempdir()?;

        let db = open_at(dir.path())?;
        db.update(|tx| {
            tx.zadd("S", b"apple", 1.0, b"A")?;
            tx.zadd("S", b"pear", 2.0, b"P")?;
            tx.zrem("S", b"apple")
        })?;
        db.close()?;

        let db = open_at(dir.path())?;
        let members = db.view(|tx| tx.zmembers("S"))?;
        assert_eq!(members, vec![(b"pear".to_vec(), 2.0, b"P".to_vec())]);
        Ok(())
    }

    // -------------------- Rollback --------------------

    #[test]
    fn user_error_rolls_back() -> Result<()> {
        let dir = tempdir()?;

        let db = open_at(dir.path())?;
        let result: crate::Result<()> = db.update(|tx| {
            tx.put("u", b"doomed", b"1", PERSISTENT)?;
            Err(Error::KeyNotFound)
        });
        assert!(result.is_err());

        assert!(matches!(
            db.view(|tx| tx.get("u", b"doomed")),
            Err(Error::BucketNotFound)
        ));
        assert_eq!(db.key_count()?, 0);
        Ok(())
    }

    #[test]
    fn writes_in_view_are_rejected() -> Result<()> {
        let dir = tempdir()?;
        let db = open_at(dir.path())?;
        db.view(|tx| {
            assert!(matches!(
                tx.put("u", b"k", b"v", PERSISTENT),
                Err(Error::TxReadOnly)
            ));
            assert!(matches!(tx.rpush("u", b"q", b"v"), Err(Error::TxReadOnly)));
            Ok(())
        })?;
        Ok(())
    }

    // -------------------- Tombstones & TTL --------------------

    #[test]
    fn delete_is_a_tombstone() -> Result<()> {
        let dir = tempdir()?;

        let db = open_at(dir.path())?;
        db.update(|tx| tx.put("u", b"x", b"1", PERSISTENT))?;
        db.update(|tx| tx.delete("u", b"x"))?;
        assert!(matches!(db.view(|tx| tx.get("u", b"x")), Err(Error::KeyNotFound)));
        db.close()?;

        let db = open_at(dir.path())?;
        assert!(matches!(db.view(|tx| tx.get("u", b"x")), Err(Error::KeyNotFound)));
        Ok(())
    }

    #[test]
    fn expired_records_read_as_missing() -> Result<()> {
        let dir = tempdir()?;

        let db = open_at(dir.path())?;
        db.update(|tx| {
            tx.put("u", b"fresh", b"1", 1_000_000)?;
            tx.put("u", b"stale", b"1", 1)
        })?;
        std::thread::sleep(std::time::Duration::from_millis(1100));

        db.view(|tx| {
            assert!(tx.get("u", b"fresh").is_ok());
            assert!(matches!(tx.get("u", b"stale"), Err(Error::KeyNotFound)));
            Ok(())
        })?;
        Ok(())
    }

    // -------------------- Prefix scans --------------------

    #[test]
    fn scan_prefix_respects_limit_and_tombstones() -> Result<()> {
        let dir = tempdir()?;

        let db = open_at(dir.path())?;
        db.update(|tx| {
            tx.put("u", b"user:1", b"a", PERSISTENT)?;
            tx.put("u", b"user:2", b"b", PERSISTENT)?;
            tx.put("u", b"user:3", b"c", PERSISTENT)?;
            tx.put("u", b"admin:1", b"d", PERSISTENT)?;
            tx.delete("u", b"user:2")
        })?;

        let all = db.view(|tx| tx.scan_prefix("u", b"user:", crate::SCAN_NO_LIMIT))?;
        assert_eq!(
            all,
            vec![
                (b"user:1".to_vec(), b"a".to_vec()),
                (b"user:3".to_vec(), b"c".to_vec()),
            ]
        );

        let capped = db.view(|tx| tx.scan_prefix("u", b"user:", 1))?;
        assert_eq!(capped.len(), 1);
        Ok(())
    }

    // -------------------- Segment rolling --------------------

    #[test]
    fn active_segment_rolls_at_cap() -> Result<()> {
        let dir = tempdir()?;
        let mut opts = Options::new(dir.path());
        opts.segment_size = 256;

        let db = Db::open(opts)?;
        for i in 0..16u32 {
            db.update(|tx| tx.put("u", format!("k{i}").as_bytes(), &[b'x'; 32], PERSISTENT))?;
        }
        assert!(db.max_file_id()? > 0);

        // Every key remains reachable, including those in sealed segments.
        db.view(|tx| {
            for i in 0..16u32 {
                assert!(tx.get("u", format!("k{i}").as_bytes()).is_ok());
            }
            Ok(())
        })?;
        db.close()?;

        let db = open_at(dir.path())?;
        assert_eq!(db.view(|tx| tx.get("u", b"k15"))?, vec![b'x'; 32]);
        Ok(())
    }

    // -------------------- Pointer mode --------------------

    #[test]
    fn key_ram_mode_reads_through_hints() -> Result<()> {
        let dir = tempdir()?;
        let mut opts = Options::new(dir.path());
        opts.entry_idx_mode = EntryIdxMode::KeyRam;

        let db = Db::open(opts.clone())?;
        db.update(|tx| tx.put("u", b"a", b"via-hint", PERSISTENT))?;
        assert_eq!(db.view(|tx| tx.get("u", b"a"))?, b"via-hint");
        db.close()?;

        let db = Db::open(opts)?;
        assert_eq!(db.view(|tx| tx.get("u", b"a"))?, b"via-hint");
        Ok(())
    }

    // -------------------- Close --------------------

    #[test]
    fn closed_db_rejects_everything() -> Result<()> {
        let dir = tempdir()?;
        let db = open_at(dir.path())?;
        db.close()?;

        assert!(matches!(db.close(), Err(Error::DbClosed)));
        assert!(matches!(db.view(|_| Ok(())), Err(Error::DbClosed)));
        assert!(matches!(db.update(|_| Ok(())), Err(Error::DbClosed)));
        assert!(matches!(db.merge(), Err(Error::DbClosed)));
        assert!(matches!(db.key_count(), Err(Error::DbClosed)));
        assert!(matches!(db.max_file_id(), Err(Error::DbClosed)));
        assert!(matches!(
            db.backup(&dir.path().join("bak")),
            Err(Error::DbClosed)
        ));
        Ok(())
    }

    // -------------------- Mode switching --------------------

    #[test]
    fn mode_switch_into_sparse_fails() -> Result<()> {
        let dir = tempdir()?;

        let db = open_at(dir.path())?;
        db.update(|tx| tx.put("u", b"a", b"1", PERSISTENT))?;
        db.close()?;

        let mut opts = Options::new(dir.path());
        opts.entry_idx_mode = EntryIdxMode::BptSparse;
        assert!(matches!(Db::open(opts), Err(Error::IndexMode(_))));
        Ok(())
    }

    #[test]
    fn mode_switch_out_of_sparse_fails() -> Result<()> {
        let dir = tempdir()?;

        let mut opts = Options::new(dir.path());
        opts.entry_idx_mode = EntryIdxMode::BptSparse;
        let db = Db::open(opts)?;
        db.update(|tx| tx.put("u", b"a", b"1", PERSISTENT))?;
        db.close()?;

        assert!(matches!(open_at(dir.path()), Err(Error::IndexMode(_))));
        Ok(())
    }

    // -------------------- Sparse mode --------------------

    #[test]
    fn sparse_mode_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let mut opts = Options::new(dir.path());
        opts.entry_idx_mode = EntryIdxMode::BptSparse;

        let db = Db::open(opts.clone())?;
        db.update(|tx| tx.put("u", b"a", b"1", PERSISTENT))?;
        assert_eq!(db.view(|tx| tx.get("u", b"a"))?, b"1");
        db.close()?;

        let db = Db::open(opts)?;
        assert_eq!(db.view(|tx| tx.get("u", b"a"))?, b"1");
        Ok(())
    }

    #[test]
    fn sparse_roll_persists_root_and_txid_indexes() -> Result<()> {
        let dir = tempdir()?;
        let mut opts = Options::new(dir.path());
        opts.entry_idx_mode = EntryIdxMode::BptSparse;
        opts.segment_size = 256;

        let db = Db::open(opts.clone())?;
        for i in 0..16u32 {
            db.update(|tx| tx.put("u", format!("k{i:02}").as_bytes(), &[b'x'; 32], PERSISTENT))?;
        }
        assert!(db.max_file_id()? > 0);
        db.close()?;

        let roots = rootidx::load_root_index(&fileset::root_index_path(dir.path(), 0))?;
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].file_id, 0);
        assert!(roots[0].start_key <= roots[0].end_key);
        assert!(!rootidx::load_txid_index(&fileset::txid_index_path(dir.path(), 0))?.is_empty());

        // Reopen loads the sealed-segment pointers back.
        let db = Db::open(opts)?;
        let guard = db.state.read();
        assert!(!guard.as_ref().unwrap().root_indexes.is_empty());
        Ok(())
    }

    // -------------------- Backup --------------------

    #[test]
    fn backup_copies_a_working_database() -> Result<()> {
        let dir = tempdir()?;
        let backup_dir = tempdir()?;
        let target = backup_dir.path().join("snapshot");

        let db = open_at(dir.path())?;
        db.update(|tx| tx.put("u", b"a", b"1", PERSISTENT))?;
        db.backup(&target)?;
        db.close()?;

        let copy = open_at(&target)?;
        assert_eq!(copy.view(|tx| tx.get("u", b"a"))?, b"1");
        Ok(())
    }

    // -------------------- Monotonic transaction ids --------------------

    #[test]
    fn tx_ids_continue_across_reopen() -> Result<()> {
        let dir = tempdir()?;

        let db = open_at(dir.path())?;
        db.update(|tx| tx.put("u", b"a", b"1", PERSISTENT))?;
        let first_id = db.tx_counter.load(Ordering::SeqCst);
        db.close()?;

        let db = open_at(dir.path())?;
        assert!(db.tx_counter.load(Ordering::SeqCst) >= first_id);
        Ok(())
    }
}
