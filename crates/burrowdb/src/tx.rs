//! Transactions: queued writes, commit/rollback, and the read surface.
//!
//! A write transaction queues [`Entry`] values; `commit` appends them in
//! order to the active segment (rolling to a fresh segment when the next
//! record would cross the cap), marks only the final record committed, and
//! then applies everything to the in-memory indexes with each record's
//! log position. Until commit, nothing is visible: reads inside the same
//! transaction see pre-transaction state, as the coordinator applies
//! pending writes only at commit.

use std::time::{SystemTime, UNIX_EPOCH};

use logfile::{
    compose, fileset, read_entry_at, CodecError, DataStructure, Entry, Flag, Hint, Meta, Record,
    Status, PERSISTENT,
};
use structures::StructureError;

use crate::db::{roll_active, DbInner};
use crate::error::{Error, Result};
use crate::options::{EntryIdxMode, Options, SCAN_NO_LIMIT};

/// Seconds since the Unix epoch.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

enum Access<'a> {
    Read(&'a DbInner),
    Write(&'a mut DbInner),
}

/// A managed transaction handle, passed to the closures given to
/// [`crate::Db::view`] and [`crate::Db::update`].
pub struct Tx<'a> {
    access: Access<'a>,
    opts: &'a Options,
    tx_id: u64,
    pending: Vec<Entry>,
}

impl<'a> Tx<'a> {
    pub(crate) fn read(inner: &'a DbInner, opts: &'a Options) -> Self {
        Self {
            access: Access::Read(inner),
            opts,
            tx_id: 0,
            pending: Vec::new(),
        }
    }

    pub(crate) fn write(inner: &'a mut DbInner, opts: &'a Options, tx_id: u64) -> Self {
        Self {
            access: Access::Write(inner),
            opts,
            tx_id,
            pending: Vec::new(),
        }
    }

    /// The transaction id; 0 for read-only transactions.
    pub fn id(&self) -> u64 {
        self.tx_id
    }

    fn inner(&self) -> &DbInner {
        match &self.access {
            Access::Read(inner) => inner,
            Access::Write(inner) => inner,
        }
    }

    fn queue(
        &mut self,
        bucket: &str,
        key: Vec<u8>,
        value: Vec<u8>,
        ttl: u32,
        flag: Flag,
        ds: DataStructure,
    ) -> Result<()> {
        if matches!(self.access, Access::Read(_)) {
            return Err(Error::TxReadOnly);
        }
        self.pending.push(Entry {
            bucket: bucket.as_bytes().to_vec(),
            key,
            value,
            meta: Meta {
                flag,
                ds,
                status: Status::Uncommitted,
                tx_id: self.tx_id,
                ttl,
                timestamp: unix_now(),
            },
        });
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Ordered map
    // ---------------------------------------------------------------------

    /// Stores `value` under `(bucket, key)`. `ttl` is seconds to live;
    /// [`PERSISTENT`] means no expiry.
    pub fn put(&mut self, bucket: &str, key: &[u8], value: &[u8], ttl: u32) -> Result<()> {
        self.queue(
            bucket,
            key.to_vec(),
            value.to_vec(),
            ttl,
            Flag::Set,
            DataStructure::Tree,
        )
    }

    /// Writes a tombstone for `(bucket, key)`.
    pub fn delete(&mut self, bucket: &str, key: &[u8]) -> Result<()> {
        self.queue(
            bucket,
            key.to_vec(),
            Vec::new(),
            PERSISTENT,
            Flag::Delete,
            DataStructure::Tree,
        )
    }

    /// Returns the live value for `(bucket, key)`. Tombstones and expired
    /// records read as [`Error::KeyNotFound`].
    pub fn get(&self, bucket: &str, key: &[u8]) -> Result<Vec<u8>> {
        let inner = self.inner();
        let record = if self.opts.entry_idx_mode == EntryIdxMode::BptSparse {
            let composite = compose::composite_key(bucket.as_bytes(), key);
            match inner.indexes.active_tree.get(&composite) {
                Some(record) => Some(record),
                None => {
                    // The key may live in a sealed segment, reachable only
                    // through its persisted index; those are not traversed.
                    if inner
                        .root_indexes
                        .iter()
                        .any(|root| root.start_key <= composite && composite <= root.end_key)
                    {
                        return Err(Error::IndexMode(
                            "key resides in a sealed segment of a sparse index",
                        ));
                    }
                    None
                }
            }
        } else {
            inner
                .indexes
                .tree
                .get(bucket)
                .ok_or(Error::BucketNotFound)?
                .get(key)
        };
        let record = record.ok_or(Error::KeyNotFound)?;
        self.live_value(record, unix_now())?.ok_or(Error::KeyNotFound)
    }

    /// All live `(key, value)` pairs whose key starts with `prefix`, in
    /// ascending key order, capped at `limit` ([`SCAN_NO_LIMIT`] for all).
    pub fn scan_prefix(
        &self,
        bucket: &str,
        prefix: &[u8],
        limit: i64,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let inner = self.inner();
        let now = unix_now();
        let composite;
        let records: Box<dyn Iterator<Item = &Record> + '_> =
            if self.opts.entry_idx_mode == EntryIdxMode::BptSparse {
                composite = compose::composite_key(bucket.as_bytes(), prefix);
                Box::new(inner.indexes.active_tree.prefix(&composite).map(|(_, r)| r))
            } else {
                let tree = inner
                    .indexes
                    .tree
                    .get(bucket)
                    .ok_or(Error::BucketNotFound)?;
                Box::new(tree.prefix(prefix).map(|(_, r)| r))
            };

        let mut out = Vec::new();
        for record in records {
            if limit != SCAN_NO_LIMIT && out.len() as i64 >= limit {
                break;
            }
            if let Some(value) = self.live_value(record, now)? {
                out.push((record.hint.key.clone(), value));
            }
        }
        Ok(out)
    }

    /// Resolves a tree record to its live value: `None` for tombstones and
    /// expired records, a read back through the hint when the value is not
    /// resident.
    fn live_value(&self, record: &Record, now: u64) -> Result<Option<Vec<u8>>> {
        let meta = &record.hint.meta;
        if meta.flag != Flag::Set || meta.is_expired_at(now) {
            return Ok(None);
        }
        if let Some(entry) = &record.entry {
            return Ok(Some(entry.value.clone()));
        }
        let path = fileset::data_path(&self.opts.dir, record.hint.file_id);
        match read_entry_at(&path, record.hint.offset)? {
            Some(entry) => Ok(Some(entry.value)),
            None => Err(Error::Codec(CodecError::Corrupt)),
        }
    }

    // ---------------------------------------------------------------------
    // Set
    // ---------------------------------------------------------------------

    pub fn sadd(&mut self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.queue(
            bucket,
            key.to_vec(),
            value.to_vec(),
            PERSISTENT,
            Flag::Set,
            DataStructure::Set,
        )
    }

    pub fn srem(&mut self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.queue(
            bucket,
            key.to_vec(),
            value.to_vec(),
            PERSISTENT,
            Flag::Delete,
            DataStructure::Set,
        )
    }

    pub fn sis_member(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<bool> {
        let set = self
            .inner()
            .indexes
            .set
            .get(bucket)
            .ok_or(Error::BucketNotFound)?;
        Ok(set.sis_member(key, value))
    }

    /// Members of the set at `(bucket, key)`, sorted for determinism.
    pub fn smembers(&self, bucket: &str, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let set = self
            .inner()
            .indexes
            .set
            .get(bucket)
            .ok_or(Error::BucketNotFound)?;
        let mut members: Vec<Vec<u8>> = set.members(key).cloned().collect();
        members.sort_unstable();
        Ok(members)
    }

    // ---------------------------------------------------------------------
    // Sorted set
    // ---------------------------------------------------------------------

    pub fn zadd(&mut self, bucket: &str, key: &[u8], score: f64, value: &[u8]) -> Result<()> {
        self.queue(
            bucket,
            compose::encode_zset_key(key, score),
            value.to_vec(),
            PERSISTENT,
            Flag::ZAdd,
            DataStructure::SortedSet,
        )
    }

    pub fn zrem(&mut self, bucket: &str, key: &[u8]) -> Result<()> {
        self.queue(
            bucket,
            key.to_vec(),
            Vec::new(),
            PERSISTENT,
            Flag::ZRem,
            DataStructure::SortedSet,
        )
    }

    /// Removes members ranked `[start, end]` (1-based; negatives from the
    /// top).
    pub fn zrem_range_by_rank(&mut self, bucket: &str, start: i64, end: i64) -> Result<()> {
        self.queue(
            bucket,
            start.to_string().into_bytes(),
            end.to_string().into_bytes(),
            PERSISTENT,
            Flag::ZRemRangeByRank,
            DataStructure::SortedSet,
        )
    }

    /// Removes and returns the highest-scored member of the sorted set.
    pub fn zpop_max(&mut self, bucket: &str) -> Result<(Vec<u8>, f64, Vec<u8>)> {
        let popped = self.zpeek(bucket, true)?;
        self.queue(
            bucket,
            Vec::new(),
            Vec::new(),
            PERSISTENT,
            Flag::ZPopMax,
            DataStructure::SortedSet,
        )?;
        Ok(popped)
    }

    /// Removes and returns the lowest-scored member of the sorted set.
    pub fn zpop_min(&mut self, bucket: &str) -> Result<(Vec<u8>, f64, Vec<u8>)> {
        let popped = self.zpeek(bucket, false)?;
        self.queue(
            bucket,
            Vec::new(),
            Vec::new(),
            PERSISTENT,
            Flag::ZPopMin,
            DataStructure::SortedSet,
        )?;
        Ok(popped)
    }

    fn zpeek(&self, bucket: &str, max: bool) -> Result<(Vec<u8>, f64, Vec<u8>)> {
        let zset = self
            .inner()
            .indexes
            .sorted_set
            .get(bucket)
            .ok_or(Error::BucketNotFound)?;
        let (key, score) = if max {
            zset.peek_max().ok_or(Error::KeyNotFound)?
        } else {
            zset.peek_min().ok_or(Error::KeyNotFound)?
        };
        let (_, value) = zset.get(key).ok_or(Error::KeyNotFound)?;
        Ok((key.clone(), score, value.clone()))
    }

    pub fn zscore(&self, bucket: &str, key: &[u8]) -> Result<f64> {
        let zset = self
            .inner()
            .indexes
            .sorted_set
            .get(bucket)
            .ok_or(Error::BucketNotFound)?;
        let (score, _) = zset.get(key).ok_or(Error::KeyNotFound)?;
        Ok(score)
    }

    /// All members ascending by `(score, key)`.
    pub fn zmembers(&self, bucket: &str) -> Result<Vec<(Vec<u8>, f64, Vec<u8>)>> {
        let zset = self
            .inner()
            .indexes
            .sorted_set
            .get(bucket)
            .ok_or(Error::BucketNotFound)?;
        Ok(zset
            .iter()
            .map(|(k, score, v)| (k.clone(), score, v.clone()))
            .collect())
    }

    // ---------------------------------------------------------------------
    // List
    // ---------------------------------------------------------------------

    pub fn lpush(&mut self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.queue(
            bucket,
            key.to_vec(),
            value.to_vec(),
            PERSISTENT,
            Flag::LPush,
            DataStructure::List,
        )
    }

    pub fn rpush(&mut self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.queue(
            bucket,
            key.to_vec(),
            value.to_vec(),
            PERSISTENT,
            Flag::RPush,
            DataStructure::List,
        )
    }

    /// Removes and returns the head of the list.
    pub fn lpop(&mut self, bucket: &str, key: &[u8]) -> Result<Vec<u8>> {
        let value = self.list_peek(bucket, key, true)?;
        self.queue(
            bucket,
            key.to_vec(),
            Vec::new(),
            PERSISTENT,
            Flag::LPop,
            DataStructure::List,
        )?;
        Ok(value)
    }

    /// Removes and returns the tail of the list.
    pub fn rpop(&mut self, bucket: &str, key: &[u8]) -> Result<Vec<u8>> {
        let value = self.list_peek(bucket, key, false)?;
        self.queue(
            bucket,
            key.to_vec(),
            Vec::new(),
            PERSISTENT,
            Flag::RPop,
            DataStructure::List,
        )?;
        Ok(value)
    }

    fn list_peek(&self, bucket: &str, key: &[u8], head: bool) -> Result<Vec<u8>> {
        let list = self
            .inner()
            .indexes
            .list
            .get(bucket)
            .ok_or(Error::BucketNotFound)?;
        let value = if head { list.front(key) } else { list.back(key) };
        Ok(value.ok_or(Error::KeyNotFound)?.clone())
    }

    /// Removes elements by position: `count > 0` from the head, `count < 0`
    /// from the tail, `0` clears the list.
    pub fn lrem(&mut self, bucket: &str, key: &[u8], count: i64) -> Result<()> {
        self.require_list(bucket, key)?;
        self.queue(
            bucket,
            key.to_vec(),
            count.to_string().into_bytes(),
            PERSISTENT,
            Flag::LRem,
            DataStructure::List,
        )
    }

    /// Replaces the element at `index` (negatives from the tail).
    pub fn lset(&mut self, bucket: &str, key: &[u8], index: i64, value: &[u8]) -> Result<()> {
        let list = self
            .inner()
            .indexes
            .list
            .get(bucket)
            .ok_or(Error::BucketNotFound)?;
        if !list.has_key(key) {
            return Err(StructureError::NotFound.into());
        }
        let len = list.llen(key) as i64;
        let resolved = if index < 0 { len + index } else { index };
        if !(0..len).contains(&resolved) {
            return Err(StructureError::IndexOutOfRange.into());
        }
        self.queue(
            bucket,
            compose::encode_list_key(key, index),
            value.to_vec(),
            PERSISTENT,
            Flag::LSet,
            DataStructure::List,
        )
    }

    /// Retains only `[start, end]` of the list (inclusive; negatives from
    /// the tail).
    pub fn ltrim(&mut self, bucket: &str, key: &[u8], start: i64, end: i64) -> Result<()> {
        self.require_list(bucket, key)?;
        self.queue(
            bucket,
            compose::encode_list_key(key, start),
            end.to_string().into_bytes(),
            PERSISTENT,
            Flag::LTrim,
            DataStructure::List,
        )
    }

    /// Elements in `[start, end]` (inclusive; negatives from the tail).
    pub fn lrange(&self, bucket: &str, key: &[u8], start: i64, end: i64) -> Result<Vec<Vec<u8>>> {
        let list = self
            .inner()
            .indexes
            .list
            .get(bucket)
            .ok_or(Error::BucketNotFound)?;
        Ok(list.lrange(key, start, end))
    }

    fn require_list(&self, bucket: &str, key: &[u8]) -> Result<()> {
        let list = self
            .inner()
            .indexes
            .list
            .get(bucket)
            .ok_or(Error::BucketNotFound)?;
        if !list.has_key(key) {
            return Err(StructureError::NotFound.into());
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Commit / rollback
    // ---------------------------------------------------------------------

    /// Appends every pending entry to the log (final entry committed) and
    /// applies them to the in-memory indexes.
    pub(crate) fn commit(&mut self) -> Result<()> {
        let inner: &mut DbInner = match &mut self.access {
            Access::Write(inner) => inner,
            Access::Read(_) => {
                self.pending.clear();
                return Ok(());
            }
        };
        if self.pending.is_empty() {
            return Ok(());
        }

        let sparse = self.opts.entry_idx_mode == EntryIdxMode::BptSparse;
        let count = self.pending.len();
        let mut positions = Vec::with_capacity(count);
        for (i, entry) in self.pending.iter_mut().enumerate() {
            entry.meta.status = if i + 1 == count {
                Status::Committed
            } else {
                Status::Uncommitted
            };

            let size = entry.size();
            if inner.active_file.write_off > 0
                && inner.active_file.write_off + size > self.opts.segment_size
            {
                roll_active(inner, self.opts)?;
            }
            let offset = inner.active_file.write_off;
            inner.active_file.append(entry)?;
            if sparse {
                inner
                    .entry_positions
                    .insert(compose::composite_key(&entry.bucket, &entry.key), offset);
            }
            positions.push((inner.active_file.file_id, offset));
        }
        if self.opts.sync_writes {
            inner.active_file.sync()?;
        }
        inner.committed_txs.insert(self.tx_id);

        for (entry, (file_id, offset)) in self.pending.drain(..).zip(positions) {
            let bucket =
                String::from_utf8(entry.bucket.clone()).map_err(|_| CodecError::BucketName)?;
            let hint = Hint {
                key: entry.key.clone(),
                file_id,
                offset,
                meta: entry.meta.clone(),
            };
            let record = Record {
                hint,
                entry: Some(entry),
            };
            inner
                .indexes
                .apply(&bucket, record, self.opts.entry_idx_mode)?;
        }
        Ok(())
    }

    /// Discards all pending writes.
    pub(crate) fn rollback(&mut self) {
        self.pending.clear();
    }
}
