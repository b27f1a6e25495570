//! The per-structure in-memory indexes and their builders.
//!
//! Every committed log record passes through [`Indexes::apply`], both during
//! recovery and at commit time, so the two paths cannot drift apart. Dispatch
//! is on the record's data structure, then on its flag.

use std::collections::HashMap;

use logfile::{compose, DataStructure, Flag, Record, Status};
use structures::{KeyTree, List, Set, SortedSet};

use crate::error::{Error, Result};
use crate::options::EntryIdxMode;

/// All bucket-keyed index state, plus the sparse-mode cross-bucket tree.
#[derive(Debug, Default)]
pub(crate) struct Indexes {
    /// bucket → ordered map of key → latest record.
    pub tree: HashMap<String, KeyTree<Record>>,
    /// bucket → sets of values per key.
    pub set: HashMap<String, Set>,
    /// bucket → sorted set.
    pub sorted_set: HashMap<String, SortedSet>,
    /// bucket → deques per key.
    pub list: HashMap<String, List>,
    /// Sparse mode only: `bucket‖key` → record, spanning all buckets.
    pub active_tree: KeyTree<Record>,
    /// Operation count: every applied record, including deletes, expired
    /// records and overwrites.
    pub key_count: u64,
}

impl Indexes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one committed record to the index selected by its data
    /// structure. The record's status is normalized to committed so a
    /// rebuilt index is bit-identical to the live one.
    pub fn apply(&mut self, bucket: &str, mut record: Record, mode: EntryIdxMode) -> Result<()> {
        record.hint.meta.status = Status::Committed;
        if let Some(entry) = record.entry.as_mut() {
            entry.meta.status = Status::Committed;
        }

        match record.hint.meta.ds {
            DataStructure::Tree => self.build_tree(bucket, record, mode),
            DataStructure::Set => self.build_set(bucket, &record)?,
            DataStructure::SortedSet => self.build_sorted_set(bucket, &record)?,
            DataStructure::List => self.build_list(bucket, &record)?,
        }

        self.key_count += 1;
        Ok(())
    }

    /// Ordered-map builder: an unconditional upsert. A delete record stays
    /// in the tree as a tombstone; reads honor the flag.
    fn build_tree(&mut self, bucket: &str, record: Record, mode: EntryIdxMode) {
        let record = if mode == EntryIdxMode::KeyValRam {
            record
        } else {
            Record {
                hint: record.hint,
                entry: None,
            }
        };

        if mode == EntryIdxMode::BptSparse {
            let composite = compose::composite_key(bucket.as_bytes(), &record.hint.key);
            self.active_tree.insert(composite, record);
        } else {
            let key = record.hint.key.clone();
            self.tree
                .entry(bucket.to_string())
                .or_default()
                .insert(key, record);
        }
    }

    fn build_set(&mut self, bucket: &str, record: &Record) -> Result<()> {
        let entry = resident(record)?;
        let set = self.set.entry(bucket.to_string()).or_default();
        match record.hint.meta.flag {
            Flag::Set => {
                set.sadd(&entry.key, entry.value.clone());
            }
            Flag::Delete => {
                set.srem(&entry.key, &entry.value);
            }
            _ => {}
        }
        Ok(())
    }

    fn build_sorted_set(&mut self, bucket: &str, record: &Record) -> Result<()> {
        let entry = resident(record)?;
        let zset = self.sorted_set.entry(bucket.to_string()).or_default();
        match record.hint.meta.flag {
            Flag::ZAdd => {
                let (key, score) = compose::decode_zset_key(&entry.key)?;
                zset.put(&key, score, entry.value.clone());
            }
            Flag::ZRem => {
                zset.remove(&entry.key);
            }
            Flag::ZRemRangeByRank => {
                let start = compose::parse_i64(&entry.key)?;
                let end = compose::parse_i64(&entry.value)?;
                zset.remove_range_by_rank(start, end);
            }
            Flag::ZPopMax => {
                zset.pop_max();
            }
            Flag::ZPopMin => {
                zset.pop_min();
            }
            _ => {}
        }
        Ok(())
    }

    fn build_list(&mut self, bucket: &str, record: &Record) -> Result<()> {
        let entry = resident(record)?;
        let list = self.list.entry(bucket.to_string()).or_default();
        match record.hint.meta.flag {
            Flag::LPush => {
                list.lpush(&entry.key, entry.value.clone());
            }
            Flag::RPush => {
                list.rpush(&entry.key, entry.value.clone());
            }
            // Structural no-ops (a pop or trim whose target was compacted
            // away) are tolerated: merge rewrites sealed segments only, so
            // a destructive record in the active segment can legitimately
            // replay against a list that no longer exists.
            Flag::LPop => {
                list.lpop(&entry.key);
            }
            Flag::RPop => {
                list.rpop(&entry.key);
            }
            Flag::LRem => {
                let count = compose::parse_i64(&entry.value)?;
                list.lrem(&entry.key, count);
            }
            Flag::LSet => {
                let (key, index) = compose::decode_list_key(&entry.key)?;
                let _ = list.lset(&key, index, entry.value.clone());
            }
            Flag::LTrim => {
                let (key, start) = compose::decode_list_key(&entry.key)?;
                let end = compose::parse_i64(&entry.value)?;
                let _ = list.ltrim(&key, start, end);
            }
            _ => {}
        }
        Ok(())
    }
}

/// Structural builders reconstruct membership from values, so the entry
/// must be resident; a pointer-only record means the log was written under
/// a mode this one cannot replay.
fn resident(record: &Record) -> Result<&logfile::Entry> {
    record
        .entry
        .as_ref()
        .ok_or(Error::IndexMode("record requires a resident entry"))
}
