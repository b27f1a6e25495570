//! Unordered sets of byte values per key.

use std::collections::{HashMap, HashSet};

/// A map of key → set-of-values, mirroring the set records replayed from
/// the log: `sadd` and `srem` are both idempotent, so replaying a log
/// segment twice converges to the same membership.
#[derive(Debug, Clone, Default)]
pub struct Set {
    items: HashMap<Vec<u8>, HashSet<Vec<u8>>>,
}

impl Set {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `value` to the set at `key`. Returns `true` if it was absent.
    pub fn sadd(&mut self, key: &[u8], value: Vec<u8>) -> bool {
        self.items.entry(key.to_vec()).or_default().insert(value)
    }

    /// Removes `value` from the set at `key`. Returns `true` if present.
    /// An emptied set is dropped so membership checks see a clean miss.
    pub fn srem(&mut self, key: &[u8], value: &[u8]) -> bool {
        let Some(set) = self.items.get_mut(key) else {
            return false;
        };
        let removed = set.remove(value);
        if set.is_empty() {
            self.items.remove(key);
        }
        removed
    }

    pub fn sis_member(&self, key: &[u8], value: &[u8]) -> bool {
        self.items.get(key).is_some_and(|s| s.contains(value))
    }

    /// Members of the set at `key`, in no particular order.
    pub fn members(&self, key: &[u8]) -> impl Iterator<Item = &Vec<u8>> {
        self.items.get(key).into_iter().flatten()
    }

    pub fn has_key(&self, key: &[u8]) -> bool {
        self.items.contains_key(key)
    }

    /// Cardinality of the set at `key`; 0 when absent.
    pub fn scard(&self, key: &[u8]) -> usize {
        self.items.get(key).map_or(0, HashSet::len)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.items.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
