//! An ordered map over byte keys.

use std::collections::BTreeMap;
use std::ops::Bound;

/// Sorted key → value map with range and prefix queries.
///
/// `insert` is an upsert: later writes for the same key supersede earlier
/// ones, which is exactly the semantics index rebuilding relies on when it
/// replays a mutation log in order. Backed by a `BTreeMap`, so iteration is
/// always in ascending key order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTree<V> {
    map: BTreeMap<Vec<u8>, V>,
}

impl<V> KeyTree<V> {
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// Upserts `value` at `key`, returning the previous value if any.
    pub fn insert(&mut self, key: Vec<u8>, value: V) -> Option<V> {
        self.map.insert(key, value)
    }

    pub fn get(&self, key: &[u8]) -> Option<&V> {
        self.map.get(key)
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<V> {
        self.map.remove(key)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.map.contains_key(key)
    }

    /// Entries with `start <= key <= end`, ascending.
    pub fn range<'a>(
        &'a self,
        start: &[u8],
        end: &[u8],
    ) -> impl Iterator<Item = (&'a Vec<u8>, &'a V)> {
        self.map.range::<Vec<u8>, _>((
            Bound::Included(start.to_vec()),
            Bound::Included(end.to_vec()),
        ))
    }

    /// Entries whose key starts with `prefix`, ascending.
    pub fn prefix<'a>(&'a self, prefix: &'a [u8]) -> impl Iterator<Item = (&'a Vec<u8>, &'a V)> {
        self.map
            .range::<Vec<u8>, _>((Bound::Included(prefix.to_vec()), Bound::Unbounded))
            .take_while(move |(k, _)| k.starts_with(prefix))
    }

    /// All entries in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &V)> {
        self.map.iter()
    }

    pub fn first_key(&self) -> Option<&Vec<u8>> {
        self.map.keys().next()
    }

    pub fn last_key(&self) -> Option<&Vec<u8>> {
        self.map.keys().next_back()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

impl<V> Default for KeyTree<V> {
    fn default() -> Self {
        Self::new()
    }
}
