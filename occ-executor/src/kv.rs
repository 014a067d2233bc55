//! Key-value store interfaces and the in-memory canonical store.

use crate::types::{Key, Value};
use alloy_primitives::{keccak256, B256};
use std::collections::BTreeMap;
use std::ops::Bound;

/// Pending writes of one transaction. `None` deletes the key.
pub type WriteSet = BTreeMap<Key, Option<Value>>;

/// Ascending iterator over `(key, value)` pairs.
pub type KvIter<'a> = Box<dyn Iterator<Item = (Key, Value)> + 'a>;

/// Read-only view of committed state.
///
/// The multi-version store wraps a `KvStore` while a block executes, so
/// implementations must be safe to read from many workers at once.
pub trait KvStore: Sync {
    /// Returns the value stored under `key`.
    fn get(&self, key: &[u8]) -> Option<Value>;

    /// Iterates `[start, end)` in ascending key order. `None` is unbounded.
    fn iterator<'a>(&'a self, start: &[u8], end: Option<&[u8]>) -> KvIter<'a>;

    fn has(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }
}

/// Mutable store. Only the block pipeline writes to one, single-threaded.
pub trait KvStoreMut: KvStore {
    fn set(&mut self, key: &[u8], value: Value);

    fn delete(&mut self, key: &[u8]);
}

/// Merges a write set into `store`.
pub fn apply_write_set<S: KvStoreMut + ?Sized>(store: &mut S, write_set: &WriteSet) {
    for (key, value) in write_set {
        match value {
            Some(value) => store.set(key, value.clone()),
            None => store.delete(key),
        }
    }
}

/// Overlays `writes` in `[start, end)` onto sorted `entries`.
pub fn merge_writes(
    entries: impl IntoIterator<Item = (Key, Value)>,
    writes: &WriteSet,
    start: &[u8],
    end: Option<&[u8]>,
) -> Vec<(Key, Value)> {
    let mut merged: BTreeMap<Key, Value> = entries.into_iter().collect();
    for (key, value) in writes.range::<[u8], _>((Bound::Included(start), Bound::Unbounded)) {
        if !in_range(key, start, end) {
            break;
        }
        match value {
            Some(value) => merged.insert(key.clone(), value.clone()),
            None => merged.remove(key),
        };
    }
    merged.into_iter().collect()
}

/// Returns true when `key` falls in `[start, end)`.
pub fn in_range(key: &[u8], start: &[u8], end: Option<&[u8]>) -> bool {
    key >= start && end.map_or(true, |end| key < end)
}

/// Ordered in-memory store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemStore {
    data: BTreeMap<Key, Value>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Commitment over the whole store.
    ///
    /// Keccak-256 of every entry in key order, each key and value prefixed
    /// with its big-endian length. Two stores hash equal iff their contents
    /// are equal.
    pub fn root_hash(&self) -> B256 {
        let mut buf = Vec::with_capacity(self.data.len() * 64);
        for (key, value) in &self.data {
            buf.extend_from_slice(&(key.len() as u64).to_be_bytes());
            buf.extend_from_slice(key);
            buf.extend_from_slice(&(value.len() as u64).to_be_bytes());
            buf.extend_from_slice(value);
        }
        keccak256(&buf)
    }
}

impl KvStore for MemStore {
    fn get(&self, key: &[u8]) -> Option<Value> {
        self.data.get(key).cloned()
    }

    fn iterator<'a>(&'a self, start: &[u8], end: Option<&[u8]>) -> KvIter<'a> {
        if let Some(end) = end {
            // BTreeMap::range panics on inverted bounds.
            if end <= start {
                return Box::new(std::iter::empty());
            }
        }
        let upper = match end {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        Box::new(
            self.data
                .range::<[u8], _>((Bound::Included(start), upper))
                .map(|(k, v)| (k.clone(), v.clone())),
        )
    }
}

impl KvStoreMut for MemStore {
    fn set(&mut self, key: &[u8], value: Value) {
        self.data.insert(key.to_vec(), value);
    }

    fn delete(&mut self, key: &[u8]) {
        self.data.remove(key);
    }
}

/// Buffers writes on top of a read-only store.
///
/// The block pipeline runs a whole block against an overlay of the
/// canonical store and applies [`OverlayStore::into_writes`] only once the
/// block has succeeded.
#[derive(Debug)]
pub struct OverlayStore<'a, S: KvStore + ?Sized> {
    base: &'a S,
    writes: WriteSet,
}

impl<'a, S: KvStore + ?Sized> OverlayStore<'a, S> {
    pub fn new(base: &'a S) -> Self {
        Self {
            base,
            writes: WriteSet::new(),
        }
    }

    /// Number of keys written or deleted so far.
    pub fn pending(&self) -> usize {
        self.writes.len()
    }

    pub fn into_writes(self) -> WriteSet {
        self.writes
    }
}

impl<S: KvStore + ?Sized> KvStore for OverlayStore<'_, S> {
    fn get(&self, key: &[u8]) -> Option<Value> {
        match self.writes.get(key) {
            Some(value) => value.clone(),
            None => self.base.get(key),
        }
    }

    fn iterator<'b>(&'b self, start: &[u8], end: Option<&[u8]>) -> KvIter<'b> {
        let merged = merge_writes(self.base.iterator(start, end), &self.writes, start, end);
        Box::new(merged.into_iter())
    }
}

impl<S: KvStore + ?Sized> KvStoreMut for OverlayStore<'_, S> {
    fn set(&mut self, key: &[u8], value: Value) {
        self.writes.insert(key.to_vec(), Some(value));
    }

    fn delete(&mut self, key: &[u8]) {
        self.writes.insert(key.to_vec(), None);
    }
}
