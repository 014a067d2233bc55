//! Transaction-scoped state access.
//!
//! Handlers never see the multi-version store directly. They get a
//! [`TxnState`]; the [`VersionedView`] implementation resolves reads through
//! the [`MVHashMap`], buffers writes locally and records the read-set that
//! validation later replays.

use crate::kv::{merge_writes, KvStore, WriteSet};
use crate::mvhashmap::{MVHashMap, ReadResult, ReadSet};
use crate::types::{Abort, Key, RangeRead, ReadOrigin, TxnIndex, Value, Version};
use std::collections::BTreeMap;

/// Snapshot of buffered writes, used to roll back a failed branch.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    writes: WriteSet,
}

impl Checkpoint {
    pub fn new(writes: WriteSet) -> Self {
        Self { writes }
    }

    pub fn into_writes(self) -> WriteSet {
        self.writes
    }
}

/// State interface handed to transaction handlers.
///
/// Reads return `Err(Abort)` when the value they depend on is still being
/// produced by a lower transaction. Handlers must stop and propagate it.
pub trait TxnState {
    fn get(&mut self, key: &[u8]) -> Result<Option<Value>, Abort>;

    fn set(&mut self, key: &[u8], value: Value);

    fn delete(&mut self, key: &[u8]);

    /// Entries in `[start, end)` in ascending key order, own writes included.
    fn iterate(&mut self, start: &[u8], end: Option<&[u8]>) -> Result<Vec<(Key, Value)>, Abort>;

    fn checkpoint(&self) -> Checkpoint;

    fn revert_to(&mut self, checkpoint: Checkpoint);

    fn has(&mut self, key: &[u8]) -> Result<bool, Abort> {
        Ok(self.get(key)?.is_some())
    }
}

/// Multi-version view of the state for one incarnation of one transaction.
pub struct VersionedView<'a, S: KvStore + ?Sized> {
    version: Version,
    mv: &'a MVHashMap,
    base: &'a S,
    reads: ReadSet,
    /// Value returned by the first read of each key.
    read_cache: BTreeMap<Key, Option<Value>>,
    ranges: Vec<RangeRead>,
    writes: WriteSet,
    abort: Option<Abort>,
}

impl<'a, S: KvStore + ?Sized> VersionedView<'a, S> {
    pub fn new(version: Version, mv: &'a MVHashMap, base: &'a S) -> Self {
        Self {
            version,
            mv,
            base,
            reads: ReadSet::new(),
            read_cache: BTreeMap::new(),
            ranges: Vec::new(),
            writes: WriteSet::new(),
            abort: None,
        }
    }

    pub fn txn_idx(&self) -> TxnIndex {
        self.version.txn_idx
    }

    /// First abort hit by this incarnation, if any.
    ///
    /// Sticky: a handler that swallowed the error still gets aborted.
    pub fn abort(&self) -> Option<Abort> {
        self.abort
    }

    pub fn into_sets(self) -> (ReadSet, Vec<RangeRead>, WriteSet) {
        (self.reads, self.ranges, self.writes)
    }

    fn fail(&mut self, blocking: TxnIndex) -> Abort {
        let abort = Abort::estimate(blocking);
        self.abort.get_or_insert(abort);
        abort
    }

    /// Resolves `key` below this transaction, recording the first origin.
    fn read_versioned(&mut self, key: &[u8]) -> Result<Option<Value>, Abort> {
        if let Some(cached) = self.read_cache.get(key) {
            return Ok(cached.clone());
        }

        let (origin, value) = match self.mv.read(key, self.version.txn_idx) {
            ReadResult::Versioned(version, value) => (ReadOrigin::Version(version), value),
            ReadResult::Storage => (ReadOrigin::Storage, self.base.get(key)),
            ReadResult::Dependency(blocking) => return Err(self.fail(blocking)),
        };
        self.reads.insert(key.to_vec(), origin);
        self.read_cache.insert(key.to_vec(), value.clone());
        Ok(value)
    }
}

impl<S: KvStore + ?Sized> TxnState for VersionedView<'_, S> {
    fn get(&mut self, key: &[u8]) -> Result<Option<Value>, Abort> {
        if let Some(abort) = self.abort {
            return Err(abort);
        }
        if let Some(value) = self.writes.get(key) {
            return Ok(value.clone());
        }
        self.read_versioned(key)
    }

    fn set(&mut self, key: &[u8], value: Value) {
        self.writes.insert(key.to_vec(), Some(value));
    }

    fn delete(&mut self, key: &[u8]) {
        self.writes.insert(key.to_vec(), None);
    }

    fn iterate(&mut self, start: &[u8], end: Option<&[u8]>) -> Result<Vec<(Key, Value)>, Abort> {
        if let Some(abort) = self.abort {
            return Err(abort);
        }

        let keys = self
            .mv
            .visible_keys(self.version.txn_idx, self.base, start, end)
            .map_err(|blocking| self.fail(blocking))?;

        let mut entries = Vec::with_capacity(keys.len());
        for key in &keys {
            // A concurrent lower write may have removed the key since the
            // scan; the range validation catches that, so just skip it.
            if let Some(value) = self.read_versioned(key)? {
                entries.push((key.clone(), value));
            }
        }

        self.ranges.push(RangeRead {
            start: start.to_vec(),
            end: end.map(<[u8]>::to_vec),
            keys,
        });
        Ok(merge_writes(entries, &self.writes, start, end))
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint::new(self.writes.clone())
    }

    fn revert_to(&mut self, checkpoint: Checkpoint) {
        self.writes = checkpoint.into_writes();
    }
}
