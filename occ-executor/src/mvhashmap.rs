//! Multi-version hashmap for storing versioned values.
//!
//! This is the core data structure that enables parallel execution with
//! optimistic concurrency control. For each key it stores one entry per
//! writing transaction, so a reader at index `i` resolves the write of the
//! highest transaction below `i` without touching the canonical store.
//!
//! The per-key histories live in a sharded [`DashMap`], so writers on
//! different keys never contend on a single lock.

use crate::kv::{in_range, KvStore, WriteSet};
use crate::types::{Incarnation, Key, RangeRead, ReadOrigin, TxnIndex, Value, Version};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Entry in the version history for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionedEntry {
    /// Value written by an incarnation. `None` is a deletion.
    Write {
        incarnation: Incarnation,
        value: Option<Value>,
    },
    /// The owner is being re-executed and will probably write this key again.
    Estimate,
}

/// Result of reading from the MVHashMap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    /// Value found at a specific version.
    Versioned(Version, Option<Value>),
    /// No version found, should read from base storage.
    Storage,
    /// The closest lower write is an estimate owned by this transaction.
    Dependency(TxnIndex),
}

/// Read-set of one incarnation: first origin observed per key.
pub type ReadSet = BTreeMap<Key, ReadOrigin>;

/// Everything an incarnation recorded for later validation.
#[derive(Debug, Default)]
struct TxnRecord {
    reads: ReadSet,
    ranges: Vec<RangeRead>,
    writes: WriteSet,
}

/// Multi-version hashmap storing versioned values.
///
/// Structure: Key -> BTreeMap<TxnIndex -> VersionedEntry>
///
/// The BTreeMap is keyed by TxnIndex for efficient range queries to find
/// the latest version written by a transaction with index < current_txn_idx.
pub struct MVHashMap {
    /// Map from key to version history.
    data: DashMap<Key, BTreeMap<TxnIndex, VersionedEntry>>,
    /// Every key that has ever had an entry this block, for range scans.
    key_index: RwLock<BTreeSet<Key>>,
    /// Last recorded read/write sets, indexed by transaction.
    records: Vec<Mutex<Arc<TxnRecord>>>,
}

impl MVHashMap {
    /// Creates an empty multi-version hashmap for a block of `num_txns`.
    pub fn new(num_txns: usize) -> Self {
        Self {
            data: DashMap::new(),
            key_index: RwLock::new(BTreeSet::new()),
            records: (0..num_txns)
                .map(|_| Mutex::new(Arc::new(TxnRecord::default())))
                .collect(),
        }
    }

    pub fn num_txns(&self) -> usize {
        self.records.len()
    }

    /// Reads the latest version of `key` visible to `reader_txn_idx`.
    ///
    /// Only transactions strictly below the reader are considered:
    /// - `ReadResult::Versioned` if a lower transaction wrote a value
    /// - `ReadResult::Dependency` if the closest lower entry is an estimate
    /// - `ReadResult::Storage` if no lower transaction touched the key
    pub fn read(&self, key: &[u8], reader_txn_idx: TxnIndex) -> ReadResult {
        let Some(versions) = self.data.get(key) else {
            return ReadResult::Storage;
        };

        match versions.range(..reader_txn_idx).next_back() {
            Some((&idx, VersionedEntry::Write { incarnation, value })) => {
                ReadResult::Versioned(Version::new(idx, *incarnation), value.clone())
            }
            Some((&idx, VersionedEntry::Estimate)) => ReadResult::Dependency(idx),
            None => ReadResult::Storage,
        }
    }

    /// Writes a single versioned value.
    ///
    /// Returns true if `key` was not previously written by `txn_idx`. A new
    /// location means readers above `txn_idx` may have resolved an older
    /// version and must be re-validated.
    pub fn write(
        &self,
        key: &[u8],
        txn_idx: TxnIndex,
        incarnation: Incarnation,
        value: Option<Value>,
    ) -> bool {
        self.insert_entry(key, txn_idx, VersionedEntry::Write { incarnation, value })
    }

    /// Marks `key` as about to be written by `txn_idx`.
    pub fn write_estimate(&self, key: &[u8], txn_idx: TxnIndex) {
        self.insert_entry(key, txn_idx, VersionedEntry::Estimate);
    }

    /// Removes the entry (value or estimate) of `txn_idx` for `key`.
    pub fn remove(&self, key: &[u8], txn_idx: TxnIndex) {
        if let Some(mut versions) = self.data.get_mut(key) {
            versions.remove(&txn_idx);
        }
    }

    fn insert_entry(&self, key: &[u8], txn_idx: TxnIndex, entry: VersionedEntry) -> bool {
        // Index first: a range scan must never miss a key that already has
        // versions.
        if !self.data.contains_key(key) {
            self.key_index.write().insert(key.to_vec());
        }
        let previous = self.data.entry(key.to_vec()).or_default().insert(txn_idx, entry);
        previous.is_none()
    }

    /// Prefills estimate markers for keys a transaction declared it will write.
    ///
    /// Must run before the transaction's first execution. The keys become its
    /// recorded locations, so an execution that ends up not writing them
    /// clears the markers on record.
    pub fn prefill_estimates(&self, txn_idx: TxnIndex, keys: &[Key]) {
        let mut writes = WriteSet::new();
        for key in keys {
            self.write_estimate(key, txn_idx);
            writes.insert(key.clone(), None);
        }
        *self.records[txn_idx].lock() = Arc::new(TxnRecord {
            writes,
            ..TxnRecord::default()
        });
    }

    /// Records the outcome of an incarnation.
    ///
    /// Replaces every entry of the previous incarnation: keys in `writes` are
    /// (re)written, keys the previous incarnation wrote but this one did not
    /// are removed. Returns true if a key outside the previous write set was
    /// written.
    pub fn record(
        &self,
        version: Version,
        reads: ReadSet,
        ranges: Vec<RangeRead>,
        writes: WriteSet,
    ) -> bool {
        let Version { txn_idx, incarnation } = version;
        let previous = self.records[txn_idx].lock().clone();

        let mut wrote_new_location = false;
        for (key, value) in &writes {
            self.write(key, txn_idx, incarnation, value.clone());
            if !previous.writes.contains_key(key) {
                wrote_new_location = true;
            }
        }
        for key in previous.writes.keys() {
            if !writes.contains_key(key) {
                self.remove(key, txn_idx);
            }
        }

        *self.records[txn_idx].lock() = Arc::new(TxnRecord {
            reads,
            ranges,
            writes,
        });
        wrote_new_location
    }

    /// Replaces every entry of `txn_idx` with an estimate marker.
    pub fn convert_writes_to_estimates(&self, txn_idx: TxnIndex) {
        let record = self.records[txn_idx].lock().clone();
        for key in record.writes.keys() {
            if let Some(mut versions) = self.data.get_mut(key.as_slice()) {
                versions.insert(txn_idx, VersionedEntry::Estimate);
            }
        }
    }

    /// Checks that every read of the last recorded incarnation still
    /// resolves to the same origin, and that every range scan still sees the
    /// same keys.
    pub fn validate_read_set<S: KvStore + ?Sized>(&self, txn_idx: TxnIndex, base: &S) -> bool {
        let record = self.records[txn_idx].lock().clone();

        for (key, origin) in &record.reads {
            let still_valid = match (self.read(key, txn_idx), origin) {
                (ReadResult::Versioned(current, _), ReadOrigin::Version(read)) => current == *read,
                (ReadResult::Storage, ReadOrigin::Storage) => true,
                _ => false,
            };
            if !still_valid {
                return false;
            }
        }

        record.ranges.iter().all(|range| {
            matches!(
                self.visible_keys(txn_idx, base, &range.start, range.end.as_deref()),
                Ok(keys) if keys == range.keys
            )
        })
    }

    /// Keys in `[start, end)` that exist for `txn_idx`, taking both the base
    /// store and lower transactions into account. Fails with the blocking
    /// index if an estimate is in the way.
    pub fn visible_keys<S: KvStore + ?Sized>(
        &self,
        txn_idx: TxnIndex,
        base: &S,
        start: &[u8],
        end: Option<&[u8]>,
    ) -> Result<Vec<Key>, TxnIndex> {
        let versioned = self.keys_in_range(start, end);

        let mut visible = BTreeSet::new();
        for (key, _) in base.iterator(start, end) {
            if versioned.binary_search(&key).is_err() {
                visible.insert(key);
            }
        }

        for key in versioned {
            match self.read(&key, txn_idx) {
                ReadResult::Versioned(_, Some(_)) => {
                    visible.insert(key);
                }
                ReadResult::Versioned(_, None) => {}
                ReadResult::Storage => {
                    if base.has(&key) {
                        visible.insert(key);
                    }
                }
                ReadResult::Dependency(blocking) => return Err(blocking),
            }
        }
        Ok(visible.into_iter().collect())
    }

    /// Keys with a version history in `[start, end)`, ascending.
    pub fn keys_in_range(&self, start: &[u8], end: Option<&[u8]>) -> Vec<Key> {
        self.key_index
            .read()
            .range(start.to_vec()..)
            .take_while(|key| in_range(key, start, end))
            .cloned()
            .collect()
    }

    /// Last recorded write set of `txn_idx`.
    pub fn write_set(&self, txn_idx: TxnIndex) -> WriteSet {
        self.records[txn_idx].lock().writes.clone()
    }

    /// Number of keys with at least one version.
    pub fn num_keys(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvStoreMut, MemStore};

    fn reads(entries: &[(&[u8], ReadOrigin)]) -> ReadSet {
        entries.iter().map(|(k, o)| (k.to_vec(), *o)).collect()
    }

    fn writes(entries: &[(&[u8], Option<&[u8]>)]) -> WriteSet {
        entries
            .iter()
            .map(|(k, v)| (k.to_vec(), v.map(|v| v.to_vec())))
            .collect()
    }

    #[test]
    fn test_read_write() {
        let mv = MVHashMap::new(4);
        let key = b"balance";

        // Read from empty map
        assert_eq!(mv.read(key, 1), ReadResult::Storage);

        // Write from transaction 0
        mv.write(key, 0, 0, Some(vec![100]));

        // Transaction 1 should see transaction 0's write
        assert_eq!(
            mv.read(key, 1),
            ReadResult::Versioned(Version::new(0, 0), Some(vec![100]))
        );
    }

    #[test]
    fn test_never_reads_equal_or_later_writes() {
        let mv = MVHashMap::new(8);
        mv.write(b"k", 5, 0, Some(vec![5]));
        mv.write(b"k", 3, 1, Some(vec![3]));

        assert_eq!(mv.read(b"k", 3), ReadResult::Storage);
        assert_eq!(mv.read(b"k", 2), ReadResult::Storage);
        assert_eq!(
            mv.read(b"k", 5),
            ReadResult::Versioned(Version::new(3, 1), Some(vec![3]))
        );
        assert_eq!(
            mv.read(b"k", 7),
            ReadResult::Versioned(Version::new(5, 0), Some(vec![5]))
        );
    }

    #[test]
    fn test_estimate_blocks_readers() {
        let mv = MVHashMap::new(8);
        mv.write(b"k", 1, 0, Some(vec![1]));
        mv.write_estimate(b"k", 4);

        // The estimate shadows transaction 1's value for readers above 4.
        assert_eq!(mv.read(b"k", 6), ReadResult::Dependency(4));
        assert_eq!(
            mv.read(b"k", 4),
            ReadResult::Versioned(Version::new(1, 0), Some(vec![1]))
        );

        mv.remove(b"k", 4);
        assert_eq!(
            mv.read(b"k", 6),
            ReadResult::Versioned(Version::new(1, 0), Some(vec![1]))
        );
    }

    #[test]
    fn test_record_replaces_previous_incarnation() {
        let mv = MVHashMap::new(4);

        let new = mv.record(
            Version::new(1, 0),
            ReadSet::new(),
            vec![],
            writes(&[(b"a", Some(b"1")), (b"b", Some(b"2"))]),
        );
        assert!(new);

        // Same locations again: nothing new.
        let new = mv.record(
            Version::new(1, 1),
            ReadSet::new(),
            vec![],
            writes(&[(b"a", Some(b"3"))]),
        );
        assert!(!new);
        assert_eq!(
            mv.read(b"a", 2),
            ReadResult::Versioned(Version::new(1, 1), Some(b"3".to_vec()))
        );
        // "b" was dropped by incarnation 1.
        assert_eq!(mv.read(b"b", 2), ReadResult::Storage);

        let new = mv.record(
            Version::new(1, 2),
            ReadSet::new(),
            vec![],
            writes(&[(b"a", Some(b"3")), (b"c", None)]),
        );
        assert!(new);
        assert_eq!(mv.write_set(1).len(), 2);
    }

    #[test]
    fn test_convert_writes_to_estimates() {
        let mv = MVHashMap::new(4);
        mv.record(
            Version::new(0, 0),
            ReadSet::new(),
            vec![],
            writes(&[(b"x", Some(b"1")), (b"y", None)]),
        );

        mv.convert_writes_to_estimates(0);
        assert_eq!(mv.read(b"x", 3), ReadResult::Dependency(0));
        assert_eq!(mv.read(b"y", 1), ReadResult::Dependency(0));
    }

    #[test]
    fn test_prefilled_estimates_cleared_on_record() {
        let mv = MVHashMap::new(4);
        mv.prefill_estimates(1, &[b"x".to_vec(), b"y".to_vec()]);
        assert_eq!(mv.read(b"y", 2), ReadResult::Dependency(1));

        let new = mv.record(
            Version::new(1, 0),
            ReadSet::new(),
            vec![],
            writes(&[(b"x", Some(b"1"))]),
        );
        assert!(!new);
        assert_eq!(mv.read(b"y", 2), ReadResult::Storage);
    }

    #[test]
    fn test_validate_read_set() {
        let base = MemStore::new();
        let mv = MVHashMap::new(4);

        mv.record(
            Version::new(0, 0),
            ReadSet::new(),
            vec![],
            writes(&[(b"a", Some(b"1"))]),
        );
        mv.record(
            Version::new(2, 0),
            reads(&[
                (b"a", ReadOrigin::Version(Version::new(0, 0))),
                (b"b", ReadOrigin::Storage),
            ]),
            vec![],
            WriteSet::new(),
        );
        assert!(mv.validate_read_set(2, &base));

        // Transaction 1 now writes "b": the storage read of 2 is stale.
        mv.record(
            Version::new(1, 0),
            ReadSet::new(),
            vec![],
            writes(&[(b"b", Some(b"2"))]),
        );
        assert!(!mv.validate_read_set(2, &base));
    }

    #[test]
    fn test_validate_fails_on_superseded_version_and_estimate() {
        let base = MemStore::new();
        let mv = MVHashMap::new(3);

        mv.record(
            Version::new(0, 0),
            ReadSet::new(),
            vec![],
            writes(&[(b"a", Some(b"1"))]),
        );
        mv.record(
            Version::new(1, 0),
            reads(&[(b"a", ReadOrigin::Version(Version::new(0, 0)))]),
            vec![],
            WriteSet::new(),
        );
        assert!(mv.validate_read_set(1, &base));

        mv.convert_writes_to_estimates(0);
        assert!(!mv.validate_read_set(1, &base));

        mv.record(
            Version::new(0, 1),
            ReadSet::new(),
            vec![],
            writes(&[(b"a", Some(b"1"))]),
        );
        // Same value but a different incarnation still invalidates.
        assert!(!mv.validate_read_set(1, &base));
    }

    #[test]
    fn test_visible_keys_and_range_validation() {
        let mut base = MemStore::new();
        base.set(b"p/1", vec![1]);
        base.set(b"p/3", vec![3]);
        base.set(b"q/1", vec![9]);

        let mv = MVHashMap::new(4);
        mv.write(b"p/2", 0, 0, Some(vec![2]));
        mv.write(b"p/3", 1, 0, None);

        let keys = mv.visible_keys(2, &base, b"p/", Some(b"p0")).unwrap();
        assert_eq!(keys, vec![b"p/1".to_vec(), b"p/2".to_vec()]);

        // Transaction 1 does not see its own deletion.
        let keys = mv.visible_keys(1, &base, b"p/", Some(b"p0")).unwrap();
        assert_eq!(keys, vec![b"p/1".to_vec(), b"p/2".to_vec(), b"p/3".to_vec()]);

        mv.record(
            Version::new(3, 0),
            ReadSet::new(),
            vec![RangeRead {
                start: b"p/".to_vec(),
                end: Some(b"p0".to_vec()),
                keys: vec![b"p/1".to_vec(), b"p/2".to_vec()],
            }],
            WriteSet::new(),
        );
        assert!(mv.validate_read_set(3, &base));

        // A new key in the scanned range invalidates the scan.
        mv.write(b"p/4", 2, 0, Some(vec![4]));
        assert!(!mv.validate_read_set(3, &base));

        mv.write_estimate(b"p/5", 2);
        assert_eq!(mv.visible_keys(3, &base, b"p/", None), Err(2));
    }
}
