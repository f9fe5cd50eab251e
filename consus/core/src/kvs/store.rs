// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

//! The datastore contract a key-value store node builds on: a sorted map
//! keyed by `(table, key, timestamp descending)` with point-in-time reads and
//! tombstones, plus a lock column recording the durable holder of each
//! per-key lock.
//!
//! The in-memory implementation backs tests and local clusters; a persistent
//! engine implements the same trait.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::ReturnCode;
use crate::types::TransactionGroup;

/// Result of a point-in-time read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreGet {
    /// The latest version at or below the requested timestamp.
    Value { timestamp: u64, value: Bytes },
    /// The latest version is a deletion.
    Tombstone { timestamp: u64 },
    /// No version at or below the requested timestamp.
    Missing,
    UnknownTable,
}

pub trait Datastore: Send + Sync + 'static {
    fn create_table(&self, table: &[u8]);

    fn put(&self, table: &[u8], key: &[u8], timestamp: u64, value: Bytes) -> ReturnCode;

    /// Writes a tombstone at `timestamp`.
    fn del(&self, table: &[u8], key: &[u8], timestamp: u64) -> ReturnCode;

    /// Latest version with timestamp at or below `timestamp`.
    fn get(&self, table: &[u8], key: &[u8], timestamp: u64) -> StoreGet;

    /// Durably records `holder` as the lock owner of `(table, key)`, or
    /// clears the record when `holder` is the null transaction group.
    fn write_lock(&self, table: &[u8], key: &[u8], holder: TransactionGroup) -> ReturnCode;

    /// The persisted lock holder, if any.
    fn read_lock(&self, table: &[u8], key: &[u8]) -> Option<TransactionGroup>;
}

type VersionKey = (Vec<u8>, Vec<u8>, Reverse<u64>);

#[derive(Default)]
struct MemStoreInner {
    tables: BTreeSet<Vec<u8>>,
    // None marks a tombstone.
    data: BTreeMap<VersionKey, Option<Bytes>>,
    locks: BTreeMap<(Vec<u8>, Vec<u8>), TransactionGroup>,
}

/// Heap-backed datastore.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemStoreInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tables<T: AsRef<[u8]>>(tables: impl IntoIterator<Item = T>) -> Self {
        let store = Self::new();
        for table in tables {
            store.create_table(table.as_ref());
        }
        store
    }
}

impl Datastore for MemStore {
    fn create_table(&self, table: &[u8]) {
        self.inner.lock().tables.insert(table.to_vec());
    }

    fn put(&self, table: &[u8], key: &[u8], timestamp: u64, value: Bytes) -> ReturnCode {
        let mut inner = self.inner.lock();
        if !inner.tables.contains(table) {
            return ReturnCode::UnknownTable;
        }
        inner
            .data
            .insert((table.to_vec(), key.to_vec(), Reverse(timestamp)), Some(value));
        ReturnCode::Success
    }

    fn del(&self, table: &[u8], key: &[u8], timestamp: u64) -> ReturnCode {
        let mut inner = self.inner.lock();
        if !inner.tables.contains(table) {
            return ReturnCode::UnknownTable;
        }
        inner
            .data
            .insert((table.to_vec(), key.to_vec(), Reverse(timestamp)), None);
        ReturnCode::Success
    }

    fn get(&self, table: &[u8], key: &[u8], timestamp: u64) -> StoreGet {
        let inner = self.inner.lock();
        if !inner.tables.contains(table) {
            return StoreGet::UnknownTable;
        }
        let lower: VersionKey = (table.to_vec(), key.to_vec(), Reverse(timestamp));
        let upper: VersionKey = (table.to_vec(), key.to_vec(), Reverse(0));
        match inner.data.range(lower..=upper).next() {
            Some(((_, _, Reverse(version)), Some(value))) => StoreGet::Value {
                timestamp: *version,
                value: value.clone(),
            },
            Some(((_, _, Reverse(version)), None)) => StoreGet::Tombstone {
                timestamp: *version,
            },
            None => StoreGet::Missing,
        }
    }

    fn write_lock(&self, table: &[u8], key: &[u8], holder: TransactionGroup) -> ReturnCode {
        let mut inner = self.inner.lock();
        let lock_key = (table.to_vec(), key.to_vec());
        if holder == TransactionGroup::default() {
            inner.locks.remove(&lock_key);
        } else {
            inner.locks.insert(lock_key, holder);
        }
        ReturnCode::Success
    }

    fn read_lock(&self, table: &[u8], key: &[u8]) -> Option<TransactionGroup> {
        self.inner
            .lock()
            .locks
            .get(&(table.to_vec(), key.to_vec()))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionId;
    use consus_config::PaxosGroupId;

    #[test]
    fn point_in_time_reads() {
        let store = MemStore::with_tables([b"t"]);
        assert_eq!(store.put(b"t", b"k", 10, Bytes::from_static(b"v10")), ReturnCode::Success);
        assert_eq!(store.put(b"t", b"k", 20, Bytes::from_static(b"v20")), ReturnCode::Success);

        assert_eq!(store.get(b"t", b"k", 5), StoreGet::Missing);
        assert_eq!(
            store.get(b"t", b"k", 15),
            StoreGet::Value {
                timestamp: 10,
                value: Bytes::from_static(b"v10")
            }
        );
        assert_eq!(
            store.get(b"t", b"k", u64::MAX),
            StoreGet::Value {
                timestamp: 20,
                value: Bytes::from_static(b"v20")
            }
        );
    }

    #[test]
    fn tombstones_shadow_older_versions() {
        let store = MemStore::with_tables([b"t"]);
        store.put(b"t", b"k", 10, Bytes::from_static(b"v"));
        store.del(b"t", b"k", 30);
        assert_eq!(store.get(b"t", b"k", u64::MAX), StoreGet::Tombstone { timestamp: 30 });
        assert_eq!(
            store.get(b"t", b"k", 10),
            StoreGet::Value {
                timestamp: 10,
                value: Bytes::from_static(b"v")
            }
        );
    }

    #[test]
    fn unknown_tables_are_rejected() {
        let store = MemStore::new();
        assert_eq!(store.put(b"t", b"k", 1, Bytes::new()), ReturnCode::UnknownTable);
        assert_eq!(store.get(b"t", b"k", 1), StoreGet::UnknownTable);
    }

    #[test]
    fn lock_column_round_trips() {
        let store = MemStore::with_tables([b"t"]);
        let tg = TransactionGroup::home(TransactionId::new(PaxosGroupId::new(1), 2, 3));
        assert_eq!(store.read_lock(b"t", b"k"), None);
        store.write_lock(b"t", b"k", tg);
        assert_eq!(store.read_lock(b"t", b"k"), Some(tg));
        store.write_lock(b"t", b"k", TransactionGroup::default());
        assert_eq!(store.read_lock(b"t", b"k"), None);
    }
}
