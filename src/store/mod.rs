//! Crash-consistent persistence for job records.
//!
//! The store is split in two layers:
//!
//! - [`Datastore`]: a key-ordered backend with atomic multi-key transactions,
//!   prefix scans, and point-in-time snapshots. [`MemDatastore`] keeps the map
//!   in memory; [`FileDatastore`] is backed by RocksDB and commits each
//!   transaction as one write batch.
//! - [`JobStore`]: typed job records plus a by-state index, kept consistent
//!   by writing both in one transaction.
//!
//! # Key layout
//!
//! ```text
//! /jobs/<job-id>                      -> JSON job record
//! /index/<state>/<seq:020>/<job-id>   -> empty (FIFO within a state)
//! /meta/next_seq                      -> next submission sequence
//! ```

pub mod file;
pub mod jobs;
pub mod mem;

use std::collections::BTreeMap;
use std::ops::Bound;

use thiserror::Error;

pub use file::FileDatastore;
pub use jobs::JobStore;
pub use mem::MemDatastore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Corrupt datastore: {0}")]
    Corrupt(String),

    #[error("Datastore lock poisoned")]
    Poisoned,

    #[error("Datastore unavailable: {0}")]
    Unavailable(String),

    #[error("Transaction aborted")]
    Aborted,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Key-ordered transactional storage.
pub trait Datastore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>>;

    /// Run `f` against a consistent view and commit its writes atomically.
    /// Nothing is written if `f` returns an error.
    fn update(&self, f: &mut dyn FnMut(&mut Txn<'_>) -> StoreResult<()>) -> StoreResult<()>;

    /// Independent point-in-time copy; later writes to either side are not
    /// visible to the other.
    fn snapshot(&self) -> StoreResult<MemDatastore>;
}

/// Committed state a transaction reads through.
pub(crate) trait ReadView {
    fn read(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;
    fn scan(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>>;
}

impl ReadView for BTreeMap<String, Vec<u8>> {
    fn read(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.get(key).cloned())
    }

    fn scan(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        Ok(scan_map(self, prefix).collect())
    }
}

/// Read-your-writes view over committed state plus pending writes.
pub struct Txn<'a> {
    base: &'a dyn ReadView,
    writes: BTreeMap<String, Option<Vec<u8>>>,
}

impl<'a> Txn<'a> {
    pub(crate) fn new(base: &'a dyn ReadView) -> Self {
        Self {
            base,
            writes: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        match self.writes.get(key) {
            Some(pending) => Ok(pending.clone()),
            None => self.base.read(key),
        }
    }

    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.writes.insert(key.into(), Some(value));
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.writes.insert(key.into(), None);
    }

    pub fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let mut merged: BTreeMap<String, Vec<u8>> = self.base.scan(prefix)?.into_iter().collect();
        for (key, pending) in self
            .writes
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            match pending {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    pub(crate) fn into_writes(self) -> BTreeMap<String, Option<Vec<u8>>> {
        self.writes
    }
}

pub(crate) fn scan_map<'m>(
    map: &'m BTreeMap<String, Vec<u8>>,
    prefix: &'m str,
) -> impl Iterator<Item = (String, Vec<u8>)> + 'm {
    map.range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
        .take_while(move |(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
}

pub(crate) fn apply_writes(
    map: &mut BTreeMap<String, Vec<u8>>,
    writes: BTreeMap<String, Option<Vec<u8>>>,
) {
    for (key, pending) in writes {
        match pending {
            Some(value) => {
                map.insert(key, value);
            }
            None => {
                map.remove(&key);
            }
        }
    }
}
