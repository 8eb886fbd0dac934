use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB};

use crate::store::{Datastore, MemDatastore, ReadView, StoreError, StoreResult, Txn};

/// On-disk datastore backed by RocksDB.
///
/// A transaction reads through to the database and buffers its writes; on
/// success they are committed as a single synced `WriteBatch`, so a crash
/// leaves either all of a transaction's keys or none of them. Commits are
/// serialized so a read-modify-write never interleaves with another.
pub struct FileDatastore {
    path: PathBuf,
    db: DB,
    commit: Mutex<()>,
}

impl FileDatastore {
    /// Open the database directory at `path`, creating it if missing.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        fs::create_dir_all(&path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, &path)?;
        tracing::debug!(path = %path.display(), "Opened datastore");

        Ok(Self {
            path,
            db,
            commit: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn decode_key(raw: Box<[u8]>) -> StoreResult<String> {
    String::from_utf8(raw.into_vec())
        .map_err(|e| StoreError::Corrupt(format!("non-UTF-8 key: {}", e)))
}

impl ReadView for FileDatastore {
    fn read(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.db.get(key.as_bytes())?)
    }

    fn scan(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let mut entries = Vec::new();
        let mode = IteratorMode::From(prefix.as_bytes(), Direction::Forward);
        for item in self.db.iterator(mode) {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            entries.push((decode_key(key)?, value.into_vec()));
        }
        Ok(entries)
    }
}

impl Datastore for FileDatastore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.read(key)
    }

    fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        self.scan(prefix)
    }

    fn update(&self, f: &mut dyn FnMut(&mut Txn<'_>) -> StoreResult<()>) -> StoreResult<()> {
        let _commit = self.commit.lock();
        let writes = {
            let mut txn = Txn::new(self);
            f(&mut txn)?;
            txn.into_writes()
        };
        if writes.is_empty() {
            return Ok(());
        }

        let mut batch = WriteBatch::default();
        for (key, pending) in writes {
            match pending {
                Some(value) => batch.put(key.as_bytes(), value),
                None => batch.delete(key.as_bytes()),
            }
        }
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        self.db.write_opt(batch, &opts)?;
        Ok(())
    }

    fn snapshot(&self) -> StoreResult<MemDatastore> {
        // The iterator reads from an implicit snapshot taken at creation.
        let mut map = BTreeMap::new();
        for item in self.db.iterator(IteratorMode::Start) {
            let (key, value) = item?;
            map.insert(decode_key(key)?, value.into_vec());
        }
        Ok(MemDatastore::from_map(map))
    }
}
