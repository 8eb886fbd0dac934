use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::store::{apply_writes, scan_map, Datastore, StoreError, StoreResult, Txn};

/// In-memory transactional map. Transactions serialize on a single write
/// lock, so readers see each commit entirely or not at all.
#[derive(Debug, Default)]
pub struct MemDatastore {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: BTreeMap<String, Vec<u8>>) -> Self {
        Self {
            data: RwLock::new(map),
        }
    }

    pub fn len(&self) -> StoreResult<usize> {
        Ok(self.data.read().map_err(|_| StoreError::Poisoned)?.len())
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    pub(crate) fn to_map(&self) -> StoreResult<BTreeMap<String, Vec<u8>>> {
        Ok(self.data.read().map_err(|_| StoreError::Poisoned)?.clone())
    }
}

impl Datastore for MemDatastore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let data = self.data.read().map_err(|_| StoreError::Poisoned)?;
        Ok(data.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let data = self.data.read().map_err(|_| StoreError::Poisoned)?;
        Ok(scan_map(&data, prefix).collect())
    }

    fn update(&self, f: &mut dyn FnMut(&mut Txn<'_>) -> StoreResult<()>) -> StoreResult<()> {
        let mut guard = self.data.write().map_err(|_| StoreError::Poisoned)?;
        let writes = {
            let mut txn = Txn::new(&*guard);
            f(&mut txn)?;
            txn.into_writes()
        };
        apply_writes(&mut guard, writes);
        Ok(())
    }

    fn snapshot(&self) -> StoreResult<MemDatastore> {
        Ok(MemDatastore::from_map(self.to_map()?))
    }
}
