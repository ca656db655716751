//! In-memory content store, the default when no store path is configured.

use super::{ContentStore, StoreRead, StoreResult};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ContentStore for InMemoryStore {
    fn get(&self, keys: &[String]) -> StoreResult<StoreRead> {
        let entries = self.lock();
        let mut read = StoreRead::default();
        for key in keys {
            match entries.get(key) {
                Some(value) => {
                    read.found.insert(key.clone(), value.clone());
                }
                None => read.missing.push(key.clone()),
            }
        }
        Ok(read)
    }

    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, keys: &[String]) -> StoreResult<usize> {
        let mut entries = self.lock();
        Ok(keys.iter().filter(|k| entries.remove(*k).is_some()).count())
    }
}
