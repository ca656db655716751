// File-backed content store
//
// Keeps every entry in memory and rewrites a text file on each change.
// One entry per line: `<hex value> <key>`, after a commented header.
// Default location is ~/.cache/feedsync/store.lst

use super::{ContentStore, StoreError, StoreRead, StoreResult};
use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

pub struct FileContentStore {
    path: PathBuf,
    // In-memory copy of the file
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl FileContentStore {
    /// Format version
    const FORMAT_VERSION: &'static str = "v1";

    const HEADER_PREFIX: &'static str = "# feedsync store ";

    /// Open or create a store at `path`
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let entries = if path.exists() {
            Self::load_from_file(&path)?
        } else {
            HashMap::new()
        };
        debug!(path = %path.display(), entries = entries.len(), "Opened content store");

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_from_file(path: &Path) -> StoreResult<HashMap<String, Vec<u8>>> {
        let file = fs::File::open(path)?;
        let reader = BufReader::new(file);
        let mut entries = HashMap::new();

        for (number, line) in reader.lines().enumerate() {
            let line = line?;

            if let Some(version) = line.strip_prefix(Self::HEADER_PREFIX) {
                if version.trim() != Self::FORMAT_VERSION {
                    return Err(StoreError::Corrupt(format!(
                        "unsupported store version {}",
                        version.trim()
                    )));
                }
                continue;
            }
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }

            // Parse: <hex value> <key>
            let Some((value, key)) = line.split_once(' ') else {
                warn!(line = number + 1, "Skipping malformed store line");
                continue;
            };
            match hex::decode(value) {
                Ok(bytes) => {
                    entries.insert(key.to_string(), bytes);
                }
                Err(e) => {
                    warn!(line = number + 1, error = %e, "Skipping undecodable store value");
                }
            }
        }

        Ok(entries)
    }

    /// Rewrite the whole file (atomic rename)
    fn save_to_file(&self, entries: &HashMap<String, Vec<u8>>) -> StoreResult<()> {
        let temp_file = self.path.with_extension("tmp");

        {
            let mut file = fs::File::create(&temp_file)?;

            writeln!(file, "{}{}", Self::HEADER_PREFIX, Self::FORMAT_VERSION)?;
            writeln!(file, "# updated: {}", chrono::Utc::now().to_rfc3339())?;

            // Sorted for deterministic output
            let mut sorted: Vec<(&String, &Vec<u8>)> = entries.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));

            for (key, value) in sorted {
                writeln!(file, "{} {}", hex::encode(value), key)?;
            }
            file.sync_all()?;
        }

        fs::rename(&temp_file, &self.path)?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ContentStore for FileContentStore {
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
        if key.contains('\n') {
            return Err(StoreError::Serialization(format!(
                "key contains a newline: {:?}",
                key
            )));
        }
        let mut entries = self.lock();
        entries.insert(key.to_string(), value.to_vec());
        self.save_to_file(&entries)
    }

    fn remove(&self, keys: &[String]) -> StoreResult<usize> {
        let mut entries = self.lock();
        let removed = keys.iter().filter(|k| entries.remove(*k).is_some()).count();
        if removed > 0 {
            self.save_to_file(&entries)?;
        }
        Ok(removed)
    }

    fn put_all(&self, batch: &[(String, Vec<u8>)]) -> StoreResult<()> {
        let mut entries = self.lock();
        let mut failed = Vec::new();
        for (key, value) in batch {
            if key.contains('\n') {
                failed.push(key.clone());
                continue;
            }
            entries.insert(key.clone(), value.clone());
        }
        self.save_to_file(&entries)?;
        if failed.is_empty() {
            Ok(())
        } else {
            Err(StoreError::PartialFailure { failed })
        }
    }
}
