use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{apply_entries, StateStore, StoreError};

/// Single JSON document on disk, rewritten atomically (temp file + rename)
/// whenever a write actually changes its contents.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    map: Mutex<BTreeMap<String, Value>>,
}

impl JsonFileStore {
    /// Open the store, starting empty when the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let map = if path.exists() {
            let contents = fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
            if contents.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&contents)?
            }
        } else {
            info!(path = %path.display(), "state file not found, starting empty");
            BTreeMap::new()
        };
        Ok(Self {
            path,
            map: Mutex::new(map),
        })
    }

    fn flush(&self, map: &BTreeMap<String, Value>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
        }
        let json = serde_json::to_string_pretty(map)?;
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, json).map_err(|e| io_err(&temp_path, e))?;
        fs::rename(&temp_path, &self.path).map_err(|e| io_err(&self.path, e))?;
        debug!(path = %self.path.display(), keys = map.len(), "state file written");
        Ok(())
    }
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

impl StateStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.map.lock().get(key).cloned())
    }

    fn set_many(&self, entries: Vec<(String, Value)>) -> Result<(), StoreError> {
        let mut map = self.map.lock();
        let mut next = map.clone();
        apply_entries(&mut next, entries);
        // Most ticks persist the same values again.
        if next == *map {
            return Ok(());
        }
        self.flush(&next)?;
        *map = next;
        Ok(())
    }
}
