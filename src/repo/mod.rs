//! Key-value persistence port.
//!
//! The optimizer stores each field under its own key so a restart can rebuild
//! state without replaying history. Writing `Value::Null` removes a key.

mod file;
mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("store contents are not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),
}

pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Apply all entries as one write. `Value::Null` deletes the key.
    fn set_many(&self, entries: Vec<(String, Value)>) -> Result<(), StoreError>;

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.set_many(vec![(key.to_string(), value)])
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.set(key, Value::Null)
    }
}

pub(crate) fn apply_entries(
    map: &mut std::collections::BTreeMap<String, Value>,
    entries: Vec<(String, Value)>,
) {
    for (key, value) in entries {
        if value.is_null() {
            map.remove(&key);
        } else {
            map.insert(key, value);
        }
    }
}
