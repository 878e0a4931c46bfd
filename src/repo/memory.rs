use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;

use super::{apply_entries, StateStore, StoreError};

/// Volatile store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.map.lock().keys().cloned().collect()
    }
}

impl StateStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.map.lock().get(key).cloned())
    }

    fn set_many(&self, entries: Vec<(String, Value)>) -> Result<(), StoreError> {
        apply_entries(&mut self.map.lock(), entries);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_get_remove() {
        let store = MemoryStore::new();
        store.set("phase", json!("peak_hold")).unwrap();
        assert_eq!(store.get("phase").unwrap(), Some(json!("peak_hold")));

        store.remove("phase").unwrap();
        assert_eq!(store.get("phase").unwrap(), None);
        assert!(store.keys().is_empty());
    }
}
