//! The key/value contract for operator scratch state.
//!
//! Operators that need state beyond their own fields (Take's per-partition
//! windows) keep it behind this contract so hosts can persist it. The
//! engine itself does not persist anything.

use std::cell::RefCell;
use std::collections::BTreeMap;

pub trait Storage {
    fn get(&self, key: &str) -> Option<serde_json::Value>;
    fn set(&self, key: &str, value: serde_json::Value);
    fn del(&self, key: &str);
    /// All entries whose key starts with `prefix`, in key order.
    fn scan(&self, prefix: &str) -> Vec<(String, serde_json::Value)>;
}

/// The default in-memory storage.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RefCell<BTreeMap<String, serde_json::Value>>,
}

impl MemoryStorage {
    pub fn new() -> MemoryStorage {
        MemoryStorage::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.borrow().get(key).cloned()
    }

    fn set(&self, key: &str, value: serde_json::Value) {
        self.entries.borrow_mut().insert(key.to_string(), value);
    }

    fn del(&self, key: &str) {
        self.entries.borrow_mut().remove(key);
    }

    fn scan(&self, prefix: &str) -> Vec<(String, serde_json::Value)> {
        self.entries
            .borrow()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
