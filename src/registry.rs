//! Deduplicated map of known endpoints.

use crate::error::{PoolError, Result};
use crate::proxy::ProxyEntry;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Every endpoint the pool currently knows about, at most once each.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Mutex<HashMap<String, Arc<ProxyEntry>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `endpoint` unless it is already known.
    ///
    /// Returns the entry and whether it was created by this call.
    pub fn add(&self, endpoint: &str) -> (Arc<ProxyEntry>, bool) {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(endpoint) {
            return (Arc::clone(existing), false);
        }
        let entry = Arc::new(ProxyEntry::new(endpoint.to_string()));
        entries.insert(endpoint.to_string(), Arc::clone(&entry));
        (entry, true)
    }

    pub fn exists(&self, endpoint: &str) -> bool {
        self.entries.lock().contains_key(endpoint)
    }

    pub fn get(&self, endpoint: &str) -> Option<Arc<ProxyEntry>> {
        self.entries.lock().get(endpoint).cloned()
    }

    pub fn delete(&self, endpoint: &str) -> Result<()> {
        self.entries
            .lock()
            .remove(endpoint)
            .map(|_| ())
            .ok_or_else(|| PoolError::NotFound(endpoint.to_string()))
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
