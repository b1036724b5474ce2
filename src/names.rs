// Instance name registry
// Maps raw operation identities to display-safe names of bounded length.
// Entries are append-only for the lifetime of the registry.

use dashmap::DashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Longest sanitized name handed out.
pub const MAX_NAME_LEN: usize = 128;
/// Characters kept from an overflowing raw name; the rest is the suffix.
const TRUNCATED_PREFIX_LEN: usize = 125;
/// Distinct suffixes before the overflow counter wraps.
const SUFFIX_SPACE: u32 = 1000;

pub struct NameSanitizer {
    names: DashMap<String, Arc<str>>,
    /// Guards creation. The value is the shared overflow counter.
    overflow: Mutex<u32>,
}

impl NameSanitizer {
    pub fn new() -> Self {
        Self {
            names: DashMap::new(),
            overflow: Mutex::new(0),
        }
    }

    /// Return the sanitized name for `raw`, creating it on first use.
    pub fn resolve(&self, raw: &str) -> Arc<str> {
        if let Some(name) = self.lookup(raw) {
            return name;
        }

        let mut counter = self.overflow.lock().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have inserted it while we waited on the lock.
        if let Some(name) = self.lookup(raw) {
            return name;
        }

        let sanitized: Arc<str> = if raw.chars().count() <= MAX_NAME_LEN {
            Arc::from(raw)
        } else {
            if *counter == SUFFIX_SPACE {
                warn!(
                    overflowed = *counter,
                    "instance name suffixes exhausted; truncated names may collide"
                );
            }
            let prefix: String = raw.chars().take(TRUNCATED_PREFIX_LEN).collect();
            let name = format!("{}{:03}", prefix, *counter % SUFFIX_SPACE);
            *counter = counter.wrapping_add(1);
            debug!(raw = %raw, sanitized = %name, "truncated instance name");
            Arc::from(name)
        };

        self.names.insert(raw.to_string(), Arc::clone(&sanitized));
        sanitized
    }

    fn lookup(&self, raw: &str) -> Option<Arc<str>> {
        self.names.get(raw).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Snapshot of every sanitized name handed out so far.
    pub fn names(&self) -> Vec<Arc<str>> {
        self.names.iter().map(|entry| Arc::clone(entry.value())).collect()
    }
}

impl Default for NameSanitizer {
    fn default() -> Self {
        Self::new()
    }
}
