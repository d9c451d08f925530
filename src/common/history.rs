//! Shared URL-test latency history, keyed by outbound tag.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Instant;

/// One measurement. Entries are overwritten on retest and removed on failure,
/// so a present entry always describes a successful probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct History {
    pub at: Instant,
    pub delay: u16,
}

#[derive(Default)]
pub struct HistoryStore {
    entries: RwLock<HashMap<String, History>>,
}

impl HistoryStore {
    pub fn new() -> Self {
        HistoryStore::default()
    }

    pub fn load(&self, tag: &str) -> Option<History> {
        self.entries.read().get(tag).copied()
    }

    pub fn store(&self, tag: &str, delay: u16) {
        self.entries.write().insert(
            tag.to_string(),
            History {
                at: Instant::now(),
                delay,
            },
        );
    }

    pub fn delete(&self, tag: &str) {
        self.entries.write().remove(tag);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_load_delete() {
        let store = HistoryStore::new();
        assert!(store.load("a").is_none());

        store.store("a", 120);
        assert_eq!(store.load("a").unwrap().delay, 120);

        store.store("a", 80);
        assert_eq!(store.load("a").unwrap().delay, 80);
        assert_eq!(store.len(), 1);

        store.delete("a");
        assert!(store.load("a").is_none());
    }
}
