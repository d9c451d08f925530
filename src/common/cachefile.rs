//! Persistent cache collaborators.
//!
//! The runtime only depends on the `CacheFile` trait; the JSON file
//! implementation below is the default vehicle for remembering selector
//! choices across restarts.

use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub trait CacheFile: Send + Sync {
    /// Last persisted selection for a group, if any.
    fn load_selected(&self, group: &str) -> Option<String>;

    fn store_selected(&self, group: &str, tag: &str) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheContent {
    #[serde(default)]
    selected: HashMap<String, String>,
}

/// JSON file-backed cache. Reads once at open, writes through on change.
pub struct JsonCacheFile {
    path: PathBuf,
    content: Mutex<CacheContent>,
}

impl JsonCacheFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let content = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| Error::config(format!("cache file {}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CacheContent::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(JsonCacheFile {
            path,
            content: Mutex::new(content),
        })
    }

    fn flush(&self, content: &CacheContent) -> Result<()> {
        let raw = serde_json::to_vec_pretty(content)?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}

impl CacheFile for JsonCacheFile {
    fn load_selected(&self, group: &str) -> Option<String> {
        self.content.lock().selected.get(group).cloned()
    }

    fn store_selected(&self, group: &str, tag: &str) -> Result<()> {
        let mut content = self.content.lock();
        content
            .selected
            .insert(group.to_string(), tag.to_string());
        self.flush(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("routebox-cache-{}-{}.json", name, std::process::id()))
    }

    #[test]
    fn test_round_trip() {
        let path = temp_path("round-trip");
        let cache = JsonCacheFile::open(&path).unwrap();
        assert!(cache.load_selected("grp").is_none());

        cache.store_selected("grp", "proxy-b").unwrap();
        assert_eq!(cache.load_selected("grp").as_deref(), Some("proxy-b"));

        // Reopen from disk.
        let cache = JsonCacheFile::open(&path).unwrap();
        assert_eq!(cache.load_selected("grp").as_deref(), Some("proxy-b"));
        let _ = std::fs::remove_file(&path);
    }
}
