use crate::paths::AppPaths;
use crate::store;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const HISTORY_MAX: usize = 500;

/// One completed download. Entries are never edited after being recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub uploader: String,
    #[serde(default)]
    pub duration: String,
    pub format: String,
    pub resolution: String,
    pub download_path: String,
    pub completed_at_ms: i64,
    #[serde(default)]
    pub thumbnail_embedded: bool,
    #[serde(default)]
    pub redownloaded: bool,
}

/// Newest-first download log backed by a JSON array.
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    max_entries: usize,
    lock: Mutex<()>,
}

impl HistoryStore {
    pub fn new(path: PathBuf, max_entries: usize) -> Self {
        Self {
            path,
            max_entries: max_entries.max(1),
            lock: Mutex::new(()),
        }
    }

    pub fn open(paths: &AppPaths) -> Self {
        Self::new(paths.history_path(), HISTORY_MAX)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn load(&self) -> Vec<HistoryEntry> {
        store::read_json_or(&self.path, Vec::new())
    }

    pub fn append(&self, entry: HistoryEntry) -> bool {
        self.modify(|entries| {
            entries.insert(0, entry);
            true
        })
    }

    /// Removes the entry at `index` (0 = newest). Out-of-range is a no-op.
    pub fn delete(&self, index: usize) -> bool {
        self.modify(|entries| {
            if index >= entries.len() {
                return false;
            }
            entries.remove(index);
            true
        })
    }

    pub fn clear(&self) -> bool {
        self.modify(|entries| {
            entries.clear();
            true
        })
    }

    fn modify(&self, change: impl FnOnce(&mut Vec<HistoryEntry>) -> bool) -> bool {
        let _guard = match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut entries = self.load();
        if !change(&mut entries) {
            return false;
        }
        entries.truncate(self.max_entries);
        store::save_json(&self.path, &entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn entry(url: &str, at: i64) -> HistoryEntry {
        HistoryEntry {
            url: url.to_string(),
            title: format!("title {url}"),
            uploader: "someone".to_string(),
            duration: "3:14".to_string(),
            format: "mp4".to_string(),
            resolution: "1080p".to_string(),
            download_path: "/tmp/downloads".to_string(),
            completed_at_ms: at,
            thumbnail_embedded: false,
            redownloaded: false,
        }
    }

    #[test]
    fn append_inserts_newest_first_and_caps_length() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = HistoryStore::new(dir.path().join("history.json"), 3);

        for i in 0..5 {
            assert!(store.append(entry(&format!("https://example.com/{i}"), i)));
        }

        let urls: Vec<String> = store.load().into_iter().map(|e| e.url).collect();
        assert_eq!(
            urls,
            vec![
                "https://example.com/4",
                "https://example.com/3",
                "https://example.com/2"
            ]
        );
    }

    #[test]
    fn delete_and_clear() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = HistoryStore::new(dir.path().join("history.json"), 10);
        store.append(entry("https://example.com/a", 1));
        store.append(entry("https://example.com/b", 2));

        assert!(!store.delete(5));
        assert!(store.delete(0));
        let left = store.load();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].url, "https://example.com/a");

        assert!(store.clear());
        assert!(store.load().is_empty());
        let raw = std::fs::read_to_string(store.path()).expect("read");
        assert_eq!(raw.trim(), "[]");
    }

    #[test]
    fn concurrent_appends_keep_exactly_the_cap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(HistoryStore::new(dir.path().join("history.json"), 100));

        let handles: Vec<_> = (0..2)
            .map(|worker| {
                let store = store.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        assert!(store.append(entry(&format!("https://example.com/{worker}/{i}"), i)));
                        let raw = std::fs::read(store.path()).expect("read after write");
                        serde_json::from_slice::<Vec<HistoryEntry>>(&raw)
                            .expect("history stays valid json");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }

        assert_eq!(store.load().len(), 100);
    }

    #[test]
    fn legacy_entries_without_optional_fields_still_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("history.json");
        std::fs::write(
            &path,
            r#"[{"url":"https://example.com/x","title":"x","format":"mp4","resolution":"best","download_path":"/d","completed_at_ms":5}]"#,
        )
        .expect("write");

        let store = HistoryStore::new(path, 10);
        let loaded = store.load();
        assert_eq!(loaded.len(), 1);
        assert!(!loaded[0].redownloaded);
        assert_eq!(loaded[0].uploader, "");
    }
}
