use crate::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tempfile::NamedTempFile;

const LOCK_TIMEOUT: Duration = Duration::from_secs(2);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);
const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

/// Best-effort cross-process advisory lock. Removed on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    pub fn lock_path_for(target: &Path) -> PathBuf {
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        target.with_file_name(format!("{file_name}.lock"))
    }

    /// Returns `None` when the lock could not be taken within `timeout`.
    pub fn acquire(target: &Path, timeout: Duration) -> Option<Self> {
        let path = Self::lock_path_for(target);
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Some(Self { path });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path) {
                        log::warn!("removing stale lock file {}", path.display());
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                }
                Err(err) => {
                    log::debug!("lock file {} unavailable: {err}", path.display());
                    return None;
                }
            }

            if started.elapsed() >= timeout {
                return None;
            }
            thread::sleep(LOCK_POLL_INTERVAL);
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn lock_is_stale(path: &Path) -> bool {
    let modified = match std::fs::metadata(path).and_then(|m| m.modified()) {
        Ok(v) => v,
        Err(_) => return false,
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age > LOCK_STALE_AFTER)
        .unwrap_or(false)
}

pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let lock = FileLock::acquire(path, LOCK_TIMEOUT);
    if lock.is_none() {
        log::warn!(
            "could not lock {} within {:?}; writing without the advisory lock",
            path.display(),
            LOCK_TIMEOUT
        );
    }

    let json = serde_json::to_string_pretty(value)?;
    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(format!("{json}\n").as_bytes())?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    drop(lock);
    Ok(())
}

/// Like [`write_json_atomic`] but never fails; the outcome is logged and
/// reported as a flag the caller may surface.
pub fn save_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> bool {
    match write_json_atomic(path, value) {
        Ok(()) => true,
        Err(err) => {
            log::error!("failed to write {}: {err}", path.display());
            false
        }
    }
}

pub fn read_json_or<T: DeserializeOwned>(path: &Path, default: T) -> T {
    let bytes = match std::fs::read(path) {
        Ok(v) => v,
        Err(err) => {
            if err.kind() != ErrorKind::NotFound {
                log::warn!("failed to read {}: {err}", path.display());
            }
            return default;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(v) => v,
        Err(err) => {
            log::warn!("failed to parse {}: {err}", path.display());
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn write_then_read_returns_same_value() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("sample.json");
        let value = Sample {
            name: "clip".to_string(),
            count: 3,
        };

        write_json_atomic(&path, &value).expect("write");
        let loaded: Option<Sample> = read_json_or(&path, None);
        assert_eq!(loaded, Some(value));
        assert!(!FileLock::lock_path_for(&path).exists());
    }

    #[test]
    fn read_falls_back_on_missing_or_corrupt_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.json");

        let missing: Vec<u32> = read_json_or(&path, vec![7]);
        assert_eq!(missing, vec![7]);

        std::fs::write(&path, "{ not json").expect("write corrupt");
        let corrupt: Vec<u32> = read_json_or(&path, vec![9]);
        assert_eq!(corrupt, vec![9]);
    }

    #[test]
    fn held_lock_delays_but_does_not_block_the_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("locked.json");
        std::fs::write(FileLock::lock_path_for(&path), "other process").expect("lock");

        let started = Instant::now();
        assert!(save_json(&path, &vec![1, 2, 3]));
        assert!(started.elapsed() >= LOCK_TIMEOUT);

        let loaded: Vec<u32> = read_json_or(&path, Vec::new());
        assert_eq!(loaded, vec![1, 2, 3]);
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stale.json");
        let lock_path = FileLock::lock_path_for(&path);
        std::fs::write(&lock_path, "dead process").expect("lock");
        let old = SystemTime::now() - Duration::from_secs(120);
        filetime::set_file_mtime(&lock_path, filetime::FileTime::from_system_time(old))
            .expect("age lock");

        let lock = FileLock::acquire(&path, Duration::from_millis(50));
        assert!(lock.is_some());
        drop(lock);
        assert!(!lock_path.exists());
    }
}
