use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

const TEMP_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config_dir().join("settings.json")
    }

    pub fn history_path(&self) -> PathBuf {
        self.config_dir().join("history.json")
    }

    pub fn default_download_dir(&self) -> PathBuf {
        self.base_dir.join("downloads")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.base_dir.join("temp")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn log_file_path(&self) -> PathBuf {
        self.logs_dir().join("reelq.log")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.base_dir.join("tools")
    }

    pub fn ytdlp_bin_path(&self) -> PathBuf {
        executable_in(&self.tools_dir(), "yt-dlp")
    }

    pub fn ffmpeg_bin_path(&self) -> PathBuf {
        executable_in(&self.tools_dir(), "ffmpeg")
    }

    /// Bundled binary when present, otherwise whatever `yt-dlp` resolves to on PATH.
    pub fn ytdlp_cmd(&self) -> PathBuf {
        let path = self.ytdlp_bin_path();
        if path.exists() {
            path
        } else {
            PathBuf::from("yt-dlp")
        }
    }

    pub fn ffmpeg_cmd(&self) -> PathBuf {
        let path = self.ffmpeg_bin_path();
        if path.exists() {
            path
        } else {
            PathBuf::from("ffmpeg")
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.default_download_dir())?;
        std::fs::create_dir_all(self.temp_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.tools_dir())?;
        Ok(())
    }

    /// Removes scratch files older than a day. Returns how many were removed.
    pub fn purge_temp_dir(&self) -> std::io::Result<usize> {
        purge_files_older_than(&self.temp_dir(), TEMP_MAX_AGE)
    }
}

fn executable_in(dir: &Path, name: &str) -> PathBuf {
    let mut path = dir.join(name);
    if cfg!(windows) {
        path.set_extension("exe");
    }
    path
}

pub(crate) fn purge_files_older_than(dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut removed = 0_usize;
    for entry in std::fs::read_dir(dir)? {
        let entry = match entry {
            Ok(v) => v,
            Err(_) => continue,
        };
        let meta = match entry.metadata() {
            Ok(v) => v,
            Err(_) => continue,
        };
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if modified < cutoff && std::fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Most recently modified regular file directly inside `dir`.
pub fn newest_file_in(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .flatten()
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            Some((entry.path(), meta.modified().unwrap_or(SystemTime::UNIX_EPOCH)))
        })
        .max_by_key(|(_, modified)| *modified)
        .map(|(path, _)| path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;

    #[test]
    fn purge_removes_only_stale_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        paths.ensure_dirs().expect("ensure dirs");

        let stale = paths.temp_dir().join("thumb_old.jpg");
        let fresh = paths.temp_dir().join("thumb_new.jpg");
        std::fs::write(&stale, "old").expect("write stale");
        std::fs::write(&fresh, "new").expect("write fresh");

        let two_days_ago = SystemTime::now() - Duration::from_secs(2 * 24 * 60 * 60);
        filetime::set_file_mtime(&stale, FileTime::from_system_time(two_days_ago))
            .expect("age stale file");

        let removed = paths.purge_temp_dir().expect("purge");
        assert_eq!(removed, 1);
        assert!(!stale.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn newest_file_prefers_latest_mtime() {
        let dir = tempfile::tempdir().expect("tempdir");
        let older = dir.path().join("a.mp4");
        let newer = dir.path().join("b.mp4");
        std::fs::write(&older, "a").expect("write a");
        std::fs::write(&newer, "b").expect("write b");
        std::fs::create_dir_all(dir.path().join("subdir")).expect("subdir");

        let base = SystemTime::now() - Duration::from_secs(600);
        filetime::set_file_mtime(&older, FileTime::from_system_time(base)).expect("mtime a");
        filetime::set_file_mtime(
            &newer,
            FileTime::from_system_time(base + Duration::from_secs(60)),
        )
        .expect("mtime b");

        assert_eq!(newest_file_in(dir.path()), Some(newer));
    }

    #[test]
    fn ytdlp_cmd_falls_back_to_path_lookup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        assert_eq!(paths.ytdlp_cmd(), PathBuf::from("yt-dlp"));

        paths.ensure_dirs().expect("ensure dirs");
        std::fs::write(paths.ytdlp_bin_path(), "").expect("bundled");
        assert_eq!(paths.ytdlp_cmd(), paths.ytdlp_bin_path());
    }
}
