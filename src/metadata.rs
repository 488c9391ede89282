use crate::cmd::{self, ToolProgram};
use crate::format::{OutputFormat, Resolution};
use crate::progress;
use crate::supervisor;
use crate::{EngineError, Result};
use serde::{Deserialize, Deserializer};
use std::io::Read;
use std::path::Path;
use std::process::{Child, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MediaInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub duration_string: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub formats: Vec<StreamFormat>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StreamFormat {
    #[serde(default)]
    pub format_id: String,
    #[serde(default)]
    pub ext: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub height: Option<u64>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub filesize: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub filesize_approx: Option<u64>,
}

// yt-dlp prints some integer fields as floats depending on the extractor.
fn lenient_u64<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| {
        v.as_u64()
            .or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64))
    }))
}

impl StreamFormat {
    fn codec_present(codec: &Option<String>) -> bool {
        matches!(codec.as_deref(), Some(c) if c != "none")
    }

    pub fn has_video(&self) -> bool {
        Self::codec_present(&self.vcodec)
    }

    pub fn has_audio(&self) -> bool {
        Self::codec_present(&self.acodec)
    }

    pub fn size(&self) -> Option<u64> {
        self.filesize.or(self.filesize_approx)
    }
}

impl MediaInfo {
    pub fn uploader_label(&self) -> String {
        self.uploader.clone().unwrap_or_default()
    }

    pub fn duration_label(&self) -> String {
        if let Some(s) = self.duration_string.as_deref().filter(|s| !s.is_empty()) {
            return s.to_string();
        }
        match self.duration {
            Some(secs) if secs.is_finite() && secs >= 0.0 => format_duration(secs.round() as u64),
            _ => String::new(),
        }
    }

    /// `Best` followed by every distinct video height, tallest first.
    pub fn available_resolutions(&self) -> Vec<Resolution> {
        let mut heights: Vec<u32> = self
            .formats
            .iter()
            .filter(|f| f.has_video())
            .filter_map(|f| f.height)
            .filter_map(|h| u32::try_from(h).ok())
            .filter(|h| *h > 0)
            .collect();
        heights.sort_unstable_by(|a, b| b.cmp(a));
        heights.dedup();

        let mut out = vec![Resolution::Best];
        out.extend(heights.into_iter().map(Resolution::MaxHeight));
        out
    }

    /// Rough byte count of what the selector for `format` and `resolution`
    /// would fetch. `None` when the streams carry no sizes.
    pub fn estimate_size(&self, format: OutputFormat, resolution: Resolution) -> Option<u64> {
        estimate_size(&self.formats, format, resolution)
    }
}

/// Size estimate over raw stream descriptors: the tallest video stream within
/// the height limit plus the largest audio-only stream when the video carries
/// no audio of its own.
pub fn estimate_size(formats: &[StreamFormat], format: OutputFormat, resolution: Resolution) -> Option<u64> {
    let best_audio = formats
        .iter()
        .filter(|f| f.has_audio() && !f.has_video())
        .filter_map(|f| f.size())
        .max();
    if format.is_audio_only() {
        return best_audio;
    }

    let limit = resolution.height().map(u64::from).unwrap_or(u64::MAX);
    let video = formats
        .iter()
        .filter(|f| f.has_video() && f.size().is_some())
        .filter(|f| f.height.map(|h| h <= limit).unwrap_or(resolution == Resolution::Best))
        .max_by_key(|f| (f.height.unwrap_or(0), f.size().unwrap_or(0)))?;

    let video_size = video.size()?;
    if video.has_audio() {
        Some(video_size)
    } else {
        Some(video_size + best_audio.unwrap_or(0))
    }
}

pub fn format_duration(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

pub fn parse_dump_json(stdout: &str) -> Result<MediaInfo> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with('{'))
        .ok_or_else(|| EngineError::MetadataInvalid("no JSON object in output".to_string()))?;
    serde_json::from_str(line).map_err(|e| EngineError::MetadataInvalid(e.to_string()))
}

/// Runs the metadata query, killing the tool once `timeout` elapses.
pub fn fetch_metadata(
    program: &ToolProgram,
    url: &str,
    cookies_path: Option<&Path>,
    timeout: Duration,
) -> Result<MediaInfo> {
    let tool = program.name();
    if program.is_missing_path() {
        return Err(EngineError::ExternalToolMissing { tool });
    }

    let mut cmd = program.command();
    cmd.args(cmd::metadata_args(url, cookies_path))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
            EngineError::ExternalToolMissing { tool: tool.clone() }
        }
        _ => EngineError::Io(e),
    })?;

    let stdout_handle = child.stdout.take().map(|mut out| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = out.read_to_end(&mut buf);
            buf
        })
    });
    let stderr_handle = child.stderr.take().map(|mut err| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = err.read_to_end(&mut buf);
            buf
        })
    });

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if started.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    // Readers are left to finish on their own; a grandchild
                    // may still hold the pipes open.
                    log::warn!("metadata fetch for {url} timed out after {:?}", timeout);
                    return Err(EngineError::FetchTimeout {
                        secs: timeout.as_secs(),
                    });
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(err) => {
                let _ = child.kill();
                return Err(EngineError::Io(err));
            }
        }
    };

    let stdout = stdout_handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    let stderr = stderr_handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    let stderr = String::from_utf8_lossy(&stderr);

    if stderr.lines().any(progress::is_restricted) {
        return Err(EngineError::RestrictedContent(
            progress::RESTRICTED_MESSAGE.to_string(),
        ));
    }
    if !status.success() {
        return Err(EngineError::ExternalToolFailed {
            tool,
            code: status.code(),
            stderr: stderr.trim().to_string(),
        });
    }

    let info = parse_dump_json(&String::from_utf8_lossy(&stdout))?;
    log::debug!("metadata for {url}: {:?} ({} formats)", info.title, info.formats.len());
    Ok(info)
}

#[derive(Debug, Default, Deserialize)]
struct FlatEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    webpage_url: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    channel: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistEntry {
    /// 1-based position in the playlist.
    pub index: usize,
    pub id: String,
    pub title: String,
    pub url: String,
    pub duration: Option<f64>,
    pub uploader: Option<String>,
}

impl PlaylistEntry {
    /// The descriptive part of the entry, in the shape a full fetch returns.
    pub fn to_media_info(&self) -> MediaInfo {
        MediaInfo {
            id: self.id.clone(),
            title: self.title.clone(),
            uploader: self.uploader.clone(),
            duration: self.duration,
            ..MediaInfo::default()
        }
    }
}

fn is_http(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Parses one `--flat-playlist` line. Lines that are not JSON or that carry
/// neither an id nor a URL yield `None`.
pub fn parse_playlist_line(line: &str, index: usize) -> Option<PlaylistEntry> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    let raw: FlatEntry = serde_json::from_str(line).ok()?;
    let id = raw.id.clone().filter(|v| !v.trim().is_empty());
    let url = raw
        .webpage_url
        .clone()
        .filter(|u| is_http(u))
        .or_else(|| raw.url.clone().filter(|u| is_http(u)))
        .or_else(|| id.as_ref().map(|v| format!("https://www.youtube.com/watch?v={v}")))?;
    Some(PlaylistEntry {
        index,
        id: id.unwrap_or_else(|| url.clone()),
        title: raw.title.unwrap_or_default(),
        url,
        duration: raw.duration,
        uploader: raw.uploader.or(raw.channel),
    })
}

/// `idle_timeout` bounds the gap between two lines. A nonzero exit after at
/// least one entry only logs a warning.
pub fn fetch_playlist<F>(
    program: &ToolProgram,
    url: &str,
    cookies_path: Option<&Path>,
    idle_timeout: Duration,
    mut on_entry: F,
) -> Result<usize>
where
    F: FnMut(PlaylistEntry),
{
    let tool = program.name();
    if program.is_missing_path() {
        return Err(EngineError::ExternalToolMissing { tool });
    }

    let mut cmd = program.command();
    cmd.args(cmd::playlist_args(url, cookies_path))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
            EngineError::ExternalToolMissing { tool: tool.clone() }
        }
        _ => EngineError::Io(e),
    })?;

    let (tx, rx) = mpsc::channel::<String>();
    if let Some(stdout) = child.stdout.take() {
        supervisor::spawn_line_reader(stdout, tx);
    } else {
        drop(tx);
    }
    let stderr_handle = child.stderr.take().map(|mut err| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = err.read_to_end(&mut buf);
            buf
        })
    });

    let mut count = 0;
    loop {
        match rx.recv_timeout(idle_timeout) {
            Ok(line) => {
                if let Some(entry) = parse_playlist_line(&line, count + 1) {
                    count += 1;
                    on_entry(entry);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                kill_and_reap(&mut child);
                log::warn!("playlist fetch for {url} stalled for {:?}", idle_timeout);
                return Err(EngineError::FetchTimeout {
                    secs: idle_timeout.as_secs(),
                });
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let status = child.wait()?;
    let stderr = stderr_handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    let stderr = String::from_utf8_lossy(&stderr);

    if count == 0 && stderr.lines().any(progress::is_restricted) {
        return Err(EngineError::RestrictedContent(
            progress::RESTRICTED_MESSAGE.to_string(),
        ));
    }
    if !status.success() {
        if count == 0 {
            return Err(EngineError::ExternalToolFailed {
                tool,
                code: status.code(),
                stderr: stderr.trim().to_string(),
            });
        }
        log::warn!("playlist {url} listed {count} entries before {tool} exited with {status}");
    }
    log::info!("playlist {url}: {count} entries");
    Ok(count)
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}
