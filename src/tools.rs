use crate::paths::AppPaths;
use serde::Serialize;
use std::ffi::OsStr;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize)]
pub struct YtDlpToolsStatus {
    pub available: bool,
    pub bundled_installed: bool,
    pub bundled_path: String,
    pub ytdlp_path: String,
    pub ytdlp_version: Option<String>,
}

pub fn ytdlp_tools_status(paths: &AppPaths) -> YtDlpToolsStatus {
    let bundled = paths.ytdlp_bin_path();
    let bundled_installed = bundled.exists();

    let mut candidates: Vec<PathBuf> = Vec::new();
    if bundled_installed {
        candidates.push(bundled.clone());
    }
    candidates.push(PathBuf::from("yt-dlp"));

    let mut status = YtDlpToolsStatus {
        available: false,
        bundled_installed,
        bundled_path: bundled.to_string_lossy().to_string(),
        ytdlp_path: String::new(),
        ytdlp_version: None,
    };
    for candidate in candidates {
        let version = tool_version_first_line(&candidate, "--version");
        if version.is_some() {
            status.available = true;
            status.ytdlp_path = candidate.to_string_lossy().to_string();
            status.ytdlp_version = version;
            break;
        }
    }
    status
}

#[derive(Debug, Clone, Serialize)]
pub struct FfmpegToolsStatus {
    pub available: bool,
    pub bundled_installed: bool,
    pub ffmpeg_path: String,
    pub ffmpeg_version: Option<String>,
}

pub fn ffmpeg_tools_status(paths: &AppPaths) -> FfmpegToolsStatus {
    let bundled = paths.ffmpeg_bin_path();
    let program = paths.ffmpeg_cmd();
    let ffmpeg_version = tool_version_first_line(&program, "-version");
    FfmpegToolsStatus {
        available: ffmpeg_version.is_some(),
        bundled_installed: bundled.exists(),
        ffmpeg_path: program.to_string_lossy().to_string(),
        ffmpeg_version,
    }
}

/// Names of the required executables that cannot be run. Empty when both
/// yt-dlp and ffmpeg answer a version query.
pub fn check_executables(paths: &AppPaths) -> Vec<String> {
    let mut missing = Vec::new();
    if !ytdlp_tools_status(paths).available {
        missing.push("yt-dlp".to_string());
    }
    if !ffmpeg_tools_status(paths).available {
        missing.push("ffmpeg".to_string());
    }
    if !missing.is_empty() {
        log::warn!("missing executables: {}", missing.join(", "));
    }
    missing
}

fn tool_version_first_line(program: impl AsRef<OsStr>, arg: &str) -> Option<String> {
    let output = crate::cmd::command(program).arg(arg).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let first = text.lines().next()?.trim();
    if first.is_empty() {
        return None;
    }
    Some(first.to_string())
}
