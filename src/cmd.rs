use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;

pub fn command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    configure_for_background(&mut cmd);
    cmd
}

#[cfg(windows)]
fn configure_for_background(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    // Prevent console windows from stealing focus on Windows while running tools.
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn configure_for_background(_cmd: &mut Command) {}

/// An executable plus the arguments that must precede the tool's own ones,
/// e.g. `python -m yt_dlp`.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolProgram {
    pub program: PathBuf,
    pub prefix_args: Vec<String>,
}

impl ToolProgram {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
        }
    }

    pub fn with_prefix(program: impl Into<PathBuf>, prefix_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            prefix_args,
        }
    }

    pub fn command(&self) -> Command {
        let mut cmd = command(&self.program);
        cmd.args(&self.prefix_args);
        cmd
    }

    /// Short name for messages, e.g. `yt-dlp` for `/opt/tools/yt-dlp.exe`.
    pub fn name(&self) -> String {
        self.program
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    /// True when the program is given as a path (not a bare name looked up on
    /// PATH) and nothing exists there.
    pub fn is_missing_path(&self) -> bool {
        self.program.components().count() > 1 && !self.program.exists()
    }
}

/// Arguments for one yt-dlp download run.
#[derive(Debug, Clone)]
pub struct YtDlpInvocation {
    pub program: ToolProgram,
    pub url: String,
    pub output_dir: PathBuf,
    pub filename_template: String,
    pub format_selector: String,
    pub cookies_path: Option<PathBuf>,
}

impl YtDlpInvocation {
    pub fn output_template(&self) -> PathBuf {
        self.output_dir.join(&self.filename_template)
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["--no-warnings".to_string(), "--newline".to_string()];
        if let Some(cookies) = &self.cookies_path {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().to_string());
        }
        args.push("-o".to_string());
        args.push(self.output_template().to_string_lossy().to_string());
        args.push("-f".to_string());
        args.push(self.format_selector.clone());
        args.push(self.url.clone());
        args
    }
}

pub fn metadata_args(url: &str, cookies_path: Option<&Path>) -> Vec<String> {
    dump_json_args(&["--skip-download"], url, cookies_path)
}

/// One JSON line per entry, without resolving each video.
pub fn playlist_args(url: &str, cookies_path: Option<&Path>) -> Vec<String> {
    dump_json_args(&["--flat-playlist"], url, cookies_path)
}

fn dump_json_args(mode: &[&str], url: &str, cookies_path: Option<&Path>) -> Vec<String> {
    let mut args = vec!["--no-warnings".to_string()];
    args.extend(mode.iter().map(|m| m.to_string()));
    args.push("--dump-json".to_string());
    if let Some(cookies) = cookies_path {
        args.push("--cookies".to_string());
        args.push(cookies.to_string_lossy().to_string());
    }
    args.push(url.to_string());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_args_place_url_last_and_include_cookies() {
        let invocation = YtDlpInvocation {
            program: ToolProgram::new("yt-dlp"),
            url: "https://youtu.be/abc".to_string(),
            output_dir: PathBuf::from("out"),
            filename_template: "%(title)s.%(ext)s".to_string(),
            format_selector: "bestvideo+bestaudio/best".to_string(),
            cookies_path: Some(PathBuf::from("cookies.txt")),
        };
        let args = invocation.args();
        assert_eq!(args.first().map(String::as_str), Some("--no-warnings"));
        assert!(args.windows(2).any(|w| w[0] == "--cookies" && w[1] == "cookies.txt"));
        assert!(args.windows(2).any(|w| w[0] == "-f" && w[1] == "bestvideo+bestaudio/best"));
        assert_eq!(args.last().map(String::as_str), Some("https://youtu.be/abc"));
    }

    #[test]
    fn prefix_args_come_before_tool_args() {
        let program = ToolProgram::with_prefix("python3", vec!["-m".to_string(), "yt_dlp".to_string()]);
        let cmd = program.command();
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(args, vec!["-m", "yt_dlp"]);
        assert!(!program.is_missing_path());
        assert!(ToolProgram::new("/definitely/not/here/yt-dlp").is_missing_path());
    }

    #[test]
    fn metadata_args_skip_download() {
        let args = metadata_args("https://youtu.be/abc", None);
        assert!(args.contains(&"--dump-json".to_string()));
        assert!(args.contains(&"--skip-download".to_string()));
        assert!(!args.contains(&"--cookies".to_string()));
    }

    #[test]
    fn playlist_args_are_flat() {
        let args = playlist_args("https://youtube.com/playlist?list=PL1", Some(Path::new("c.txt")));
        assert_eq!(
            args,
            vec![
                "--no-warnings",
                "--flat-playlist",
                "--dump-json",
                "--cookies",
                "c.txt",
                "https://youtube.com/playlist?list=PL1",
            ]
        );
        assert_eq!(ToolProgram::new("/opt/tools/yt-dlp.exe").name(), "yt-dlp");
    }
}
