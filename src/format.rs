use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Mp4,
    Mkv,
    Webm,
    M4a,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 4] = [
        OutputFormat::Mp4,
        OutputFormat::Mkv,
        OutputFormat::Webm,
        OutputFormat::M4a,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Mkv => "mkv",
            OutputFormat::Webm => "webm",
            OutputFormat::M4a => "m4a",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mp4" => Some(OutputFormat::Mp4),
            "mkv" => Some(OutputFormat::Mkv),
            "webm" => Some(OutputFormat::Webm),
            "m4a" => Some(OutputFormat::M4a),
            _ => None,
        }
    }

    pub fn is_audio_only(&self) -> bool {
        matches!(self, OutputFormat::M4a)
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolution ceiling. `Best` leaves the height unconstrained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    #[default]
    Best,
    MaxHeight(u32),
}

impl Resolution {
    pub fn height(&self) -> Option<u32> {
        match self {
            Resolution::Best => None,
            Resolution::MaxHeight(h) => Some(*h),
        }
    }

    /// Accepts `best`, `Best Available`, `1080p` and `1080`.
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("best") || trimmed.eq_ignore_ascii_case("best available")
        {
            return Some(Resolution::Best);
        }
        let digits = trimmed.strip_suffix(['p', 'P']).unwrap_or(trimmed);
        match digits.parse::<u32>() {
            Ok(h) if h > 0 => Some(Resolution::MaxHeight(h)),
            _ => None,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Resolution::Best => "best".to_string(),
            Resolution::MaxHeight(h) => format!("{h}p"),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

pub fn build_format_selector(format: OutputFormat, resolution: Resolution) -> String {
    match (format, resolution.height()) {
        (OutputFormat::M4a, _) => "bestaudio[ext=m4a]/bestaudio".to_string(),
        (OutputFormat::Mp4, Some(h)) => {
            format!("bestvideo[height<={h}][ext=mp4]+bestaudio[ext=m4a]/best[height<={h}]")
        }
        (OutputFormat::Mp4, None) => "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best".to_string(),
        (OutputFormat::Webm, Some(h)) => {
            format!("bestvideo[height<={h}][ext=webm]+bestaudio[ext=webm]/best[height<={h}]")
        }
        (OutputFormat::Webm, None) => "bestvideo[ext=webm]+bestaudio[ext=webm]/best".to_string(),
        (OutputFormat::Mkv, Some(h)) => format!("bestvideo[height<={h}]+bestaudio/best[height<={h}]"),
        (OutputFormat::Mkv, None) => "bestvideo+bestaudio/best".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_parses_common_labels() {
        assert_eq!(Resolution::parse("Best Available"), Some(Resolution::Best));
        assert_eq!(Resolution::parse("best"), Some(Resolution::Best));
        assert_eq!(Resolution::parse("1080p"), Some(Resolution::MaxHeight(1080)));
        assert_eq!(Resolution::parse(" 720 "), Some(Resolution::MaxHeight(720)));
        assert_eq!(Resolution::parse("0p"), None);
        assert_eq!(Resolution::parse("huge"), None);
    }

    #[test]
    fn selector_caps_height_when_requested() {
        assert_eq!(
            build_format_selector(OutputFormat::Mp4, Resolution::MaxHeight(720)),
            "bestvideo[height<=720][ext=mp4]+bestaudio[ext=m4a]/best[height<=720]"
        );
        assert_eq!(
            build_format_selector(OutputFormat::Mkv, Resolution::Best),
            "bestvideo+bestaudio/best"
        );
    }

    #[test]
    fn audio_selector_ignores_resolution() {
        assert_eq!(
            build_format_selector(OutputFormat::M4a, Resolution::MaxHeight(1080)),
            build_format_selector(OutputFormat::M4a, Resolution::Best)
        );
    }

    #[test]
    fn format_parse_is_case_insensitive() {
        assert_eq!(OutputFormat::parse("MKV"), Some(OutputFormat::Mkv));
        assert_eq!(OutputFormat::parse("avi"), None);
        for format in OutputFormat::ALL {
            assert_eq!(OutputFormat::parse(format.as_str()), Some(format));
        }
    }
}
