use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;

const RESTRICTED_MARKERS: &[&str] = &[
    "sign in to confirm your age",
    "this video is only available for members",
    "members-only",
    "join this channel to get access",
    "this video is private",
    "private video",
];

pub const RESTRICTED_MESSAGE: &str =
    "age-restricted, members-only or private content; sign-in credentials are required";

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// Percent in `0.0..=100.0` as printed by the tool.
    pub percent: Option<f32>,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub raw: String,
}

impl ProgressUpdate {
    /// Percent normalised to `0.0..=1.0`.
    pub fn fraction(&self) -> Option<f32> {
        self.percent.map(|p| (p / 100.0).clamp(0.0, 1.0))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineKind {
    Restricted,
    Output {
        update: ProgressUpdate,
        destination: Option<PathBuf>,
    },
}

fn percent_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([0-9]{1,3}(?:\.[0-9]+)?)%").expect("percent regex"))
}

fn speed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bat\s+~?\s*([0-9.]+\s*[A-Za-z]+/s)").expect("speed regex"))
}

fn eta_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bETA\s+([0-9]{1,2}(?::[0-9]{2}){1,2})").expect("eta regex"))
}

fn destination_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"^(?:\[[^\]]+\]\s*)?(?:Destination:\s*(?P<dest>.+)|Merging formats into "(?P<merged>.+)"|(?P<existing>.+) has already been downloaded)$"#,
        )
        .expect("destination regex")
    })
}

pub fn is_restricted(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    RESTRICTED_MARKERS.iter().any(|marker| lower.contains(marker))
}

pub fn parse_line(raw_line: &str) -> LineKind {
    let line = raw_line.trim();
    if is_restricted(line) {
        return LineKind::Restricted;
    }

    let percent = percent_re()
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f32>().ok())
        .filter(|p| p.is_finite() && (0.0..=100.0).contains(p));
    let speed = speed_re()
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    let eta = eta_re()
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());

    let destination = destination_re().captures(line).and_then(|c| {
        c.name("dest")
            .or_else(|| c.name("merged"))
            .or_else(|| c.name("existing"))
            .map(|m| PathBuf::from(m.as_str().trim()))
    });

    LineKind::Output {
        update: ProgressUpdate {
            percent,
            speed,
            eta,
            raw: line.to_string(),
        },
        destination,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(line: &str) -> (ProgressUpdate, Option<PathBuf>) {
        match parse_line(line) {
            LineKind::Output {
                update,
                destination,
            } => (update, destination),
            LineKind::Restricted => panic!("unexpected restricted classification for {line}"),
        }
    }

    #[test]
    fn parses_full_progress_line() {
        let (update, dest) = output("[download]  42.7% of ~ 10.00MiB at  2.31MiB/s ETA 00:03");
        assert_eq!(update.percent, Some(42.7));
        assert_eq!(update.speed.as_deref(), Some("2.31MiB/s"));
        assert_eq!(update.eta.as_deref(), Some("00:03"));
        assert!(dest.is_none());
        let fraction = update.fraction().expect("fraction");
        assert!((fraction - 0.427).abs() < 1e-6);
    }

    #[test]
    fn partial_tokens_are_optional() {
        let (update, _) = output("[download] 100% of 10.00MiB in 00:00:04");
        assert_eq!(update.percent, Some(100.0));
        assert_eq!(update.speed, None);
        assert_eq!(update.eta, None);

        let (update, _) = output("[youtube] abc: Downloading webpage");
        assert_eq!(update.percent, None);
        assert_eq!(update.fraction(), None);
        assert_eq!(update.raw, "[youtube] abc: Downloading webpage");
    }

    #[test]
    fn eta_accepts_hours() {
        let (update, _) = output("[download]   1.0% of 2.00GiB at 1.00MiB/s ETA 01:02:03");
        assert_eq!(update.eta.as_deref(), Some("01:02:03"));
    }

    #[test]
    fn out_of_range_percent_is_dropped() {
        let (update, _) = output("[download] 250.0% weird");
        assert_eq!(update.percent, None);
    }

    #[test]
    fn destination_announcements_are_captured() {
        let (_, dest) = output("[download] Destination: /tmp/out/My Clip.mp4");
        assert_eq!(dest, Some(PathBuf::from("/tmp/out/My Clip.mp4")));

        let (_, dest) = output("Destination: plain.webm");
        assert_eq!(dest, Some(PathBuf::from("plain.webm")));

        let (_, dest) = output(r#"[Merger] Merging formats into "/tmp/out/Merged.mkv""#);
        assert_eq!(dest, Some(PathBuf::from("/tmp/out/Merged.mkv")));

        let (_, dest) = output("[download] /tmp/out/Old.mp4 has already been downloaded");
        assert_eq!(dest, Some(PathBuf::from("/tmp/out/Old.mp4")));
    }

    #[test]
    fn restricted_markers_are_detected_case_insensitively() {
        assert_eq!(
            parse_line("ERROR: [youtube] x: Sign in to confirm your age."),
            LineKind::Restricted
        );
        assert_eq!(
            parse_line("ERROR: This video is only available for members of this channel"),
            LineKind::Restricted
        );
        assert_eq!(parse_line("ERROR: Private video"), LineKind::Restricted);
        assert!(!is_restricted("[download] 10.0% of 1MiB"));
    }
}
