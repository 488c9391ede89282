use crate::cmd::ToolProgram;
use crate::{EngineError, Result};
use std::path::{Path, PathBuf};

/// Rewrites `media` in place with `cover` attached as its cover-art stream.
pub fn embed_cover_art(ffmpeg: &ToolProgram, media: &Path, cover: &Path) -> Result<()> {
    let tmp = sibling_tmp_path(media);
    let _ = std::fs::remove_file(&tmp);

    // Audio-only containers have no video stream ahead of the picture.
    let cover_stream = if is_audio_container(media) { "v:0" } else { "v:1" };

    let output = ffmpeg
        .command()
        .arg("-y")
        .arg("-i")
        .arg(media)
        .arg("-i")
        .arg(cover)
        .args(["-map", "0", "-map", "1", "-c", "copy"])
        .arg(format!("-disposition:{cover_stream}"))
        .arg("attached_pic")
        .arg(&tmp)
        .output()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::ExternalToolMissing {
                tool: "ffmpeg".to_string(),
            },
            _ => EngineError::Io(e),
        })?;

    if !output.status.success() || !tmp.exists() {
        let _ = std::fs::remove_file(&tmp);
        return Err(EngineError::ExternalToolFailed {
            tool: "ffmpeg".to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    replace_file(&tmp, media)
}

fn is_audio_container(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref(),
        Some("m4a" | "mp3" | "opus" | "ogg")
    )
}

fn sibling_tmp_path(media: &Path) -> PathBuf {
    let stem = media
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "media".to_string());
    let name = match media.extension() {
        Some(ext) => format!("{stem}.thumbtmp.{}", ext.to_string_lossy()),
        None => format!("{stem}.thumbtmp"),
    };
    media.with_file_name(name)
}

fn replace_file(from: &Path, to: &Path) -> Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    // Windows refuses to rename over an existing file.
    let _ = std::fs::remove_file(to);
    if std::fs::rename(from, to).is_err() {
        std::fs::copy(from, to)?;
        let _ = std::fs::remove_file(from);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_output_keeps_the_container_extension() {
        assert_eq!(
            sibling_tmp_path(Path::new("/d/Clip.mp4")),
            PathBuf::from("/d/Clip.thumbtmp.mp4")
        );
        assert!(is_audio_container(Path::new("a.M4A")));
        assert!(!is_audio_container(Path::new("a.mkv")));
    }

    #[cfg(unix)]
    mod unix {
        use super::*;

        fn fake_ffmpeg(dir: &Path, body: &str) -> ToolProgram {
            let path = dir.join("fake-ffmpeg.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
            ToolProgram::with_prefix("sh", vec![path.to_string_lossy().to_string()])
        }

        #[test]
        fn successful_embed_replaces_the_original() {
            let dir = tempfile::tempdir().expect("tempdir");
            let media = dir.path().join("Clip.mp4");
            let cover = dir.path().join("cover.jpg");
            std::fs::write(&media, b"video").expect("media");
            std::fs::write(&cover, b"jpg").expect("cover");

            // Writes "<input>+<cover>" to the last argument.
            let ffmpeg = fake_ffmpeg(
                dir.path(),
                r#"for a; do last="$a"; done
printf '%s+%s' "$(cat "$3")" "$(cat "$5")" > "$last""#,
            );
            embed_cover_art(&ffmpeg, &media, &cover).expect("embed");

            assert_eq!(std::fs::read_to_string(&media).expect("read"), "video+jpg");
            assert!(!sibling_tmp_path(&media).exists());
        }

        #[test]
        fn failed_embed_leaves_the_original() {
            let dir = tempfile::tempdir().expect("tempdir");
            let media = dir.path().join("Song.m4a");
            let cover = dir.path().join("cover.jpg");
            std::fs::write(&media, b"audio").expect("media");
            std::fs::write(&cover, b"jpg").expect("cover");

            let ffmpeg = fake_ffmpeg(dir.path(), "echo 'Invalid data' >&2\nexit 1");
            let err = embed_cover_art(&ffmpeg, &media, &cover).expect_err("fails");
            assert!(matches!(err, EngineError::ExternalToolFailed { code: Some(1), .. }));
            assert_eq!(std::fs::read_to_string(&media).expect("read"), "audio");
        }
    }
}
