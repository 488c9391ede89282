use crate::cmd::ToolProgram;
use crate::ffmpeg;
use crate::{EngineError, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

const THUMBNAIL_TIMEOUT: Duration = Duration::from_secs(20);
const USER_AGENT: &str = concat!("reelq/", env!("CARGO_PKG_VERSION"));

fn build_http_agent() -> ureq::Agent {
    let mut config = ureq::Agent::config_builder();
    config = config
        .http_status_as_error(false)
        .timeout_global(Some(THUMBNAIL_TIMEOUT))
        .user_agent(USER_AGENT);
    config.build().into()
}

fn thumbnail_extension(url: &url::Url) -> &'static str {
    let path = url.path().to_ascii_lowercase();
    if path.ends_with(".png") {
        "png"
    } else if path.ends_with(".webp") {
        "webp"
    } else {
        "jpg"
    }
}

pub fn download_thumbnail(thumbnail_url: &str, temp_dir: &Path) -> Result<PathBuf> {
    let parsed = url::Url::parse(thumbnail_url)
        .map_err(|e| EngineError::Http(format!("bad thumbnail url: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(EngineError::Http(format!(
            "unsupported thumbnail scheme: {}",
            parsed.scheme()
        )));
    }

    std::fs::create_dir_all(temp_dir)?;
    let target = temp_dir.join(format!(
        "thumb-{}.{}",
        uuid::Uuid::new_v4(),
        thumbnail_extension(&parsed)
    ));

    let resp = build_http_agent()
        .get(thumbnail_url)
        .call()
        .map_err(|e| EngineError::Http(format!("thumbnail download failed: {e}")))?;
    let status = resp.status();
    if status.as_u16() >= 400 {
        return Err(EngineError::Http(format!(
            "thumbnail download failed (status={status})"
        )));
    }

    {
        let mut reader = resp.into_body().into_reader();
        let mut file = std::fs::File::create(&target)?;
        std::io::copy(&mut reader, &mut file)?;
        file.flush()?;
    }
    Ok(target)
}

/// Downloads the thumbnail and attaches it to `media`. Failures are logged and
/// reported as `false`; the media file is left as it was.
pub fn embed_thumbnail(ffmpeg: &ToolProgram, temp_dir: &Path, media: &Path, thumbnail_url: &str) -> bool {
    let cover = match download_thumbnail(thumbnail_url, temp_dir) {
        Ok(path) => path,
        Err(err) => {
            log::warn!("thumbnail unavailable for {}: {err}", media.display());
            return false;
        }
    };
    let result = ffmpeg::embed_cover_art(ffmpeg, media, &cover);
    let _ = std::fs::remove_file(&cover);
    match result {
        Ok(()) => {
            log::info!("embedded thumbnail into {}", media.display());
            true
        }
        Err(err) => {
            log::warn!("thumbnail embed failed for {}: {err}", media.display());
            false
        }
    }
}
