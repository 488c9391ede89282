use crate::config::Settings;
use crate::paths::AppPaths;
use crate::Result;
use simplelog::{ColorChoice, CombinedLogger, Config, LevelFilter, TermLogger, TerminalMode, WriteLogger};
use std::fs::OpenOptions;

/// Console plus `<base>/logs/reelq.log`, at debug level when `debug` is set.
pub fn init_logging(paths: &AppPaths, debug: bool) -> Result<()> {
    std::fs::create_dir_all(paths.logs_dir())?;
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.log_file_path())?;

    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if CombinedLogger::init(vec![
        TermLogger::new(level, Config::default(), TerminalMode::Mixed, ColorChoice::Auto),
        WriteLogger::new(level, Config::default(), log_file),
    ])
    .is_err()
    {
        log::debug!("logger already initialized");
    }
    Ok(())
}

pub fn log_startup_configuration(paths: &AppPaths, settings: &Settings) {
    log::info!("base dir: {}", paths.base_dir.display());
    log::info!("download dir: {}", settings.output_dir().display());
    log::info!(
        "format: {} / {}, concurrency {}",
        settings.output_format(),
        settings.resolution(),
        settings.effective_concurrency()
    );
    match settings.cookies_file() {
        Some(path) if path.exists() => log::info!("cookies file: {}", path.display()),
        Some(path) => log::warn!(
            "cookies file {} not found; restricted videos will fail",
            path.display()
        ),
        None => log::debug!("no cookies file configured"),
    }
}
