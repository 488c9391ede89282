use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use reelq_engine::bridge::{self, EngineEvent, EventConsumer};
use reelq_engine::config::{self, MAX_CONCURRENCY_LIMIT};
use reelq_engine::format::{OutputFormat, Resolution};
use reelq_engine::history::HistoryStore;
use reelq_engine::metadata::format_size;
use reelq_engine::paths::AppPaths;
use reelq_engine::queue::{DownloadQueue, QueueConfig};
use reelq_engine::{logging, tools};

fn main() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_help();
        return Ok(());
    }

    let mut base_dir: Option<PathBuf> = None;
    let mut format: Option<OutputFormat> = None;
    let mut resolution: Option<Resolution> = None;
    let mut concurrency: Option<usize> = None;
    let mut show_history = false;
    let mut clear_history = false;
    let mut check = false;
    let mut redownload: Vec<usize> = Vec::new();
    let mut urls: Vec<String> = Vec::new();
    let mut playlists: Vec<String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--base-dir" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--base-dir requires a value".to_string())?;
                base_dir = Some(PathBuf::from(v));
            }
            "--format" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--format requires a value".to_string())?;
                format = Some(
                    OutputFormat::parse(v)
                        .ok_or_else(|| format!("unknown format: {v} (mp4, mkv, webm, m4a)"))?,
                );
            }
            "--resolution" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--resolution requires a value".to_string())?;
                resolution =
                    Some(Resolution::parse(v).ok_or_else(|| format!("unknown resolution: {v}"))?);
            }
            "--concurrency" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--concurrency requires a value".to_string())?;
                let n: usize = v
                    .parse()
                    .map_err(|_| format!("--concurrency expects a number, got {v}"))?;
                concurrency = Some(n.clamp(1, MAX_CONCURRENCY_LIMIT));
            }
            "--redownload" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--redownload requires a history index".to_string())?;
                redownload.push(
                    v.parse()
                        .map_err(|_| format!("--redownload expects an index, got {v}"))?,
                );
            }
            "--playlist" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--playlist requires a url".to_string())?;
                playlists.push(v.to_string());
            }
            "--history" => show_history = true,
            "--clear-history" => clear_history = true,
            "--check" => check = true,
            other if other.starts_with("--") => {
                return Err(format!("unknown arg: {other} (try --help)"))
            }
            url => urls.push(url.to_string()),
        }
        i += 1;
    }

    let base_dir = base_dir
        .or_else(default_base_dir)
        .ok_or_else(|| "could not determine base dir; pass --base-dir".to_string())?;
    let paths = AppPaths::new(base_dir);
    paths.ensure_dirs().map_err(|e| e.to_string())?;

    let settings = config::load_settings(&paths);
    logging::init_logging(&paths, settings.debug).map_err(|e| e.to_string())?;
    logging::log_startup_configuration(&paths, &settings);
    if let Ok(removed) = paths.purge_temp_dir() {
        if removed > 0 {
            log::info!("removed {removed} stale temp file(s)");
        }
    }

    if check {
        let missing = tools::check_executables(&paths);
        let ytdlp = tools::ytdlp_tools_status(&paths);
        let ffmpeg = tools::ffmpeg_tools_status(&paths);
        println!(
            "yt-dlp: {}",
            ytdlp.ytdlp_version.as_deref().unwrap_or("not found")
        );
        println!(
            "ffmpeg: {}",
            ffmpeg.ffmpeg_version.as_deref().unwrap_or("not found")
        );
        if !missing.is_empty() {
            return Err(format!("missing: {}", missing.join(", ")));
        }
        return Ok(());
    }

    let history = Arc::new(HistoryStore::open(&paths));
    if clear_history {
        if !history.clear() {
            return Err("could not clear history".to_string());
        }
        println!("History cleared.");
    }
    if show_history {
        print_history(&history);
    }

    if urls.is_empty() && redownload.is_empty() && playlists.is_empty() {
        if !show_history && !clear_history {
            return Err("nothing to do (pass URLs or --help)".to_string());
        }
        return Ok(());
    }

    let mut queue_config = QueueConfig::from_settings(&paths, &settings);
    if let Some(f) = format {
        queue_config.default_format = f;
    }
    if let Some(r) = resolution {
        queue_config.default_resolution = r;
    }
    if let Some(n) = concurrency {
        queue_config.max_concurrency = n;
    }
    let fetch_timeout = queue_config.fetch_timeout;

    let (events, consumer) = bridge::channel();
    let queue = DownloadQueue::new(queue_config, history.clone(), events);

    let entries = history.load();
    for index in redownload {
        let entry = entries
            .get(index)
            .ok_or_else(|| format!("no history entry at index {index}"))?;
        queue.requeue_history_entry(entry).map_err(|e| e.to_string())?;
    }
    for url in &urls {
        if let Err(err) = queue.add(url) {
            eprintln!("skipping {url}: {err}");
        }
    }
    for url in &playlists {
        println!("Listing playlist {url}...");
        match queue.add_playlist(url) {
            Ok(listing) => {
                while !listing.is_finished() {
                    std::thread::sleep(bridge::DEFAULT_DRAIN_INTERVAL);
                    drain_events(&consumer, &queue);
                }
                if let Err(err) = listing.wait() {
                    eprintln!("skipping playlist {url}: {err}");
                }
            }
            Err(err) => eprintln!("skipping playlist {url}: {err}"),
        }
    }
    drain_events(&consumer, &queue);
    if queue.is_empty() {
        return Err("no valid URLs".to_string());
    }

    let interrupted = queue.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        log::warn!("interrupted, canceling downloads");
        interrupted.cancel();
    }) {
        log::warn!("could not install Ctrl-C handler: {err}");
    }

    println!("Fetching metadata for {} item(s)...", queue.len());
    while !queue.wait_for_metadata(bridge::DEFAULT_DRAIN_INTERVAL) {
        drain_events(&consumer, &queue);
    }
    drain_events(&consumer, &queue);
    log::debug!("metadata settled (timeout per item {}s)", fetch_timeout.as_secs());

    let handle = queue.start_all().map_err(|e| e.to_string())?;
    let finished = Arc::new(AtomicBool::new(false));
    let waiter = {
        let finished = finished.clone();
        std::thread::spawn(move || {
            let summary = handle.wait();
            finished.store(true, Ordering::SeqCst);
            summary
        })
    };
    consumer.run(bridge::DEFAULT_DRAIN_INTERVAL, &finished, |event| {
        print_event(&queue, event)
    });
    let summary = waiter
        .join()
        .map_err(|_| "download run panicked".to_string())?;
    drain_events(&consumer, &queue);

    println!("Done: {}/{} downloaded.", summary.completed, summary.total);
    if summary.completed < summary.total {
        return Err(format!(
            "{} download(s) failed",
            summary.total - summary.completed
        ));
    }
    Ok(())
}

fn drain_events(consumer: &EventConsumer, queue: &DownloadQueue) {
    consumer.drain(|event| print_event(queue, event));
}

fn print_event(queue: &DownloadQueue, event: EngineEvent) -> Result<(), String> {
    let title = event
        .item_id()
        .and_then(|id| queue.item(id))
        .map(|item| item.display_title().to_string())
        .unwrap_or_default();
    match event {
        EngineEvent::MetadataReady {
            duration,
            size_bytes,
            ..
        } => {
            let size = size_bytes
                .map(|b| format!(", ~{}", format_size(b)))
                .unwrap_or_default();
            println!("Ready: {title} ({duration}{size})");
        }
        EngineEvent::Progress {
            fraction,
            speed,
            eta,
            ..
        } => {
            print!(
                "\r{:>5.1}%  {:<12} ETA {:<8} {title}",
                fraction * 100.0,
                speed.unwrap_or_default(),
                eta.unwrap_or_default()
            );
            std::io::stdout().flush().map_err(|e| e.to_string())?;
        }
        EngineEvent::Finished { output_path, .. } => {
            let location = output_path
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_else(|| "(output file not found)".to_string());
            println!("\nSaved: {location}");
        }
        EngineEvent::Failed { kind, message, .. } => {
            if kind.is_blocking() {
                eprintln!("\nERROR [{}] {title}: {message}", kind.label());
                if kind == bridge::FailureKind::Restricted {
                    eprintln!("  Set \"cookies_path\" in settings.json to a cookies.txt export.");
                }
            } else {
                eprintln!("\nFailed: {title}: {message}");
            }
        }
        EngineEvent::StatusChanged { id, status } => {
            log::debug!("{id}: {status}");
        }
        EngineEvent::PlaylistEntryAdded { index, .. } => {
            println!("  #{index}: {title}");
        }
        EngineEvent::PlaylistFinished { playlist_url, count } => {
            println!("Playlist {playlist_url}: {count} entr(ies) queued");
        }
        EngineEvent::PlaylistFailed {
            playlist_url,
            kind,
            message,
        } => {
            eprintln!("ERROR [{}] playlist {playlist_url}: {message}", kind.label());
        }
        EngineEvent::RunFinished { .. } => {}
    }
    Ok(())
}

fn print_history(history: &HistoryStore) {
    let entries = history.load();
    if entries.is_empty() {
        println!("History is empty.");
        return;
    }
    for (index, entry) in entries.iter().enumerate() {
        println!(
            "{index:>3}  {}  [{} {}]  {}",
            entry.title, entry.format, entry.resolution, entry.url
        );
    }
}

fn default_base_dir() -> Option<PathBuf> {
    if let Ok(v) = std::env::var("REELQ_BASE_DIR") {
        let t = v.trim();
        if !t.is_empty() {
            return Some(PathBuf::from(t));
        }
    }

    if cfg!(windows) {
        if let Ok(appdata) = std::env::var("APPDATA") {
            let t = appdata.trim();
            if !t.is_empty() {
                return Some(PathBuf::from(t).join("reelq"));
            }
        }
    }

    std::env::var("HOME")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .map(|h| PathBuf::from(h).join(".reelq"))
}

fn print_help() {
    println!(
        r#"reelq

Queues media URLs, fetches their metadata and downloads them with yt-dlp.

Usage:
  reelq [options] <url>...
  reelq --playlist <url>
  reelq --history
  reelq --check

Options:
  --base-dir <path>      Override base dir (default: $REELQ_BASE_DIR, %APPDATA%\reelq or ~/.reelq)
  --format <fmt>         mp4, mkv, webm or m4a (default: settings.json)
  --resolution <res>     best, 2160p, 1440p, 1080p, 720p, ... (default: settings.json)
  --concurrency <n>      Parallel downloads, 1-8 (default: settings.json)
  --playlist <url>       Queue every entry of a playlist
  --redownload <index>   Queue a history entry again (see --history)
  --history              List past downloads, newest first
  --clear-history        Delete all history entries
  --check                Report whether yt-dlp and ffmpeg can be run
"#
    );
}
