use crate::bridge::{EngineEvent, EventSender};
use crate::cmd::{ToolProgram, YtDlpInvocation};
use crate::config::{Settings, MAX_CONCURRENCY_LIMIT};
use crate::format::{build_format_selector, OutputFormat, Resolution};
use crate::history::{HistoryEntry, HistoryStore};
use crate::metadata::{self, MediaInfo, StreamFormat};
use crate::paths::{self, AppPaths};
use crate::progress::ProgressUpdate;
use crate::supervisor::Supervisor;
use crate::thumbnail;
use crate::{EngineError, Result};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub use crate::bridge::ItemStatus;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub ytdlp: ToolProgram,
    pub ffmpeg: ToolProgram,
    pub output_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub filename_template: String,
    pub cookies_path: Option<PathBuf>,
    pub max_concurrency: usize,
    pub default_format: OutputFormat,
    pub default_resolution: Resolution,
    pub fetch_timeout: Duration,
    pub embed_thumbnail: bool,
}

impl QueueConfig {
    pub fn from_settings(paths: &AppPaths, settings: &Settings) -> Self {
        Self {
            ytdlp: ToolProgram::new(paths.ytdlp_cmd()),
            ffmpeg: ToolProgram::new(paths.ffmpeg_cmd()),
            output_dir: settings.output_dir(),
            temp_dir: paths.temp_dir(),
            filename_template: settings.filename_template().to_string(),
            cookies_path: settings.cookies_file(),
            max_concurrency: settings.effective_concurrency(),
            default_format: settings.output_format(),
            default_resolution: settings.resolution(),
            fetch_timeout: metadata::DEFAULT_FETCH_TIMEOUT,
            embed_thumbnail: settings.embed_thumbnail,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub id: String,
    pub url: String,
    pub title: String,
    pub uploader: String,
    pub duration: String,
    pub thumbnail_url: Option<String>,
    pub format: OutputFormat,
    pub resolution: Resolution,
    pub format_selector: String,
    pub status: ItemStatus,
    pub progress: f32,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub size_bytes: Option<u64>,
    pub error: Option<String>,
    pub formats: Vec<StreamFormat>,
    pub resolutions: Vec<Resolution>,
    pub output_path: Option<PathBuf>,
    pub redownload: bool,
}

impl WorkItem {
    fn new(url: &str, format: OutputFormat, resolution: Resolution) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.to_string(),
            title: String::new(),
            uploader: String::new(),
            duration: String::new(),
            thumbnail_url: None,
            format,
            resolution,
            format_selector: build_format_selector(format, resolution),
            status: ItemStatus::Pending,
            progress: 0.0,
            speed: None,
            eta: None,
            size_bytes: None,
            error: None,
            formats: Vec::new(),
            resolutions: vec![Resolution::Best],
            output_path: None,
            redownload: false,
        }
    }

    pub fn display_title(&self) -> &str {
        if self.title.trim().is_empty() {
            &self.url
        } else {
            &self.title
        }
    }

    fn apply_metadata(&mut self, info: &MediaInfo) {
        self.title = info.title.clone();
        self.uploader = info.uploader_label();
        self.duration = info.duration_label();
        self.thumbnail_url = info.thumbnail.clone().filter(|t| !t.trim().is_empty());
        self.formats = info.formats.clone();
        self.resolutions = info.available_resolutions();
        self.size_bytes = info.estimate_size(self.format, self.resolution);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub total: usize,
}

/// Handle on a download run started by [`DownloadQueue::start_all`].
#[derive(Debug)]
pub struct RunHandle {
    handle: JoinHandle<RunSummary>,
}

impl RunHandle {
    pub fn wait(self) -> RunSummary {
        self.handle.join().unwrap_or(RunSummary {
            completed: 0,
            total: 0,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Handle on a background playlist listing started by
/// [`DownloadQueue::add_playlist`].
#[derive(Debug)]
pub struct PlaylistHandle {
    handle: JoinHandle<Result<Vec<String>>>,
}

impl PlaylistHandle {
    /// Ids of the queued entries, in playlist order.
    pub fn wait(self) -> Result<Vec<String>> {
        self.handle
            .join()
            .unwrap_or_else(|_| Err(EngineError::Io(std::io::Error::other("playlist worker panicked"))))
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[derive(Debug)]
struct Inner {
    config: QueueConfig,
    history: Arc<HistoryStore>,
    events: EventSender,
    items: Mutex<Vec<WorkItem>>,
    active: Mutex<HashMap<String, Arc<Supervisor>>>,
    running: AtomicBool,
    stop: Arc<AtomicBool>,
}

#[derive(Debug, Clone)]
pub struct DownloadQueue {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Accepts absolute http(s) URLs with a host.
pub fn validate_url(raw: &str) -> Result<url::Url> {
    let trimmed = raw.trim();
    let parsed = url::Url::parse(trimmed).map_err(|e| EngineError::InvalidUrl(format!("{trimmed}: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(EngineError::InvalidUrl(format!(
            "{trimmed}: unsupported scheme {}",
            parsed.scheme()
        )));
    }
    if parsed.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(EngineError::InvalidUrl(format!("{trimmed}: missing host")));
    }
    Ok(parsed)
}

impl DownloadQueue {
    pub fn new(mut config: QueueConfig, history: Arc<HistoryStore>, events: EventSender) -> Self {
        config.max_concurrency = config.max_concurrency.clamp(1, MAX_CONCURRENCY_LIMIT);
        Self {
            inner: Arc::new(Inner {
                config,
                history,
                events,
                items: Mutex::new(Vec::new()),
                active: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                stop: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn add(&self, url: &str) -> Result<String> {
        let config = &self.inner.config;
        self.add_with_options(url, config.default_format, config.default_resolution)
    }

    pub fn add_with_options(&self, url: &str, format: OutputFormat, resolution: Resolution) -> Result<String> {
        self.push_item(url, format, resolution, false)
    }

    /// Queues a history entry again with the format and resolution it was
    /// originally downloaded with.
    pub fn requeue_history_entry(&self, entry: &HistoryEntry) -> Result<String> {
        let format = OutputFormat::parse(&entry.format).unwrap_or(self.inner.config.default_format);
        let resolution =
            Resolution::parse(&entry.resolution).unwrap_or(self.inner.config.default_resolution);
        self.push_item(&entry.url, format, resolution, true)
    }

    fn push_item(&self, url: &str, format: OutputFormat, resolution: Resolution, redownload: bool) -> Result<String> {
        let parsed = validate_url(url)?;
        let mut item = WorkItem::new(parsed.as_str(), format, resolution);
        item.redownload = redownload;
        let id = self.inner.insert_item(item);

        self.inner.transition(&id, ItemStatus::Fetching);
        let inner = self.inner.clone();
        let fetch_id = id.clone();
        let fetch_url = parsed.to_string();
        thread::spawn(move || inner.fetch_metadata(&fetch_id, &fetch_url));
        Ok(id)
    }

    /// Entries are appended as yt-dlp lists them and go straight to `Ready`.
    pub fn add_playlist(&self, url: &str) -> Result<PlaylistHandle> {
        let parsed = validate_url(url)?;
        let inner = self.inner.clone();
        let playlist_url = parsed.to_string();
        let handle = thread::spawn(move || inner.fetch_playlist(&playlist_url));
        Ok(PlaylistHandle { handle })
    }

    /// Changes format and resolution of an item that is not busy. Returns
    /// whether the change was applied.
    pub fn set_item_options(&self, id: &str, format: OutputFormat, resolution: Resolution) -> Result<bool> {
        let mut items = lock(&self.inner.items);
        let item = items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| EngineError::UnknownItem(id.to_string()))?;
        if !matches!(item.status, ItemStatus::Ready | ItemStatus::Error) {
            log::debug!("ignoring option change for {id} while {}", item.status);
            return Ok(false);
        }
        item.format = format;
        item.resolution = resolution;
        item.format_selector = build_format_selector(format, resolution);
        item.size_bytes = metadata::estimate_size(&item.formats, format, resolution);
        Ok(true)
    }

    /// Removes the item at `index`. A worker still busy with it keeps running
    /// but its updates no longer land anywhere.
    pub fn remove(&self, index: usize) -> Option<WorkItem> {
        let mut items = lock(&self.inner.items);
        if index < items.len() {
            Some(items.remove(index))
        } else {
            None
        }
    }

    pub fn remove_id(&self, id: &str) -> bool {
        let mut items = lock(&self.inner.items);
        let before = items.len();
        items.retain(|i| i.id != id);
        items.len() != before
    }

    pub fn clear(&self) {
        lock(&self.inner.items).clear();
    }

    pub fn items(&self) -> Vec<WorkItem> {
        lock(&self.inner.items).clone()
    }

    pub fn item(&self, id: &str) -> Option<WorkItem> {
        lock(&self.inner.items).iter().find(|i| i.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Waits until no item is pending or fetching. Returns false on timeout.
    pub fn wait_for_metadata(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        loop {
            let busy = lock(&self.inner.items)
                .iter()
                .any(|i| matches!(i.status, ItemStatus::Pending | ItemStatus::Fetching));
            if !busy {
                return true;
            }
            if started.elapsed() >= timeout {
                return false;
            }
            thread::sleep(Duration::from_millis(25));
        }
    }

    /// Downloads every `Ready` or `Error` item, in list order.
    pub fn start_all(&self) -> Result<RunHandle> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::QueueBusy);
        }
        self.inner.stop.store(false, Ordering::SeqCst);

        let ids: VecDeque<String> = lock(&self.inner.items)
            .iter()
            .filter(|i| matches!(i.status, ItemStatus::Ready | ItemStatus::Error))
            .map(|i| i.id.clone())
            .collect();
        let total = ids.len();
        let workers = self.inner.config.max_concurrency.min(total).max(1);
        log::info!("starting run: {total} item(s), {workers} worker(s)");

        let inner = self.inner.clone();
        let handle = thread::spawn(move || inner.run_all(ids, workers));
        Ok(RunHandle { handle })
    }

    /// Stops the current run. The active downloads end in `Error`; items that
    /// had not started yet keep their status.
    pub fn cancel(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        let active: Vec<Arc<Supervisor>> = lock(&self.inner.active).values().cloned().collect();
        if !active.is_empty() {
            log::info!("canceling {} active download(s)", active.len());
        }
        for supervisor in active {
            supervisor.cancel();
        }
    }
}

impl Inner {
    fn transition(&self, id: &str, next: ItemStatus) -> bool {
        let mut items = lock(&self.items);
        let Some(item) = items.iter_mut().find(|i| i.id == id) else {
            return false;
        };
        if !item.status.can_transition_to(next) {
            log::debug!("ignoring transition {} -> {next} for {id}", item.status);
            return false;
        }
        log::debug!("{id}: {} -> {next}", item.status);
        item.status = next;
        self.events.send(EngineEvent::StatusChanged {
            id: id.to_string(),
            status: next,
        });
        true
    }

    fn update_item(&self, id: &str, change: impl FnOnce(&mut WorkItem)) -> Option<WorkItem> {
        let mut items = lock(&self.items);
        let item = items.iter_mut().find(|i| i.id == id)?;
        change(item);
        Some(item.clone())
    }

    fn fail(&self, id: &str, err: &EngineError) {
        let message = err.to_string();
        log::warn!("{id} failed: {message}");
        self.update_item(id, |item| {
            item.error = Some(message.clone());
            item.speed = None;
            item.eta = None;
        });
        if self.transition(id, ItemStatus::Error) {
            self.events.send(EngineEvent::Failed {
                id: id.to_string(),
                kind: err.failure_kind(),
                message,
            });
        }
    }

    fn insert_item(&self, item: WorkItem) -> String {
        let id = item.id.clone();
        log::info!("queued {} as {id}", item.url);
        lock(&self.items).push(item);
        self.events.send(EngineEvent::StatusChanged {
            id: id.clone(),
            status: ItemStatus::Pending,
        });
        id
    }

    fn mark_ready(&self, id: &str, info: &MediaInfo) {
        let mut applied = false;
        let Some(item) = self.update_item(id, |item| {
            if item.status == ItemStatus::Fetching {
                item.apply_metadata(info);
                applied = true;
            }
        }) else {
            log::debug!("metadata for removed item {id} discarded");
            return;
        };
        if !applied {
            return;
        }
        // Sent before the status flips so a consumer that sees Ready
        // already has the descriptive fields.
        self.events.send(EngineEvent::MetadataReady {
            id: id.to_string(),
            title: item.title,
            uploader: item.uploader,
            duration: item.duration,
            resolutions: item.resolutions,
            size_bytes: item.size_bytes,
        });
        self.transition(id, ItemStatus::Ready);
    }

    fn fetch_playlist(&self, playlist_url: &str) -> Result<Vec<String>> {
        let config = &self.config;
        let mut ids = Vec::new();
        let result = metadata::fetch_playlist(
            &config.ytdlp,
            playlist_url,
            config.cookies_path.as_deref(),
            config.fetch_timeout,
            |entry| {
                let Ok(parsed) = validate_url(&entry.url) else {
                    log::warn!("playlist entry {} has no usable url: {}", entry.index, entry.url);
                    return;
                };
                let item = WorkItem::new(parsed.as_str(), config.default_format, config.default_resolution);
                let id = self.insert_item(item);
                self.transition(&id, ItemStatus::Fetching);
                self.mark_ready(&id, &entry.to_media_info());
                self.events.send(EngineEvent::PlaylistEntryAdded {
                    playlist_url: playlist_url.to_string(),
                    index: entry.index,
                    id: id.clone(),
                    title: entry.title.clone(),
                });
                ids.push(id);
            },
        );
        match result {
            Ok(count) => {
                self.events.send(EngineEvent::PlaylistFinished {
                    playlist_url: playlist_url.to_string(),
                    count,
                });
                Ok(ids)
            }
            Err(err) => {
                log::warn!("playlist {playlist_url} failed: {err}");
                self.events.send(EngineEvent::PlaylistFailed {
                    playlist_url: playlist_url.to_string(),
                    kind: err.failure_kind(),
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn fetch_metadata(&self, id: &str, url: &str) {
        let config = &self.config;
        let result = metadata::fetch_metadata(
            &config.ytdlp,
            url,
            config.cookies_path.as_deref(),
            config.fetch_timeout,
        );
        match result {
            Ok(info) => self.mark_ready(id, &info),
            Err(err) => self.fail(id, &err),
        }
    }

    fn run_all(self: Arc<Self>, ids: VecDeque<String>, workers: usize) -> RunSummary {
        let total = ids.len();
        let pending = Arc::new(Mutex::new(ids));
        let completed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let inner = self.clone();
            let pending = pending.clone();
            let completed = completed.clone();
            handles.push(thread::spawn(move || loop {
                if inner.stop.load(Ordering::SeqCst) {
                    break;
                }
                let Some(id) = lock(&pending).pop_front() else {
                    break;
                };
                if inner.download(&id) {
                    completed.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            if handle.join().is_err() {
                log::error!("download worker panicked");
            }
        }

        let summary = RunSummary {
            completed: completed.load(Ordering::SeqCst),
            total,
        };
        log::info!("run finished: {}/{} completed", summary.completed, summary.total);
        self.running.store(false, Ordering::SeqCst);
        self.events.send(EngineEvent::RunFinished {
            completed: summary.completed,
            total: summary.total,
        });
        summary
    }

    fn download(&self, id: &str) -> bool {
        // Registered before the status flips so a concurrent cancel always
        // reaches this item's process.
        let supervisor = Arc::new(Supervisor::with_stop_flag(self.stop.clone()));
        lock(&self.active).insert(id.to_string(), supervisor.clone());
        let result = self.download_with(id, &supervisor);
        lock(&self.active).remove(id);
        result
    }

    fn download_with(&self, id: &str, supervisor: &Supervisor) -> bool {
        if self.stop.load(Ordering::SeqCst) || !self.transition(id, ItemStatus::Downloading) {
            return false;
        }
        let Some(item) = self.update_item(id, |item| {
            item.progress = 0.0;
            item.error = None;
            item.output_path = None;
        }) else {
            return false;
        };

        let config = &self.config;
        if let Err(err) = std::fs::create_dir_all(&config.output_dir) {
            self.fail(id, &EngineError::Io(err));
            return false;
        }

        let invocation = YtDlpInvocation {
            program: config.ytdlp.clone(),
            url: item.url.clone(),
            output_dir: config.output_dir.clone(),
            filename_template: config.filename_template.clone(),
            format_selector: item.format_selector.clone(),
            cookies_path: config.cookies_path.clone(),
        };
        let result = supervisor.run(&invocation.program, &invocation.args(), |update| {
            self.report_progress(id, update)
        });

        match result {
            Ok(announced) => {
                self.finish(&item, announced);
                true
            }
            Err(err) => {
                self.fail(id, &err);
                false
            }
        }
    }

    // Lines without a percent count as 0.0.
    fn report_progress(&self, id: &str, update: &ProgressUpdate) {
        let fraction = update.fraction().unwrap_or(0.0);
        self.update_item(id, |item| {
            item.progress = fraction;
            if update.speed.is_some() {
                item.speed = update.speed.clone();
            }
            if update.eta.is_some() {
                item.eta = update.eta.clone();
            }
        });
        self.events.send(EngineEvent::Progress {
            id: id.to_string(),
            fraction,
            speed: update.speed.clone(),
            eta: update.eta.clone(),
        });
    }

    fn finish(&self, item: &WorkItem, announced: Option<PathBuf>) {
        let config = &self.config;
        let output_path = announced
            .filter(|p| p.exists())
            .or_else(|| paths::newest_file_in(&config.output_dir));

        let thumbnail_embedded = match (&output_path, &item.thumbnail_url) {
            (Some(path), Some(thumb)) if config.embed_thumbnail => {
                thumbnail::embed_thumbnail(&config.ffmpeg, &config.temp_dir, path, thumb)
            }
            _ => false,
        };

        let entry = HistoryEntry {
            url: item.url.clone(),
            title: item.display_title().to_string(),
            uploader: item.uploader.clone(),
            duration: item.duration.clone(),
            format: item.format.as_str().to_string(),
            resolution: item.resolution.label(),
            download_path: config.output_dir.to_string_lossy().to_string(),
            completed_at_ms: now_ms(),
            thumbnail_embedded,
            redownloaded: item.redownload,
        };
        if !self.history.append(entry) {
            log::warn!("history entry for {} was not saved", item.id);
        }

        self.update_item(&item.id, |it| {
            it.progress = 1.0;
            it.speed = None;
            it.eta = None;
            it.output_path = output_path.clone();
        });
        if self.transition(&item.id, ItemStatus::Done) {
            self.events.send(EngineEvent::Finished {
                id: item.id.clone(),
                output_path: output_path.clone(),
                format: item.format,
            });
        }
        log::info!(
            "{} finished: {}",
            item.id,
            output_path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(no output file found)".to_string())
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_url_requires_http_and_host() {
        assert!(validate_url("https://www.youtube.com/watch?v=abc").is_ok());
        assert!(validate_url("  http://example.com/v  ").is_ok());
        for bad in ["", "not a url", "ftp://example.com/v", "file:///tmp/x", "mailto:a@b.c"] {
            assert!(
                matches!(validate_url(bad), Err(EngineError::InvalidUrl(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn new_item_has_selector_for_its_options() {
        let item = WorkItem::new("https://e.com/v", OutputFormat::M4a, Resolution::Best);
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.format_selector, build_format_selector(OutputFormat::M4a, Resolution::Best));
        assert_eq!(item.display_title(), "https://e.com/v");
        assert_eq!(uuid::Uuid::parse_str(&item.id).map(|u| u.get_version_num()).ok(), Some(4));
    }

    #[test]
    fn metadata_fills_descriptive_fields() {
        let mut item = WorkItem::new("https://e.com/v", OutputFormat::Mp4, Resolution::Best);
        let info = MediaInfo {
            title: "Clip".to_string(),
            uploader: Some("Up".to_string()),
            duration: Some(90.0),
            thumbnail: Some(String::new()),
            ..MediaInfo::default()
        };
        item.apply_metadata(&info);
        assert_eq!(item.display_title(), "Clip");
        assert_eq!(item.duration, "1:30");
        assert_eq!(item.thumbnail_url, None);
        assert_eq!(item.resolutions, vec![Resolution::Best]);
    }
}
