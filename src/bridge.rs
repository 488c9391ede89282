use crate::format::{OutputFormat, Resolution};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Restricted,
    ToolMissing,
    Canceled,
    Timeout,
    Other,
}

impl FailureKind {
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::Restricted => "restricted",
            FailureKind::ToolMissing => "tool_missing",
            FailureKind::Canceled => "canceled",
            FailureKind::Timeout => "timeout",
            FailureKind::Other => "other",
        }
    }

    /// Whether the consumer should interrupt the user instead of showing a
    /// passing notice.
    pub fn is_blocking(&self) -> bool {
        matches!(self, FailureKind::Restricted | FailureKind::ToolMissing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Pending,
    Fetching,
    Ready,
    Downloading,
    Done,
    Error,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Fetching => "fetching",
            ItemStatus::Ready => "ready",
            ItemStatus::Downloading => "downloading",
            ItemStatus::Done => "done",
            ItemStatus::Error => "error",
        }
    }

    /// Forward-only lifecycle. `Error -> Downloading` is the retry edge taken
    /// by a new run.
    pub fn can_transition_to(&self, next: ItemStatus) -> bool {
        use ItemStatus::*;
        matches!(
            (self, next),
            (Pending, Fetching)
                | (Fetching, Ready)
                | (Fetching, Error)
                | (Ready, Downloading)
                | (Ready, Error)
                | (Error, Downloading)
                | (Downloading, Done)
                | (Downloading, Error)
        )
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    StatusChanged {
        id: String,
        status: ItemStatus,
    },
    MetadataReady {
        id: String,
        title: String,
        uploader: String,
        duration: String,
        resolutions: Vec<Resolution>,
        size_bytes: Option<u64>,
    },
    Progress {
        id: String,
        fraction: f32,
        speed: Option<String>,
        eta: Option<String>,
    },
    Finished {
        id: String,
        output_path: Option<PathBuf>,
        format: OutputFormat,
    },
    Failed {
        id: String,
        kind: FailureKind,
        message: String,
    },
    RunFinished {
        completed: usize,
        total: usize,
    },
    PlaylistEntryAdded {
        playlist_url: String,
        index: usize,
        id: String,
        title: String,
    },
    PlaylistFinished {
        playlist_url: String,
        count: usize,
    },
    PlaylistFailed {
        playlist_url: String,
        kind: FailureKind,
        message: String,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::StatusChanged { .. } => "status_changed",
            EngineEvent::MetadataReady { .. } => "metadata_ready",
            EngineEvent::Progress { .. } => "progress",
            EngineEvent::Finished { .. } => "finished",
            EngineEvent::Failed { .. } => "failed",
            EngineEvent::RunFinished { .. } => "run_finished",
            EngineEvent::PlaylistEntryAdded { .. } => "playlist_entry_added",
            EngineEvent::PlaylistFinished { .. } => "playlist_finished",
            EngineEvent::PlaylistFailed { .. } => "playlist_failed",
        }
    }

    pub fn item_id(&self) -> Option<&str> {
        match self {
            EngineEvent::StatusChanged { id, .. }
            | EngineEvent::MetadataReady { id, .. }
            | EngineEvent::Progress { id, .. }
            | EngineEvent::Finished { id, .. }
            | EngineEvent::Failed { id, .. }
            | EngineEvent::PlaylistEntryAdded { id, .. } => Some(id),
            EngineEvent::RunFinished { .. }
            | EngineEvent::PlaylistFinished { .. }
            | EngineEvent::PlaylistFailed { .. } => None,
        }
    }
}

pub fn channel() -> (EventSender, EventConsumer) {
    let (tx, rx) = mpsc::channel();
    (EventSender { tx }, EventConsumer { rx })
}

#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<EngineEvent>,
}

impl EventSender {
    /// Returns false once the consumer is gone.
    pub fn send(&self, event: EngineEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(err) => {
                log::trace!("event dropped, consumer gone: {}", err.0.kind());
                false
            }
        }
    }
}

#[derive(Debug)]
pub struct EventConsumer {
    rx: Receiver<EngineEvent>,
}

impl EventConsumer {
    /// A failing or panicking handler is logged and skipped.
    pub fn drain<F>(&self, mut handler: F) -> usize
    where
        F: FnMut(EngineEvent) -> Result<(), String>,
    {
        let mut taken = 0;
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    taken += 1;
                    dispatch(&mut handler, event);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        taken
    }

    /// Drains every `interval` until `stop` is set or every sender has been
    /// dropped and nothing is left to take.
    pub fn run<F>(&self, interval: Duration, stop: &AtomicBool, mut handler: F)
    where
        F: FnMut(EngineEvent) -> Result<(), String>,
    {
        while !stop.load(Ordering::SeqCst) {
            match self.rx.recv_timeout(interval) {
                Ok(event) => {
                    dispatch(&mut handler, event);
                    self.drain(&mut handler);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }
}

fn dispatch<F>(handler: &mut F, event: EngineEvent)
where
    F: FnMut(EngineEvent) -> Result<(), String>,
{
    let kind = event.kind();
    match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => log::error!("event handler failed on {kind}: {err}"),
        Err(_) => log::error!("event handler panicked on {kind}"),
    }
}
