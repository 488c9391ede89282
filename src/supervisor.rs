use crate::cmd::ToolProgram;
use crate::progress::{self, LineKind, ProgressUpdate};
use crate::{EngineError, Result};
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const TERMINATE_GRACE: Duration = Duration::from_millis(200);
const TERMINATE_POLL: Duration = Duration::from_millis(20);
/// How long output still buffered in the pipes is collected after exit.
const EXIT_DRAIN_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
pub struct Supervisor {
    child: Mutex<Option<Child>>,
    cancel_requested: AtomicBool,
    stop_flag: Option<Arc<AtomicBool>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// A supervisor that also treats `flag` being set as a cancel request.
    pub fn with_stop_flag(flag: Arc<AtomicBool>) -> Self {
        Self {
            stop_flag: Some(flag),
            ..Self::default()
        }
    }

    pub fn is_running(&self) -> bool {
        let mut guard = self.lock_child();
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Returns the announced output path on exit code 0.
    pub fn run<F>(&self, program: &ToolProgram, args: &[String], mut on_progress: F) -> Result<Option<PathBuf>>
    where
        F: FnMut(&ProgressUpdate),
    {
        let tool = program.name();
        if program.is_missing_path() {
            return Err(EngineError::ExternalToolMissing { tool });
        }

        let (tx, rx) = mpsc::channel::<String>();
        {
            let mut guard = self.lock_child();
            if let Some(existing) = guard.as_mut() {
                if matches!(existing.try_wait(), Ok(None)) {
                    return Err(EngineError::SupervisorBusy);
                }
            }
            self.cancel_requested.store(false, Ordering::SeqCst);

            let mut cmd = program.command();
            cmd.args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            let mut child = cmd.spawn().map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    EngineError::ExternalToolMissing { tool: tool.clone() }
                }
                _ => EngineError::Io(e),
            })?;
            log::info!("started {tool} (pid {})", child.id());

            if let Some(stdout) = child.stdout.take() {
                spawn_line_reader(stdout, tx.clone());
            }
            if let Some(stderr) = child.stderr.take() {
                spawn_line_reader(stderr, tx.clone());
            }
            *guard = Some(child);
        }
        drop(tx);

        let mut output_path: Option<PathBuf> = None;
        let mut exited_at: Option<Instant> = None;
        loop {
            // Checked every iteration: a chatty tool never lets recv time out.
            if self.stop_requested() {
                self.terminate();
                self.reap();
                return Err(EngineError::Canceled);
            }
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(line) => match progress::parse_line(&line) {
                    LineKind::Restricted => {
                        log::warn!("{tool} reported restricted content: {line}");
                        self.terminate();
                        self.reap();
                        return Err(EngineError::RestrictedContent(
                            progress::RESTRICTED_MESSAGE.to_string(),
                        ));
                    }
                    LineKind::Output {
                        update,
                        destination,
                    } => {
                        log::trace!("{tool}: {}", update.raw);
                        if let Some(dest) = destination {
                            output_path = Some(dest);
                        }
                        on_progress(&update);
                    }
                },
                Err(RecvTimeoutError::Timeout) => {
                    // A grandchild can keep the pipes open after the tool
                    // itself exited; stop listening shortly after exit.
                    match exited_at {
                        Some(at) if at.elapsed() >= EXIT_DRAIN_WINDOW => break,
                        Some(_) => {}
                        None => {
                            if self.has_exited() {
                                exited_at = Some(Instant::now());
                            }
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let status = self.wait_for_exit()?;
        if status.success() {
            log::info!("{tool} finished");
            Ok(output_path)
        } else if self.stop_requested() {
            Err(EngineError::Canceled)
        } else {
            log::warn!("{tool} exited with {status}");
            Err(EngineError::NonZeroExit {
                tool,
                code: status.code(),
            })
        }
    }

    /// Asks the running process to stop, escalating to a kill after a short
    /// grace period. No-op when nothing is running.
    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.terminate();
    }

    fn stop_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
            || self
                .stop_flag
                .as_ref()
                .map(|f| f.load(Ordering::SeqCst))
                .unwrap_or(false)
    }

    fn lock_child(&self) -> MutexGuard<'_, Option<Child>> {
        match self.child.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn has_exited(&self) -> bool {
        let mut guard = self.lock_child();
        match guard.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    fn terminate(&self) {
        let mut guard = self.lock_child();
        let Some(child) = guard.as_mut() else {
            return;
        };
        if !matches!(child.try_wait(), Ok(None)) {
            return;
        }

        request_graceful_exit(child);
        let started = Instant::now();
        while started.elapsed() < TERMINATE_GRACE {
            if !matches!(child.try_wait(), Ok(None)) {
                return;
            }
            thread::sleep(TERMINATE_POLL);
        }
        log::debug!("process {} ignored termination; killing", child.id());
        let _ = child.kill();
    }

    fn reap(&self) {
        let mut guard = self.lock_child();
        if let Some(mut child) = guard.take() {
            let _ = child.wait();
        }
    }

    fn wait_for_exit(&self) -> Result<ExitStatus> {
        loop {
            {
                let mut guard = self.lock_child();
                let Some(child) = guard.as_mut() else {
                    return Err(EngineError::Canceled);
                };
                if let Some(status) = child.try_wait()? {
                    guard.take();
                    return Ok(status);
                }
            }
            if self.stop_requested() {
                self.terminate();
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

pub(crate) fn spawn_line_reader<R: Read + Send + 'static>(stream: R, tx: Sender<String>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    // Progress redraws may be separated by carriage returns.
                    for part in line.split('\r') {
                        let part = part.trim();
                        if part.is_empty() {
                            continue;
                        }
                        if tx.send(part.to_string()).is_err() {
                            return;
                        }
                    }
                }
            }
        }
    });
}

#[cfg(unix)]
fn request_graceful_exit(child: &mut Child) {
    let pid = child.id().to_string();
    let sent = crate::cmd::command("kill")
        .args(["-TERM", &pid])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if !sent {
        let _ = child.kill();
    }
}

#[cfg(windows)]
fn request_graceful_exit(child: &mut Child) {
    let pid = child.id().to_string();
    let _ = crate::cmd::command("taskkill")
        .args(["/PID", &pid, "/T"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binary_fails_without_spawning() {
        let supervisor = Supervisor::new();
        let program = ToolProgram::new("/nonexistent/dir/yt-dlp");
        let err = supervisor
            .run(&program, &[], |_| panic!("no output expected"))
            .expect_err("must fail");
        assert!(matches!(err, EngineError::ExternalToolMissing { ref tool } if tool == "yt-dlp"));
        assert!(!supervisor.is_running());
    }

    #[test]
    fn cancel_without_process_is_a_noop() {
        let supervisor = Supervisor::new();
        supervisor.cancel();
        supervisor.cancel();
        assert!(!supervisor.is_running());
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::path::Path;

        fn script(dir: &Path, body: &str) -> ToolProgram {
            let path = dir.join("fake-tool.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
            ToolProgram::with_prefix("sh", vec![path.to_string_lossy().to_string()])
        }

        #[test]
        fn reports_progress_for_every_line_and_returns_destination() {
            let dir = tempfile::tempdir().expect("tempdir");
            let program = script(
                dir.path(),
                r#"echo "[youtube] abc: Downloading webpage"
echo "[download] Destination: /tmp/out/Clip.mp4"
echo "[download]  50.0% of 1.00MiB at 1.00MiB/s ETA 00:01"
echo "some warning" >&2
echo "[download] 100.0% of 1.00MiB at 1.00MiB/s ETA 00:00"
exit 0"#,
            );

            let supervisor = Supervisor::new();
            let mut updates = Vec::new();
            let out = supervisor
                .run(&program, &[], |u| updates.push(u.clone()))
                .expect("run");

            assert_eq!(out, Some(PathBuf::from("/tmp/out/Clip.mp4")));
            assert_eq!(updates.len(), 5);
            for update in &updates {
                if let Some(f) = update.fraction() {
                    assert!((0.0..=1.0).contains(&f));
                }
            }
            let percents: Vec<Option<f32>> = updates
                .iter()
                .filter(|u| u.raw.starts_with("[download]"))
                .map(|u| u.percent)
                .collect();
            assert_eq!(percents, vec![None, Some(50.0), Some(100.0)]);
            assert!(!supervisor.is_running());
        }

        #[test]
        fn nonzero_exit_reports_code() {
            let dir = tempfile::tempdir().expect("tempdir");
            let program = script(dir.path(), "echo 'ERROR: unsupported url'\nexit 3");
            let err = Supervisor::new()
                .run(&program, &[], |_| {})
                .expect_err("must fail");
            assert!(matches!(err, EngineError::NonZeroExit { code: Some(3), .. }));
            assert!(err.to_string().ends_with("exited with code 3"));
        }

        #[test]
        fn restricted_line_terminates_before_exit_code_is_seen() {
            let dir = tempfile::tempdir().expect("tempdir");
            let program = script(
                dir.path(),
                "echo 'ERROR: [youtube] abc: Sign in to confirm your age'\nsleep 10\nexit 1",
            );

            let started = Instant::now();
            let mut seen = 0;
            let err = Supervisor::new()
                .run(&program, &[], |_| seen += 1)
                .expect_err("must fail");
            assert!(matches!(err, EngineError::RestrictedContent(_)));
            assert_eq!(seen, 0);
            assert!(started.elapsed() < Duration::from_secs(5));
        }

        #[test]
        fn cancel_from_another_thread_stops_the_run() {
            let dir = tempfile::tempdir().expect("tempdir");
            let program = script(dir.path(), "echo '[download]   1.0% of 9.00MiB'\nsleep 10\nexit 0");

            let supervisor = Arc::new(Supervisor::new());
            let canceller = supervisor.clone();
            let handle = thread::spawn(move || {
                thread::sleep(Duration::from_millis(300));
                canceller.cancel();
                canceller.cancel();
            });

            let started = Instant::now();
            let err = supervisor.run(&program, &[], |_| {}).expect_err("canceled");
            handle.join().expect("join");
            assert!(matches!(err, EngineError::Canceled));
            assert!(started.elapsed() < Duration::from_secs(5));
            assert!(!supervisor.is_running());
        }

        #[test]
        fn stop_flag_is_seen_while_output_keeps_flowing() {
            let dir = tempfile::tempdir().expect("tempdir");
            let program = script(
                dir.path(),
                r#"i=0
while [ $i -lt 60 ]; do
  echo "[download] $i.0% of 9.00MiB at 1.00MiB/s ETA 00:09"
  sleep 0.05
  i=$((i+1))
done
exit 0"#,
            );
            let flag = Arc::new(AtomicBool::new(false));
            let supervisor = Supervisor::with_stop_flag(flag.clone());

            let setter = thread::spawn(move || {
                thread::sleep(Duration::from_millis(200));
                flag.store(true, Ordering::SeqCst);
            });
            let started = Instant::now();
            let mut lines = 0;
            let err = supervisor.run(&program, &[], |_| lines += 1).expect_err("stopped");
            setter.join().expect("join");
            assert!(matches!(err, EngineError::Canceled));
            assert!(started.elapsed() < Duration::from_millis(1500));
            assert!(lines < 60);
        }

        #[test]
        fn stop_flag_cancels_like_cancel() {
            let dir = tempfile::tempdir().expect("tempdir");
            let program = script(dir.path(), "sleep 10");
            let flag = Arc::new(AtomicBool::new(false));
            let supervisor = Supervisor::with_stop_flag(flag.clone());

            let setter = thread::spawn(move || {
                thread::sleep(Duration::from_millis(200));
                flag.store(true, Ordering::SeqCst);
            });
            let err = supervisor.run(&program, &[], |_| {}).expect_err("stopped");
            setter.join().expect("join");
            assert!(matches!(err, EngineError::Canceled));
        }
    }
}
