//! Process Supervisor
//!
//! Owns one engine subprocess at a time.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──start──▶ Starting ──spawned──▶ Running ──exit──▶ Stopped | Crashed
//!                                          │
//!                                     stop(timeout)
//!                                          │
//!                               SIGTERM ─ timeout ─▶ kill
//! ```
//!
//! Each run gets two reader tasks (stdout, stderr) with their own partial
//! line buffers and a monitor task that owns the [`Child`]. Everything the
//! tasks observe is reported as a [`RunEvent`] on one channel, so events
//! from a single run are totally ordered: log lines, then the final
//! `Stopped`. The run counter lets the receiver drop events from a previous
//! run that arrive after a restart.

use crate::traffic::{parse_traffic_delta, TrafficCounters};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Grace period used when the supervisor is dropped while running
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Extra wait after `stop` for the monitor to confirm cleanup
pub const DEFAULT_CLEANUP_GRACE: Duration = Duration::from_secs(2);

/// Upper bound on waiting for the readers once the process has exited.
/// Grandchildren may keep the pipes open.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 4096;

/// Supervisor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Stopped,
    Crashed,
}

/// Which output stream a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Ended by [`ProcessSupervisor::stop`]
    Requested,
    /// Exited on its own with status 0
    Exited,
    /// Exited on its own with a failure status or a signal
    Crashed,
}

/// Something the engine process did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Started {
        pid: u32,
    },
    Log {
        stream: LogStream,
        line: String,
    },
    /// Log-derived running totals changed
    TrafficChanged {
        rx_total: u64,
        tx_total: u64,
    },
    Stopped {
        exit_code: Option<i32>,
        kind: ExitKind,
    },
    Error {
        message: String,
    },
}

/// A [`SupervisorEvent`] tagged with the run that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunEvent {
    pub run: u64,
    pub event: SupervisorEvent,
}

/// Supervisor errors
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Engine is already running")]
    AlreadyRunning,

    #[error("Engine executable path is empty")]
    EmptyExecutable,

    #[error("Engine executable not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to launch engine: {0}")]
    Spawn(#[from] io::Error),

    #[error("Engine did not confirm shutdown in time")]
    StopTimedOut,
}

/// Handles to a live run
struct RunControl {
    pid: u32,
    stop_tx: Option<oneshot::Sender<Duration>>,
    done_rx: oneshot::Receiver<()>,
    stop_requested: Arc<AtomicBool>,
}

/// Engine subprocess supervisor
pub struct ProcessSupervisor {
    events: mpsc::UnboundedSender<RunEvent>,
    state: Arc<Mutex<SupervisorState>>,
    counters: Arc<TrafficCounters>,
    working_dir: Option<PathBuf>,
    cleanup_grace: Duration,
    run: u64,
    control: Option<RunControl>,
}

impl ProcessSupervisor {
    /// Create a supervisor reporting to `events`
    pub fn new(events: mpsc::UnboundedSender<RunEvent>) -> Self {
        Self {
            events,
            state: Arc::new(Mutex::new(SupervisorState::Idle)),
            counters: Arc::new(TrafficCounters::new()),
            working_dir: None,
            cleanup_grace: DEFAULT_CLEANUP_GRACE,
            run: 0,
            control: None,
        }
    }

    /// Working directory for the next run
    pub fn set_working_dir(&mut self, dir: Option<PathBuf>) {
        self.working_dir = dir;
    }

    /// How long `stop` waits for exit confirmation beyond its timeout
    pub fn set_cleanup_grace(&mut self, grace: Duration) {
        self.cleanup_grace = grace;
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SupervisorState) {
        set_state(&self.state, state);
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            SupervisorState::Starting | SupervisorState::Running
        )
    }

    /// Identifier of the current (or last) run
    pub fn current_run(&self) -> u64 {
        self.run
    }

    pub fn pid(&self) -> Option<u32> {
        self.control.as_ref().map(|c| c.pid).filter(|_| self.is_running())
    }

    /// Log-derived `(rx, tx)` totals for the current run
    pub fn traffic(&self) -> (u64, u64) {
        self.counters.totals()
    }

    pub fn reset_traffic(&self) {
        self.counters.reset();
    }

    /// Launch `executable run -config <config>`
    ///
    /// Must be called from within a Tokio runtime. Fails without spawning
    /// anything when a run is active or the executable is missing.
    pub fn start(&mut self, executable: &Path, config: &Path) -> Result<u32, SupervisorError> {
        if self.is_running() {
            return Err(SupervisorError::AlreadyRunning);
        }
        if executable.as_os_str().is_empty() {
            return Err(SupervisorError::EmptyExecutable);
        }
        if !executable.exists() {
            return Err(SupervisorError::NotFound(executable.to_path_buf()));
        }

        self.set_state(SupervisorState::Starting);
        self.counters.reset();

        let mut command = Command::new(executable);
        command
            .arg("run")
            .arg("-config")
            .arg(config)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.set_state(SupervisorState::Idle);
                return Err(SupervisorError::Spawn(e));
            }
        };

        self.run += 1;
        let run = self.run;
        let pid = child.id().unwrap_or_default();
        info!("Engine started (pid {}, run {})", pid, run);

        self.set_state(SupervisorState::Running);
        let _ = self.events.send(RunEvent {
            run,
            event: SupervisorEvent::Started { pid },
        });

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(self.spawn_reader(stdout, LogStream::Stdout, run));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(self.spawn_reader(stderr, LogStream::Stderr, run));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let stop_requested = Arc::new(AtomicBool::new(false));

        tokio::spawn(monitor(Monitor {
            child,
            run,
            readers,
            stop_rx,
            done_tx,
            stop_requested: stop_requested.clone(),
            state: self.state.clone(),
            events: self.events.clone(),
        }));

        self.control = Some(RunControl {
            pid,
            stop_tx: Some(stop_tx),
            done_rx,
            stop_requested,
        });
        Ok(pid)
    }

    fn spawn_reader<R>(&self, reader: R, stream: LogStream, run: u64) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(drain(
            reader,
            stream,
            run,
            self.counters.clone(),
            self.events.clone(),
        ))
    }

    /// Stop the engine
    ///
    /// Sends a graceful termination request, escalates to a kill after
    /// `timeout`, then waits briefly for the exit to be reported. A no-op
    /// when nothing is running, including after a crash.
    pub async fn stop(&mut self, timeout: Duration) -> Result<(), SupervisorError> {
        if !self.is_running() {
            self.control = None;
            return Ok(());
        }
        let Some(mut control) = self.control.take() else {
            return Ok(());
        };

        info!("Stopping engine (pid {})", control.pid);
        control.stop_requested.store(true, Ordering::SeqCst);
        if let Some(tx) = control.stop_tx.take() {
            let _ = tx.send(timeout);
        }

        match tokio::time::timeout(timeout + self.cleanup_grace, &mut control.done_rx).await {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!("Engine (pid {}) still running after stop", control.pid);
                Err(SupervisorError::StopTimedOut)
            }
        }
    }
}

fn set_state(state: &Mutex<SupervisorState>, value: SupervisorState) {
    *state.lock().unwrap_or_else(|e| e.into_inner()) = value;
}

/// Everything the monitor task owns
struct Monitor {
    child: Child,
    run: u64,
    readers: Vec<JoinHandle<()>>,
    stop_rx: oneshot::Receiver<Duration>,
    done_tx: oneshot::Sender<()>,
    stop_requested: Arc<AtomicBool>,
    state: Arc<Mutex<SupervisorState>>,
    events: mpsc::UnboundedSender<RunEvent>,
}

enum Wake {
    Exited(io::Result<ExitStatus>),
    Stop(Duration),
}

async fn monitor(mut m: Monitor) {
    // A dropped sender means the supervisor itself went away
    let wake = tokio::select! {
        status = m.child.wait() => Wake::Exited(status),
        grace = &mut m.stop_rx => Wake::Stop(grace.unwrap_or(DEFAULT_STOP_TIMEOUT)),
    };

    let requested = matches!(wake, Wake::Stop(_));
    let status = match wake {
        Wake::Exited(status) => status,
        Wake::Stop(grace) => terminate(&mut m.child, grace).await,
    };

    // Readers flush their partial lines on EOF; wait for them so the
    // final log lines precede the stop event.
    for reader in m.readers {
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
            debug!("Engine output still open after exit (run {})", m.run);
        }
    }

    let requested = requested || m.stop_requested.load(Ordering::SeqCst);
    let event = match status {
        Ok(status) => {
            let kind = classify(&status, requested);
            match kind {
                ExitKind::Crashed => {
                    warn!("Engine exited unexpectedly: {}", status);
                    set_state(&m.state, SupervisorState::Crashed);
                }
                _ => {
                    info!("Engine stopped: {}", status);
                    set_state(&m.state, SupervisorState::Stopped);
                }
            }
            SupervisorEvent::Stopped {
                exit_code: status.code(),
                kind,
            }
        }
        Err(e) => {
            set_state(&m.state, SupervisorState::Crashed);
            SupervisorEvent::Error {
                message: format!("Lost track of engine process: {}", e),
            }
        }
    };

    let _ = m.events.send(RunEvent { run: m.run, event });
    let _ = m.done_tx.send(());
}

fn classify(status: &ExitStatus, requested: bool) -> ExitKind {
    if requested {
        ExitKind::Requested
    } else if status.success() {
        ExitKind::Exited
    } else {
        ExitKind::Crashed
    }
}

async fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    request_exit(child);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!("Engine ignored termination for {:?}, killing", grace);
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn request_exit(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!("SIGTERM to {} failed: {}, killing", pid, e);
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child) {
    let _ = child.start_kill();
}

async fn drain<R>(
    mut reader: R,
    stream: LogStream,
    run: u64,
    counters: Arc<TrafficCounters>,
    events: mpsc::UnboundedSender<RunEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut buffer = LineBuffer::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                for line in buffer.push(&chunk[..n]) {
                    emit_line(line, stream, run, &counters, &events);
                }
            }
            Err(e) => {
                debug!("Engine {:?} read failed: {}", stream, e);
                break;
            }
        }
    }

    if let Some(line) = buffer.flush() {
        emit_line(line, stream, run, &counters, &events);
    }
}

fn emit_line(
    line: String,
    stream: LogStream,
    run: u64,
    counters: &TrafficCounters,
    events: &mpsc::UnboundedSender<RunEvent>,
) {
    debug!(target: "engine", "{}", line);
    let delta = parse_traffic_delta(&line);

    let _ = events.send(RunEvent {
        run,
        event: SupervisorEvent::Log { stream, line },
    });

    if let Some((rx, tx)) = delta {
        let (rx_total, tx_total) = counters.add(rx, tx);
        let _ = events.send(RunEvent {
            run,
            event: SupervisorEvent::TrafficChanged { rx_total, tx_total },
        });
    }
}

/// Splits a byte stream into trimmed, non-empty lines
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes, returning every line completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(line) = finish_line(&raw) {
                lines.push(line);
            }
        }
        lines
    }

    /// Take whatever is left as a final line
    pub fn flush(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.pending);
        finish_line(&raw)
    }
}

fn finish_line(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim();
    (!line.is_empty()).then(|| line.to_string())
}
