use std::{process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter},
    process::{Child, Command},
    sync::{broadcast, mpsc, Mutex, RwLock},
    time::timeout,
};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::LaunchSpec,
    console::{ConsoleLine, LogMeta, StreamSource},
    error::ProcessError,
};

/// Lifecycle states of the supervised server process.
///
/// `NotRunning → Starting → Running → Stopping → NotRunning` is the normal
/// path; `Running → Crashed` is entered when the process dies without a stop
/// having been requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotRunning,
    Starting,
    Running,
    Stopping,
    Crashed,
}

/// Snapshot of the supervised process for status surfaces.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub state: ProcessState,
}

/// Capability the orchestrator and restart policy depend on. Platform
/// process details stay behind this seam; test doubles implement it too.
#[async_trait]
pub trait ServerControl: Send + Sync {
    /// Spawns the server process. Fails with [`ProcessError::AlreadyRunning`]
    /// if one is already starting, running, or stopping.
    async fn start(&self, spec: &LaunchSpec) -> Result<(), ProcessError>;

    /// Requests a graceful shutdown and escalates to a forced terminate once
    /// `grace` has elapsed. The state is `NotRunning` on return no matter
    /// which path was taken.
    async fn stop_gracefully(&self, grace: Duration) -> Result<(), ProcessError>;

    /// Non-blocking liveness probe. Reports `true` only while the process
    /// genuinely holds its resources.
    async fn is_alive(&self) -> bool;

    async fn state(&self) -> ProcessState;
}

struct RunningProcess {
    child: Arc<Mutex<Child>>,
    stdin_tx: mpsc::Sender<String>,
    shutdown: CancellationToken,
    started_at: DateTime<Utc>,
    pid: Option<u32>,
}

/// Owns the server child process: spawning, output pumping, stdin command
/// forwarding, graceful-then-forced shutdown, and crash detection.
pub struct ProcessSupervisor {
    status: Arc<RwLock<ProcessState>>,
    stdout_tx: broadcast::Sender<ConsoleLine>,
    stderr_tx: broadcast::Sender<ConsoleLine>,
    ready_tx: broadcast::Sender<()>,
    inner: RwLock<Option<RunningProcess>>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            status: Arc::new(RwLock::new(ProcessState::NotRunning)),
            stdout_tx: broadcast::Sender::new(2048),
            stderr_tx: broadcast::Sender::new(2048),
            ready_tx: broadcast::Sender::new(16),
            inner: RwLock::new(None),
        }
    }

    /// Queues a console command for the server's stdin. A trailing newline
    /// is added if missing.
    pub async fn send_command<S: Into<String>>(&self, cmd: S) -> Result<(), ProcessError> {
        let mut command = cmd.into();
        if !command.ends_with('\n') {
            command.push('\n');
        }

        let inner = self.inner.read().await;
        let running = inner.as_ref().ok_or(ProcessError::NotRunning)?;
        running
            .stdin_tx
            .send(command)
            .await
            .map_err(|_| ProcessError::StdinWriteFailed)
    }

    /// Live view of stdout or stderr as a stream of [`ConsoleLine`]s. Lines
    /// only flow while a process is running; the subscription itself
    /// survives restarts.
    pub fn subscribe(&self, stream: StreamSource) -> BroadcastStream<ConsoleLine> {
        let rx = match stream {
            StreamSource::Stdout => self.stdout_tx.subscribe(),
            StreamSource::Stderr => self.stderr_tx.subscribe(),
        };
        BroadcastStream::new(rx)
    }

    /// Blocks until the current process prints its vanilla ready marker or
    /// `wait` elapses. Returns whether the marker was seen.
    pub async fn wait_ready(&self, wait: Duration) -> bool {
        let mut rx = self.ready_tx.subscribe();
        timeout(wait, rx.recv()).await.map(|r| r.is_ok()).unwrap_or(false)
    }

    pub async fn info(&self) -> ProcessInfo {
        let state = *self.status.read().await;
        let inner = self.inner.read().await;
        match inner.as_ref() {
            Some(running) => ProcessInfo {
                pid: running.pid,
                started_at: Some(running.started_at),
                state,
            },
            None => ProcessInfo {
                pid: None,
                started_at: None,
                state,
            },
        }
    }

    fn build_command(spec: &LaunchSpec) -> Command {
        let mut command = Command::new(&spec.java_bin);
        command
            .args(&spec.java_args)
            .arg("-jar")
            .arg(&spec.jar_path)
            .current_dir(&spec.working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::piped())
            .kill_on_drop(true);

        if !spec.use_gui_console {
            command.arg("nogui");
        }

        #[cfg(unix)]
        command.process_group(0);

        command
    }

    fn spawn_pumps(
        &self,
        child: &mut Child,
        shutdown: CancellationToken,
    ) -> Result<mpsc::Sender<String>, ProcessError> {
        let stdout = child.stdout.take().ok_or(ProcessError::NoStdoutPipe)?;
        let stderr = child.stderr.take().ok_or(ProcessError::NoStderrPipe)?;
        let stdin = child.stdin.take().ok_or(ProcessError::NoStdinPipe)?;

        let stdout_tx = self.stdout_tx.clone();
        let ready_tx = self.ready_tx.clone();
        let stdout_status = self.status.clone();

        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            loop {
                match reader.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(meta) = LogMeta::parse(&line) {
                            if meta.is_ready_marker() {
                                info!("server reports ready");
                                let _ = ready_tx.send(());
                            }
                        }
                        let _ = stdout_tx.send(ConsoleLine::stdout(line));
                    }
                    _ => {
                        mark_crashed_on_unexpected_exit(&stdout_status).await;
                        break;
                    }
                }
            }
        });

        let stderr_tx = self.stderr_tx.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                let _ = stderr_tx.send(ConsoleLine::stderr(line));
            }
        });

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(1024);
        tokio::spawn(async move {
            let mut writer = BufWriter::new(stdin);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    maybe_cmd = stdin_rx.recv() => {
                        match maybe_cmd {
                            Some(cmd) => {
                                let _ = writer.write_all(cmd.as_bytes()).await;
                                let _ = writer.flush().await;
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        Ok(stdin_tx)
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Stdout reached EOF. If no stop was requested the process died on its own.
async fn mark_crashed_on_unexpected_exit(status: &Arc<RwLock<ProcessState>>) {
    let mut guard = status.write().await;
    if matches!(*guard, ProcessState::Running | ProcessState::Starting) {
        warn!("server process exited unexpectedly");
        *guard = ProcessState::Crashed;
    }
}

#[async_trait]
impl ServerControl for ProcessSupervisor {
    async fn start(&self, spec: &LaunchSpec) -> Result<(), ProcessError> {
        let mut inner = self.inner.write().await;

        {
            let status = self.status.read().await;
            if matches!(
                *status,
                ProcessState::Starting | ProcessState::Running | ProcessState::Stopping
            ) {
                return Err(ProcessError::AlreadyRunning);
            }
        }
        // A crashed process leaves a stale handle behind; drop it.
        inner.take();

        *self.status.write().await = ProcessState::Starting;

        let mut command = Self::build_command(spec);
        debug!(jar = %spec.jar_path.display(), "spawning server process");
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                *self.status.write().await = ProcessState::NotRunning;
                return Err(ProcessError::Spawn(e));
            }
        };

        let pid = child.id();
        let shutdown = CancellationToken::new();
        let stdin_tx = match self.spawn_pumps(&mut child, shutdown.clone()) {
            Ok(tx) => tx,
            Err(e) => {
                let _ = child.kill().await;
                *self.status.write().await = ProcessState::NotRunning;
                return Err(e);
            }
        };

        *inner = Some(RunningProcess {
            child: Arc::new(Mutex::new(child)),
            stdin_tx,
            shutdown,
            started_at: Utc::now(),
            pid,
        });
        *self.status.write().await = ProcessState::Running;
        info!(?pid, "server process running");

        Ok(())
    }

    async fn stop_gracefully(&self, grace: Duration) -> Result<(), ProcessError> {
        let mut inner = self.inner.write().await;
        let running = inner.take().ok_or(ProcessError::NotRunning)?;

        *self.status.write().await = ProcessState::Stopping;

        // Best effort: a wedged server will not read it anyway.
        let _ = running.stdin_tx.send("stop\n".to_string()).await;

        let mut child = running.child.lock().await;
        let forced = match timeout(grace, child.wait()).await {
            Ok(Ok(exit)) => {
                info!(code = ?exit.code(), "server stopped gracefully");
                false
            }
            Ok(Err(e)) => {
                warn!(error = %e, "wait failed; forcing terminate");
                true
            }
            Err(_) => {
                warn!(grace_secs = grace.as_secs_f64(), "graceful stop timed out; forcing terminate");
                true
            }
        };

        let kill_result = if forced { child.kill().await } else { Ok(()) };

        drop(child);
        running.shutdown.cancel();
        // The escalation guarantee: whatever happened above, the supervisor
        // no longer considers a process to be holding the world files.
        *self.status.write().await = ProcessState::NotRunning;

        kill_result.map_err(ProcessError::Kill)
    }

    async fn is_alive(&self) -> bool {
        // Stopping holds the process handle for the whole grace window; the
        // probe must answer from the status alone rather than wait on it.
        match *self.status.read().await {
            ProcessState::NotRunning | ProcessState::Stopping | ProcessState::Crashed => {
                return false
            }
            ProcessState::Starting | ProcessState::Running => {}
        }

        let inner = self.inner.read().await;
        let Some(running) = inner.as_ref() else {
            return false;
        };
        let mut child = running.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    async fn state(&self) -> ProcessState {
        *self.status.read().await
    }
}
