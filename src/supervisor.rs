//! Lifecycle of the external proxy engine (`xray run -c <config>`).
//!
//! `Idle -> Launching -> Running -> Stopping -> Idle`, plus `Running -> Idle`
//! when the engine closes its stdout on its own.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{LaunchError, ReadinessTimeout};

const DRAIN_FLUSH_TIMEOUT: Duration = Duration::from_millis(200);
const PORT_CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Launching,
    Running,
    Stopping,
}

/// The seam the orchestrator drives; [`ProcessSupervisor`] is the real one.
#[async_trait]
pub trait ProxyEngine: Send + Sync {
    /// Fails with `BinaryMissing` when the engine cannot be executed.
    fn check_binary(&self) -> Result<(), LaunchError>;

    async fn launch(&mut self, config_path: &Path) -> Result<(), LaunchError>;

    async fn wait_until_ready(
        &self,
        port: u16,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<(), ReadinessTimeout>;

    /// Idempotent; the engine is dead when this returns.
    async fn stop(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamTag {
    Out,
    Err,
}

impl StreamTag {
    fn as_str(self) -> &'static str {
        match self {
            StreamTag::Out => "out",
            StreamTag::Err => "err",
        }
    }
}

struct ProcessHandle {
    child: Child,
    drains: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

pub struct ProcessSupervisor {
    binary: PathBuf,
    stop_grace: Duration,
    state: Arc<Mutex<SupervisorState>>,
    handle: Option<ProcessHandle>,
}

impl ProcessSupervisor {
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>, stop_grace: Duration) -> Self {
        Self {
            binary: binary.into(),
            stop_grace,
            state: Arc::new(Mutex::new(SupervisorState::Idle)),
            handle: None,
        }
    }

    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    #[must_use]
    pub fn state(&self) -> SupervisorState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().and_then(|h| h.child.id())
    }

    fn set_state(&self, next: SupervisorState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }
}

#[async_trait]
impl ProxyEngine for ProcessSupervisor {
    fn check_binary(&self) -> Result<(), LaunchError> {
        let executable = std::fs::metadata(&self.binary)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false);
        if executable {
            Ok(())
        } else {
            Err(LaunchError::BinaryMissing(self.binary.clone()))
        }
    }

    async fn launch(&mut self, config_path: &Path) -> Result<(), LaunchError> {
        if self.handle.is_some() {
            return Err(LaunchError::AlreadyRunning);
        }
        self.check_binary()?;
        self.set_state(SupervisorState::Launching);

        let spawned = Command::new(&self.binary)
            .arg("run")
            .arg("-c")
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.set_state(SupervisorState::Idle);
                return Err(LaunchError::Spawn(e));
            }
        };

        let shutdown = CancellationToken::new();
        let mut drains = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            drains.push(spawn_drain(
                stdout,
                StreamTag::Out,
                shutdown.clone(),
                Arc::clone(&self.state),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(spawn_drain(
                stderr,
                StreamTag::Err,
                shutdown.clone(),
                Arc::clone(&self.state),
            ));
        }

        debug!(
            pid = ?child.id(),
            binary = ?self.binary.display().to_string(),
            config = ?config_path.display().to_string(),
            "engine_launched"
        );
        self.set_state(SupervisorState::Running);
        self.handle = Some(ProcessHandle {
            child,
            drains,
            shutdown,
        });
        Ok(())
    }

    async fn wait_until_ready(
        &self,
        port: u16,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<(), ReadinessTimeout> {
        let state = Arc::clone(&self.state);
        wait_for_port(port, timeout, poll_interval, move || {
            *state.lock().unwrap_or_else(|e| e.into_inner()) == SupervisorState::Running
        })
        .await
    }

    async fn stop(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            self.set_state(SupervisorState::Idle);
            return;
        };
        self.set_state(SupervisorState::Stopping);

        handle.shutdown.cancel();
        for drain in &mut handle.drains {
            if tokio::time::timeout(DRAIN_FLUSH_TIMEOUT, &mut *drain)
                .await
                .is_err()
            {
                drain.abort();
            }
        }

        terminate(&mut handle.child, self.stop_grace).await;
        self.set_state(SupervisorState::Idle);
    }
}

/// Poll `127.0.0.1:port` until it accepts a connection.
pub async fn wait_until_port_open(
    port: u16,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<(), ReadinessTimeout> {
    wait_for_port(port, timeout, poll_interval, || true).await
}

async fn wait_for_port<F>(
    port: u16,
    timeout: Duration,
    poll_interval: Duration,
    still_alive: F,
) -> Result<(), ReadinessTimeout>
where
    F: Fn() -> bool + Send,
{
    let started = Instant::now();
    let deadline = started + timeout;
    loop {
        let connect = TcpStream::connect(("127.0.0.1", port));
        if let Ok(Ok(_stream)) = tokio::time::timeout(PORT_CONNECT_TIMEOUT, connect).await {
            debug!(port, waited_ms = started.elapsed().as_millis() as u64, "engine_port_ready");
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline || !still_alive() {
            return Err(ReadinessTimeout {
                port,
                waited: now.duration_since(started),
            });
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}

fn spawn_drain<R>(
    reader: R,
    tag: StreamTag,
    shutdown: CancellationToken,
    state: Arc<Mutex<SupervisorState>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = lines.next_line() => next,
            };
            match next {
                Ok(Some(line)) => {
                    let line = line.trim_end();
                    if line.is_empty() {
                        continue;
                    }
                    match tag {
                        StreamTag::Out => tracing::info!(line = %line, "engine_stdout"),
                        StreamTag::Err => tracing::warn!(line = %line, "engine_stderr"),
                    }
                }
                Ok(None) => {
                    if tag == StreamTag::Out {
                        let mut current = state.lock().unwrap_or_else(|e| e.into_inner());
                        if *current == SupervisorState::Running {
                            tracing::warn!("engine_exited_unexpectedly");
                            *current = SupervisorState::Idle;
                        }
                    }
                    break;
                }
                Err(e) => {
                    tracing::warn!(stream = tag.as_str(), error = %e, "engine_stream_read_failed");
                    break;
                }
            }
        }
    })
}

/// How the child behaved inside the SIGTERM grace window.
#[derive(Debug)]
enum GraceOutcome {
    Exited(std::process::ExitStatus),
    WaitFailed(std::io::Error),
    TimedOut,
}

impl GraceOutcome {
    fn needs_kill(&self) -> bool {
        !matches!(self, GraceOutcome::Exited(_))
    }
}

fn send_sigterm(pid: u32) -> bool {
    debug!(pid, signal = ?"SIGTERM", "engine_signal_send");
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            debug!(pid, error = %e, "engine_sigterm_failed");
            false
        }
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL. Always reaps the child.
async fn terminate(child: &mut Child, grace: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!(status = %status, "engine_already_exited");
        return;
    }

    if let Some(pid) = child.id() {
        send_sigterm(pid);
    }

    let outcome = match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => GraceOutcome::Exited(status),
        Ok(Err(e)) => GraceOutcome::WaitFailed(e),
        Err(_) => GraceOutcome::TimedOut,
    };
    match &outcome {
        GraceOutcome::Exited(status) => debug!(status = %status, "engine_exited_after_sigterm"),
        GraceOutcome::WaitFailed(e) => tracing::warn!(error = %e, "engine_wait_failed"),
        GraceOutcome::TimedOut => debug!("engine_sigterm_grace_elapsed"),
    }
    if !outcome.needs_kill() {
        return;
    }

    debug!(signal = ?"SIGKILL", "engine_signal_send");
    if let Err(e) = child.start_kill() {
        tracing::warn!(error = %e, "engine_kill_failed");
        return;
    }
    match tokio::time::timeout(grace.max(DRAIN_FLUSH_TIMEOUT), child.wait()).await {
        Ok(Ok(status)) => debug!(status = %status, "engine_killed"),
        Ok(Err(e)) => tracing::warn!(error = %e, "engine_reap_failed"),
        Err(_) => tracing::warn!("engine_reap_timeout"),
    }
}
