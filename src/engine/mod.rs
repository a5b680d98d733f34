//! Render engine supervision.
//!
//! The engine runs in its own process group with the scene's directory as
//! working directory. Its stdout is decoded as the status protocol, stderr is
//! only logged. Lifecycle changes are published on an event channel: at most
//! one `RenderFinished` and exactly one `Exited` per run.

pub mod protocol;

use crate::control::ControlChannel;
use crate::error::SessionError;
use crate::model::EngineEvent;
use futures::StreamExt;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use protocol::StatusLine;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, watch};

/// How long trailing stdout may keep the exit notification waiting.
const STDOUT_DRAIN: Duration = Duration::from_millis(500);

/// Validated engine invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineArgs {
    pub program: PathBuf,
    pub scene: PathBuf,
    pub indirect_workers: u32,
    pub direct_workers: u32,
}

impl EngineArgs {
    /// Build from the positional `scene indirect direct` triple.
    pub fn from_positional(program: PathBuf, args: &[String]) -> Result<Self, SessionError> {
        let [scene, indirect, direct] = args else {
            return Err(SessionError::Configuration(format!(
                "expected 3 positional arguments <scene> <indirect> <direct>, got {}",
                args.len()
            )));
        };
        let parse_workers = |name: &str, v: &str| {
            v.parse::<u32>().map_err(|_| {
                SessionError::Configuration(format!("{name} must be a non-negative integer, got '{v}'"))
            })
        };
        let scene = PathBuf::from(scene);
        if !scene.is_file() {
            return Err(SessionError::Configuration(format!(
                "scene file not found: {}",
                scene.display()
            )));
        }
        Ok(Self {
            program,
            scene,
            indirect_workers: parse_workers("indirect", indirect)?,
            direct_workers: parse_workers("direct", direct)?,
        })
    }

    /// Directory the engine resolves scene-relative assets against.
    pub fn working_dir(&self) -> PathBuf {
        match self.scene.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Positional arguments, in the order the engine parses them.
    pub fn command_args(&self, control_dir: &Path) -> Vec<String> {
        vec![
            self.scene.to_string_lossy().into_owned(),
            format!("--iileIndirect={}", self.indirect_workers),
            format!("--iileDirect={}", self.direct_workers),
            format!("--iileControl={}", control_dir.display()),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Starting,
    Running,
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

/// Handle to a launched engine process.
#[derive(Debug)]
pub struct EngineHandle {
    pid: Option<Pid>,
    state_rx: watch::Receiver<EngineState>,
}

/// Launch the engine and start publishing its events on `event_tx`.
pub fn start(
    args: &EngineArgs,
    channel: &ControlChannel,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
) -> Result<EngineHandle, SessionError> {
    let (state_tx, state_rx) = watch::channel(EngineState::Starting);
    let workdir = args.working_dir();
    let argv = args.command_args(channel.path());
    tracing::info!(program = %args.program.display(), ?argv, workdir = %workdir.display(), "starting render engine");

    let mut child = Command::new(&args.program)
        .args(&argv)
        .current_dir(&workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Own process group: a terminal Ctrl-C reaches us, not the engine.
        .process_group(0)
        .spawn()
        .map_err(|source| SessionError::Spawn {
            program: args.program.clone(),
            source,
        })?;

    let pid = child.id().map(|id| Pid::from_raw(id as i32));
    let _ = state_tx.send(EngineState::Running);

    let stdout_task = child
        .stdout
        .take()
        .map(|out| tokio::spawn(forward_status(out, event_tx.clone())));
    if let Some(err) = child.stderr.take() {
        tokio::spawn(forward_stderr(err));
    }

    tokio::spawn(async move {
        let (code, signal) = match child.wait().await {
            Ok(status) => (status.code(), status.signal()),
            Err(e) => {
                tracing::warn!(error = %e, "failed to wait for render engine");
                (None, None)
            }
        };
        tracing::info!(?code, ?signal, "render engine exited");
        let _ = state_tx.send(EngineState::Exited { code, signal });
        // Deliver trailing status lines before the exit notification. A
        // helper that inherited stdout can keep the pipe open, so the drain
        // is bounded.
        if let Some(mut task) = stdout_task {
            if tokio::time::timeout(STDOUT_DRAIN, &mut task).await.is_err() {
                tracing::debug!("engine stdout still open after exit, detaching");
                task.abort();
                let _ = task.await;
            }
        }
        let _ = event_tx.send(EngineEvent::Exited { code, signal });
    });

    Ok(EngineHandle { pid, state_rx })
}

async fn forward_status(stdout: ChildStdout, event_tx: mpsc::UnboundedSender<EngineEvent>) {
    let events = protocol::status_events(stdout);
    futures::pin_mut!(events);
    let mut finished = false;
    while let Some(line) = events.next().await {
        let ev = match line {
            StatusLine::IndirectProgress(r) => EngineEvent::IndirectProgress(r),
            StatusLine::DirectProgress(r) => EngineEvent::DirectProgress(r),
            StatusLine::Finish if finished => continue,
            StatusLine::Finish => {
                finished = true;
                EngineEvent::RenderFinished
            }
        };
        let _ = event_tx.send(ev);
    }
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::debug!(target: "engine", "{line}"),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(target: "engine", error = %e, "stderr read failed");
                break;
            }
        }
    }
}

impl EngineHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid.map(|p| p.as_raw() as u32)
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.state(), EngineState::Exited { .. })
    }

    /// Ask the engine to stop with SIGINT so it can flush its frames.
    ///
    /// No-op once the process has exited.
    pub fn stop(&self) {
        let Some(pid) = self.pid else { return };
        if !self.is_running() {
            return;
        }
        match kill(pid, Signal::SIGINT) {
            Ok(()) => tracing::info!(%pid, "sent SIGINT to render engine"),
            Err(e) => tracing::debug!(%pid, error = %e, "SIGINT not delivered"),
        }
    }

    /// Resolve once the engine has exited.
    pub async fn wait(&self) -> EngineState {
        let mut rx = self.state_rx.clone();
        let state = match rx
            .wait_for(|s| matches!(s, EngineState::Exited { .. }))
            .await
        {
            Ok(state) => *state,
            // The watcher task is gone, so is the process.
            Err(_) => self.state(),
        };
        state
    }

    /// Interrupt, wait up to `grace`, then kill the whole process group.
    pub async fn shutdown(&self, grace: Duration) -> EngineState {
        self.stop();
        if let Ok(state) = tokio::time::timeout(grace, self.wait()).await {
            return state;
        }
        if let Some(pid) = self.pid {
            tracing::warn!(%pid, ?grace, "render engine ignored SIGINT, killing");
            if let Err(e) = killpg(pid, Signal::SIGKILL) {
                tracing::debug!(%pid, error = %e, "SIGKILL not delivered");
            }
        }
        match tokio::time::timeout(grace, self.wait()).await {
            Ok(state) => state,
            Err(_) => {
                tracing::warn!("render engine did not report exit after SIGKILL");
                self.state()
            }
        }
    }
}
