//! Command execution: the router that picks a destination for each shell
//! command, the sandbox runners that enforce data boundaries, and the shared
//! watchdog subprocess plumbing.

mod docker;
mod host;
mod router;
mod seatbelt;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use docker::DockerSandbox;
pub use host::HostRunner;
pub use router::CommandDecision;
pub use router::ExecRouter;
pub use router::PolicyDecision;
pub use router::Route;
pub use router::SandboxPermissions;
pub use router::build_candidates;

use crate::error::Result;
pub use seatbelt::SeatbeltSandbox;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(45);

const KILLED_EXIT_CODE: i32 = 128 + 9;

/// One shell command to run somewhere.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Shell text, run through `sh -lc`.
    pub command: String,
    pub dir: PathBuf,
    pub timeout: Duration,
    pub idle_timeout: Duration,
    /// Cooperative cancel; firing it SIGKILLs the process group.
    pub cancel: CancellationToken,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            dir: dir.into(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Wall-clock budget exhausted.
    Command,
    /// No output from the whole process group for the idle budget.
    Idle,
}

/// Output of one command run. Partial stdout/stderr survive timeout kills.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: Option<TimeoutKind>,
}

/// The interchangeable sandbox backends: probe health, run a command inside
/// the jail, tear the session down.
#[async_trait]
pub trait SandboxRunner: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;
    async fn probe(&self) -> Result<()>;
    async fn run(&self, request: &CommandRequest) -> Result<CommandResult>;
    async fn close(&self) -> Result<()>;
}

/// Environment every child gets so nothing stops to ask a human.
pub(crate) fn hygiene_env(cmd: &mut Command) {
    cmd.env("CI", "1")
        .env("TERM", "dumb")
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("PAGER", "cat")
        .env("NO_COLOR", "1");
}

/// Spawn `argv` in its own process group and babysit it: capture output with
/// activity timestamps, enforce the wall-clock and idle budgets, and kill the
/// whole group when either expires so children cannot keep the pipes open.
pub(crate) async fn run_with_watchdog(
    argv: &[String],
    dir: &PathBuf,
    timeout: Duration,
    idle_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<CommandResult> {
    let Some((program, rest)) = argv.split_first() else {
        return Err(crate::error::SableErr::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "command args are empty",
        )));
    };

    let mut cmd = Command::new(program);
    cmd.args(rest)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    hygiene_env(&mut cmd);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    let pid = child.id();

    let last_activity = Arc::new(Mutex::new(Instant::now()));
    let stdout_buf = Arc::new(Mutex::new(Vec::<u8>::new()));
    let stderr_buf = Arc::new(Mutex::new(Vec::<u8>::new()));

    let stdout_task = child.stdout.take().map(|pipe| {
        tokio::spawn(pump(pipe, Arc::clone(&stdout_buf), Arc::clone(&last_activity)))
    });
    let stderr_task = child.stderr.take().map(|pipe| {
        tokio::spawn(pump(pipe, Arc::clone(&stderr_buf), Arc::clone(&last_activity)))
    });

    let started = Instant::now();
    let mut poll = tokio::time::interval(Duration::from_millis(50));
    let mut timed_out = None;
    let mut exit_code;

    loop {
        tokio::select! {
            status = child.wait() => {
                exit_code = status?.code().unwrap_or(KILLED_EXIT_CODE);
                break;
            }
            _ = cancel.cancelled() => {
                kill_group(pid, &mut child).await;
                exit_code = KILLED_EXIT_CODE;
                break;
            }
            _ = poll.tick() => {
                if started.elapsed() >= timeout {
                    debug!("command exceeded {timeout:?}, killing group");
                    timed_out = Some(TimeoutKind::Command);
                    kill_group(pid, &mut child).await;
                    exit_code = KILLED_EXIT_CODE;
                    break;
                }
                let idle = last_activity.lock().await.elapsed();
                if idle >= idle_timeout {
                    debug!("command idle for {idle:?}, killing group");
                    timed_out = Some(TimeoutKind::Idle);
                    kill_group(pid, &mut child).await;
                    exit_code = KILLED_EXIT_CODE;
                    break;
                }
            }
        }
    }

    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    let stdout = String::from_utf8_lossy(&stdout_buf.lock().await).into_owned();
    let stderr = String::from_utf8_lossy(&stderr_buf.lock().await).into_owned();
    Ok(CommandResult {
        stdout,
        stderr,
        exit_code,
        timed_out,
    })
}

async fn pump<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    buf: Arc<Mutex<Vec<u8>>>,
    last_activity: Arc<Mutex<Instant>>,
) {
    let mut tmp = [0u8; 8192];
    loop {
        match reader.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                *last_activity.lock().await = Instant::now();
                buf.lock().await.extend_from_slice(&tmp[..n]);
            }
        }
    }
}

/// SIGKILL the whole process group so grandchildren die with the child.
async fn kill_group(pid: Option<u32>, child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}
