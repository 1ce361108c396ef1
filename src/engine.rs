//! Supervision of the engine process that hosts the test worker.
//!
//! ```text
//!   resolve_engine_binary(env)        fails before any spawn
//!            │
//!            ▼
//!   LaunchStrategy::command ──spawn──► engine (own process group)
//!            │                           │ stdout ─► info!(target: "engine")
//!            │                           │ stderr ─► warn!(target: "engine")
//!            ▼                           ▼
//!   LaunchStrategy::after_spawn     supervisor task
//!   (debugger attach)                 ├─ child exits  ─► exit watch
//!                                     └─ kill request ─► killpg(SIGKILL) ─► exit watch
//! ```
//!
//! [`EngineProcess::cancel`] kills the tree and waits briefly.
//! [`EngineProcess::wait`] bounds a normal shutdown and kills on timeout.
//! [`EngineProcess::dispose`] releases everything and may be called any
//! number of times; dropping the process disposes it.

pub mod bootstrap;
pub mod launch;

pub use bootstrap::{BootstrapError, InstallOutcome, install_bootstrap};
pub use launch::{
    DebuggerAttach, DebuggerLaunch, DirectLaunch, EngineInvocation, LaunchStrategy, strategy_for,
};

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, info, warn};

/// How long [`EngineProcess::cancel`] waits for the killed tree to exit.
pub const KILL_GRACE: Duration = Duration::from_secs(2);

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Engine binary not configured: set the {0} environment variable")]
    EngineNotConfigured(String),

    #[error("Engine binary not found: {}", .path.display())]
    EngineNotFound { path: PathBuf },

    #[error("Failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Debugger attach failed: {0}")]
    AttachFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine did not exit within {0:?}")]
    Timeout(Duration),
}

/// Reads the engine path from `env_var` and checks that it exists.
pub fn resolve_engine_binary(env_var: &str) -> EngineResult<PathBuf> {
    match std::env::var(env_var) {
        Ok(raw) if !raw.trim().is_empty() => resolve_engine_path(&raw),
        _ => Err(EngineError::EngineNotConfigured(env_var.to_string())),
    }
}

/// Expands `~` and `$VARS` in `raw` and checks that the result is a file.
pub fn resolve_engine_path(raw: &str) -> EngineResult<PathBuf> {
    let raw = raw.trim();
    let expanded = match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.into_owned()),
        Err(_) => PathBuf::from(shellexpand::tilde(raw).into_owned()),
    };
    if expanded.is_file() {
        Ok(expanded)
    } else {
        Err(EngineError::EngineNotFound { path: expanded })
    }
}

/// Final state of the engine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineExit {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
}

impl EngineExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// A running engine process.
pub struct EngineProcess {
    pid: u32,
    strategy: &'static str,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    exit: watch::Receiver<Option<EngineExit>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    helper: Mutex<Option<Child>>,
    disposed: AtomicBool,
}

impl EngineProcess {
    /// Spawns the engine through `strategy` and starts supervising it.
    pub async fn launch(
        invocation: &EngineInvocation,
        strategy: &dyn LaunchStrategy,
    ) -> EngineResult<Self> {
        let mut command = strategy.command(invocation);
        info!(strategy = strategy.name(), "Launching engine: {}", invocation.display());

        let mut child = command.spawn().map_err(|source| EngineError::SpawnFailed {
            program: invocation.program.display().to_string(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| {
            EngineError::Io(std::io::Error::other("engine exited before reporting a pid"))
        })?;

        let mut tasks = Vec::with_capacity(3);
        if let Some(stdout) = child.stdout.take() {
            tasks.push(pump_lines(stdout, pid, OutputStream::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tasks.push(pump_lines(stderr, pid, OutputStream::Stderr));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tasks.push(tokio::spawn(supervise(child, pid, kill_rx, exit_tx)));

        let process = Self {
            pid,
            strategy: strategy.name(),
            kill: Mutex::new(Some(kill_tx)),
            exit: exit_rx,
            tasks: Mutex::new(tasks),
            helper: Mutex::new(None),
            disposed: AtomicBool::new(false),
        };
        info!(pid, "Engine started");

        match strategy.after_spawn(pid).await {
            Ok(helper) => {
                if let Ok(mut slot) = process.helper.lock() {
                    *slot = helper;
                }
                Ok(process)
            }
            Err(e) => {
                process.cancel().await;
                process.dispose();
                Err(e)
            }
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn strategy(&self) -> &'static str {
        self.strategy
    }

    pub fn exit_status(&self) -> Option<EngineExit> {
        *self.exit.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some()
    }

    /// Kills the process tree and waits up to [`KILL_GRACE`] for it to go.
    /// Safe to call after the engine has already exited.
    pub async fn cancel(&self) {
        if self.has_exited() {
            return;
        }
        self.request_kill();
        if tokio::time::timeout(KILL_GRACE, self.exited()).await.is_err() {
            warn!(pid = self.pid, "Engine still running {:?} after kill", KILL_GRACE);
        }
    }

    /// Waits for a normal exit, killing the tree if `timeout` elapses first.
    pub async fn wait(&self, timeout: Duration) -> EngineResult<EngineExit> {
        match tokio::time::timeout(timeout, self.exited()).await {
            Ok(Some(exit)) => Ok(exit),
            Ok(None) => Ok(EngineExit { code: None }),
            Err(_) => {
                warn!(pid = self.pid, "Engine did not exit within {:?}, killing", timeout);
                self.cancel().await;
                Err(EngineError::Timeout(timeout))
            }
        }
    }

    /// Releases the supervisor, output pumps, and any debugger helper.
    /// A still-running engine is killed.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.has_exited() {
            self.request_kill();
        }
        if let Ok(mut helper) = self.helper.lock()
            && let Some(mut helper) = helper.take()
        {
            let _ = helper.start_kill();
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            // the supervisor is last and must reap the child
            let supervisor = tasks.pop();
            for task in tasks.drain(..) {
                task.abort();
            }
            drop(supervisor);
        }
        debug!(pid = self.pid, "Engine process disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn request_kill(&self) {
        if let Ok(mut kill) = self.kill.lock()
            && let Some(kill) = kill.take()
        {
            let _ = kill.send(());
        }
    }

    /// Resolves once the engine has exited.
    pub async fn exited(&self) -> Option<EngineExit> {
        let mut exit = self.exit.clone();
        let waited = exit.wait_for(Option::is_some).await.map(|value| *value);
        match waited {
            Ok(status) => status,
            // supervisor gone; whatever it last published is final
            Err(_) => *exit.borrow(),
        }
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for EngineProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineProcess")
            .field("pid", &self.pid)
            .field("strategy", &self.strategy)
            .field("exit", &self.exit_status())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

async fn supervise(
    mut child: Child,
    pid: u32,
    kill: oneshot::Receiver<()>,
    exit: watch::Sender<Option<EngineExit>>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        Ok(()) = kill => None,
    };
    let status = match exited {
        Some(status) => status,
        None => {
            info!(pid, "Killing engine process tree");
            kill_tree(pid);
            let _ = child.start_kill();
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(pid, "Failed to reap engine: {}", e);
            None
        }
    };
    match code {
        Some(0) => info!(pid, "Engine exited"),
        Some(code) => warn!(pid, code, "Engine exited with non-zero status"),
        None => warn!(pid, "Engine terminated by signal"),
    }
    let _ = exit.send(Some(EngineExit { code }));
}

#[cfg(unix)]
fn kill_tree(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        debug!(pid, "killpg failed: {}", e);
    }
}

#[cfg(not(unix))]
fn kill_tree(_pid: u32) {}

fn pump_lines<R>(reader: R, pid: u32, stream: OutputStream) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = LinesStream::new(BufReader::new(reader).lines());
        while let Some(line) = lines.next().await {
            match (line, stream) {
                (Ok(line), OutputStream::Stdout) => info!(target: "engine", pid, "{}", line),
                (Ok(line), OutputStream::Stderr) => warn!(target: "engine", pid, "{}", line),
                (Err(e), _) => {
                    debug!(pid, "Engine output closed: {}", e);
                    break;
                }
            }
        }
    })
}

/// Working directory for the engine: the project directory when it exists.
pub fn engine_working_dir(project_dir: &Path) -> PathBuf {
    if project_dir.is_dir() {
        project_dir.to_path_buf()
    } else {
        PathBuf::from(".")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_env_is_not_configured() {
        let result = resolve_engine_binary("STAGEHAND_TEST_UNSET_ENGINE_VAR");
        assert!(matches!(result, Err(EngineError::EngineNotConfigured(ref var)) if var == "STAGEHAND_TEST_UNSET_ENGINE_VAR"));
    }

    #[test]
    fn test_missing_path_is_not_found() {
        let result = resolve_engine_path("/nonexistent/engine/bin");
        assert!(matches!(result, Err(EngineError::EngineNotFound { .. })));
    }

    #[test]
    fn test_existing_path_resolves() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let binary = dir.path().join("engine");
        std::fs::write(&binary, "")?;
        assert_eq!(resolve_engine_path(&binary.to_string_lossy())?, binary);
        // directories are not binaries
        assert!(resolve_engine_path(&dir.path().to_string_lossy()).is_err());
        Ok(())
    }

    #[cfg(unix)]
    fn shell(script: &str) -> EngineInvocation {
        EngineInvocation::new("/bin/sh").with_args(["-c", script])
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_reports_exit_code() {
        let process = EngineProcess::launch(&shell("echo ready; exit 3"), &DirectLaunch)
            .await
            .unwrap();
        let exit = process.wait(Duration::from_secs(10)).await.unwrap();
        assert_eq!(exit.code, Some(3));
        assert!(!exit.success());
        assert!(process.has_exited());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exited_resolves_for_every_caller() {
        let process = EngineProcess::launch(&shell("exit 0"), &DirectLaunch)
            .await
            .unwrap();
        let first = process.exited().await;
        let second = process.exited().await;
        assert_eq!(first.and_then(|e| e.code), Some(0));
        assert_eq!(second.and_then(|e| e.code), Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_timeout_kills_engine() {
        let process = EngineProcess::launch(&shell("sleep 30"), &DirectLaunch)
            .await
            .unwrap();
        let result = process.wait(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(EngineError::Timeout(_))));
        assert!(process.has_exited());
        assert_eq!(process.exit_status().and_then(|e| e.code), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_and_dispose_are_idempotent() {
        let process = EngineProcess::launch(&shell("sleep 30"), &DirectLaunch)
            .await
            .unwrap();
        process.cancel().await;
        process.cancel().await;
        assert!(process.has_exited());

        process.dispose();
        process.dispose();
        assert!(process.is_disposed());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let invocation = EngineInvocation::new("/nonexistent/engine");
        let result = EngineProcess::launch(&invocation, &DirectLaunch).await;
        assert!(matches!(result, Err(EngineError::SpawnFailed { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_attach_kills_engine() {
        let attach = DebuggerAttach {
            command: "/nonexistent/debugger -p {pid}".to_string(),
        };
        let result = EngineProcess::launch(&shell("sleep 30"), &attach).await;
        assert!(matches!(result, Err(EngineError::AttachFailed(_))));
    }
}
