//! How the engine process gets started.
//!
//! | Strategy | Spawned program | After spawn |
//! |----------|-----------------|-------------|
//! | [`DirectLaunch`] | the engine | nothing |
//! | [`DebuggerLaunch`] | the debugger, with the engine as its argument | nothing |
//! | [`DebuggerAttach`] | the engine | runs the attach command with `{pid}` |

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::info;

use super::{EngineError, EngineResult};
use crate::config::DebuggerConfig;

/// Everything needed to start the engine, independent of the strategy.
#[derive(Debug, Clone)]
pub struct EngineInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl EngineInvocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: PathBuf::from("."),
            env: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// A command for `program` with this invocation's directory, environment,
    /// and redirected stdio.
    ///
    /// On Unix the process leads its own process group so the whole tree
    /// can be killed at once.
    pub fn command_for(&self, program: impl AsRef<std::ffi::OsStr>) -> Command {
        let mut command = Command::new(program);
        command
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        #[cfg(unix)]
        command.process_group(0);
        command
    }

    /// Rendered command line, for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .map(|part| shell_words::quote(&part).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Starts the engine, optionally handing off to a debugger.
#[async_trait]
pub trait LaunchStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// The command that starts the engine.
    fn command(&self, invocation: &EngineInvocation) -> Command;

    /// Runs once the engine is up; may return a helper process to supervise.
    async fn after_spawn(&self, _pid: u32) -> EngineResult<Option<Child>> {
        Ok(None)
    }
}

/// Spawns the engine as is.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectLaunch;

#[async_trait]
impl LaunchStrategy for DirectLaunch {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn command(&self, invocation: &EngineInvocation) -> Command {
        let mut command = invocation.command_for(&invocation.program);
        command.args(&invocation.args);
        command
    }
}

/// Spawns a debugger that in turn starts the engine.
#[derive(Debug, Clone)]
pub struct DebuggerLaunch {
    pub program: String,
    pub args: Vec<String>,
}

#[async_trait]
impl LaunchStrategy for DebuggerLaunch {
    fn name(&self) -> &'static str {
        "debugger-launch"
    }

    fn command(&self, invocation: &EngineInvocation) -> Command {
        let mut command = invocation.command_for(&self.program);
        command
            .args(&self.args)
            .arg(&invocation.program)
            .args(&invocation.args);
        command
    }
}

/// Spawns the engine, then attaches a debugger to its pid.
#[derive(Debug, Clone)]
pub struct DebuggerAttach {
    /// Command line with a `{pid}` placeholder.
    pub command: String,
}

impl DebuggerAttach {
    fn attach_argv(&self, pid: u32) -> EngineResult<Vec<String>> {
        let line = self.command.replace("{pid}", &pid.to_string());
        let argv = shell_words::split(&line)
            .map_err(|e| EngineError::AttachFailed(format!("invalid attach command: {}", e)))?;
        if argv.is_empty() {
            return Err(EngineError::AttachFailed("empty attach command".to_string()));
        }
        Ok(argv)
    }
}

#[async_trait]
impl LaunchStrategy for DebuggerAttach {
    fn name(&self) -> &'static str {
        "debugger-attach"
    }

    fn command(&self, invocation: &EngineInvocation) -> Command {
        DirectLaunch.command(invocation)
    }

    async fn after_spawn(&self, pid: u32) -> EngineResult<Option<Child>> {
        let argv = self.attach_argv(pid)?;
        info!(pid, "Attaching debugger: {}", argv.join(" "));
        let child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::AttachFailed(format!("{}: {}", argv[0], e)))?;
        Ok(Some(child))
    }
}

/// The strategy a debugger configuration selects.
pub fn strategy_for(config: &DebuggerConfig) -> Box<dyn LaunchStrategy> {
    match config {
        DebuggerConfig::None => Box::new(DirectLaunch),
        DebuggerConfig::Launch { program, args } => Box::new(DebuggerLaunch {
            program: program.clone(),
            args: args.clone(),
        }),
        DebuggerConfig::Attach { command } => Box::new(DebuggerAttach {
            command: command.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation() -> EngineInvocation {
        EngineInvocation::new("/opt/engine/bin/engine")
            .with_args(["--headless", "--path", "my project"])
            .with_env("STAGEHAND_ENDPOINT", "unix:/tmp/stagehand.sock")
    }

    fn argv(command: &Command) -> Vec<String> {
        let std = command.as_std();
        std::iter::once(std.get_program())
            .chain(std.get_args())
            .map(|s| s.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_direct_launch() {
        let command = DirectLaunch.command(&invocation());
        assert_eq!(
            argv(&command),
            vec!["/opt/engine/bin/engine", "--headless", "--path", "my project"]
        );
        let env: Vec<_> = command.as_std().get_envs().collect();
        assert_eq!(env.len(), 1);
    }

    #[test]
    fn test_debugger_launch_wraps_engine() {
        let strategy = DebuggerLaunch {
            program: "gdb".to_string(),
            args: vec!["--args".to_string()],
        };
        assert_eq!(
            argv(&strategy.command(&invocation())),
            vec![
                "gdb",
                "--args",
                "/opt/engine/bin/engine",
                "--headless",
                "--path",
                "my project"
            ]
        );
    }

    #[test]
    fn test_attach_substitutes_pid() {
        let strategy = DebuggerAttach {
            command: "lldb -p {pid} --batch".to_string(),
        };
        assert_eq!(
            strategy.attach_argv(4242).unwrap(),
            vec!["lldb", "-p", "4242", "--batch"]
        );
        let empty = DebuggerAttach {
            command: "   ".to_string(),
        };
        assert!(empty.attach_argv(1).is_err());
    }

    #[test]
    fn test_strategy_for_config() {
        assert_eq!(strategy_for(&DebuggerConfig::None).name(), "direct");
        assert_eq!(
            strategy_for(&DebuggerConfig::Attach {
                command: "x {pid}".to_string()
            })
            .name(),
            "debugger-attach"
        );
    }

    #[test]
    fn test_display_quotes_arguments() {
        assert_eq!(
            invocation().display(),
            "/opt/engine/bin/engine --headless --path 'my project'"
        );
    }
}
