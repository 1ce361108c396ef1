//! Configuration schema definitions for stagehand.
//!
//! This module defines all configuration types that can be deserialized from
//! `stagehand.toml`. Every field has a default, so an empty file is a valid
//! configuration.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── HarnessConfig          - Timeouts, capture switches, channel name
//! ├── EngineConfig           - How to find and launch the engine
//! │   └── DebuggerConfig     - Tagged enum selecting a launch strategy
//! │       ├── None           - Spawn the engine directly
//! │       ├── Launch         - Spawn the engine under a debugger
//! │       └── Attach         - Spawn, then attach a debugger by pid
//! └── ReportConfig           - Output and reporting settings
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration structure for stagehand.
///
/// # TOML Structure
///
/// ```toml
/// [harness]
/// stage_timeout_secs = 30
/// session_timeout_secs = 600
///
/// [engine]
/// binary_env = "STAGEHAND_ENGINE_BIN"
/// project_dir = "~/games/demo"
/// args = ["--headless"]
///
/// [engine.debugger]
/// mode = "attach"
/// command = "lldb -p {pid}"
///
/// [report]
/// output_dir = "test-results"
/// ```
///
/// # Example
///
/// ```
/// use stagehand::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [harness]
///     stage_timeout_secs = 5
/// "#).unwrap();
/// assert_eq!(config.harness.stage_timeout_secs, 5);
/// assert_eq!(config.engine.binary_env, "STAGEHAND_ENGINE_BIN");
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub harness: HarnessConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub report: ReportConfig,
}

/// Core execution settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `stage_timeout_secs` | 30 |
/// | `session_timeout_secs` | 600 (10 minutes) |
/// | `capture_stdout` | true |
/// | `report_orphans` | true |
/// | `channel` | `"stagehand"` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HarnessConfig {
    /// Timeout for any stage that declares none.
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,

    /// Upper bound for a whole run, engine start included.
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,

    /// Attach test output to results instead of logging it.
    #[serde(default = "default_true")]
    pub capture_stdout: bool,

    /// Report resources leaked by a test as warnings.
    #[serde(default = "default_true")]
    pub report_orphans: bool,

    /// Name of the well-known worker endpoint.
    #[serde(default = "default_channel")]
    pub channel: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            stage_timeout_secs: default_stage_timeout(),
            session_timeout_secs: default_session_timeout(),
            capture_stdout: true,
            report_orphans: true,
            channel: default_channel(),
        }
    }
}

impl HarnessConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

fn default_stage_timeout() -> u64 {
    30
}

fn default_session_timeout() -> u64 {
    600
}

fn default_channel() -> String {
    "stagehand".to_string()
}

/// Engine process settings.
///
/// The engine binary itself is never written here: it comes from the
/// environment variable named by `binary_env`, so the same configuration
/// works on every machine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Environment variable holding the engine binary path.
    #[serde(default = "default_binary_env")]
    pub binary_env: String,

    /// Engine project the bootstrap is installed into; also the working
    /// directory of the engine process. `~` and `$VARS` are expanded.
    #[serde(default = "default_project_dir")]
    pub project_dir: PathBuf,

    /// Extra engine arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// How long to wait for the engine to exit before killing it.
    #[serde(default = "default_exit_timeout")]
    pub exit_timeout_secs: u64,

    /// How long to keep retrying the worker connection after launch.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default)]
    pub debugger: DebuggerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary_env: default_binary_env(),
            project_dir: default_project_dir(),
            args: Vec::new(),
            exit_timeout_secs: default_exit_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            debugger: DebuggerConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn exit_timeout(&self) -> Duration {
        Duration::from_secs(self.exit_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// `project_dir` with `~` and environment variables expanded.
    pub fn expanded_project_dir(&self) -> PathBuf {
        let raw = self.project_dir.to_string_lossy();
        match shellexpand::full(&raw) {
            Ok(expanded) => PathBuf::from(expanded.into_owned()),
            Err(_) => PathBuf::from(shellexpand::tilde(&raw).into_owned()),
        }
    }
}

fn default_binary_env() -> String {
    "STAGEHAND_ENGINE_BIN".to_string()
}

fn default_project_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_exit_timeout() -> u64 {
    5
}

fn default_connect_timeout() -> u64 {
    30
}

/// Debugger integration, selected by the `mode` field.
///
/// # Example
///
/// ```toml
/// # Run the engine under a debugger
/// [engine.debugger]
/// mode = "launch"
/// program = "gdb"
/// args = ["--args"]
///
/// # Start the engine, then attach
/// [engine.debugger]
/// mode = "attach"
/// command = "lldb -p {pid}"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum DebuggerConfig {
    #[default]
    None,

    /// The debugger spawns the engine: `{program} {args..} {engine} {engine args..}`.
    Launch {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },

    /// A command run after the engine starts; `{pid}` is replaced by its pid.
    Attach { command: String },
}

/// Configuration for test result reporting.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `output_dir` | `"test-results"` |
/// | `junit` | `true` |
/// | `junit_file` | `"junit.xml"` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory where report files are written. Created if missing.
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    /// Whether to generate a JUnit XML report.
    #[serde(default = "default_true")]
    pub junit: bool,

    /// Filename for the JUnit XML report, relative to `output_dir`.
    #[serde(default = "default_junit_file")]
    pub junit_file: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            junit: true,
            junit_file: default_junit_file(),
        }
    }
}

impl ReportConfig {
    pub fn junit_path(&self) -> PathBuf {
        self.output_dir.join(&self.junit_file)
    }
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_true() -> bool {
    true
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}
