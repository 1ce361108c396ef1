//! A controller run: from configuration to a [`RunResult`].
//!
//! ```text
//!   prepare()                        configuration errors stop here
//!     ├─ resolve engine binary       (env var, must exist)
//!     └─ install worker bootstrap    (skipped when present)
//!   run()
//!     ├─ launch engine               STAGEHAND_ENDPOINT=<well-known endpoint>
//!     ├─ connect (retry) ─ Liveness handshake
//!     ├─ RunSuite × N ─────────────► events relayed to the reporter
//!     ├─ Terminate ─ wait(exit_timeout) ─ kill if still running
//!     └─ dispose
//! ```
//!
//! One cancellation token covers the run. Ctrl-C and the session timeout
//! both cancel it; the remote executor then closes started tests as
//! Terminated and the engine is killed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::{
    EngineInvocation, EngineProcess, InstallOutcome, engine_working_dir, install_bootstrap,
    resolve_engine_binary, strategy_for,
};
use crate::executor::RemoteExecutor;
use crate::protocol::transport::ENDPOINT_ENV;
use crate::protocol::{Command, Endpoint, RunSettings, StatusCode, TestEvent};
use crate::report::{NullReporter, Reporter, RunCollector, RunResult};
use crate::suite::TestSuiteNode;

/// Reads a JSON array of suite descriptors.
pub fn load_suites(path: &Path) -> Result<Vec<TestSuiteNode>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read suites file: {}", path.display()))?;
    let suites: Vec<TestSuiteNode> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse suites file: {}", path.display()))?;
    Ok(suites)
}

/// Everything checked before the engine is spawned.
#[derive(Debug, Clone)]
pub struct PreparedEngine {
    pub binary: PathBuf,
    pub project_dir: PathBuf,
    pub endpoint: Endpoint,
    pub bootstrap: InstallOutcome,
}

/// Drives one run against one engine process.
pub struct Session {
    config: Config,
    reporter: Arc<dyn Reporter>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            reporter: Arc::new(NullReporter),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporter = Arc::new(reporter);
        self
    }

    /// Token that cancels the whole run. Cancelling twice, or after the
    /// run has finished, is harmless.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Resolves the engine binary and installs the worker bootstrap.
    pub fn prepare(&self) -> Result<PreparedEngine> {
        let binary = resolve_engine_binary(&self.config.engine.binary_env)?;
        let project_dir = self.config.engine.expanded_project_dir();
        let bootstrap = install_bootstrap(&project_dir, &self.config.harness.channel)
            .context("Failed to install the worker bootstrap")?;
        let endpoint = Endpoint::well_known(&self.config.harness.channel);
        debug!(binary = %binary.display(), %endpoint, "Engine prepared");
        Ok(PreparedEngine {
            binary,
            project_dir,
            endpoint,
            bootstrap,
        })
    }

    /// Runs every suite in the engine. Host failures end up in
    /// [`RunResult::host_failure`]; per-test detail in the results.
    pub async fn run(&self, engine: PreparedEngine, suites: Vec<TestSuiteNode>) -> RunResult {
        let started = Instant::now();
        self.reporter.on_run_start(&suites).await;

        let run_token = self.cancel.child_token();
        let watchdog = tokio::spawn({
            let token = run_token.clone();
            let timeout = self.config.harness.session_timeout();
            async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {
                        warn!("Session timed out after {:?}", timeout);
                        token.cancel();
                    }
                }
            }
        });

        let (collector, host_failure) = self.drive(&engine, &suites, &run_token).await;
        watchdog.abort();

        let host_failure = match host_failure {
            Some(failure) => Some(failure),
            None if run_token.is_cancelled() => Some("Run cancelled".to_string()),
            None => None,
        };
        let result = collector.finish(started.elapsed(), host_failure);
        self.reporter.on_run_complete(&result).await;
        result
    }

    async fn drive(
        &self,
        engine: &PreparedEngine,
        suites: &[TestSuiteNode],
        cancel: &CancellationToken,
    ) -> (RunCollector, Option<String>) {
        let engine_config = &self.config.engine;
        let invocation = EngineInvocation::new(&engine.binary)
            .with_args(engine_config.args.iter().cloned())
            .with_working_dir(engine_working_dir(&engine.project_dir))
            .with_env(ENDPOINT_ENV, engine.endpoint.to_string());
        let strategy = strategy_for(&engine_config.debugger);

        let process = match EngineProcess::launch(&invocation, strategy.as_ref()).await {
            Ok(process) => process,
            Err(e) => return (RunCollector::new(), Some(e.to_string())),
        };

        let stream = tokio::select! {
            connected = engine.endpoint.connect_with_retry(engine_config.connect_timeout(), cancel) => connected,
            exit = process.exited() => Err(std::io::Error::other(format!(
                "engine exited before the worker came up ({:?})",
                exit.and_then(|e| e.code)
            ))),
        };
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                process.cancel().await;
                process.dispose();
                return (RunCollector::new(), Some(format!("Failed to connect to the worker: {}", e)));
            }
        };

        let mut executor = RemoteExecutor::new(stream);
        let handshake = executor.execute(&Command::Liveness, &|_: TestEvent| {}, cancel).await;
        if !handshake.is_ok() {
            process.cancel().await;
            process.dispose();
            return (
                RunCollector::new(),
                Some(format!("Worker handshake failed: {}", handshake.payload)),
            );
        }
        info!(pid = process.pid(), "Worker is alive");

        let settings = RunSettings {
            capture_std_out: self.config.harness.capture_stdout,
            report_orphans: self.config.harness.report_orphans,
            stage_timeout_ms: None,
        }
        .with_stage_timeout(self.config.harness.stage_timeout());
        let (collector, host_failure) =
            run_suites(&mut executor, suites, settings, self.reporter.clone(), cancel).await;

        if cancel.is_cancelled() || host_failure.is_some() {
            process.cancel().await;
        } else {
            let shutdown = CancellationToken::new();
            let response = tokio::time::timeout(
                engine_config.exit_timeout(),
                executor.execute(&Command::Terminate, &|_: TestEvent| {}, &shutdown),
            )
            .await;
            if !matches!(response, Ok(ref r) if r.is_ok()) {
                warn!("Worker did not acknowledge Terminate");
            }
            match process.wait(engine_config.exit_timeout()).await {
                Ok(exit) if exit.success() => {}
                Ok(exit) => warn!(code = ?exit.code, "Engine exited abnormally after the run"),
                Err(e) => warn!("{}", e),
            }
        }
        process.dispose();

        (collector, host_failure)
    }
}

/// Runs each suite with `RunSuite`, relaying events to `reporter` and
/// folding them into a collector.
///
/// Stops at the first disconnect or cancellation. The second value
/// describes the failure that stopped the run, if any.
pub async fn run_suites<S>(
    executor: &mut RemoteExecutor<S>,
    suites: &[TestSuiteNode],
    settings: RunSettings,
    reporter: Arc<dyn Reporter>,
    cancel: &CancellationToken,
) -> (RunCollector, Option<String>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<TestEvent>();
    let relay = tokio::spawn(async move {
        let mut collector = RunCollector::new();
        while let Some(event) = rx.recv().await {
            collector.record(&event);
            reporter.on_event(&event).await;
        }
        collector
    });
    let listener = move |event: TestEvent| {
        let _ = tx.send(event);
    };

    let mut host_failure = None;
    for suite in suites {
        if cancel.is_cancelled() {
            break;
        }
        info!(suite = %suite.type_name, tests = suite.tests.len(), "Running suite");
        let command = Command::RunSuite {
            suite: suite.clone(),
            capture_std_out: settings.capture_std_out,
            report_orphans: settings.report_orphans,
            stage_timeout_ms: settings.stage_timeout_ms,
        };
        let response = executor.execute(&command, &listener, cancel).await;
        match response.status_code {
            StatusCode::Ok => debug!(suite = %suite.type_name, "Suite finished"),
            StatusCode::Cancelled => {
                warn!(suite = %suite.type_name, "Suite cancelled: {}", response.payload);
                break;
            }
            StatusCode::Disconnected | StatusCode::InternalError => {
                host_failure = Some(format!("{}: {}", suite.type_name, response.payload));
                break;
            }
            status => {
                warn!(suite = %suite.type_name, ?status, "Suite rejected: {}", response.payload);
                host_failure.get_or_insert_with(|| {
                    format!("{}: {}", suite.type_name, response.payload)
                });
            }
        }
    }
    drop(listener);

    match relay.await {
        Ok(collector) => (collector, host_failure),
        Err(e) => (
            RunCollector::new(),
            Some(host_failure.unwrap_or_else(|| format!("Event relay failed: {}", e))),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_suites_defaults_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("suites.json");
        std::fs::write(
            &path,
            r#"[{"type_name": "PlayerTests", "location": "tests/player.lua",
                 "tests": [{"name": "spawns", "line_number": 4}]}]"#,
        )
        .unwrap();

        let suites = load_suites(&path).unwrap();
        assert_eq!(suites.len(), 1);
        assert_eq!(suites[0].tests[0].name, "spawns");
        assert_eq!(suites[0].tests[0].iterations, 1);
        assert!(!suites[0].id.is_nil());
    }

    #[test]
    fn test_prepare_fails_without_engine() {
        let mut config = Config::default();
        config.engine.binary_env = "STAGEHAND_TEST_NO_SUCH_ENGINE".to_string();
        let err = Session::new(config).prepare().unwrap_err();
        assert!(err.to_string().contains("STAGEHAND_TEST_NO_SUCH_ENGINE"));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_after_run() {
        let session = Session::new(Config::default());
        let token = session.cancellation_token();
        token.cancel();
        token.cancel();
        assert!(session.cancellation_token().is_cancelled());
    }
}
