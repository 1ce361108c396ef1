//! Worker side of the exchange, hosted inside the engine process.
//!
//! # Command handling
//!
//! | Command | Effect | Error status |
//! |---------|--------|--------------|
//! | `LoadSuite` | create suite context, SuiteBefore, Before stage | `SuiteNotFound` |
//! | `SetupTest` | create test context, TestBefore, BeforeTest | `ContextNotFound` |
//! | `RunTest` | test body (or every parameter row) | `ContextNotFound` |
//! | `TeardownTest` | AfterTest, TestAfter, dispose | `ContextNotFound` |
//! | `UnloadSuite` | After stage, SuiteAfter, dispose | `ContextNotFound` |
//! | `RunSuite` | the whole lifecycle in one round trip | `SuiteNotFound` |
//! | `Liveness` | answers `alive` | |
//! | `Terminate` | answers, then stops serving | |
//!
//! Commands from every connection pass through one gate, so exactly one is
//! in flight at a time. Events are written while the handler is still
//! running; the response is always written last.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{WorkerError, WorkerResult};
use crate::context::{ExecutionContext, ExecutionContextStore, SuiteScope};
use crate::pipeline::{
    self, DEFAULT_STAGE_TIMEOUT, ExceptionMonitor, OrphanPolicy, SuiteCatalog, TrackedResources,
};
use crate::protocol::transport::ENDPOINT_ENV;
use crate::protocol::{
    ChannelResult, Command, Endpoint, FramedChannel, Listener, Message, Response, RunSettings,
    StatusCode, TestEvent, codec,
};
use crate::suite::TestSuiteNode;

/// Settings shared by every suite the worker loads.
#[derive(Clone)]
pub struct WorkerConfig {
    pub stage_timeout: Duration,
    pub resources: TrackedResources,
    /// Replaces the resource counter as the orphan policy when set.
    pub orphan_policy: Option<Arc<dyn OrphanPolicy>>,
    pub monitor: ExceptionMonitor,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
            resources: TrackedResources::new(),
            orphan_policy: None,
            monitor: ExceptionMonitor::new(),
        }
    }
}

/// Executes commands against registered suite types.
#[derive(Clone)]
pub struct InProcessExecutor {
    catalog: Arc<SuiteCatalog>,
    store: ExecutionContextStore,
    /// test id → id of the loaded suite that owns it
    owners: Arc<DashMap<Uuid, Uuid>>,
    gate: Arc<Mutex<()>>,
    shutdown: CancellationToken,
    config: WorkerConfig,
}

impl InProcessExecutor {
    pub fn new(catalog: SuiteCatalog) -> Self {
        Self {
            catalog: Arc::new(catalog),
            store: ExecutionContextStore::new(),
            owners: Arc::new(DashMap::new()),
            gate: Arc::new(Mutex::new(())),
            shutdown: CancellationToken::new(),
            config: WorkerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Fires once `Terminate` has been answered.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn store(&self) -> &ExecutionContextStore {
        &self.store
    }

    /// Binds the endpoint named by `STAGEHAND_ENDPOINT` and serves it.
    ///
    /// This is the entry point the engine's bootstrap calls.
    pub async fn serve_from_env(self) -> WorkerResult<()> {
        let endpoint: Endpoint = std::env::var(ENDPOINT_ENV)
            .map_err(|_| WorkerError::MissingEndpoint(ENDPOINT_ENV))?
            .parse()?;
        let listener = endpoint.bind().await.map_err(WorkerError::Bind)?;
        info!("Worker listening on {}", endpoint);
        self.serve(listener).await
    }

    /// Accepts controller connections until terminated.
    pub async fn serve(&self, listener: Listener) -> WorkerResult<()> {
        loop {
            let stream = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted.map_err(WorkerError::Accept)?,
            };
            let worker = self.clone();
            tokio::spawn(async move {
                if let Err(e) = worker.serve_connection(stream).await {
                    warn!("Controller connection ended with error: {}", e);
                }
            });
        }
        self.release_all();
        info!("Worker stopped");
        Ok(())
    }

    /// Serves commands from one connection until it closes or the worker
    /// is terminated.
    pub async fn serve_connection<S>(&self, stream: S) -> WorkerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut channel = FramedChannel::new(stream);
        let connection = self.shutdown.child_token();
        let result = self.command_loop(&mut channel, &connection).await;
        connection.cancel();
        result
    }

    async fn command_loop<S>(
        &self,
        channel: &mut FramedChannel<S>,
        connection: &CancellationToken,
    ) -> WorkerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                frame = channel.receive() => frame,
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) if e.is_closed() => {
                    info!("Controller disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            let _gate = self.gate.lock().await;
            let command = match codec::decode(&frame) {
                Ok(Message::Command(command)) => command,
                Ok(_) => {
                    let response = Response::error(StatusCode::InvalidCommand, "Expected a command");
                    channel.send_message(&response.into()).await?;
                    continue;
                }
                Err(e) => {
                    warn!("Rejecting undecodable command: {}", e);
                    let response = Response::error(StatusCode::InvalidCommand, e.to_string());
                    channel.send_message(&response.into()).await?;
                    continue;
                }
            };

            let terminate = matches!(command, Command::Terminate);
            self.dispatch(command, channel, connection).await?;
            if terminate {
                info!("Terminate received, shutting down");
                self.shutdown.cancel();
                return Ok(());
            }
        }
    }

    /// Runs one handler, streaming its events, then writes its response.
    async fn dispatch<S>(
        &self,
        command: Command,
        channel: &mut FramedChannel<S>,
        connection: &CancellationToken,
    ) -> ChannelResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let name = command.name();
        debug!(command = name, "Dispatching");

        let (events, mut received) = mpsc::unbounded_channel();
        let handler = AssertUnwindSafe(self.handle(command, events, connection)).catch_unwind();
        tokio::pin!(handler);

        let mut write_error = None;
        let response = loop {
            tokio::select! {
                Some(event) = received.recv() => {
                    if write_error.is_none()
                        && let Err(e) = channel.send_message(&event.into()).await
                    {
                        // keep driving the handler so teardown still runs
                        warn!(command = name, "Event write failed, cancelling: {}", e);
                        connection.cancel();
                        write_error = Some(e);
                    }
                }
                finished = &mut handler => break match finished {
                    Ok(response) => response,
                    Err(panic) => {
                        let message = panic_message(panic);
                        error!(command = name, "Handler panicked: {}", message);
                        Response::error(StatusCode::InternalError, message)
                    }
                },
            }
        };

        if let Some(e) = write_error {
            return Err(e);
        }
        while let Ok(event) = received.try_recv() {
            channel.send_message(&event.into()).await?;
        }
        debug!(command = name, status = ?response.status_code, "Responding");
        channel.send_message(&response.into()).await
    }

    async fn handle(
        &self,
        command: Command,
        events: mpsc::UnboundedSender<TestEvent>,
        connection: &CancellationToken,
    ) -> Response {
        match command {
            Command::LoadSuite { suite, settings } => {
                self.load_suite(suite, settings, events, connection).await
            }
            Command::SetupTest { test_id } => self.setup_test(test_id, events).await,
            Command::RunTest { test_id } => self.run_test(test_id, events).await,
            Command::TeardownTest { test_id } => self.teardown_test(test_id, events).await,
            Command::UnloadSuite { suite_id } => self.unload_suite(suite_id, events).await,
            Command::RunSuite {
                suite,
                capture_std_out,
                report_orphans,
                stage_timeout_ms,
            } => {
                let settings = RunSettings {
                    capture_std_out,
                    report_orphans,
                    stage_timeout_ms,
                };
                self.run_suite(suite, settings, events, connection).await
            }
            Command::Liveness => Response::ok("alive"),
            Command::Terminate => Response::ok("terminating"),
        }
    }

    fn create_suite_context(
        &self,
        suite: TestSuiteNode,
        settings: RunSettings,
        connection: &CancellationToken,
    ) -> Result<Arc<ExecutionContext>, Response> {
        let Some(definition) = self.catalog.instantiate(&suite.type_name) else {
            warn!(suite = %suite.type_name, "Unknown suite type");
            return Err(Response::error(
                StatusCode::SuiteNotFound,
                format!("Suite type '{}' is not registered", suite.type_name),
            ));
        };

        let mut scope = SuiteScope::new(suite, definition, settings)
            .with_stage_timeout(
                settings
                    .stage_timeout()
                    .unwrap_or(self.config.stage_timeout),
            )
            .with_resources(self.config.resources.clone())
            .with_monitor(self.config.monitor.clone());
        if let Some(policy) = &self.config.orphan_policy {
            scope = scope.with_orphan_policy(policy.clone());
        }
        Ok(ExecutionContext::for_suite(
            Arc::new(scope),
            connection.child_token(),
        ))
    }

    async fn load_suite(
        &self,
        suite: TestSuiteNode,
        settings: RunSettings,
        events: mpsc::UnboundedSender<TestEvent>,
        connection: &CancellationToken,
    ) -> Response {
        let suite_id = suite.id;
        let ctx = match self.create_suite_context(suite, settings, connection) {
            Ok(ctx) => ctx,
            Err(response) => return response,
        };
        for test in &ctx.scope().node.tests {
            self.owners.insert(test.id, suite_id);
        }
        if let Some(previous) = self.store.set(suite_id, ctx.clone()) {
            warn!(suite = %previous.name(), "Replacing a loaded suite with the same id");
            previous.dispose();
        }

        ctx.scope().attach_events(events);
        pipeline::suite_before(&ctx).await;
        ctx.scope().detach_events();
        Response::ok(format!("Loaded {}", ctx.name()))
    }

    fn suite_of(&self, test_id: Uuid) -> Result<Arc<ExecutionContext>, Response> {
        self.owners
            .get(&test_id)
            .and_then(|owner| self.store.get(owner.value()))
            .ok_or_else(|| not_found("No loaded suite owns test", test_id))
    }

    async fn setup_test(&self, test_id: Uuid, events: mpsc::UnboundedSender<TestEvent>) -> Response {
        let suite = match self.suite_of(test_id) {
            Ok(suite) => suite,
            Err(response) => return response,
        };
        let Some(test) = suite.scope().node.test(test_id).cloned() else {
            return not_found("Unknown test", test_id);
        };

        suite.scope().attach_events(events);
        let ctx = pipeline::setup_test(&suite, &test).await;
        suite.scope().detach_events();
        if let Some(previous) = self.store.set(test_id, ctx.clone()) {
            warn!(test = %previous.name(), "Replacing a test that was already set up");
            previous.dispose();
        }
        Response::ok(format!("Set up {}", ctx.name()))
    }

    async fn run_test(&self, test_id: Uuid, events: mpsc::UnboundedSender<TestEvent>) -> Response {
        let Some(ctx) = self.store.get(&test_id) else {
            return not_found("No context for test", test_id);
        };
        ctx.scope().attach_events(events);
        pipeline::run_test(&ctx).await;
        ctx.scope().detach_events();
        Response::ok(format!("Ran {}", ctx.name()))
    }

    async fn teardown_test(
        &self,
        test_id: Uuid,
        events: mpsc::UnboundedSender<TestEvent>,
    ) -> Response {
        let Some(ctx) = self.store.remove(&test_id) else {
            return not_found("No context for test", test_id);
        };
        ctx.scope().attach_events(events);
        pipeline::teardown_test(&ctx).await;
        ctx.scope().detach_events();
        Response::ok(format!("Tore down {}", ctx.name()))
    }

    async fn unload_suite(
        &self,
        suite_id: Uuid,
        events: mpsc::UnboundedSender<TestEvent>,
    ) -> Response {
        let Some(ctx) = self.store.remove(&suite_id) else {
            return not_found("No context for suite", suite_id);
        };
        ctx.scope().attach_events(events);

        // tests still set up when the suite goes away are torn down first
        for test in &ctx.scope().node.tests {
            self.owners.remove(&test.id);
            if let Some(test_ctx) = self.store.remove(&test.id) {
                warn!(test = %test_ctx.name(), "Tearing down a test left open at unload");
                pipeline::teardown_test(&test_ctx).await;
            }
        }
        pipeline::suite_after(&ctx).await;
        ctx.scope().detach_events();
        ctx.dispose();
        Response::ok(format!("Unloaded {}", ctx.name()))
    }

    async fn run_suite(
        &self,
        suite: TestSuiteNode,
        settings: RunSettings,
        events: mpsc::UnboundedSender<TestEvent>,
        connection: &CancellationToken,
    ) -> Response {
        let suite_id = suite.id;
        let ctx = match self.create_suite_context(suite, settings, connection) {
            Ok(ctx) => ctx,
            Err(response) => return response,
        };
        self.store.set(suite_id, ctx.clone());
        ctx.scope().attach_events(events);

        let completed = pipeline::run_suite(&ctx).await;

        ctx.scope().detach_events();
        self.store.remove(&suite_id);
        ctx.dispose();
        if completed {
            Response::ok(format!("Ran {}", ctx.name()))
        } else {
            Response::error(StatusCode::Cancelled, format!("{} was cancelled", ctx.name()))
        }
    }

    /// Disposes every context still loaded.
    fn release_all(&self) {
        let remaining = self.store.drain();
        if !remaining.is_empty() {
            warn!("Disposing {} context(s) left at shutdown", remaining.len());
        }
        for ctx in remaining {
            ctx.dispose();
        }
        self.owners.clear();
    }
}

fn not_found(what: &str, id: Uuid) -> Response {
    Response::error(StatusCode::ContextNotFound, format!("{}: {}", what, id))
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string())
}
