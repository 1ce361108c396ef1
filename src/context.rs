//! Per-run mutable state shared by the stages of one suite or test.
//!
//! # Ownership
//!
//! ```text
//! suite context ──owns──▶ test context ──owns──▶ row context
//!       ▲                      │  ▲                   │
//!       └──────── weak ────────┘  └────── weak ───────┘
//! ```
//!
//! A parent owns its children through a list of `Arc`s; a child only holds
//! a `Weak` back to its parent, so there is never a strong cycle. Disposing
//! a context disposes its children first, runs pending auto-release
//! actions, then detaches it from its parent.
//!
//! Every context of one suite run shares a [`SuiteScope`]: the suite node,
//! its registration table, run settings, and the sink events are written to.

mod store;

pub use store::ExecutionContextStore;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::pipeline::{
    DEFAULT_STAGE_TIMEOUT, ExceptionMonitor, OrphanPolicy, SuiteDefinition, TrackedResource,
    TrackedResources,
};
use crate::protocol::{Outcome, Report, RunSettings, TestEvent};
use crate::suite::{TestCaseNode, TestSuiteNode};

/// State shared by all contexts of one loaded suite.
pub struct SuiteScope {
    pub node: TestSuiteNode,
    pub definition: SuiteDefinition,
    pub settings: RunSettings,
    pub stage_timeout: Duration,
    pub resources: TrackedResources,
    pub orphan_policy: Arc<dyn OrphanPolicy>,
    pub monitor: ExceptionMonitor,
    events: Mutex<Option<UnboundedSender<TestEvent>>>,
}

impl SuiteScope {
    /// A scope counting orphans with its own [`TrackedResources`].
    pub fn new(node: TestSuiteNode, definition: SuiteDefinition, settings: RunSettings) -> Self {
        let resources = TrackedResources::new();
        Self {
            node,
            definition,
            settings,
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
            orphan_policy: Arc::new(resources.clone()),
            resources,
            monitor: ExceptionMonitor::new(),
            events: Mutex::new(None),
        }
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    /// Shares a resource counter; it also becomes the orphan policy.
    pub fn with_resources(mut self, resources: TrackedResources) -> Self {
        self.orphan_policy = Arc::new(resources.clone());
        self.resources = resources;
        self
    }

    pub fn with_orphan_policy(mut self, policy: Arc<dyn OrphanPolicy>) -> Self {
        self.orphan_policy = policy;
        self
    }

    pub fn with_monitor(mut self, monitor: ExceptionMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    /// Routes events to `sink` until replaced. Each command attaches its own.
    pub fn attach_events(&self, sink: UnboundedSender<TestEvent>) {
        if let Ok(mut events) = self.events.lock() {
            *events = Some(sink);
        }
    }

    pub fn detach_events(&self) {
        if let Ok(mut events) = self.events.lock() {
            *events = None;
        }
    }

    fn emit(&self, event: TestEvent) {
        let Ok(events) = self.events.lock() else {
            return;
        };
        match events.as_ref() {
            Some(sink) => {
                if sink.send(event).is_err() {
                    debug!("Event sink closed, dropping event");
                }
            }
            None => debug!(
                "No event sink attached, dropping {:?} for {}",
                event.event_type, event.fully_qualified_name
            ),
        }
    }
}

type Release = Box<dyn FnOnce() + Send>;

/// Live state of a suite, a test case, or one parameter row.
pub struct ExecutionContext {
    id: Uuid,
    name: String,
    display_name: Option<String>,
    scope: Arc<SuiteScope>,
    test: Option<TestCaseNode>,
    arguments: Vec<Value>,
    line: u32,
    parent: Weak<ExecutionContext>,
    children: Mutex<Vec<Arc<ExecutionContext>>>,
    reports: Mutex<Vec<Report>>,
    stdout: Mutex<Vec<String>>,
    auto_free: Mutex<Vec<Release>>,
    orphan_baseline: AtomicUsize,
    orphans: AtomicUsize,
    setup_ok: AtomicBool,
    skipped: AtomicBool,
    row_outcome: Mutex<Option<Outcome>>,
    cancel: CancellationToken,
    started: Instant,
    disposed: AtomicBool,
}

impl ExecutionContext {
    /// Root context of a suite run.
    pub fn for_suite(scope: Arc<SuiteScope>, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            id: scope.node.id,
            name: scope.node.type_name.clone(),
            display_name: None,
            test: None,
            arguments: Vec::new(),
            line: 0,
            parent: Weak::new(),
            scope,
            children: Mutex::new(Vec::new()),
            reports: Mutex::new(Vec::new()),
            stdout: Mutex::new(Vec::new()),
            auto_free: Mutex::new(Vec::new()),
            orphan_baseline: AtomicUsize::new(0),
            orphans: AtomicUsize::new(0),
            setup_ok: AtomicBool::new(true),
            skipped: AtomicBool::new(false),
            row_outcome: Mutex::new(None),
            cancel,
            started: Instant::now(),
            disposed: AtomicBool::new(false),
        })
    }

    /// Creates a nested context owned by `self`.
    pub fn child(
        self: &Arc<Self>,
        id: Uuid,
        test: TestCaseNode,
        display_name: Option<String>,
        arguments: Vec<Value>,
    ) -> Arc<Self> {
        let child = Arc::new(Self {
            id,
            name: self.scope.node.qualified_name(&test),
            display_name,
            line: test.line_number,
            test: Some(test),
            arguments,
            parent: Arc::downgrade(self),
            scope: self.scope.clone(),
            children: Mutex::new(Vec::new()),
            reports: Mutex::new(Vec::new()),
            stdout: Mutex::new(Vec::new()),
            auto_free: Mutex::new(Vec::new()),
            orphan_baseline: AtomicUsize::new(0),
            orphans: AtomicUsize::new(0),
            setup_ok: AtomicBool::new(true),
            skipped: AtomicBool::new(false),
            row_outcome: Mutex::new(None),
            cancel: self.cancel.child_token(),
            started: Instant::now(),
            disposed: AtomicBool::new(false),
        });
        if let Ok(mut children) = self.children.lock() {
            children.push(child.clone());
        }
        child
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Fully qualified name (`Suite` or `Suite::test`).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn scope(&self) -> &Arc<SuiteScope> {
        &self.scope
    }

    pub fn test(&self) -> Option<&TestCaseNode> {
        self.test.as_ref()
    }

    pub fn arguments(&self) -> &[Value] {
        &self.arguments
    }

    /// Source line of the current test (0 for a suite).
    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn parent(&self) -> Option<Arc<ExecutionContext>> {
        self.parent.upgrade()
    }

    pub fn child_count(&self) -> usize {
        self.children.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn emit(&self, event: TestEvent) {
        self.scope.emit(event);
    }

    pub fn add_report(&self, report: Report) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(report);
        }
    }

    /// Drains the collected reports, appending captured stdout as one
    /// Stdout report.
    pub fn take_reports(&self) -> Vec<Report> {
        let mut reports = self
            .reports
            .lock()
            .map(|mut r| std::mem::take(&mut *r))
            .unwrap_or_default();
        let stdout = self
            .stdout
            .lock()
            .map(|mut s| std::mem::take(&mut *s))
            .unwrap_or_default();
        if !stdout.is_empty() {
            reports.push(Report::new(
                crate::protocol::ReportType::Stdout,
                self.line,
                stdout.join("\n"),
            ));
        }
        reports
    }

    /// Captures a line of test output, or logs it when capture is off.
    pub fn write_stdout(&self, line: impl Into<String>) {
        let line = line.into();
        if self.scope.settings.capture_std_out {
            if let Ok(mut stdout) = self.stdout.lock() {
                stdout.push(line);
            }
        } else {
            info!(target: "test_output", test = %self.name, "{}", line);
        }
    }

    pub fn track(&self, name: impl Into<String>) -> TrackedResource {
        self.scope.resources.track(name)
    }

    /// Keeps `value` alive until the end of the current test body.
    pub fn auto_free<T: Send + 'static>(&self, value: T) {
        if let Ok(mut pending) = self.auto_free.lock() {
            pending.push(Box::new(move || drop(value)));
        }
    }

    /// Runs pending auto-release actions; returns how many ran.
    pub fn release_auto_free(&self) -> usize {
        let pending = self
            .auto_free
            .lock()
            .map(|mut p| std::mem::take(&mut *p))
            .unwrap_or_default();
        let count = pending.len();
        for release in pending {
            release();
        }
        count
    }

    /// Records the live-resource count before the test body.
    pub fn begin_orphan_scope(&self) {
        self.orphan_baseline
            .store(self.scope.orphan_policy.live_count(), Ordering::SeqCst);
    }

    /// Live resources added since [`begin_orphan_scope`](Self::begin_orphan_scope).
    pub fn measure_orphans(&self) -> usize {
        let count = self
            .scope
            .orphan_policy
            .live_count()
            .saturating_sub(self.orphan_baseline.load(Ordering::SeqCst));
        self.orphans.store(count, Ordering::SeqCst);
        count
    }

    pub fn orphans(&self) -> usize {
        self.orphans.load(Ordering::SeqCst)
    }

    pub fn set_setup_ok(&self, ok: bool) {
        self.setup_ok.store(ok, Ordering::SeqCst);
    }

    /// Whether the setup stage of this context succeeded.
    pub fn setup_ok(&self) -> bool {
        self.setup_ok.load(Ordering::SeqCst)
    }

    /// Marks the context as skipped: no further stage runs for it.
    pub fn mark_skipped(&self) {
        self.skipped.store(true, Ordering::SeqCst);
        self.setup_ok.store(false, Ordering::SeqCst);
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped.load(Ordering::SeqCst)
    }

    /// Folds a parameter row's outcome into this context's aggregate.
    pub fn record_row_outcome(&self, outcome: Outcome) {
        if let Ok(mut aggregate) = self.row_outcome.lock() {
            *aggregate = Some(match *aggregate {
                Some(current) => current.merge(outcome),
                None => outcome,
            });
        }
    }

    pub fn row_outcome(&self) -> Option<Outcome> {
        self.row_outcome.lock().ok().and_then(|o| *o)
    }

    /// Releases this context and its children. Safe to call more than once.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let children = self
            .children
            .lock()
            .map(|mut c| std::mem::take(&mut *c))
            .unwrap_or_default();
        for child in children {
            child.dispose();
        }
        self.release_auto_free();

        if let Some(parent) = self.parent.upgrade()
            && let Ok(mut siblings) = parent.children.lock()
        {
            siblings.retain(|c| c.id != self.id);
        }
        debug!(context = %self.name, "Disposed execution context");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("display_name", &self.display_name)
            .field("children", &self.child_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
