//! The staged execution state machine for one suite.
//!
//! # Lifecycle
//!
//! ```text
//! SuiteBefore ── Before
//!    │
//!    ├─ TestBefore ── BeforeTest ── TestBody ── release ── AfterTest ── TestAfter
//!    │                                                   (once per test case)
//!    ├─ TestBefore                                       (parameterized case)
//!    │    ├─ TestBefore ── BeforeTest ── TestBody ── release ── AfterTest ── TestAfter
//!    │    └─ ...                                         (once per row)
//!    │  TestAfter
//!    │
//! After ── SuiteAfter
//! ```
//!
//! Each stage runs under [`stage::race`]: the body against the stage timeout
//! and, except for teardown stages, the context's cancellation token. The
//! result is classified into a [`StageOutcome`] and its report is attached
//! to the owning context. A stage with nothing registered succeeds at once.
//!
//! The test phases are split into [`setup_test`], [`run_test`], and
//! [`teardown_test`] so the worker can drive them from three separate
//! commands; [`run_suite`] chains everything for a single round trip.
//!
//! # Rules
//!
//! | Situation | Behavior |
//! |-----------|----------|
//! | Before fails | no tests run, After is skipped, failure lands on SuiteAfter |
//! | test body fails | auto-release and orphan check still run |
//! | cancellation mid-suite | remaining tests are skipped, After still runs |
//! | `skip_reason` set | a TestBefore/TestAfter pair with one Skipped report |

pub mod definition;
pub mod resources;
pub mod stage;

pub use definition::{
    DataPointFn, StageArgs, StageFn, StageFuture, StageMethod, SuiteCatalog, SuiteDefinition,
    SuiteFactory,
};
pub use resources::{
    ExceptionMonitor, IgnoreOrphans, OrphanPolicy, Subscription, TrackedResource,
    TrackedResources, UnexpectedError,
};
pub use stage::{StageError, StageKind, StageOutcome, classify};

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::protocol::{Report, ReportType, TestEvent};
use crate::suite::{TestCaseNode, row_display_name};

/// Timeout applied to any stage that declares none.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs one stage of `ctx` and records its report.
async fn execute_stage(
    ctx: &Arc<ExecutionContext>,
    kind: StageKind,
    method: Option<&StageMethod>,
    iterations: u32,
) -> StageOutcome {
    let Some(method) = method else {
        return StageOutcome::Success;
    };

    let scope = ctx.scope();
    let timeout = match (kind, ctx.test().and_then(|t| t.timeout())) {
        (StageKind::TestBody, Some(case_timeout)) => case_timeout,
        _ => method.timeout.unwrap_or(scope.stage_timeout),
    };
    let line = method.line.unwrap_or(ctx.line());

    debug!(context = %ctx.name(), stage = %kind, ?timeout, "Running stage");
    let args = StageArgs {
        context: ctx.clone(),
        arguments: ctx.arguments().to_vec(),
    };
    let cancel = ctx.cancellation();
    let result = stage::race(
        method.invoke_repeated(args, iterations),
        timeout,
        (!kind.is_teardown()).then_some(&cancel),
    )
    .await;

    let outcome = match result {
        Ok(()) => StageOutcome::Success,
        Err(e) => classify(e, line),
    };

    if let StageOutcome::Abort {
        message,
        stack_trace,
        ..
    } = &outcome
    {
        error!(
            context = %ctx.name(),
            stage = %kind,
            "Unexpected error: {}\n{}",
            message,
            stack_trace.as_deref().unwrap_or("<no stack trace>")
        );
        scope.monitor.notify(&UnexpectedError {
            source: ctx.name().to_string(),
            message: message.clone(),
            stack_trace: stack_trace.clone(),
        });
    }

    if let Some(report) = outcome.to_report() {
        ctx.add_report(report);
    }
    outcome
}

/// Emits SuiteBefore and runs the Before stage.
pub async fn suite_before(ctx: &Arc<ExecutionContext>) -> StageOutcome {
    info!(suite = %ctx.name(), "Suite started");
    ctx.emit(TestEvent::suite_before(ctx.id(), ctx.name()));

    let method = ctx.scope().definition.stage_method(StageKind::Before);
    let outcome = execute_stage(ctx, StageKind::Before, method, 1).await;
    ctx.set_setup_ok(outcome.is_success());
    outcome
}

/// Runs the After stage (when Before succeeded) and emits SuiteAfter.
pub async fn suite_after(ctx: &Arc<ExecutionContext>) {
    if ctx.setup_ok() {
        let method = ctx.scope().definition.stage_method(StageKind::After);
        execute_stage(ctx, StageKind::After, method, 1).await;
    } else {
        debug!(suite = %ctx.name(), "Skipping after stage, before stage failed");
    }

    let event = TestEvent::suite_after(ctx.id(), ctx.name())
        .with_elapsed(ctx.elapsed())
        .with_reports(ctx.take_reports());
    info!(
        suite = %ctx.name(),
        success = event.outcome.success,
        elapsed_ms = event.elapsed.as_millis() as u64,
        "Suite finished"
    );
    ctx.emit(event);
}

/// Creates the test context, emits TestBefore, and runs BeforeTest.
///
/// For parameterized cases BeforeTest runs per row inside [`run_test`].
pub async fn setup_test(suite: &Arc<ExecutionContext>, test: &TestCaseNode) -> Arc<ExecutionContext> {
    let ctx = suite.child(test.id, test.clone(), None, test.single_arguments());
    ctx.emit(TestEvent::test_before(ctx.id(), ctx.name()));

    let skip_reason = match &test.skip_reason {
        Some(reason) => Some(reason.clone()),
        None if !suite.setup_ok() => Some("Skipped, the suite setup failed".to_string()),
        None => None,
    };
    if let Some(reason) = skip_reason {
        ctx.add_report(Report::new(ReportType::Skipped, test.line_number, reason));
        ctx.mark_skipped();
        return ctx;
    }

    if !test.is_parameterized() {
        let method = ctx.scope().definition.stage_method(StageKind::BeforeTest);
        let outcome = execute_stage(&ctx, StageKind::BeforeTest, method, 1).await;
        ctx.set_setup_ok(outcome.is_success());
        // fixtures from BeforeTest are released by AfterTest, not the body
        ctx.begin_orphan_scope();
    }
    ctx
}

/// Runs the test body, or every row of a parameterized case.
pub async fn run_test(ctx: &Arc<ExecutionContext>) {
    let Some(test) = ctx.test().cloned() else {
        return;
    };
    if ctx.is_skipped() {
        return;
    }

    if test.is_parameterized() {
        let rows = match resolve_rows(ctx, &test) {
            Ok(rows) => rows,
            Err(report) => {
                ctx.add_report(report);
                return;
            }
        };
        for (index, (display, arguments)) in rows.into_iter().enumerate() {
            if ctx.is_cancelled() {
                warn!(test = %ctx.name(), "Cancelled before row {}", index);
                ctx.add_report(Report::new(
                    ReportType::Interrupted,
                    test.line_number,
                    "The execution was cancelled.",
                ));
                break;
            }
            run_row(ctx, &test, display, arguments).await;
        }
        return;
    }

    if ctx.setup_ok() {
        run_body(ctx, &test).await;
    }
    release_test_resources(ctx);
}

/// Runs AfterTest, emits TestAfter, and disposes the test context.
pub async fn teardown_test(ctx: &Arc<ExecutionContext>) {
    let Some(test) = ctx.test() else {
        return;
    };

    if !ctx.is_skipped() && !test.is_parameterized() {
        let method = ctx.scope().definition.stage_method(StageKind::AfterTest);
        execute_stage(ctx, StageKind::AfterTest, method, 1).await;
    }

    let reports = ctx.take_reports();
    let mut event = TestEvent::test_after(ctx.id(), ctx.name())
        .with_elapsed(ctx.elapsed())
        .with_orphans(ctx.orphans())
        .with_reports(reports);
    if let Some(rows) = ctx.row_outcome() {
        let merged = event.outcome.merge(rows);
        event = event.with_outcome(merged);
    }
    debug!(test = %ctx.name(), success = event.outcome.success, "Test finished");
    ctx.emit(event);
    ctx.dispose();
}

/// Runs a whole suite: Before, every test case, After.
///
/// Returns `false` if the run was cancelled; After has still run then.
pub async fn run_suite(ctx: &Arc<ExecutionContext>) -> bool {
    let before = suite_before(ctx).await;

    if before.is_success() {
        let tests = ctx.scope().node.tests.clone();
        for (index, test) in tests.iter().enumerate() {
            if ctx.is_cancelled() {
                warn!(
                    suite = %ctx.name(),
                    "Cancelled, skipping {} remaining test(s)",
                    tests.len() - index
                );
                break;
            }
            let test_ctx = setup_test(ctx, test).await;
            run_test(&test_ctx).await;
            teardown_test(&test_ctx).await;
        }
    }

    suite_after(ctx).await;
    !ctx.is_cancelled()
}

async fn run_body(ctx: &Arc<ExecutionContext>, test: &TestCaseNode) {
    let definition = &ctx.scope().definition;
    match definition.test_method(&test.name) {
        Some(method) => {
            execute_stage(ctx, StageKind::TestBody, Some(method), test.iterations).await;
        }
        None => ctx.add_report(Report::new(
            ReportType::Abort,
            test.line_number,
            format!(
                "Test method '{}' is not registered in {}",
                test.name,
                definition.type_name()
            ),
        )),
    }
}

/// One parameter row: its own context, event pair, and full test cycle.
async fn run_row(
    parent: &Arc<ExecutionContext>,
    test: &TestCaseNode,
    display: String,
    arguments: Vec<Value>,
) {
    let row = parent.child(Uuid::new_v4(), test.clone(), Some(display), arguments);
    let display = row.display_name().unwrap_or(row.name()).to_string();
    row.emit(TestEvent::test_before(row.id(), row.name()).with_display_name(display.clone()));

    let definition = &row.scope().definition;
    let setup = execute_stage(
        &row,
        StageKind::BeforeTest,
        definition.stage_method(StageKind::BeforeTest),
        1,
    )
    .await;
    row.begin_orphan_scope();
    if setup.is_success() {
        run_body(&row, test).await;
    }
    release_test_resources(&row);
    execute_stage(
        &row,
        StageKind::AfterTest,
        definition.stage_method(StageKind::AfterTest),
        1,
    )
    .await;

    let event = TestEvent::test_after(row.id(), row.name())
        .with_display_name(display)
        .with_elapsed(row.elapsed())
        .with_orphans(row.orphans())
        .with_reports(row.take_reports());
    parent.record_row_outcome(event.outcome);
    row.emit(event);
    row.dispose();
}

/// Releases auto-free values and turns leaked resources into a warning.
///
/// Runs whether or not the body succeeded.
fn release_test_resources(ctx: &ExecutionContext) {
    let released = ctx.release_auto_free();
    let orphans = ctx.measure_orphans();
    if released > 0 {
        debug!(test = %ctx.name(), "Released {} auto-free value(s)", released);
    }
    if orphans > 0 && ctx.scope().settings.report_orphans {
        ctx.add_report(Report::new(
            ReportType::Warning,
            ctx.line(),
            format!("Detected {} orphan resource(s) after the test", orphans),
        ));
    }
}

/// Parameter rows of a case with their display names.
fn resolve_rows(
    ctx: &ExecutionContext,
    test: &TestCaseNode,
) -> Result<Vec<(String, Vec<Value>)>, Report> {
    if let Some(source) = &test.data_point {
        let rows = ctx.scope().definition.rows(source).ok_or_else(|| {
            Report::new(
                ReportType::Abort,
                test.line_number,
                format!("Data point source '{}' is not registered", source),
            )
        })?;
        return Ok(rows
            .into_iter()
            .enumerate()
            .map(|(i, args)| (row_display_name(&test.name, i, &args), args))
            .collect());
    }

    Ok(test
        .attributes
        .iter()
        .enumerate()
        .map(|(i, attribute)| {
            let display = attribute
                .description
                .clone()
                .unwrap_or_else(|| row_display_name(&test.name, i, &attribute.arguments));
            (display, attribute.arguments.clone())
        })
        .collect())
}
