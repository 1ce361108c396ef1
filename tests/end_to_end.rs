//! Controller and worker talking over an in-memory duplex stream.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::io::{DuplexStream, duplex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use stagehand::executor::{EventListener, InProcessExecutor, RemoteExecutor};
use stagehand::pipeline::{StageMethod, SuiteCatalog, SuiteDefinition};
use stagehand::protocol::{Command, EventType, ReportType, RunSettings, StatusCode, TestEvent};
use stagehand::report::{EXIT_SUCCESS, EXIT_TEST_FAILURES, NullReporter};
use stagehand::session::run_suites;
use stagehand::stage_assert;
use stagehand::suite::{InvocationAttribute, TestCaseNode, TestSuiteNode};

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<TestEvent>>>);

impl EventListener for Recorder {
    fn on_event(&self, event: TestEvent) {
        self.0.lock().unwrap().push(event);
    }
}

impl Recorder {
    fn events(&self) -> Vec<TestEvent> {
        self.0.lock().unwrap().clone()
    }

    fn types(&self) -> Vec<EventType> {
        self.events().iter().map(|e| e.event_type).collect()
    }
}

fn catalog(started: Arc<Notify>) -> SuiteCatalog {
    let mut catalog = SuiteCatalog::new();
    catalog.register("Arithmetic", || {
        SuiteDefinition::new("Arithmetic")
            .before(StageMethod::new("setup", |_| async { Ok(()) }).at_line(1))
            .after(StageMethod::new("teardown", |_| async { Ok(()) }).at_line(2))
            .test(StageMethod::new("adds", |_| async {
                stage_assert!(1 + 1 == 2);
                Ok(())
            }))
            .test(StageMethod::new("subtracts", |_| async {
                stage_assert!(3 - 1 == 2);
                Ok(())
            }))
            .test(StageMethod::new("multiplies", |_| async {
                stage_assert!(2 * 3 == 6);
                Ok(())
            }))
            .test(StageMethod::new("divides", |_| async {
                stage_assert!(7 / 2 == 4, "integer division rounds down");
                Ok(())
            }))
            .test(StageMethod::new("sums", |args| async move {
                let a: i64 = args.arg(0)?;
                let b: i64 = args.arg(1)?;
                let total: i64 = args.arg(2)?;
                stage_assert!(a + b == total, "{} + {} != {}", a, b, total);
                Ok(())
            }))
    });
    catalog.register("Slow", || {
        SuiteDefinition::new("Slow").test(StageMethod::new("sleeps", |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }))
    });
    catalog.register("Hanging", move || {
        let started = started.clone();
        SuiteDefinition::new("Hanging").test(StageMethod::new("hangs", move |_| {
            let started = started.clone();
            async move {
                started.notify_one();
                std::future::pending::<()>().await;
                Ok(())
            }
        }))
    });
    catalog
}

fn connect(worker: &InProcessExecutor) -> (RemoteExecutor<DuplexStream>, tokio::task::JoinHandle<()>) {
    let (client, server) = duplex(64 * 1024);
    let worker = worker.clone();
    let task = tokio::spawn(async move {
        let _ = worker.serve_connection(server).await;
    });
    (RemoteExecutor::new(client), task)
}

fn arithmetic(tests: &[&str]) -> TestSuiteNode {
    tests
        .iter()
        .enumerate()
        .fold(TestSuiteNode::new("Arithmetic", "tests/arithmetic.lua"), |suite, (i, name)| {
            suite.with_test(TestCaseNode::new(*name, 10 + i as u32))
        })
}

fn run_suite(suite: TestSuiteNode) -> Command {
    Command::RunSuite {
        suite,
        capture_std_out: true,
        report_orphans: true,
        stage_timeout_ms: None,
    }
}

#[tokio::test]
async fn test_three_passing_tests() {
    let worker = InProcessExecutor::new(catalog(Arc::new(Notify::new())));
    let (mut executor, _task) = connect(&worker);
    let recorder = Recorder::default();

    let suite = arithmetic(&["adds", "subtracts", "multiplies"]);
    let response = executor
        .execute(&run_suite(suite), &recorder, &CancellationToken::new())
        .await;

    assert_eq!(response.status_code, StatusCode::Ok);
    assert_eq!(
        recorder.types(),
        vec![
            EventType::SuiteBefore,
            EventType::TestBefore,
            EventType::TestAfter,
            EventType::TestBefore,
            EventType::TestAfter,
            EventType::TestBefore,
            EventType::TestAfter,
            EventType::SuiteAfter,
        ]
    );
    let afters: Vec<_> = recorder
        .events()
        .into_iter()
        .filter(|e| e.event_type == EventType::TestAfter)
        .collect();
    assert_eq!(afters.len(), 3);
    assert!(afters.iter().all(|e| e.outcome.success));
    assert_eq!(executor.open_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_body_past_default_timeout_is_interrupted() {
    let worker = InProcessExecutor::new(catalog(Arc::new(Notify::new())));
    let (mut executor, _task) = connect(&worker);
    let recorder = Recorder::default();
    let cancel = CancellationToken::new();

    let suite = TestSuiteNode::new("Slow", "tests/slow.lua").with_test(TestCaseNode::new("sleeps", 7));
    let suite_id = suite.id;
    let test_id = suite.tests[0].id;

    let commands = [
        Command::LoadSuite {
            suite,
            settings: RunSettings::default(),
        },
        Command::SetupTest { test_id },
        Command::RunTest { test_id },
        Command::TeardownTest { test_id },
        Command::UnloadSuite { suite_id },
    ];
    for command in &commands {
        let response = executor.execute(command, &recorder, &cancel).await;
        assert!(response.is_ok(), "{} failed: {}", command.name(), response.payload);
    }

    let events = recorder.events();
    let test_after = events
        .iter()
        .find(|e| e.event_type == EventType::TestAfter)
        .unwrap();
    assert_eq!(test_after.reports.len(), 1);
    assert_eq!(test_after.reports[0].report_type, ReportType::Interrupted);
    assert_eq!(test_after.reports[0].line_number, 7);
    assert!(test_after.outcome.error);
}

#[tokio::test(start_paused = true)]
async fn test_configured_stage_timeout_reaches_worker() {
    let worker = InProcessExecutor::new(catalog(Arc::new(Notify::new())));
    let (mut executor, _task) = connect(&worker);
    let recorder = Recorder::default();
    let cancel = CancellationToken::new();

    let suite = TestSuiteNode::new("Slow", "tests/slow.lua").with_test(TestCaseNode::new("sleeps", 7));
    let suite_id = suite.id;
    let test_id = suite.tests[0].id;
    let settings = RunSettings::default().with_stage_timeout(Duration::from_secs(5));

    let started = tokio::time::Instant::now();
    for command in [
        Command::LoadSuite { suite, settings },
        Command::SetupTest { test_id },
        Command::RunTest { test_id },
        Command::TeardownTest { test_id },
        Command::UnloadSuite { suite_id },
    ] {
        let response = executor.execute(&command, &recorder, &cancel).await;
        assert!(response.is_ok(), "{} failed: {}", command.name(), response.payload);
    }
    assert!(started.elapsed() < Duration::from_secs(30));

    let events = recorder.events();
    let test_after = events
        .iter()
        .find(|e| e.event_type == EventType::TestAfter)
        .unwrap();
    assert_eq!(test_after.reports.len(), 1);
    assert_eq!(test_after.reports[0].report_type, ReportType::Interrupted);
    assert!(test_after.reports[0].message.contains("5000ms"));
}

#[tokio::test]
async fn test_three_rows_make_four_pairs() {
    let worker = InProcessExecutor::new(catalog(Arc::new(Notify::new())));
    let (mut executor, _task) = connect(&worker);
    let recorder = Recorder::default();

    let sums = [[1, 2, 3], [2, 2, 4], [10, -4, 6]]
        .into_iter()
        .fold(TestCaseNode::new("sums", 20), |test, row| {
            test.with_attribute(InvocationAttribute::new(row.iter().map(|v| json!(v)).collect()))
        });
    let suite = TestSuiteNode::new("Arithmetic", "tests/arithmetic.lua").with_test(sums);

    let response = executor
        .execute(&run_suite(suite), &recorder, &CancellationToken::new())
        .await;
    assert!(response.is_ok());

    let events = recorder.events();
    let befores = events.iter().filter(|e| e.event_type == EventType::TestBefore).count();
    let afters: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == EventType::TestAfter)
        .collect();
    assert_eq!(befores, 4);
    assert_eq!(afters.len(), 4);
    assert!(afters.iter().all(|e| e.outcome.success));
    // rows close before the outer pair
    assert_eq!(afters[0].display_name.as_deref(), Some("sums:0 (1, 2, 3)"));
    assert_eq!(afters[3].display_name, None);
}

#[tokio::test]
async fn test_worker_killed_mid_test_interrupts_it() {
    let started = Arc::new(Notify::new());
    let worker = InProcessExecutor::new(catalog(started.clone()));
    let (mut executor, task) = connect(&worker);
    let recorder = Recorder::default();
    let cancel = CancellationToken::new();

    let suite = TestSuiteNode::new("Hanging", "tests/hang.lua").with_test(TestCaseNode::new("hangs", 3));
    let test_id = suite.tests[0].id;
    for command in [
        Command::LoadSuite {
            suite,
            settings: RunSettings::default(),
        },
        Command::SetupTest { test_id },
    ] {
        assert!(executor.execute(&command, &recorder, &cancel).await.is_ok());
    }

    // kill the worker once the body is running
    tokio::spawn(async move {
        started.notified().await;
        task.abort();
    });
    let response = executor
        .execute(&Command::RunTest { test_id }, &recorder, &cancel)
        .await;

    assert_eq!(response.status_code, StatusCode::Disconnected);
    let events = recorder.events();
    let interrupted: Vec<_> = events
        .iter()
        .flat_map(|e| e.reports.iter())
        .filter(|r| r.report_type == ReportType::Interrupted)
        .collect();
    assert_eq!(interrupted.len(), 1);
    let closing = events
        .iter()
        .find(|e| e.event_type == EventType::TestAfter)
        .unwrap();
    assert_eq!(closing.id, test_id);
    assert!(closing.outcome.error);
    assert_eq!(executor.open_count(), 0);
}

#[tokio::test]
async fn test_run_suites_maps_failures_to_exit_code() {
    let worker = InProcessExecutor::new(catalog(Arc::new(Notify::new())));
    let (mut executor, _task) = connect(&worker);

    let passing = arithmetic(&["adds", "subtracts"]);
    let (collector, host_failure) = run_suites(
        &mut executor,
        &[passing],
        RunSettings::default(),
        Arc::new(NullReporter),
        &CancellationToken::new(),
    )
    .await;
    let result = collector.finish(Duration::ZERO, host_failure);
    assert_eq!(result.total(), 2);
    assert_eq!(result.exit_code(), EXIT_SUCCESS);

    let failing = arithmetic(&["adds", "divides"]);
    let (collector, host_failure) = run_suites(
        &mut executor,
        &[failing],
        RunSettings::default(),
        Arc::new(NullReporter),
        &CancellationToken::new(),
    )
    .await;
    let result = collector.finish(Duration::ZERO, host_failure);
    assert_eq!(result.failed(), 1);
    let failure = result.results[1].primary_report().unwrap();
    assert_eq!(failure.message, "integer division rounds down");
    assert_eq!(result.exit_code(), EXIT_TEST_FAILURES);
}

#[tokio::test]
async fn test_liveness_then_terminate() {
    let worker = InProcessExecutor::new(catalog(Arc::new(Notify::new())));
    let shutdown = worker.shutdown_token();
    let (mut executor, _task) = connect(&worker);
    let noop = |_: TestEvent| {};

    let alive = executor
        .execute(&Command::Liveness, &noop, &CancellationToken::new())
        .await;
    assert_eq!(alive.payload, "alive");

    let bye = executor
        .execute(&Command::Terminate, &noop, &CancellationToken::new())
        .await;
    assert!(bye.is_ok());
    assert!(shutdown.is_cancelled());
}
