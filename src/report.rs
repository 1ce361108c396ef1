//! Controller-side reporting.
//!
//! Events relayed from the worker are fed to a [`Reporter`] as they arrive
//! and folded into a [`RunResult`] by a [`RunCollector`]. A parameterized
//! test produces an outer pair around its rows; only the rows count as
//! results, the outer pair is an aggregate.

pub mod junit;

pub use junit::JUnitReporter;

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::protocol::{EventType, Outcome, Report, ReportType, TestEvent};
use crate::suite::TestSuiteNode;

/// Exit code when every test passed.
pub const EXIT_SUCCESS: i32 = 0;

/// Exit code when at least one test failed or errored.
pub const EXIT_TEST_FAILURES: i32 = 100;

/// Exit code when the engine or the connection failed.
pub const EXIT_HOST_FAILURE: i32 = 1;

/// Receives progress from a run.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once before the first suite runs.
    async fn on_run_start(&self, suites: &[TestSuiteNode]);

    /// Called for every event, in arrival order.
    async fn on_event(&self, event: &TestEvent);

    /// Called when all suites have completed.
    async fn on_run_complete(&self, result: &RunResult);
}

/// A reporter that does nothing.
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_run_start(&self, _suites: &[TestSuiteNode]) {}
    async fn on_event(&self, _event: &TestEvent) {}
    async fn on_run_complete(&self, _result: &RunResult) {}
}

/// A reporter that forwards to several reporters in order.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }
}

impl Default for MultiReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_run_start(&self, suites: &[TestSuiteNode]) {
        for reporter in &self.reporters {
            reporter.on_run_start(suites).await;
        }
    }

    async fn on_event(&self, event: &TestEvent) {
        for reporter in &self.reporters {
            reporter.on_event(event).await;
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        for reporter in &self.reporters {
            reporter.on_run_complete(result).await;
        }
    }
}

/// Final status of one test result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    Passed,
    Failed,
    Errored,
    Skipped,
}

impl TestStatus {
    pub fn from_outcome(outcome: &Outcome) -> Self {
        if outcome.error {
            TestStatus::Errored
        } else if outcome.failed {
            TestStatus::Failed
        } else if outcome.skipped {
            TestStatus::Skipped
        } else {
            TestStatus::Passed
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TestStatus::Passed => "PASS",
            TestStatus::Failed => "FAIL",
            TestStatus::Errored => "ERR ",
            TestStatus::Skipped => "SKIP",
        }
    }
}

/// One test (or parameter row) as seen by the controller.
#[derive(Debug, Clone)]
pub struct TestResult {
    pub suite: String,
    pub name: String,
    pub display_name: String,
    pub status: TestStatus,
    pub duration: Duration,
    pub warning: bool,
    pub reports: Vec<Report>,
}

impl TestResult {
    fn from_event(suite: &str, event: &TestEvent) -> Self {
        Self {
            suite: suite.to_string(),
            name: event.fully_qualified_name.clone(),
            display_name: event.name().to_string(),
            status: TestStatus::from_outcome(&event.outcome),
            duration: event.elapsed,
            warning: event.outcome.warning,
            reports: event.reports.clone(),
        }
    }

    /// The report that decided a failed, errored, or skipped status.
    pub fn primary_report(&self) -> Option<&Report> {
        self.reports.iter().find(|r| {
            r.report_type.is_failure()
                || r.report_type.is_error()
                || r.report_type == ReportType::Skipped
        })
    }

    /// Captured output, if any.
    pub fn stdout(&self) -> Option<&str> {
        self.reports
            .iter()
            .find(|r| r.report_type == ReportType::Stdout)
            .map(|r| r.message.as_str())
    }
}

/// A suite whose setup or teardown reported a problem.
#[derive(Debug, Clone)]
pub struct SuiteFailure {
    pub suite: String,
    pub reports: Vec<Report>,
}

/// Aggregated result of a run.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub results: Vec<TestResult>,
    pub suite_failures: Vec<SuiteFailure>,
    pub suites: usize,
    pub duration: Duration,
    /// Set when the engine or the connection failed.
    pub host_failure: Option<String>,
}

impl RunResult {
    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn passed(&self) -> usize {
        self.count(TestStatus::Passed)
    }

    pub fn failed(&self) -> usize {
        self.count(TestStatus::Failed)
    }

    pub fn errored(&self) -> usize {
        self.count(TestStatus::Errored)
    }

    pub fn skipped(&self) -> usize {
        self.count(TestStatus::Skipped)
    }

    pub fn warnings(&self) -> usize {
        self.results.iter().filter(|r| r.warning).count()
    }

    fn count(&self, status: TestStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    /// No host failure, no suite failure, no failed or errored test.
    pub fn success(&self) -> bool {
        self.host_failure.is_none()
            && self.suite_failures.is_empty()
            && self.failed() == 0
            && self.errored() == 0
    }

    /// Process exit code for this result.
    pub fn exit_code(&self) -> i32 {
        if self.host_failure.is_some() {
            EXIT_HOST_FAILURE
        } else if self.success() {
            EXIT_SUCCESS
        } else {
            EXIT_TEST_FAILURES
        }
    }
}

struct OpenTest {
    has_rows: bool,
}

/// Folds a stream of events into a [`RunResult`].
#[derive(Default)]
pub struct RunCollector {
    suite: String,
    open: Vec<OpenTest>,
    result: RunResult,
}

impl RunCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: &TestEvent) {
        match event.event_type {
            EventType::SuiteBefore => {
                self.suite = event.fully_qualified_name.clone();
                self.result.suites += 1;
                self.open.clear();
            }
            EventType::SuiteAfter => {
                if event.outcome.failed || event.outcome.error {
                    self.result.suite_failures.push(SuiteFailure {
                        suite: event.fully_qualified_name.clone(),
                        reports: event.reports.clone(),
                    });
                }
            }
            EventType::TestBefore => {
                if let Some(parent) = self.open.last_mut() {
                    parent.has_rows = true;
                }
                self.open.push(OpenTest { has_rows: false });
            }
            EventType::TestAfter => {
                let aggregate = self.open.pop().is_some_and(|open| open.has_rows);
                if !aggregate {
                    self.result
                        .results
                        .push(TestResult::from_event(&self.suite, event));
                }
            }
        }
    }

    pub fn finish(mut self, duration: Duration, host_failure: Option<String>) -> RunResult {
        self.result.duration = duration;
        self.result.host_failure = host_failure;
        self.result
    }
}

/// Console reporter that shows progress in the terminal.
pub struct ConsoleReporter {
    progress: Mutex<Option<indicatif::ProgressBar>>,
    depth: Mutex<usize>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            depth: Mutex::new(0),
            verbose,
        }
    }

    fn println(&self, line: String) {
        match self.progress.lock().ok().and_then(|pb| pb.clone()) {
            Some(pb) => pb.println(line),
            None => println!("{}", line),
        }
    }
}

fn styled_status(status: TestStatus) -> console::StyledObject<&'static str> {
    let label = status.label();
    match status {
        TestStatus::Passed => console::style(label).green(),
        TestStatus::Failed => console::style(label).red(),
        TestStatus::Skipped => console::style(label).yellow(),
        TestStatus::Errored => console::style(label).red().bold(),
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_run_start(&self, suites: &[TestSuiteNode]) {
        let total: usize = suites.iter().map(|s| s.tests.len()).sum();
        println!("Running {} tests in {} suites", total, suites.len());

        let pb = indicatif::ProgressBar::new(total as u64);
        if let Ok(style) = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        if let Ok(mut progress) = self.progress.lock() {
            *progress = Some(pb);
        }
    }

    async fn on_event(&self, event: &TestEvent) {
        let Ok(mut depth) = self.depth.lock().map(|d| *d) else {
            return;
        };
        match event.event_type {
            EventType::SuiteBefore => {
                depth = 0;
                if self.verbose {
                    self.println(format!("{}", console::style(event.name()).bold()));
                }
            }
            EventType::TestBefore => {
                depth += 1;
                if self.verbose && depth == 1 {
                    self.println(format!("  Running: {}", event.name()));
                }
            }
            EventType::TestAfter => {
                depth = depth.saturating_sub(1);
                let status = TestStatus::from_outcome(&event.outcome);
                if depth == 0
                    && let Ok(progress) = self.progress.lock()
                    && let Some(pb) = progress.as_ref()
                {
                    pb.inc(1);
                }
                if self.verbose || status != TestStatus::Passed {
                    let indent = "  ".repeat(depth + 1);
                    self.println(format!("{}{} {}", indent, styled_status(status), event.name()));
                }
            }
            EventType::SuiteAfter => {
                if event.outcome.failed || event.outcome.error {
                    self.println(format!(
                        "{} suite {}",
                        console::style("ERR ").red().bold(),
                        event.name()
                    ));
                    for report in &event.reports {
                        self.println(format!("    {}", console::style(&report.message).dim()));
                    }
                }
            }
        }
        if let Ok(mut stored) = self.depth.lock() {
            *stored = depth;
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        if let Ok(mut progress) = self.progress.lock()
            && let Some(pb) = progress.take()
        {
            pb.finish_and_clear();
        }

        println!();
        println!("Test Results:");
        println!("  Total:   {}", result.total());
        println!("  Passed:  {}", console::style(result.passed()).green());
        println!("  Failed:  {}", console::style(result.failed()).red());
        if result.errored() > 0 {
            println!("  Errored: {}", console::style(result.errored()).red().bold());
        }
        println!("  Skipped: {}", console::style(result.skipped()).yellow());
        if result.warnings() > 0 {
            println!("  Warnings: {}", console::style(result.warnings()).yellow());
        }
        println!("  Duration: {:?}", result.duration);

        println!();
        if let Some(failure) = &result.host_failure {
            println!("{}", console::style("The engine failed.").red().bold());
            println!("  {}", console::style(failure).dim());
        } else if result.success() {
            println!("{}", console::style("All tests passed!").green().bold());
        } else {
            println!("{}", console::style("Some tests failed.").red().bold());
            println!();
            println!("Failed tests:");
            for r in result
                .results
                .iter()
                .filter(|r| matches!(r.status, TestStatus::Failed | TestStatus::Errored))
            {
                println!("  - {}", r.display_name);
                if let Some(report) = r.primary_report() {
                    println!(
                        "    {}",
                        console::style(format!("line {}: {}", report.line_number, report.message))
                            .dim()
                    );
                }
                if let Some(stdout) = r.stdout() {
                    println!("    {}", console::style("stdout:").dim());
                    for line in stdout.lines() {
                        println!("      {}", line);
                    }
                }
            }
            for failure in &result.suite_failures {
                println!("  - suite {}", failure.suite);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn after(name: &str, reports: Vec<Report>) -> TestEvent {
        TestEvent::test_after(Uuid::new_v4(), name).with_reports(reports)
    }

    fn failure(message: &str) -> Report {
        Report::new(ReportType::Failure, 12, message)
    }

    #[test]
    fn test_collector_counts_plain_tests() {
        let mut collector = RunCollector::new();
        collector.record(&TestEvent::suite_before(Uuid::new_v4(), "MathSuite"));
        collector.record(&TestEvent::test_before(Uuid::new_v4(), "MathSuite::add"));
        collector.record(&after("MathSuite::add", vec![]));
        collector.record(&TestEvent::test_before(Uuid::new_v4(), "MathSuite::sub"));
        collector.record(&after("MathSuite::sub", vec![failure("2 != 3")]));
        collector.record(&TestEvent::suite_after(Uuid::new_v4(), "MathSuite"));

        let result = collector.finish(Duration::from_secs(1), None);
        assert_eq!(result.suites, 1);
        assert_eq!(result.total(), 2);
        assert_eq!(result.passed(), 1);
        assert_eq!(result.failed(), 1);
        assert_eq!(result.results[1].suite, "MathSuite");
        assert_eq!(result.results[1].primary_report().map(|r| r.line_number), Some(12));
        assert_eq!(result.exit_code(), EXIT_TEST_FAILURES);
    }

    #[test]
    fn test_collector_counts_rows_not_outer_pair() {
        let mut collector = RunCollector::new();
        collector.record(&TestEvent::suite_before(Uuid::new_v4(), "Rows"));
        collector.record(&TestEvent::test_before(Uuid::new_v4(), "Rows::sum"));
        for i in 0..3 {
            let name = format!("sum:{}", i);
            collector.record(&TestEvent::test_before(Uuid::new_v4(), "Rows::sum").with_display_name(&name));
            collector.record(&after("Rows::sum", vec![]).with_display_name(&name));
        }
        collector.record(&after("Rows::sum", vec![]));
        collector.record(&TestEvent::suite_after(Uuid::new_v4(), "Rows"));

        let result = collector.finish(Duration::ZERO, None);
        assert_eq!(result.total(), 3);
        assert_eq!(result.results[2].display_name, "sum:2");
        assert_eq!(result.exit_code(), EXIT_SUCCESS);
    }

    #[test]
    fn test_suite_failure_fails_run() {
        let mut collector = RunCollector::new();
        collector.record(&TestEvent::suite_before(Uuid::new_v4(), "Broken"));
        collector.record(
            &TestEvent::suite_after(Uuid::new_v4(), "Broken")
                .with_reports(vec![Report::new(ReportType::Abort, 3, "setup exploded")]),
        );
        let result = collector.finish(Duration::ZERO, None);
        assert_eq!(result.total(), 0);
        assert_eq!(result.suite_failures.len(), 1);
        assert_eq!(result.exit_code(), EXIT_TEST_FAILURES);
    }

    #[test]
    fn test_host_failure_exit_code() {
        let result = RunCollector::new().finish(Duration::ZERO, Some("engine crashed".into()));
        assert_eq!(result.exit_code(), EXIT_HOST_FAILURE);
    }

    #[test]
    fn test_status_from_outcome() {
        let interrupted = Outcome::from_reports(&[Report::new(ReportType::Interrupted, 0, "timeout")]);
        assert_eq!(TestStatus::from_outcome(&interrupted), TestStatus::Errored);
        let skipped = Outcome::from_reports(&[Report::new(ReportType::Skipped, 0, "not today")]);
        assert_eq!(TestStatus::from_outcome(&skipped), TestStatus::Skipped);
        let warned = Outcome::from_reports(&[Report::new(ReportType::Warning, 0, "1 orphan")]);
        assert_eq!(TestStatus::from_outcome(&warned), TestStatus::Passed);
    }

    #[tokio::test]
    async fn test_multi_reporter_forwards() {
        let reporter = MultiReporter::new()
            .with_reporter(NullReporter)
            .with_reporter(NullReporter);
        assert_eq!(reporter.len(), 2);
        reporter
            .on_event(&TestEvent::suite_before(Uuid::new_v4(), "S"))
            .await;
        reporter.on_run_complete(&RunResult::default()).await;
    }
}
