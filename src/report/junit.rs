//! JUnit XML report generation.
//!
//! Generates JUnit XML, the de facto format CI systems ingest. One
//! `<testsuite>` is written per suite type; parameter rows appear as
//! separate test cases named by their display name.
//!
//! # Format
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites name="stagehand" tests="3" failures="1" errors="0" skipped="0" time="1.234">
//!   <testsuite name="PlayerTests" tests="3" failures="1" errors="0" skipped="0" time="1.234" timestamp="2024-05-01T10:00:00+00:00">
//!     <testcase classname="PlayerTests" name="spawns" time="0.100"/>
//!     <testcase classname="PlayerTests" name="jumps" time="0.150">
//!       <failure message="expected 2, got 1" type="Failure">line 42: expected 2, got 1</failure>
//!     </testcase>
//!     <testcase classname="PlayerTests" name="damage:0 (10, 90)" time="0.050"/>
//!   </testsuite>
//! </testsuites>
//! ```
//!
//! Text and attribute values are escaped by the writer; characters XML
//! cannot represent are dropped.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::{Reporter, RunResult, TestResult, TestStatus};
use crate::protocol::TestEvent;
use crate::suite::TestSuiteNode;

/// Reporter that writes a JUnit XML file when the run completes.
///
/// Parent directories are created if missing; an existing file is
/// overwritten.
pub struct JUnitReporter {
    output_path: PathBuf,
    name: String,
    started: std::sync::Mutex<Option<DateTime<Local>>>,
}

impl JUnitReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            name: "stagehand".to_string(),
            started: std::sync::Mutex::new(None),
        }
    }

    /// Sets the `name` of the root `<testsuites>` element.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn timestamp(&self) -> DateTime<Local> {
        self.started
            .lock()
            .ok()
            .and_then(|started| *started)
            .unwrap_or_else(Local::now)
    }

    /// Renders the report for a finished run.
    pub fn generate_xml(&self, run: &RunResult) -> anyhow::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let all: Vec<&TestResult> = run.results.iter().collect();
        let mut root = BytesStart::new("testsuites");
        root.push_attribute(("name", self.name.as_str()));
        push_counts(&mut root, &all, run.duration);
        writer.write_event(Event::Start(root))?;

        let timestamp = self.timestamp().to_rfc3339();
        for (suite, results) in group_by_suite(&run.results) {
            let time = results.iter().map(|r| r.duration).sum();
            let mut element = BytesStart::new("testsuite");
            element.push_attribute(("name", clean(suite).as_str()));
            push_counts(&mut element, &results, time);
            element.push_attribute(("timestamp", timestamp.as_str()));
            writer.write_event(Event::Start(element))?;

            for result in results {
                write_testcase(&mut writer, result)?;
            }

            writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;
        Ok(String::from_utf8(writer.into_inner())?)
    }

    fn write_file(&self, xml: String) -> anyhow::Result<()> {
        if let Some(parent) = self.output_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.output_path, xml)?;
        Ok(())
    }
}

#[async_trait]
impl Reporter for JUnitReporter {
    async fn on_run_start(&self, _suites: &[TestSuiteNode]) {
        if let Ok(mut started) = self.started.lock() {
            *started = Some(Local::now());
        }
    }

    async fn on_event(&self, _event: &TestEvent) {}

    async fn on_run_complete(&self, result: &RunResult) {
        match self.generate_xml(result).and_then(|xml| self.write_file(xml)) {
            Ok(()) => tracing::info!("JUnit XML written to: {}", self.output_path.display()),
            Err(e) => tracing::error!("Failed to write JUnit XML: {}", e),
        }
    }
}

fn push_counts(element: &mut BytesStart, results: &[&TestResult], time: Duration) {
    let count = |status| results.iter().filter(|r| r.status == status).count();
    element.push_attribute(("tests", results.len().to_string().as_str()));
    element.push_attribute(("failures", count(TestStatus::Failed).to_string().as_str()));
    element.push_attribute(("errors", count(TestStatus::Errored).to_string().as_str()));
    element.push_attribute(("skipped", count(TestStatus::Skipped).to_string().as_str()));
    element.push_attribute(("time", format!("{:.3}", time.as_secs_f64()).as_str()));
}

/// Groups results by suite, keeping first-seen order.
fn group_by_suite(results: &[TestResult]) -> Vec<(&str, Vec<&TestResult>)> {
    let mut groups: Vec<(&str, Vec<&TestResult>)> = Vec::new();
    for result in results {
        match groups.iter_mut().find(|(suite, _)| *suite == result.suite) {
            Some((_, members)) => members.push(result),
            None => groups.push((result.suite.as_str(), vec![result])),
        }
    }
    groups
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    result: &TestResult,
) -> anyhow::Result<()> {
    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", clean(&result.suite).as_str()));
    testcase.push_attribute(("name", clean(&result.display_name).as_str()));
    testcase.push_attribute((
        "time",
        format!("{:.3}", result.duration.as_secs_f64()).as_str(),
    ));

    let stdout = result.stdout();
    let element = match result.status {
        TestStatus::Passed => None,
        TestStatus::Failed => Some("failure"),
        TestStatus::Errored => Some("error"),
        TestStatus::Skipped => Some("skipped"),
    };

    if element.is_none() && stdout.is_none() {
        writer.write_event(Event::Empty(testcase))?;
        return Ok(());
    }

    writer.write_event(Event::Start(testcase))?;

    if let Some(tag) = element {
        let mut detail = BytesStart::new(tag);
        match result.primary_report() {
            Some(report) => {
                detail.push_attribute(("message", clean(&report.message).as_str()));
                if tag != "skipped" {
                    detail.push_attribute(("type", format!("{:?}", report.report_type).as_str()));
                }
                let body = match &report.stack_trace {
                    Some(trace) => format!("line {}: {}\n{}", report.line_number, report.message, trace),
                    None => format!("line {}: {}", report.line_number, report.message),
                };
                if tag == "skipped" {
                    writer.write_event(Event::Empty(detail))?;
                } else {
                    writer.write_event(Event::Start(detail))?;
                    writer.write_event(Event::Text(BytesText::new(&clean(&body))))?;
                    writer.write_event(Event::End(BytesEnd::new(tag)))?;
                }
            }
            None => writer.write_event(Event::Empty(detail))?,
        }
    }

    if let Some(stdout) = stdout {
        writer.write_event(Event::Start(BytesStart::new("system-out")))?;
        writer.write_event(Event::Text(BytesText::new(&clean(stdout))))?;
        writer.write_event(Event::End(BytesEnd::new("system-out")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

/// Drops characters XML 1.0 cannot represent. Escaping is left to the writer.
fn clean(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..='\u{10FFFF}'))
        .collect()
}
