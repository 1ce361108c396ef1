//! Progress events streamed from the worker while a command runs.
//!
//! A single command may produce any number of [`TestEvent`]s before its
//! terminal [`Response`](super::Response). Running a whole suite emits:
//!
//! ```text
//! SuiteBefore
//!   TestBefore ─ TestAfter        (one pair per test case)
//!   TestBefore                    (parameterized: outer pair ...)
//!     TestBefore ─ TestAfter      (... wrapping one inner pair per row)
//!   TestAfter
//! SuiteAfter
//! ```
//!
//! Outcomes travel as [`Report`]s attached to the closing event of a pair.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Position of an event in the suite lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    SuiteBefore,
    SuiteAfter,
    TestBefore,
    TestAfter,
}

impl EventType {
    /// Returns `true` for the events that open a pair.
    pub fn is_before(&self) -> bool {
        matches!(self, EventType::SuiteBefore | EventType::TestBefore)
    }
}

/// Kind of a single outcome record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportType {
    Success,
    Warning,
    Failure,
    Orphan,
    Terminated,
    Interrupted,
    Abort,
    Skipped,
    Stdout,
}

impl ReportType {
    /// Reports that mark the owning test as failed by assertion.
    pub fn is_failure(&self) -> bool {
        matches!(self, ReportType::Failure)
    }

    /// Reports that mark the owning test as errored (did not complete normally).
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ReportType::Abort | ReportType::Interrupted | ReportType::Terminated
        )
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, ReportType::Warning | ReportType::Orphan)
    }
}

/// A single outcome record attached to a [`TestEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    #[serde(rename = "type")]
    pub report_type: ReportType,

    /// Source line the report refers to (0 when unknown).
    pub line_number: u32,

    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl Report {
    pub fn new(report_type: ReportType, line_number: u32, message: impl Into<String>) -> Self {
        Self {
            report_type,
            line_number,
            message: message.into(),
            stack_trace: None,
        }
    }

    pub fn with_stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = Some(trace.into());
        self
    }
}

/// Outcome flags derived from the reports of an event.
///
/// Only closing events (`SuiteAfter`, `TestAfter`) carry meaningful flags;
/// opening events always report success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub failed: bool,
    pub error: bool,
    pub success: bool,
    pub warning: bool,
    pub skipped: bool,
}

impl Outcome {
    /// Derives the flags from a set of reports.
    pub fn from_reports(reports: &[Report]) -> Self {
        let failed = reports.iter().any(|r| r.report_type.is_failure());
        let error = reports.iter().any(|r| r.report_type.is_error());
        let warning = reports.iter().any(|r| r.report_type.is_warning());
        let skipped = reports.iter().any(|r| r.report_type == ReportType::Skipped);
        Self {
            failed,
            error,
            success: !failed && !error && !skipped,
            warning,
            skipped,
        }
    }

    /// Merges flags from a child result into an aggregate result.
    pub fn merge(self, other: Outcome) -> Self {
        let failed = self.failed || other.failed;
        let error = self.error || other.error;
        let skipped = self.skipped && other.skipped;
        Self {
            failed,
            error,
            success: !failed && !error && !skipped,
            warning: self.warning || other.warning,
            skipped,
        }
    }
}

/// A typed progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestEvent {
    /// Id of the suite, test case, or parameter row this event belongs to.
    pub id: Uuid,

    #[serde(rename = "type")]
    pub event_type: EventType,

    pub fully_qualified_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    pub outcome: Outcome,

    /// Wall-clock time of the pair, set on closing events.
    #[serde(rename = "elapsed_ns", with = "duration_nanos")]
    pub elapsed: Duration,

    /// Resources leaked during the test (closing events only).
    #[serde(default)]
    pub orphan_count: usize,

    #[serde(default)]
    pub reports: Vec<Report>,
}

impl TestEvent {
    fn new(id: Uuid, event_type: EventType, fully_qualified_name: impl Into<String>) -> Self {
        Self {
            id,
            event_type,
            fully_qualified_name: fully_qualified_name.into(),
            display_name: None,
            outcome: Outcome {
                success: true,
                ..Outcome::default()
            },
            elapsed: Duration::ZERO,
            orphan_count: 0,
            reports: Vec::new(),
        }
    }

    pub fn suite_before(id: Uuid, name: impl Into<String>) -> Self {
        Self::new(id, EventType::SuiteBefore, name)
    }

    pub fn suite_after(id: Uuid, name: impl Into<String>) -> Self {
        Self::new(id, EventType::SuiteAfter, name)
    }

    pub fn test_before(id: Uuid, name: impl Into<String>) -> Self {
        Self::new(id, EventType::TestBefore, name)
    }

    pub fn test_after(id: Uuid, name: impl Into<String>) -> Self {
        Self::new(id, EventType::TestAfter, name)
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    pub fn with_orphans(mut self, count: usize) -> Self {
        self.orphan_count = count;
        self
    }

    /// Attaches reports and recomputes the outcome flags from them.
    pub fn with_reports(mut self, reports: Vec<Report>) -> Self {
        self.outcome = Outcome::from_reports(&reports);
        self.reports = reports;
        self
    }

    /// Overrides the outcome flags (used for aggregated parameterized results).
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Name shown to users: the display name if set, else the qualified name.
    pub fn name(&self) -> &str {
        self.display_name
            .as_deref()
            .unwrap_or(&self.fully_qualified_name)
    }
}

/// Durations travel as whole nanoseconds so events survive a round trip.
mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    const NANOS_PER_SEC: u64 = 1_000_000_000;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let nanos = u64::deserialize(d)?;
        Ok(Duration::new(
            nanos / NANOS_PER_SEC,
            (nanos % NANOS_PER_SEC) as u32,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_from_reports() {
        let outcome = Outcome::from_reports(&[]);
        assert!(outcome.success);

        let outcome = Outcome::from_reports(&[Report::new(ReportType::Failure, 12, "expected")]);
        assert!(outcome.failed);
        assert!(!outcome.success);

        let outcome = Outcome::from_reports(&[
            Report::new(ReportType::Stdout, 0, "hello"),
            Report::new(ReportType::Warning, 3, "leak"),
        ]);
        assert!(outcome.success);
        assert!(outcome.warning);

        let outcome = Outcome::from_reports(&[Report::new(ReportType::Interrupted, 4, "t/o")]);
        assert!(outcome.error);
        assert!(!outcome.failed);
    }

    #[test]
    fn test_outcome_merge() {
        let ok = Outcome::from_reports(&[]);
        let failed = Outcome::from_reports(&[Report::new(ReportType::Failure, 1, "x")]);
        let merged = ok.merge(failed);
        assert!(merged.failed);
        assert!(!merged.success);
    }

    #[test]
    fn test_event_json_keeps_sub_millisecond_elapsed() {
        let event = TestEvent::test_after(Uuid::nil(), "suite.test")
            .with_elapsed(Duration::from_micros(1_500));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["elapsed_ns"], 1_500_000);
        assert_eq!(json["type"], "TestAfter");

        let back: TestEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.elapsed, Duration::from_micros(1_500));
    }
}
