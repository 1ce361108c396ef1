//! Stage kinds, typed stage failures, and their mapping to reports.
//!
//! Stage bodies return `Result<(), StageError>`. The pipeline turns the
//! result into a [`StageOutcome`] with [`classify`], a single switch that
//! decides which [`Report`] type a failure becomes:
//!
//! | StageError | StageOutcome | ReportType |
//! |------------|--------------|------------|
//! | `AssertionFailed` | `Failure` | `Failure` |
//! | `Timeout` | `Interrupted` | `Interrupted` |
//! | `Cancelled` | `Interrupted` | `Interrupted` |
//! | `Invocation(inner)` | classify(inner) | … |
//! | `Unexpected` | `Abort` | `Abort` |

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::protocol::{Report, ReportType};

/// One phase of the suite lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Runs once before any test of the suite.
    Before,
    /// Runs before every test (and every parameter row).
    BeforeTest,
    /// The test method itself.
    TestBody,
    /// Runs after every test (and every parameter row).
    AfterTest,
    /// Runs once after all tests of the suite.
    After,
}

impl StageKind {
    /// Teardown stages still run after cancellation; only their timeout bounds them.
    pub fn is_teardown(&self) -> bool {
        matches!(self, StageKind::After | StageKind::AfterTest)
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StageKind::Before => "before",
            StageKind::BeforeTest => "before_test",
            StageKind::TestBody => "test",
            StageKind::AfterTest => "after_test",
            StageKind::After => "after",
        };
        f.write_str(name)
    }
}

/// Why a stage did not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    /// An expectation in the test did not hold.
    #[error("{message}")]
    AssertionFailed { line: Option<u32>, message: String },

    /// The stage outlived its timeout.
    #[error("The execution has timed out after {}ms.", .timeout.as_millis())]
    Timeout { timeout: Duration },

    /// Cancellation was requested while the stage ran.
    #[error("The execution was cancelled.")]
    Cancelled,

    /// A wrapper around the error raised by the invoked method.
    #[error("Invocation failed: {0}")]
    Invocation(Box<StageError>),

    /// Anything else; always surfaced in the process log.
    #[error("{message}")]
    Unexpected {
        message: String,
        stack_trace: Option<String>,
    },
}

impl StageError {
    /// An assertion failure at a source line.
    pub fn assertion(line: u32, message: impl Into<String>) -> Self {
        StageError::AssertionFailed {
            line: Some(line),
            message: message.into(),
        }
    }

    /// An unexpected error with no stack trace.
    pub fn unexpected(message: impl Into<String>) -> Self {
        StageError::Unexpected {
            message: message.into(),
            stack_trace: None,
        }
    }

    /// Wraps an error the way a reflective method invoker would.
    pub fn invocation(inner: StageError) -> Self {
        StageError::Invocation(Box::new(inner))
    }

    /// Strips every invocation wrapper.
    pub fn into_root_cause(self) -> StageError {
        match self {
            StageError::Invocation(inner) => inner.into_root_cause(),
            other => other,
        }
    }
}

impl From<anyhow::Error> for StageError {
    fn from(e: anyhow::Error) -> Self {
        StageError::Unexpected {
            message: e.to_string(),
            stack_trace: Some(format!("{:?}", e)),
        }
    }
}

impl From<serde_json::Error> for StageError {
    fn from(e: serde_json::Error) -> Self {
        StageError::unexpected(format!("Invalid test argument: {}", e))
    }
}

/// Result of a single stage run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Success,
    Failure { line: u32, message: String },
    Interrupted { line: u32, message: String },
    Abort {
        line: u32,
        message: String,
        stack_trace: Option<String>,
    },
}

impl StageOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Success)
    }

    /// The report this outcome contributes, if any.
    pub fn to_report(&self) -> Option<Report> {
        match self {
            StageOutcome::Success => None,
            StageOutcome::Failure { line, message } => {
                Some(Report::new(ReportType::Failure, *line, message.clone()))
            }
            StageOutcome::Interrupted { line, message } => {
                Some(Report::new(ReportType::Interrupted, *line, message.clone()))
            }
            StageOutcome::Abort {
                line,
                message,
                stack_trace,
            } => {
                let report = Report::new(ReportType::Abort, *line, message.clone());
                Some(match stack_trace {
                    Some(trace) => report.with_stack_trace(trace.clone()),
                    None => report,
                })
            }
        }
    }
}

/// Maps a stage failure to its outcome.
///
/// `line` is used when the error carries no line of its own: the stage's
/// declared line, or the current test's line.
pub fn classify(error: StageError, line: u32) -> StageOutcome {
    match error.into_root_cause() {
        StageError::AssertionFailed {
            line: at,
            message,
        } => StageOutcome::Failure {
            line: at.unwrap_or(line),
            message,
        },
        e @ (StageError::Timeout { .. } | StageError::Cancelled) => StageOutcome::Interrupted {
            line,
            message: e.to_string(),
        },
        StageError::Unexpected {
            message,
            stack_trace,
        } => StageOutcome::Abort {
            line,
            message,
            stack_trace,
        },
        // into_root_cause never returns a wrapper
        StageError::Invocation(inner) => classify(*inner, line),
    }
}

/// Races a stage against its timeout and, for cancellable stages, the token.
///
/// The body runs as its own task so it may execute on any worker thread.
/// If the delay wins the task is aborted and the stage counts as timed out,
/// even if the body would eventually have succeeded. A panicking body is an
/// unexpected error.
pub async fn race<F>(
    body: F,
    timeout: Duration,
    cancel: Option<&CancellationToken>,
) -> Result<(), StageError>
where
    F: Future<Output = Result<(), StageError>> + Send + 'static,
{
    let mut handle = tokio::spawn(body);
    let never = CancellationToken::new();
    let cancel = cancel.unwrap_or(&never);

    tokio::select! {
        _ = cancel.cancelled() => {
            handle.abort();
            Err(StageError::Cancelled)
        }
        joined = &mut handle => match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(StageError::Unexpected {
                message: panic_message(e.into_panic()),
                stack_trace: None,
            }),
            Err(_) => Err(StageError::Cancelled),
        },
        _ = tokio::time::sleep(timeout) => {
            handle.abort();
            Err(StageError::Timeout { timeout })
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

/// Fails the current stage with an assertion failure at the caller's line.
///
/// ```
/// use stagehand::pipeline::StageError;
///
/// fn check(total: i32) -> Result<(), StageError> {
///     stagehand::stage_assert!(total == 3, "expected 3 but was {}", total);
///     Ok(())
/// }
///
/// assert!(check(3).is_ok());
/// assert!(matches!(check(4), Err(StageError::AssertionFailed { .. })));
/// ```
#[macro_export]
macro_rules! stage_assert {
    ($cond:expr $(,)?) => {
        $crate::stage_assert!($cond, "assertion failed: {}", stringify!($cond))
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::pipeline::StageError::assertion(line!(), format!($($arg)+)));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_assertion_uses_own_line() {
        let outcome = classify(StageError::assertion(42, "expected 1"), 7);
        assert_eq!(
            outcome,
            StageOutcome::Failure {
                line: 42,
                message: "expected 1".to_string()
            }
        );
    }

    #[test]
    fn test_classify_timeout_uses_stage_line() {
        let outcome = classify(
            StageError::Timeout {
                timeout: Duration::from_millis(30_000),
            },
            7,
        );
        match outcome {
            StageOutcome::Interrupted { line, message } => {
                assert_eq!(line, 7);
                assert!(message.contains("30000ms"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_classify_unwraps_invocation() {
        let wrapped = StageError::invocation(StageError::invocation(StageError::assertion(3, "x")));
        assert!(matches!(
            classify(wrapped, 1),
            StageOutcome::Failure { line: 3, .. }
        ));
    }

    #[test]
    fn test_classify_unexpected_is_abort() {
        let outcome = classify(StageError::unexpected("boom"), 5);
        let report = outcome.to_report().unwrap();
        assert_eq!(report.report_type, ReportType::Abort);
        assert_eq!(report.line_number, 5);
        assert_eq!(report.message, "boom");
    }

    #[test]
    fn test_success_has_no_report() {
        assert!(StageOutcome::Success.to_report().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_timeout_dominates_late_success() {
        let result = race(
            async {
                tokio::time::sleep(Duration::from_secs(31)).await;
                Ok(())
            },
            Duration::from_secs(30),
            None,
        )
        .await;
        assert!(matches!(result, Err(StageError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_race_passes_through_result() {
        let result = race(async { Ok(()) }, Duration::from_secs(5), None).await;
        assert!(result.is_ok());

        let result = race(
            async { Err(StageError::assertion(1, "no")) },
            Duration::from_secs(5),
            None,
        )
        .await;
        assert!(matches!(result, Err(StageError::AssertionFailed { .. })));
    }

    #[tokio::test]
    async fn test_race_panic_is_unexpected() {
        let result = race(
            async {
                if true {
                    panic!("kaboom");
                }
                Ok(())
            },
            Duration::from_secs(5),
            None,
        )
        .await;
        match result {
            Err(StageError::Unexpected { message, .. }) => assert!(message.contains("kaboom")),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let result = race(
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            },
            Duration::from_secs(30),
            Some(&token),
        )
        .await;
        assert_eq!(result, Err(StageError::Cancelled));
    }
}
