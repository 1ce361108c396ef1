//! Requests sent by the controller and the uniform response to each.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::suite::TestSuiteNode;

/// Per-run switches that travel with suite-level commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSettings {
    /// Attach captured stdout to the closing event of each test.
    #[serde(default = "default_true")]
    pub capture_std_out: bool,

    /// Turn leaked resources into Warning reports.
    #[serde(default = "default_true")]
    pub report_orphans: bool,

    /// Timeout for stages that declare none; the worker's own default
    /// applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_timeout_ms: Option<u64>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            capture_std_out: true,
            report_orphans: true,
            stage_timeout_ms: None,
        }
    }
}

impl RunSettings {
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_ms.map(Duration::from_millis)
    }
}

fn default_true() -> bool {
    true
}

/// A request for the worker.
///
/// Each variant carries only the identifiers needed to resolve its target.
/// The split `LoadSuite → SetupTest → RunTest → TeardownTest → UnloadSuite`
/// sequence drives one test at a time; `RunSuite` runs a whole suite in a
/// single round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    LoadSuite {
        suite: TestSuiteNode,
        #[serde(default)]
        settings: RunSettings,
    },
    SetupTest {
        test_id: Uuid,
    },
    RunTest {
        test_id: Uuid,
    },
    TeardownTest {
        test_id: Uuid,
    },
    UnloadSuite {
        suite_id: Uuid,
    },
    RunSuite {
        suite: TestSuiteNode,
        capture_std_out: bool,
        report_orphans: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage_timeout_ms: Option<u64>,
    },
    Liveness,
    Terminate,
}

impl Command {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::LoadSuite { .. } => "LoadSuite",
            Command::SetupTest { .. } => "SetupTest",
            Command::RunTest { .. } => "RunTest",
            Command::TeardownTest { .. } => "TeardownTest",
            Command::UnloadSuite { .. } => "UnloadSuite",
            Command::RunSuite { .. } => "RunSuite",
            Command::Liveness => "Liveness",
            Command::Terminate => "Terminate",
        }
    }
}

/// Result category of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    InvalidCommand,
    ContextNotFound,
    SuiteNotFound,
    InternalError,
    Cancelled,
    Disconnected,
}

impl StatusCode {
    pub fn is_ok(&self) -> bool {
        matches!(self, StatusCode::Ok)
    }
}

/// Terminal reply; exactly one is returned per command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status_code: StatusCode,

    /// Human-readable success message or serialized error.
    pub payload: String,
}

impl Response {
    pub fn ok(payload: impl Into<String>) -> Self {
        Self {
            status_code: StatusCode::Ok,
            payload: payload.into(),
        }
    }

    pub fn error(status_code: StatusCode, payload: impl Into<String>) -> Self {
        Self {
            status_code,
            payload: payload.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status_code.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_carries_type_tag() {
        let json = serde_json::to_value(Command::RunTest {
            test_id: Uuid::nil(),
        })
        .unwrap();
        assert_eq!(json["type"], "RunTest");

        let json = serde_json::to_value(Command::Liveness).unwrap();
        assert_eq!(json["type"], "Liveness");
    }

    #[test]
    fn test_load_suite_settings_default() {
        let json = r#"{"type":"LoadSuite","suite":{"id":"00000000-0000-0000-0000-000000000000","type_name":"S","location":"s.rs"}}"#;
        let command: Command = serde_json::from_str(json).unwrap();
        match command {
            Command::LoadSuite { settings, .. } => assert_eq!(settings, RunSettings::default()),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_stage_timeout_is_optional_on_the_wire() {
        let json = r#"{"type":"RunSuite","suite":{"type_name":"S","location":"s.rs"},"capture_std_out":true,"report_orphans":false}"#;
        match serde_json::from_str::<Command>(json).unwrap() {
            Command::RunSuite {
                stage_timeout_ms, ..
            } => assert_eq!(stage_timeout_ms, None),
            other => panic!("unexpected command {:?}", other),
        }

        let settings = RunSettings::default().with_stage_timeout(Duration::from_secs(5));
        let json = serde_json::to_value(settings).unwrap();
        assert_eq!(json["stage_timeout_ms"], 5000);
        let back: RunSettings = serde_json::from_value(json).unwrap();
        assert_eq!(back.stage_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(RunSettings::default().stage_timeout(), None);
    }
}
