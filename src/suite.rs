//! Static description of what to run.
//!
//! Suites and test cases are produced by discovery (outside this crate) and
//! consumed read-only by the worker. They travel inside `LoadSuite` and
//! `RunSuite` commands, so every type here is serializable.
//!
//! # Example
//!
//! ```
//! use stagehand::suite::{InvocationAttribute, TestCaseNode, TestSuiteNode};
//! use serde_json::json;
//!
//! let suite = TestSuiteNode::new("MathSuite", "tests/math_suite.rs")
//!     .with_test(TestCaseNode::new("adds", 12))
//!     .with_test(
//!         TestCaseNode::new("adds_rows", 20)
//!             .with_attribute(InvocationAttribute::new(vec![json!(1), json!(2)]))
//!             .with_attribute(InvocationAttribute::new(vec![json!(3), json!(4)])),
//!     );
//!
//! assert_eq!(suite.tests.len(), 2);
//! assert!(suite.tests[1].is_parameterized());
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A test suite and its ordered test cases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSuiteNode {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    /// Registered suite type the worker instantiates (its catalog key).
    pub type_name: String,

    /// Source location of the suite (script, assembly, or module path).
    pub location: PathBuf,

    #[serde(default)]
    pub tests: Vec<TestCaseNode>,
}

impl TestSuiteNode {
    pub fn new(type_name: impl Into<String>, location: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            type_name: type_name.into(),
            location: location.into(),
            tests: Vec::new(),
        }
    }

    pub fn with_test(mut self, test: TestCaseNode) -> Self {
        self.tests.push(test);
        self
    }

    /// Finds a test case by id.
    pub fn test(&self, id: Uuid) -> Option<&TestCaseNode> {
        self.tests.iter().find(|t| t.id == id)
    }

    /// Fully qualified name of a test case in this suite.
    pub fn qualified_name(&self, test: &TestCaseNode) -> String {
        format!("{}::{}", self.type_name, test.name)
    }
}

/// A single test method and how to invoke it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseNode {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    /// Registered test method name inside the suite definition.
    pub name: String,

    /// Source line of the test method.
    pub line_number: u32,

    /// Invocation attributes; more than one makes the case parameterized.
    #[serde(default)]
    pub attributes: Vec<InvocationAttribute>,

    /// Named data-point source providing parameter rows at run time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_point: Option<String>,

    /// How many times the body runs inside one body stage.
    #[serde(default = "default_iterations")]
    pub iterations: u32,

    /// Overrides the default stage timeout for the body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// When set the case is reported as skipped without running any stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

fn default_iterations() -> u32 {
    1
}

impl TestCaseNode {
    pub fn new(name: impl Into<String>, line_number: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            line_number,
            attributes: Vec::new(),
            data_point: None,
            iterations: 1,
            timeout_ms: None,
            skip_reason: None,
        }
    }

    pub fn with_attribute(mut self, attribute: InvocationAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn with_data_point(mut self, source: impl Into<String>) -> Self {
        self.data_point = Some(source.into());
        self
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn skipped(mut self, reason: impl Into<String>) -> Self {
        self.skip_reason = Some(reason.into());
        self
    }

    /// Returns `true` if the case expands into one run per parameter row.
    pub fn is_parameterized(&self) -> bool {
        self.attributes.len() > 1 || self.data_point.is_some()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Arguments for a non-parameterized run (the single attribute, if any).
    pub fn single_arguments(&self) -> Vec<Value> {
        self.attributes
            .first()
            .map(|a| a.arguments.clone())
            .unwrap_or_default()
    }
}

/// One invocation of a test method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationAttribute {
    #[serde(default)]
    pub arguments: Vec<Value>,

    /// Optional row name; rows are otherwise named after their arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl InvocationAttribute {
    pub fn new(arguments: Vec<Value>) -> Self {
        Self {
            arguments,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Display name of a parameter row, e.g. `adds_rows:1 (3, 4)`.
pub fn row_display_name(test: &str, index: usize, arguments: &[Value]) -> String {
    let args = arguments
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!("{}:{} ({})", test, index, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_attribute_is_not_parameterized() {
        let case = TestCaseNode::new("t", 1).with_attribute(InvocationAttribute::new(vec![json!(1)]));
        assert!(!case.is_parameterized());
        assert_eq!(case.single_arguments(), vec![json!(1)]);
    }

    #[test]
    fn test_data_point_is_parameterized() {
        let case = TestCaseNode::new("t", 1).with_data_point("rows");
        assert!(case.is_parameterized());
    }

    #[test]
    fn test_iterations_default_from_json() {
        let json = r#"{"id":"00000000-0000-0000-0000-000000000000","name":"t","line_number":4}"#;
        let case: TestCaseNode = serde_json::from_str(json).unwrap();
        assert_eq!(case.iterations, 1);
        assert!(case.attributes.is_empty());
    }

    #[test]
    fn test_row_display_name() {
        assert_eq!(
            row_display_name("adds", 2, &[json!(1), json!("a")]),
            "adds:2 (1, \"a\")"
        );
    }
}
