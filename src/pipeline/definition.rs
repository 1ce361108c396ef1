//! Registration tables for suite types.
//!
//! A [`SuiteDefinition`] maps each lifecycle stage and each test name to a
//! [`StageMethod`]. It is built once when a suite is loaded, from the
//! factory registered for the suite's type in a [`SuiteCatalog`].
//!
//! ```
//! use stagehand::pipeline::{StageMethod, SuiteCatalog, SuiteDefinition};
//!
//! let mut catalog = SuiteCatalog::new();
//! catalog.register("MathSuite", || {
//!     SuiteDefinition::new("MathSuite")
//!         .before(StageMethod::new("setup", |_| async { Ok(()) }))
//!         .test(StageMethod::new("adds", |_| async {
//!             stagehand::stage_assert!(1 + 2 == 3);
//!             Ok(())
//!         }))
//! });
//!
//! let definition = catalog.instantiate("MathSuite").unwrap();
//! assert!(definition.test_method("adds").is_some());
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::resources::TrackedResource;
use super::stage::{StageError, StageKind};
use crate::context::ExecutionContext;

/// Future returned by a stage body.
pub type StageFuture = BoxFuture<'static, Result<(), StageError>>;

/// A type-erased stage body.
pub type StageFn = Arc<dyn Fn(StageArgs) -> StageFuture + Send + Sync>;

/// Produces the rows of a data-point source.
pub type DataPointFn = Arc<dyn Fn() -> Vec<Vec<Value>> + Send + Sync>;

/// Builds a fresh definition for a suite type.
pub type SuiteFactory = Arc<dyn Fn() -> SuiteDefinition + Send + Sync>;

/// What a stage body receives: its context and the row arguments.
#[derive(Clone)]
pub struct StageArgs {
    pub context: Arc<ExecutionContext>,
    pub arguments: Vec<Value>,
}

impl StageArgs {
    /// Deserializes the argument at `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, StageError> {
        let value = self.arguments.get(index).cloned().ok_or_else(|| {
            StageError::unexpected(format!(
                "Missing test argument {} (got {})",
                index,
                self.arguments.len()
            ))
        })?;
        Ok(serde_json::from_value(value)?)
    }

    /// Writes a line to the test's stdout.
    pub fn println(&self, line: impl Into<String>) {
        self.context.write_stdout(line);
    }

    /// Registers a resource that must be released by the end of the test.
    pub fn track(&self, name: impl Into<String>) -> TrackedResource {
        self.context.track(name)
    }

    /// Hands a value to the context; it is dropped when the test body ends.
    pub fn auto_free<T: Send + 'static>(&self, value: T) {
        self.context.auto_free(value);
    }

    /// Fires when the run is cancelled.
    pub fn cancellation(&self) -> CancellationToken {
        self.context.cancellation()
    }
}

/// One registered method: its body plus declared line and timeout.
#[derive(Clone)]
pub struct StageMethod {
    pub name: String,
    pub line: Option<u32>,
    pub timeout: Option<Duration>,
    body: StageFn,
}

impl StageMethod {
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(StageArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StageError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            line: None,
            timeout: None,
            body: Arc::new(move |args| Box::pin(body(args))),
        }
    }

    pub fn at_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn invoke(&self, args: StageArgs) -> StageFuture {
        (self.body)(args)
    }

    /// Runs the body `iterations` times, stopping at the first error.
    pub fn invoke_repeated(&self, args: StageArgs, iterations: u32) -> StageFuture {
        let body = self.body.clone();
        Box::pin(async move {
            for _ in 0..iterations.max(1) {
                body(args.clone()).await?;
            }
            Ok(())
        })
    }
}

impl std::fmt::Debug for StageMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageMethod")
            .field("name", &self.name)
            .field("line", &self.line)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Stage and test methods of one suite type.
#[derive(Clone, Default)]
pub struct SuiteDefinition {
    type_name: String,
    stages: HashMap<StageKind, StageMethod>,
    tests: HashMap<String, StageMethod>,
    data_points: HashMap<String, DataPointFn>,
}

impl SuiteDefinition {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            ..Self::default()
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn before(self, method: StageMethod) -> Self {
        self.stage(StageKind::Before, method)
    }

    pub fn after(self, method: StageMethod) -> Self {
        self.stage(StageKind::After, method)
    }

    pub fn before_test(self, method: StageMethod) -> Self {
        self.stage(StageKind::BeforeTest, method)
    }

    pub fn after_test(self, method: StageMethod) -> Self {
        self.stage(StageKind::AfterTest, method)
    }

    fn stage(mut self, kind: StageKind, method: StageMethod) -> Self {
        self.stages.insert(kind, method);
        self
    }

    /// Registers a test method under its name.
    pub fn test(mut self, method: StageMethod) -> Self {
        self.tests.insert(method.name.clone(), method);
        self
    }

    /// Registers a named source of parameter rows.
    pub fn data_point<F>(mut self, name: impl Into<String>, rows: F) -> Self
    where
        F: Fn() -> Vec<Vec<Value>> + Send + Sync + 'static,
    {
        self.data_points.insert(name.into(), Arc::new(rows));
        self
    }

    /// The method registered for a lifecycle stage.
    ///
    /// `TestBody` is resolved per test with [`test_method`](Self::test_method).
    pub fn stage_method(&self, kind: StageKind) -> Option<&StageMethod> {
        self.stages.get(&kind)
    }

    pub fn test_method(&self, name: &str) -> Option<&StageMethod> {
        self.tests.get(name)
    }

    /// Evaluates a data-point source.
    pub fn rows(&self, name: &str) -> Option<Vec<Vec<Value>>> {
        self.data_points.get(name).map(|rows| rows())
    }
}

impl std::fmt::Debug for SuiteDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuiteDefinition")
            .field("type_name", &self.type_name)
            .field("stages", &self.stages.keys().collect::<Vec<_>>())
            .field("tests", &self.tests.keys().collect::<Vec<_>>())
            .field("data_points", &self.data_points.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Suite types known to a worker, keyed by type name.
#[derive(Clone, Default)]
pub struct SuiteCatalog {
    factories: HashMap<String, SuiteFactory>,
}

impl SuiteCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, type_name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> SuiteDefinition + Send + Sync + 'static,
    {
        self.factories.insert(type_name.into(), Arc::new(factory));
        self
    }

    /// Builds the registration table for a suite type.
    pub fn instantiate(&self, type_name: &str) -> Option<SuiteDefinition> {
        self.factories.get(type_name).map(|factory| factory())
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop(name: &str) -> StageMethod {
        StageMethod::new(name, |_| async { Ok(()) })
    }

    #[test]
    fn test_definition_registration() {
        let definition = SuiteDefinition::new("S")
            .before(noop("setup").at_line(3))
            .after_test(noop("cleanup"))
            .test(noop("a").with_timeout(Duration::from_secs(2)))
            .data_point("rows", || vec![vec![json!(1)], vec![json!(2)]]);

        assert_eq!(definition.type_name(), "S");
        assert_eq!(
            definition.stage_method(StageKind::Before).unwrap().line,
            Some(3)
        );
        assert!(definition.stage_method(StageKind::After).is_none());
        assert!(definition.stage_method(StageKind::AfterTest).is_some());
        assert_eq!(
            definition.test_method("a").unwrap().timeout,
            Some(Duration::from_secs(2))
        );
        assert_eq!(definition.rows("rows").unwrap().len(), 2);
        assert!(definition.rows("missing").is_none());
    }

    #[test]
    fn test_catalog_builds_fresh_definitions() {
        let mut catalog = SuiteCatalog::new();
        catalog.register("S", || SuiteDefinition::new("S").test(noop("a")));

        assert!(catalog.contains("S"));
        assert_eq!(catalog.len(), 1);
        assert!(catalog.instantiate("S").is_some());
        assert!(catalog.instantiate("Other").is_none());
    }
}
