//! stagehand: an out-of-process test harness.
//!
//! Test suites run inside an external engine process while a controller
//! (CLI, IDE, or CI runner) drives them over a framed local socket.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Protocol**: length-prefixed JSON frames carrying commands, events,
//!   and responses
//! - **Executor**: the controller's [`RemoteExecutor`] and the worker's
//!   [`InProcessExecutor`]
//! - **Pipeline**: the staged suite lifecycle (before, per-test setup,
//!   body, teardown, after) with timeouts and failure classification
//! - **Engine**: launching, debugging, and killing the engine process
//! - **Report**: console output and JUnit XML
//!
//! # Example
//!
//! ```no_run
//! use stagehand::config::load_config;
//! use stagehand::report::ConsoleReporter;
//! use stagehand::session::{Session, load_suites};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("stagehand.toml"))?;
//!     let suites = load_suites(std::path::Path::new("suites.json"))?;
//!     let session = Session::new(config).with_reporter(ConsoleReporter::new(false));
//!     let engine = session.prepare()?;
//!     let result = session.run(engine, suites).await;
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod config;
pub mod context;
pub mod engine;
pub mod executor;
pub mod pipeline;
pub mod protocol;
pub mod report;
pub mod session;
pub mod suite;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use executor::{EventListener, InProcessExecutor, RemoteExecutor};
pub use pipeline::{SuiteCatalog, SuiteDefinition};
pub use protocol::{Command, Response, StatusCode, TestEvent};
pub use report::{Reporter, RunResult};
pub use session::Session;
pub use suite::{TestCaseNode, TestSuiteNode};
