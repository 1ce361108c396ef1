//! Both ends of the command exchange.
//!
//! ```text
//!  controller                               engine process
//! ┌──────────────────┐  Command            ┌─────────────────────┐
//! │ RemoteExecutor   │ ──────────────────▶ │ InProcessExecutor   │
//! │                  │  Event* (streamed)  │  gate ─▶ handler    │
//! │  EventListener ◀─│ ◀────────────────── │    └─▶ pipeline     │
//! │                  │  Response           │                     │
//! └──────────────────┘ ◀────────────────── └─────────────────────┘
//! ```
//!
//! - [`RemoteExecutor`] sends one command and relays events to an
//!   [`EventListener`] until the response arrives. If the worker disappears
//!   or the run is cancelled, it closes every test it saw start with a
//!   synthesized report so no result goes missing.
//! - [`InProcessExecutor`] runs inside the engine. It takes one command at a
//!   time, streams events while the handler runs, and always answers with a
//!   response, even when the handler panics.

pub mod remote;
pub mod worker;

pub use remote::RemoteExecutor;
pub use worker::{InProcessExecutor, WorkerConfig};

use crate::protocol::{ChannelError, TestEvent};
use crate::protocol::transport::InvalidEndpoint;

/// Receives events in arrival order, as soon as they are decoded.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: TestEvent);
}

impl<F> EventListener for F
where
    F: Fn(TestEvent) + Send + Sync,
{
    fn on_event(&self, event: TestEvent) {
        self(event)
    }
}

/// Result type for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Errors that stop a worker's serve loop.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Endpoint variable {0} is not set")]
    MissingEndpoint(&'static str),

    #[error(transparent)]
    InvalidEndpoint(#[from] InvalidEndpoint),

    #[error("Failed to bind worker endpoint: {0}")]
    Bind(#[source] std::io::Error),

    #[error("Failed to accept controller connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}
