//! Wire protocol between the controller and the engine-hosted worker.
//!
//! # Layers
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Command / Response / TestEvent     (command.rs, event.rs)     │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Message envelope, JSON codec       (codec.rs)                 │
//! ├──────────────────────────────────────────────────────────────┤
//! │ [u32 LE length][payload] framing   (channel.rs)               │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Unix socket / loopback TCP         (transport.rs)             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Exchange
//!
//! The controller writes one `Command` frame. The worker answers with zero
//! or more `Event` frames, streamed as they are produced, followed by
//! exactly one `Response` frame. Only one command is in flight per worker.

pub mod channel;
pub mod codec;
pub mod command;
pub mod event;
pub mod transport;

pub use channel::{ChannelError, ChannelResult, FramedChannel};
pub use codec::{CodecError, Message};
pub use command::{Command, Response, RunSettings, StatusCode};
pub use event::{EventType, Outcome, Report, ReportType, TestEvent};
pub use transport::{BoxedStream, Endpoint, Listener};
