//! Controller side of the exchange.
//!
//! [`RemoteExecutor::execute`] writes one command, then forwards events to
//! the listener until the matching response arrives.
//!
//! | Ending | Synthesized for each started test | Returned status |
//! |--------|-----------------------------------|-----------------|
//! | response received | nothing | worker's status |
//! | channel closed | TestAfter with an Interrupted report | `Disconnected` |
//! | cancellation | TestAfter with a Terminated report | `Cancelled` |
//!
//! Cancellation leaves the channel open because the worker may still be
//! cleaning up. The abandoned response is drained at the start of the next
//! `execute` so responses never pair with the wrong command.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::EventListener;
use crate::protocol::{
    ChannelError, Command, EventType, FramedChannel, Message, Outcome, Report, ReportType,
    Response, StatusCode, TestEvent,
};

const DISCONNECT_MESSAGE: &str = "The worker disconnected before the test finished.";
const CANCEL_MESSAGE: &str = "The run was cancelled before the test finished.";

/// A pair that has opened but not yet closed.
struct OpenPair {
    id: Uuid,
    event_type: EventType,
    name: String,
    display_name: Option<String>,
}

impl OpenPair {
    fn from_event(event: &TestEvent) -> Self {
        Self {
            id: event.id,
            event_type: event.event_type,
            name: event.fully_qualified_name.clone(),
            display_name: event.display_name.clone(),
        }
    }

    /// The closing event for this pair.
    ///
    /// Tests carry the report; suites are only flagged as errored so each
    /// outstanding test accounts for exactly one report.
    fn close(self, report_type: ReportType, message: &str) -> TestEvent {
        let event = match self.event_type {
            EventType::SuiteBefore => {
                return TestEvent::suite_after(self.id, self.name).with_outcome(Outcome {
                    error: true,
                    ..Outcome::default()
                });
            }
            _ => TestEvent::test_after(self.id, self.name),
        };
        let event = match self.display_name {
            Some(display) => event.with_display_name(display),
            None => event,
        };
        event.with_reports(vec![Report::new(report_type, 0, message)])
    }
}

/// Sends commands to a worker over one connection.
pub struct RemoteExecutor<S> {
    channel: FramedChannel<S>,
    pending_response: bool,
    /// Pairs still open, across commands: `SetupTest` opens a test that
    /// `TeardownTest` closes.
    open: Vec<OpenPair>,
}

impl<S> RemoteExecutor<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            channel: FramedChannel::new(stream),
            pending_response: false,
            open: Vec::new(),
        }
    }

    /// Returns `true` while a cancelled command's response is still unread.
    pub fn has_pending_response(&self) -> bool {
        self.pending_response
    }

    /// Number of started tests and suites not yet closed.
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Sends `command` and relays its events until the response arrives.
    ///
    /// Never fails: transport problems and cancellation become error
    /// responses.
    pub async fn execute(
        &mut self,
        command: &Command,
        listener: &dyn EventListener,
        cancel: &CancellationToken,
    ) -> Response {
        if self.pending_response
            && let Err(response) = self.drain_stale_response(cancel).await
        {
            return response;
        }

        debug!(command = command.name(), "Sending command");
        if let Err(e) = self
            .channel
            .send_message(&Message::Command(command.clone()))
            .await
        {
            let status = if e.is_closed() {
                close_open_pairs(&mut self.open, ReportType::Interrupted, DISCONNECT_MESSAGE, listener);
                StatusCode::Disconnected
            } else {
                StatusCode::InternalError
            };
            return Response::error(status, format!("Failed to send {}: {}", command.name(), e));
        }
        self.pending_response = true;

        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(command = command.name(), "Cancelled while waiting for the worker");
                    close_open_pairs(&mut self.open, ReportType::Terminated, CANCEL_MESSAGE, listener);
                    return Response::error(
                        StatusCode::Cancelled,
                        format!("{} was cancelled", command.name()),
                    );
                }
                received = self.channel.receive_message() => received,
            };

            match received {
                Ok(Message::Event(event)) => {
                    track(&mut self.open, &event);
                    listener.on_event(event);
                }
                Ok(Message::Response(response)) => {
                    self.pending_response = false;
                    debug!(
                        command = command.name(),
                        status = ?response.status_code,
                        "Received response"
                    );
                    return response;
                }
                Ok(Message::Command(unexpected)) => {
                    warn!("Ignoring {} command sent by the worker", unexpected.name());
                }
                Err(ChannelError::Codec(e)) => {
                    warn!("Skipping undecodable frame: {}", e);
                }
                Err(e) => {
                    self.pending_response = false;
                    let status = if e.is_closed() {
                        StatusCode::Disconnected
                    } else {
                        StatusCode::InternalError
                    };
                    warn!(command = command.name(), "Lost the worker: {}", e);
                    close_open_pairs(&mut self.open, ReportType::Interrupted, DISCONNECT_MESSAGE, listener);
                    return Response::error(status, format!("{} failed: {}", command.name(), e));
                }
            }
        }
    }

    /// Reads and discards frames up to the response of a cancelled command.
    async fn drain_stale_response(&mut self, cancel: &CancellationToken) -> Result<(), Response> {
        debug!("Draining the response of a cancelled command");
        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(Response::error(StatusCode::Cancelled, "Cancelled while draining"));
                }
                received = self.channel.receive_message() => received,
            };
            match received {
                Ok(Message::Response(_)) => {
                    self.pending_response = false;
                    return Ok(());
                }
                Ok(_) | Err(ChannelError::Codec(_)) => continue,
                Err(e) => {
                    self.pending_response = false;
                    let status = if e.is_closed() {
                        StatusCode::Disconnected
                    } else {
                        StatusCode::InternalError
                    };
                    return Err(Response::error(status, e.to_string()));
                }
            }
        }
    }
}

fn track(open: &mut Vec<OpenPair>, event: &TestEvent) {
    if event.event_type.is_before() {
        open.push(OpenPair::from_event(event));
    } else {
        open.retain(|pair| pair.id != event.id);
    }
}

/// Closes innermost pairs first, so a row closes before its outer test.
fn close_open_pairs(
    open: &mut Vec<OpenPair>,
    report_type: ReportType,
    message: &str,
    listener: &dyn EventListener,
) {
    while let Some(pair) = open.pop() {
        listener.on_event(pair.close(report_type, message));
    }
}
