//! Self-describing JSON payloads for the framed channel.
//!
//! Every frame holds one [`Message`]. The envelope embeds a `message`
//! discriminator and commands embed their own `type` tag, so the receiver
//! recovers the concrete variant from the payload alone:
//!
//! ```json
//! {"message":"Command","body":{"type":"RunTest","test_id":"…"}}
//! {"message":"Event","body":{"id":"…","type":"TestAfter", …}}
//! {"message":"Response","body":{"status_code":"Ok","payload":"…"}}
//! ```

use serde::{Deserialize, Serialize};

use super::command::{Command, Response};
use super::event::TestEvent;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors raised while turning messages into payloads and back.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The payload is not valid JSON or not a known message shape.
    #[error("Failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Everything that can travel over the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message", content = "body")]
pub enum Message {
    Command(Command),
    Response(Response),
    Event(TestEvent),
}

impl From<Command> for Message {
    fn from(command: Command) -> Self {
        Message::Command(command)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

impl From<TestEvent> for Message {
    fn from(event: TestEvent) -> Self {
        Message::Event(event)
    }
}

/// Serializes a message into a UTF-8 JSON payload.
pub fn encode(message: &Message) -> CodecResult<Vec<u8>> {
    serde_json::to_vec(message).map_err(CodecError::Encode)
}

/// Deserializes a payload produced by [`encode`].
pub fn decode(payload: &[u8]) -> CodecResult<Message> {
    serde_json::from_slice(payload).map_err(CodecError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command::StatusCode;
    use crate::protocol::event::{Report, ReportType};
    use crate::suite::{InvocationAttribute, TestCaseNode, TestSuiteNode};
    use serde_json::json;
    use uuid::Uuid;

    fn round_trip(message: Message) {
        let payload = encode(&message).unwrap();
        assert_eq!(decode(&payload).unwrap(), message);
    }

    #[test]
    fn test_round_trip_every_kind() {
        let suite = TestSuiteNode::new("Suite", "suite.rs").with_test(
            TestCaseNode::new("rows", 7)
                .with_attribute(InvocationAttribute::new(vec![json!(1)]))
                .with_attribute(InvocationAttribute::new(vec![json!(2)])),
        );

        round_trip(Command::RunSuite {
            suite,
            capture_std_out: true,
            report_orphans: false,
            stage_timeout_ms: Some(250),
        }
        .into());
        round_trip(Command::Terminate.into());
        round_trip(Response::error(StatusCode::ContextNotFound, "missing").into());
        round_trip(
            TestEvent::test_after(Uuid::new_v4(), "Suite::rows")
                .with_reports(vec![
                    Report::new(ReportType::Failure, 9, "expected 1").with_stack_trace("at 9"),
                ])
                .into(),
        );
    }

    #[test]
    fn test_measured_elapsed_round_trips() {
        let started = std::time::Instant::now();
        std::thread::sleep(std::time::Duration::from_micros(200));
        round_trip(
            TestEvent::test_after(Uuid::new_v4(), "Suite::timed")
                .with_elapsed(started.elapsed())
                .into(),
        );
        round_trip(
            TestEvent::test_after(Uuid::new_v4(), "Suite::fixed")
                .with_elapsed(std::time::Duration::new(3, 1_500))
                .into(),
        );
    }

    #[test]
    fn test_decoder_needs_no_type_hint() {
        let payload = br#"{"message":"Command","body":{"type":"Liveness"}}"#;
        assert_eq!(decode(payload).unwrap(), Message::Command(Command::Liveness));
    }

    #[test]
    fn test_decode_rejects_unknown_variant() {
        let payload = br#"{"message":"Command","body":{"type":"Reboot"}}"#;
        assert!(matches!(decode(payload), Err(CodecError::Decode(_))));
    }
}
