//! Length-prefixed framing over a duplex byte stream.
//!
//! Wire format, repeated per message:
//!
//! ```text
//! ┌───────────────────────┬──────────────────────────┐
//! │ u32 length (LE, 4 B)  │ payload (length bytes)   │
//! └───────────────────────┴──────────────────────────┘
//! ```
//!
//! The receiver buffers partial reads until a whole frame is available, so
//! one read never has to equal one message. Receiving is cancel-safe: a
//! `receive()` dropped mid-frame keeps the bytes already read and the next
//! call resumes from them.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::codec::{self, CodecError, Message};

/// Upper bound on a single payload.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const PREFIX_LEN: usize = 4;

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Errors raised by a [`FramedChannel`].
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The peer closed the stream. `pending` bytes of an unfinished frame
    /// were discarded (0 means the close fell on a frame boundary).
    #[error("Channel closed ({pending} bytes of a partial frame pending)")]
    Closed { pending: usize },

    #[error("Frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge(usize),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// Returns `true` when the error means the peer is gone.
    pub fn is_closed(&self) -> bool {
        match self {
            ChannelError::Closed { .. } => true,
            ChannelError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// A bidirectional, message-framed view of a byte stream.
pub struct FramedChannel<S> {
    stream: S,
    read_buf: Vec<u8>,
}

impl<S> FramedChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: Vec::with_capacity(8 * 1024),
        }
    }

    /// Writes one frame.
    pub async fn send(&mut self, payload: &[u8]) -> ChannelResult<()> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(ChannelError::FrameTooLarge(payload.len()));
        }
        let len = payload.len() as u32;

        let mut frame = Vec::with_capacity(PREFIX_LEN + payload.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(payload);

        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads the next whole frame.
    pub async fn receive(&mut self) -> ChannelResult<Vec<u8>> {
        loop {
            if let Some(frame) = self.split_frame()? {
                return Ok(frame);
            }

            // read_buf keeps already-buffered bytes if this future is dropped
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ChannelError::Closed {
                    pending: self.read_buf.len(),
                });
            }
        }
    }

    /// Encodes and sends a message.
    pub async fn send_message(&mut self, message: &Message) -> ChannelResult<()> {
        let payload = codec::encode(message)?;
        self.send(&payload).await
    }

    /// Receives and decodes a message.
    pub async fn receive_message(&mut self) -> ChannelResult<Message> {
        let payload = self.receive().await?;
        Ok(codec::decode(&payload)?)
    }

    /// Consumes the channel and returns the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    fn split_frame(&mut self) -> ChannelResult<Option<Vec<u8>>> {
        if self.read_buf.len() < PREFIX_LEN {
            return Ok(None);
        }
        let mut prefix = [0u8; PREFIX_LEN];
        prefix.copy_from_slice(&self.read_buf[..PREFIX_LEN]);
        let len = u32::from_le_bytes(prefix) as usize;

        if len > MAX_FRAME_SIZE {
            return Err(ChannelError::FrameTooLarge(len));
        }
        if self.read_buf.len() < PREFIX_LEN + len {
            return Ok(None);
        }

        let frame = self.read_buf[PREFIX_LEN..PREFIX_LEN + len].to_vec();
        self.read_buf.drain(..PREFIX_LEN + len);
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command::Command;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_send_receive() {
        let (a, b) = duplex(64);
        let mut left = FramedChannel::new(a);
        let mut right = FramedChannel::new(b);

        left.send(b"hello").await.unwrap();
        left.send(b"").await.unwrap();
        assert_eq!(right.receive().await.unwrap(), b"hello");
        assert_eq!(right.receive().await.unwrap(), b"");
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        // an 8-byte pipe forces the 100-byte payload through many partial reads
        let (a, b) = duplex(8);
        let payload = vec![7u8; 100];
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            let mut left = FramedChannel::new(a);
            left.send(&payload).await.unwrap();
            left
        });

        let mut right = FramedChannel::new(b);
        assert_eq!(right.receive().await.unwrap(), expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_prefix_is_little_endian() {
        let (mut raw, b) = duplex(64);
        raw.write_all(&[3, 0, 0, 0, b'a', b'b', b'c']).await.unwrap();
        let mut right = FramedChannel::new(b);
        assert_eq!(right.receive().await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_close_on_boundary() {
        let (a, b) = duplex(64);
        drop(a);
        let mut right = FramedChannel::new(b);
        let err = right.receive().await.unwrap_err();
        assert!(matches!(err, ChannelError::Closed { pending: 0 }));
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn test_short_read_is_closed_not_generic() {
        let (mut raw, b) = duplex(64);
        raw.write_all(&[10, 0, 0, 0, b'x', b'y']).await.unwrap();
        drop(raw);

        let mut right = FramedChannel::new(b);
        match right.receive().await {
            Err(ChannelError::Closed { pending }) => assert_eq!(pending, 6),
            other => panic!("expected Closed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_prefix_rejected() {
        let (mut raw, b) = duplex(64);
        raw.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
        let mut right = FramedChannel::new(b);
        assert!(matches!(
            right.receive().await,
            Err(ChannelError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_message_round_trip() {
        let (a, b) = duplex(1024);
        let mut left = FramedChannel::new(a);
        let mut right = FramedChannel::new(b);

        left.send_message(&Command::Liveness.into()).await.unwrap();
        assert_eq!(
            right.receive_message().await.unwrap(),
            Message::Command(Command::Liveness)
        );
    }
}
