//! Local duplex transport between controller and worker.
//!
//! The worker listens on a well-known [`Endpoint`] and the controller
//! connects to it. On Unix the endpoint is a socket file in the temp
//! directory named after the channel; elsewhere it is a loopback TCP port.
//! Endpoints round-trip through strings (`unix:/tmp/stagehand.sock`,
//! `tcp:127.0.0.1:47011`) so they can be handed to the engine process via
//! an environment variable.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Environment variable through which the engine learns the worker endpoint.
pub const ENDPOINT_ENV: &str = "STAGEHAND_ENDPOINT";

/// Any connected duplex byte stream.
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}

/// A boxed connected stream.
pub type BoxedStream = Box<dyn DuplexStream>;

/// Address of a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix domain socket path.
    Local(PathBuf),
    /// Loopback TCP address.
    Tcp(SocketAddr),
}

impl Endpoint {
    /// Derives the single per-machine endpoint for a channel name.
    pub fn well_known(channel: &str) -> Self {
        if cfg!(unix) {
            Endpoint::Local(std::env::temp_dir().join(format!("{}.sock", channel)))
        } else {
            // stable port in the dynamic range derived from the name
            let hash = channel
                .bytes()
                .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
            let port = 49152 + (hash % 16000) as u16;
            Endpoint::Tcp(SocketAddr::from(([127, 0, 0, 1], port)))
        }
    }

    /// Binds a listener on this endpoint.
    ///
    /// A stale Unix socket file left by a crashed worker is removed first.
    pub async fn bind(&self) -> std::io::Result<Listener> {
        match self {
            #[cfg(unix)]
            Endpoint::Local(path) => {
                if path.exists() {
                    debug!("Removing stale socket {}", path.display());
                    std::fs::remove_file(path)?;
                }
                Ok(Listener::Local(tokio::net::UnixListener::bind(path)?))
            }
            #[cfg(not(unix))]
            Endpoint::Local(path) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!("local sockets are unavailable here: {}", path.display()),
            )),
            Endpoint::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr).await?)),
        }
    }

    /// Connects once.
    pub async fn connect(&self) -> std::io::Result<BoxedStream> {
        match self {
            #[cfg(unix)]
            Endpoint::Local(path) => Ok(Box::new(tokio::net::UnixStream::connect(path).await?)),
            #[cfg(not(unix))]
            Endpoint::Local(path) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!("local sockets are unavailable here: {}", path.display()),
            )),
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }

    /// Connects, retrying until the worker is up, the timeout elapses, or
    /// `cancel` fires.
    pub async fn connect_with_retry(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> std::io::Result<BoxedStream> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.connect().await {
                Ok(stream) => {
                    debug!("Connected to {} after {} attempt(s)", self, attempt);
                    return Ok(stream);
                }
                Err(e) if tokio::time::Instant::now() >= deadline => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("worker at {} not reachable after {:?}: {}", self, timeout, e),
                    ));
                }
                Err(e) => debug!("Connect attempt {} to {} failed: {}", attempt, self, e),
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::Interrupted,
                        "connect cancelled",
                    ));
                }
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Local(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

/// Error returned when an endpoint string has no known scheme.
#[derive(Debug, thiserror::Error)]
#[error("Invalid endpoint '{0}': expected unix:<path> or tcp:<addr>")]
pub struct InvalidEndpoint(String);

impl FromStr for Endpoint {
    type Err = InvalidEndpoint;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            Ok(Endpoint::Local(PathBuf::from(path)))
        } else if let Some(addr) = s.strip_prefix("tcp:") {
            addr.parse()
                .map(Endpoint::Tcp)
                .map_err(|_| InvalidEndpoint(s.to_string()))
        } else {
            Err(InvalidEndpoint(s.to_string()))
        }
    }
}

/// A bound worker endpoint.
pub enum Listener {
    #[cfg(unix)]
    Local(tokio::net::UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    /// Accepts the next controller connection.
    pub async fn accept(&self) -> std::io::Result<BoxedStream> {
        match self {
            #[cfg(unix)]
            Listener::Local(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                debug!("Accepted controller connection from {}", peer);
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }

    /// The endpoint actually bound (resolves port 0 for TCP).
    pub fn local_endpoint(&self) -> std::io::Result<Endpoint> {
        match self {
            #[cfg(unix)]
            Listener::Local(listener) => {
                let addr = listener.local_addr()?;
                let path = addr.as_pathname().map(PathBuf::from).ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "unnamed socket")
                })?;
                Ok(Endpoint::Local(path))
            }
            Listener::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::channel::FramedChannel;

    #[test]
    fn test_endpoint_string_round_trip() {
        let local = Endpoint::Local(PathBuf::from("/tmp/stagehand.sock"));
        assert_eq!(local.to_string(), "unix:/tmp/stagehand.sock");
        assert_eq!(local.to_string().parse::<Endpoint>().unwrap(), local);

        let tcp: Endpoint = "tcp:127.0.0.1:4000".parse().unwrap();
        assert_eq!(tcp, Endpoint::Tcp(SocketAddr::from(([127, 0, 0, 1], 4000))));

        assert!("pipe:foo".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_well_known_is_stable() {
        assert_eq!(Endpoint::well_known("stagehand"), Endpoint::well_known("stagehand"));
    }

    #[tokio::test]
    async fn test_tcp_connect_and_exchange() {
        let listener = Endpoint::Tcp(SocketAddr::from(([127, 0, 0, 1], 0)))
            .bind()
            .await
            .unwrap();
        let endpoint = listener.local_endpoint().unwrap();

        let server = tokio::spawn(async move {
            let stream = listener.accept().await.unwrap();
            let mut channel = FramedChannel::new(stream);
            let frame = channel.receive().await.unwrap();
            channel.send(&frame).await.unwrap();
        });

        let stream = endpoint
            .connect_with_retry(Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        let mut channel = FramedChannel::new(stream);
        channel.send(b"ping").await.unwrap();
        assert_eq!(channel.receive().await.unwrap(), b"ping");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_retry_times_out() {
        let endpoint = Endpoint::Local(std::env::temp_dir().join("stagehand-missing-test.sock"));
        let result = endpoint
            .connect_with_retry(Duration::from_millis(300), &CancellationToken::new())
            .await;
        assert!(result.is_err());
    }
}
