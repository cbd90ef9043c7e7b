//! A direct connection to one peer server.

use std::io::ErrorKind;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use sluice_protocol::{wire, LogEntry, SendStatus, WireError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Errors from peer connections
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    /// Connection could not be established
    #[error("connection failed to {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O failed mid-exchange
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation exceeded the configured timeout
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Frame encode/decode failure
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Peer replied with a byte outside the status alphabet
    #[error("peer sent invalid status byte {0}")]
    BadResponse(u8),
}

/// One TCP connection to a peer server.
///
/// The exchange per batch is a 4-byte big-endian frame length, the frame
/// itself, then a single status byte back from the peer. Every I/O step runs
/// under the connection's timeout; a timed-out or errored connection is no
/// longer usable and should be dropped.
pub struct PeerConnection {
    addr: String,
    stream: TcpStream,
    timeout: Duration,
}

impl PeerConnection {
    /// Connect to a peer with the given I/O timeout.
    pub async fn connect(host: &str, port: u16, io_timeout: Duration) -> Result<Self, ConnError> {
        let addr = format!("{}:{}", host, port);

        let stream = match timeout(io_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ConnError::ConnectFailed { addr, source: e });
            }
            Err(_) => {
                return Err(ConnError::ConnectFailed {
                    addr,
                    source: std::io::Error::new(ErrorKind::TimedOut, "connect timed out"),
                });
            }
        };

        // Low latency for small batches; non-fatal if it fails
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(addr = %addr, error = %e, "failed to set TCP_NODELAY");
        }

        // Keep-alive so half-dead peers are detected between batches
        let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(30));
        if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            tracing::debug!(addr = %addr, error = %e, "failed to set TCP keep-alive");
        }

        tracing::debug!(addr = %addr, "connected to peer");

        Ok(Self {
            addr,
            stream,
            timeout: io_timeout,
        })
    }

    /// Peer address as `host:port`
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one batch and wait for the peer's status byte.
    pub async fn send(&mut self, batch: &[LogEntry]) -> Result<SendStatus, ConnError> {
        let frame = wire::encode_batch(batch)?;
        let len_prefix = (frame.len() as u32).to_be_bytes();
        let io_timeout = self.timeout;

        let stream = &mut self.stream;
        let io = async move {
            stream.write_all(&len_prefix).await?;
            stream.write_all(&frame).await?;
            stream.flush().await?;

            let mut status = [0u8; 1];
            stream.read_exact(&mut status).await?;
            Ok::<u8, std::io::Error>(status[0])
        };

        let byte = match timeout(io_timeout, io).await {
            Ok(Ok(byte)) => byte,
            Ok(Err(e)) => return Err(ConnError::Io(e)),
            Err(_) => return Err(ConnError::Timeout(io_timeout)),
        };

        SendStatus::try_from(byte).map_err(|_| ConnError::BadResponse(byte))
    }
}

#[cfg(test)]
#[path = "peer_test.rs"]
mod peer_test;
