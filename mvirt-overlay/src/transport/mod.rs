//! Secure session transport
//!
//! The data plane talks to peers through these traits only:
//! - `Transport`: dial a peer or listen for peers
//! - `Acceptor`: yields inbound sessions
//! - `Session`: a multiplexed connection carrying logical streams
//! - `FrameSender` / `FrameReceiver`: one direction of a stream, frame at a time
//!
//! `quic` implements them on quinn; `test_util::MemoryNetwork` implements
//! them in-process. Both use the length-prefixed framing in this module.

pub mod quic;

use crate::Frame;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame that fits the 16-bit length prefix (and an IPv4 total length).
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The session handshake did not complete in time. Recoverable by retrying.
    #[error("handshake did not complete in time")]
    HandshakeTimeout,

    #[error("connection to {addr} failed: {reason}")]
    ConnectionFailed { addr: SocketAddr, reason: String },

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("frame of {0} bytes exceeds maximum frame size")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    pub fn is_handshake_timeout(&self) -> bool {
        matches!(self, TransportError::HandshakeTimeout)
    }

    pub fn connection_failed(addr: SocketAddr, reason: impl ToString) -> Self {
        TransportError::ConnectionFailed {
            addr,
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Entry point to a session transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bind a listener for inbound sessions.
    async fn listen(&self, local: SocketAddr) -> Result<Box<dyn Acceptor>>;

    /// Establish an outbound session.
    ///
    /// Fails with `TransportError::HandshakeTimeout` when the peer did not
    /// answer the handshake in time.
    async fn dial(&self, remote: SocketAddr) -> Result<Arc<dyn Session>>;
}

/// Listener side of a transport.
#[async_trait]
pub trait Acceptor: Send {
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Wait for the next inbound session.
    ///
    /// An error means the listener itself can no longer accept.
    async fn accept(&mut self) -> Result<Arc<dyn Session>>;

    /// Stop accepting. A pending `accept` returns an error.
    fn close(&self);
}

/// An established session with one peer.
#[async_trait]
pub trait Session: Send + Sync {
    fn remote_addr(&self) -> SocketAddr;

    /// Open a new outbound stream.
    async fn open_stream(&self) -> Result<Box<dyn FrameSender>>;

    /// Wait for the peer to open a stream.
    async fn accept_stream(&self) -> Result<Box<dyn FrameReceiver>>;

    /// Close the session. Pending stream operations fail.
    fn close(&self);
}

/// Sending half of a stream.
#[async_trait]
pub trait FrameSender: Send {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<()>;
}

/// Receiving half of a stream.
#[async_trait]
pub trait FrameReceiver: Send {
    /// Next frame, or `None` once the peer finished the stream.
    async fn recv_frame(&mut self) -> Result<Option<Frame>>;
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if frame.is_empty() || frame.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(frame.len()));
    }
    writer.write_all(&(frame.len() as u16).to_be_bytes()).await?;
    writer.write_all(frame).await?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// A clean end of stream before a length prefix yields `None`. A zero
/// length or a stream ending inside a frame is an error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len = [0u8; 2];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = usize::from(u16::from_be_bytes(len));
    if len == 0 {
        return Err(TransportError::Closed("zero-length frame".to_string()));
    }

    let mut frame = vec![0u8; len];
    match reader.read_exact(&mut frame).await {
        Ok(_) => Ok(Some(frame)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(TransportError::Closed("stream ended inside a frame".to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_framing_preserves_boundaries() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let writer = tokio::spawn(async move {
            write_frame(&mut client, b"first").await.unwrap();
            write_frame(&mut client, &[7u8; 300]).await.unwrap();
            write_frame(&mut client, b"x").await.unwrap();
        });

        assert_eq!(read_frame(&mut server).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut server).await.unwrap().unwrap(), vec![7u8; 300]);
        assert_eq!(read_frame(&mut server).await.unwrap().unwrap(), b"x");

        writer.await.unwrap();
        // Writer dropped: clean end of stream
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 10, 1, 2, 3]).await.unwrap();
        drop(client);

        assert!(matches!(
            read_frame(&mut server).await,
            Err(TransportError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_length_frame_is_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0]).await.unwrap();

        assert!(read_frame(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, _server) = tokio::io::duplex(64);
        let frame = vec![0u8; MAX_FRAME_LEN + 1];

        assert!(matches!(
            write_frame(&mut client, &frame).await,
            Err(TransportError::FrameTooLarge(n)) if n == MAX_FRAME_LEN + 1
        ));
        assert!(write_frame(&mut client, &[]).await.is_err());
    }

    #[test]
    fn test_handshake_timeout_classification() {
        assert!(TransportError::HandshakeTimeout.is_handshake_timeout());
        let addr: SocketAddr = "203.0.113.5:2345".parse().unwrap();
        assert!(!TransportError::connection_failed(addr, "refused").is_handshake_timeout());
        assert!(!TransportError::Closed("gone".into()).is_handshake_timeout());
    }
}
