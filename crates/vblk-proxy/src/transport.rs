//! Transports carrying proxy frames over byte streams.
//!
//! Connection setup internals (sockets, pipes, shared memory) belong to the
//! caller; this module only needs something that can move whole frames. The
//! [`ProxyTransport`] trait is the seam: TCP gets a concrete helper, and any
//! other duplex byte stream (a pipe, an in-process duplex for tests) goes
//! through [`StreamTransport`].

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::error::{ProxyError, Result};
use crate::wire::{Frame, FrameHeader, FRAME_HEADER_SIZE};

/// A bidirectional, frame-oriented connection to a proxy backing store.
#[async_trait]
pub trait ProxyTransport: Send + Sync {
    /// Send one frame, flushing it onto the wire.
    async fn send_frame(&self, frame: &Frame) -> Result<()>;

    /// Receive the next frame.
    async fn recv_frame(&self) -> Result<Frame>;

    /// Shut down the write side so the remote observes an orderly close.
    async fn shutdown(&self) -> Result<()>;
}

/// Frame transport over any async byte stream.
pub struct StreamTransport<T> {
    read: Mutex<ReadHalf<T>>,
    write: Mutex<WriteHalf<T>>,
    peer: String,
}

impl<T> StreamTransport<T>
where
    T: AsyncRead + AsyncWrite + Send,
{
    /// Wrap a duplex byte stream. `peer` is a label used in logs only.
    pub fn new(stream: T, peer: impl Into<String>) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            read: Mutex::new(read),
            write: Mutex::new(write),
            peer: peer.into(),
        }
    }

    /// Returns the peer label for this transport.
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

#[async_trait]
impl<T> ProxyTransport for StreamTransport<T>
where
    T: AsyncRead + AsyncWrite + Send + Sync,
{
    async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let encoded = frame.encode();
        let mut write = self.write.lock().await;
        write.write_all(&encoded).await?;
        write.flush().await?;
        Ok(())
    }

    async fn recv_frame(&self) -> Result<Frame> {
        let mut read = self.read.lock().await;
        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        read.read_exact(&mut header_buf).await?;
        let header = FrameHeader::decode(&header_buf)?;
        let mut payload = vec![0u8; header.payload_length as usize];
        if !payload.is_empty() {
            read.read_exact(&mut payload).await?;
        }
        Ok(Frame {
            opcode: header.opcode,
            payload,
        })
    }

    async fn shutdown(&self) -> Result<()> {
        let mut write = self.write.lock().await;
        write.shutdown().await?;
        Ok(())
    }
}

/// TCP transport configuration.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY (disable Nagle's algorithm).
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            nodelay: true,
        }
    }
}

/// TCP transport — creates frame connections from socket addresses.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Creates a new TCP transport with the given configuration.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    /// Establishes a TCP connection to the specified address.
    pub async fn connect(&self, addr: &str) -> Result<StreamTransport<tokio::net::TcpStream>> {
        let timeout = std::time::Duration::from_millis(self.config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr))
            .await
            .map_err(|_| ProxyError::ConnectTimeout {
                addr: addr.to_string(),
                timeout_ms: self.config.connect_timeout_ms,
            })??;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        tracing::debug!(addr = addr, "proxy TCP connected");
        Ok(StreamTransport::new(stream, addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Opcode;

    #[tokio::test]
    async fn test_duplex_send_recv_frame() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let left = StreamTransport::new(a, "left");
        let right = StreamTransport::new(b, "right");

        let frame = Frame::new(Opcode::Info, Vec::new());
        left.send_frame(&frame).await.unwrap();
        let got = right.recv_frame().await.unwrap();
        assert_eq!(got.opcode, Opcode::Info);
        assert!(got.payload.is_empty());

        let frame = Frame::new(Opcode::Write, vec![7u8; 1024]);
        right.send_frame(&frame).await.unwrap();
        let got = left.recv_frame().await.unwrap();
        assert_eq!(got.opcode, Opcode::Write);
        assert_eq!(got.payload.len(), 1024);
    }

    #[tokio::test]
    async fn test_recv_after_shutdown_is_error() {
        let (a, b) = tokio::io::duplex(1024);
        let left = StreamTransport::new(a, "left");
        let right = StreamTransport::new(b, "right");

        left.shutdown().await.unwrap();
        drop(left);
        assert!(right.recv_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_connect_and_exchange() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let conn = StreamTransport::new(stream, "client");
            let frame = conn.recv_frame().await.unwrap();
            assert_eq!(frame.opcode, Opcode::Read);
            conn.send_frame(&Frame::new(Opcode::ReadResp, vec![0u8; 16]))
                .await
                .unwrap();
        });

        let transport = TcpTransport::new(TcpTransportConfig::default());
        let conn = transport.connect(&addr).await.unwrap();
        conn.send_frame(&Frame::new(Opcode::Read, vec![0u8; 16]))
            .await
            .unwrap();
        let resp = conn.recv_frame().await.unwrap();
        assert_eq!(resp.opcode, Opcode::ReadResp);

        server.await.unwrap();
    }
}
