//! In-process proxy backing store for tests and local loopback setups.
//!
//! Serves the wire protocol from a memory region over any byte stream
//! (typically a [`tokio::io::duplex`] pair). Capability flags and failure
//! injection are configurable so engine-level policy — capability
//! downgrades, end-of-data handling, cancellation — can be exercised without
//! a remote process.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::transport::{ProxyTransport, StreamTransport};
use crate::wire::{
    errno, Frame, InfoResponse, Opcode, ReadRequest, ReadResponse, StatusResponse, UnmapRequest,
    WriteRequest, WriteResponse, ZeroRequest, FLAG_READ_ONLY, FLAG_SUPPORTS_UNMAP,
    FLAG_SUPPORTS_ZERO,
};

/// Configuration for a loopback proxy backing store.
#[derive(Debug, Clone)]
pub struct LoopbackProxyConfig {
    /// Backing store size in bytes.
    pub size: u64,
    /// Required transfer alignment reported in Info.
    pub req_alignment: u64,
    /// Advertise and enforce read-only access.
    pub read_only: bool,
    /// Advertise Unmap support.
    pub supports_unmap: bool,
    /// Advertise Zero support.
    pub supports_zero: bool,
    /// Fail Zero requests with `UNSUPPORTED` even when advertised.
    pub fail_zero: bool,
}

impl Default for LoopbackProxyConfig {
    fn default() -> Self {
        Self {
            size: 1 << 20,
            req_alignment: 1,
            read_only: false,
            supports_unmap: false,
            supports_zero: false,
            fail_zero: false,
        }
    }
}

/// Memory-backed proxy server speaking the wire protocol.
pub struct LoopbackProxy {
    config: LoopbackProxyConfig,
    data: Mutex<Vec<u8>>,
    zero_calls: AtomicU64,
    unmap_calls: AtomicU64,
    literal_writes: AtomicU64,
}

impl LoopbackProxy {
    /// Create a zero-filled backing store of the configured size.
    pub fn new(config: LoopbackProxyConfig) -> Self {
        let data = vec![0u8; config.size as usize];
        Self {
            config,
            data: Mutex::new(data),
            zero_calls: AtomicU64::new(0),
            unmap_calls: AtomicU64::new(0),
            literal_writes: AtomicU64::new(0),
        }
    }

    /// Number of Zero requests received.
    pub fn zero_calls(&self) -> u64 {
        self.zero_calls.load(Ordering::SeqCst)
    }

    /// Number of Unmap requests received.
    pub fn unmap_calls(&self) -> u64 {
        self.unmap_calls.load(Ordering::SeqCst)
    }

    /// Number of Write requests received.
    pub fn literal_writes(&self) -> u64 {
        self.literal_writes.load(Ordering::SeqCst)
    }

    /// Serve one connection until Stop, EOF, or a transport error.
    pub async fn serve<T>(&self, stream: T) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Send + Sync,
    {
        let transport = StreamTransport::new(stream, "loopback-client");
        loop {
            let frame = match transport.recv_frame().await {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(error = %e, "loopback connection closed");
                    return Ok(());
                }
            };
            let reply = match frame.opcode {
                Opcode::Info => Some(self.handle_info()),
                Opcode::Read => Some(self.handle_read(&frame.payload).await?),
                Opcode::Write => Some(self.handle_write(&frame.payload).await?),
                Opcode::Zero => Some(self.handle_zero(&frame.payload).await?),
                Opcode::Unmap => Some(self.handle_unmap(&frame.payload).await?),
                Opcode::Stop => {
                    debug!("loopback received stop notice");
                    return Ok(());
                }
                other => {
                    debug!(opcode = ?other, "loopback ignoring response-class frame");
                    None
                }
            };
            if let Some(reply) = reply {
                transport.send_frame(&reply).await?;
            }
        }
    }

    fn handle_info(&self) -> Frame {
        let mut flags = 0u64;
        if self.config.read_only {
            flags |= FLAG_READ_ONLY;
        }
        if self.config.supports_unmap {
            flags |= FLAG_SUPPORTS_UNMAP;
        }
        if self.config.supports_zero {
            flags |= FLAG_SUPPORTS_ZERO;
        }
        let info = InfoResponse {
            file_size: self.config.size,
            req_alignment: self.config.req_alignment,
            flags,
        };
        Frame::new(Opcode::InfoResp, info.encode())
    }

    async fn handle_read(&self, payload: &[u8]) -> Result<Frame> {
        let req = ReadRequest::decode(payload)?;
        let data = self.data.lock().await;
        let len = data.len() as u64;
        if req.offset >= len {
            let resp = ReadResponse {
                errno: errno::END_OF_DATA,
                length: 0,
            };
            return Ok(Frame::new(Opcode::ReadResp, resp.encode_with_data(&[])));
        }
        let end = len.min(req.offset + req.length);
        let body = &data[req.offset as usize..end as usize];
        let resp = ReadResponse {
            errno: errno::SUCCESS,
            length: body.len() as u64,
        };
        Ok(Frame::new(Opcode::ReadResp, resp.encode_with_data(body)))
    }

    async fn handle_write(&self, payload: &[u8]) -> Result<Frame> {
        self.literal_writes.fetch_add(1, Ordering::SeqCst);
        let status = |errno: u64| {
            Frame::new(
                Opcode::WriteResp,
                WriteResponse { errno, length: 0 }.encode(),
            )
        };
        let (req, body) = WriteRequest::decode(payload)?;
        if self.config.read_only {
            return Ok(status(errno::READ_ONLY));
        }
        let mut data = self.data.lock().await;
        let end = match req.offset.checked_add(req.length) {
            Some(end) if end <= data.len() as u64 => end,
            _ => return Ok(status(errno::INVALID_REQUEST)),
        };
        data[req.offset as usize..end as usize].copy_from_slice(body);
        let resp = WriteResponse {
            errno: errno::SUCCESS,
            length: req.length,
        };
        Ok(Frame::new(Opcode::WriteResp, resp.encode()))
    }

    async fn handle_zero(&self, payload: &[u8]) -> Result<Frame> {
        self.zero_calls.fetch_add(1, Ordering::SeqCst);
        let status = |errno: u64| Frame::new(Opcode::ZeroResp, StatusResponse { errno }.encode());
        let req = ZeroRequest::decode(payload)?;
        if self.config.fail_zero || !self.config.supports_zero {
            return Ok(status(errno::UNSUPPORTED));
        }
        if self.config.read_only {
            return Ok(status(errno::READ_ONLY));
        }
        let mut data = self.data.lock().await;
        let end = match req.offset.checked_add(req.length) {
            Some(end) if end <= data.len() as u64 => end,
            _ => return Ok(status(errno::INVALID_REQUEST)),
        };
        data[req.offset as usize..end as usize].fill(0);
        Ok(status(errno::SUCCESS))
    }

    async fn handle_unmap(&self, payload: &[u8]) -> Result<Frame> {
        self.unmap_calls.fetch_add(1, Ordering::SeqCst);
        let status = |errno: u64| Frame::new(Opcode::UnmapResp, StatusResponse { errno }.encode());
        let req = UnmapRequest::decode(payload)?;
        if !self.config.supports_unmap {
            return Ok(status(errno::UNSUPPORTED));
        }
        if self.config.read_only {
            return Ok(status(errno::READ_ONLY));
        }
        let mut data = self.data.lock().await;
        for range in &req.ranges {
            let end = match range.offset.checked_add(range.length) {
                Some(end) if end <= data.len() as u64 => end,
                _ => return Ok(status(errno::INVALID_REQUEST)),
            };
            data[range.offset as usize..end as usize].fill(0);
        }
        Ok(status(errno::SUCCESS))
    }
}
