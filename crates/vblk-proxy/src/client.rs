//! Protocol client for a proxy backing store.
//!
//! The client performs the Info negotiation once at connection time and
//! caches the result for the lifetime of the connection; capabilities are
//! never re-queried. Every blocking round-trip races the caller's
//! [`CancelToken`] so teardown can proceed even with a call in flight.

use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{ProxyError, Result};
use crate::transport::ProxyTransport;
use crate::wire::{
    errno, ByteRange, Frame, InfoResponse, Opcode, ReadRequest, ReadResponse, StatusResponse,
    UnmapRequest, WriteRequest, WriteResponse,
};

/// Capabilities negotiated with the remote side at connection time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyCapabilities {
    /// Size of the remote backing store in bytes.
    pub file_size: u64,
    /// Required transfer alignment in bytes.
    pub req_alignment: u64,
    /// Remote enforces read-only access.
    pub read_only: bool,
    /// Remote implements Unmap.
    pub supports_unmap: bool,
    /// Remote implements Zero.
    pub supports_zero: bool,
}

impl From<InfoResponse> for ProxyCapabilities {
    fn from(info: InfoResponse) -> Self {
        Self {
            file_size: info.file_size,
            req_alignment: info.req_alignment.max(1),
            read_only: info.read_only(),
            supports_unmap: info.supports_unmap(),
            supports_zero: info.supports_zero(),
        }
    }
}

/// Client half of the proxy protocol.
///
/// Round-trips are serialized by the caller (the engine funnels all data-path
/// operations for one unit through one worker), so no request multiplexing is
/// needed here.
pub struct ProxyClient {
    transport: Box<dyn ProxyTransport>,
    caps: ProxyCapabilities,
}

impl ProxyClient {
    /// Connect over an established transport: query capabilities and cache
    /// them. Fails if the stop signal fires before negotiation completes.
    pub async fn connect(transport: Box<dyn ProxyTransport>, cancel: &CancelToken) -> Result<Self> {
        let resp = roundtrip(
            transport.as_ref(),
            cancel,
            Frame::new(Opcode::Info, Vec::new()),
        )
        .await?;
        let info = InfoResponse::decode(&resp.payload)?;
        let caps = ProxyCapabilities::from(info);
        debug!(
            file_size = caps.file_size,
            req_alignment = caps.req_alignment,
            read_only = caps.read_only,
            supports_unmap = caps.supports_unmap,
            supports_zero = caps.supports_zero,
            "proxy capabilities negotiated"
        );
        Ok(Self { transport, caps })
    }

    /// The capabilities cached at connection time.
    pub fn capabilities(&self) -> &ProxyCapabilities {
        &self.caps
    }

    /// Read `length` bytes at `offset`. Returns the transferred bytes, which
    /// may be fewer than requested when the range straddles the end of the
    /// remote backing store. A read entirely past the end returns
    /// [`ProxyError::EndOfData`].
    pub async fn read(&self, cancel: &CancelToken, offset: u64, length: u64) -> Result<Vec<u8>> {
        let req = ReadRequest { offset, length };
        let frame = Frame::new(Opcode::Read, req.encode());
        let resp = roundtrip(self.transport.as_ref(), cancel, frame).await?;
        let (header, data) = ReadResponse::decode(&resp.payload)?;
        if header.errno != errno::SUCCESS {
            return Err(ProxyError::from_errno(Opcode::Read, header.errno));
        }
        Ok(data.to_vec())
    }

    /// Write `data` at `offset`. Returns the number of bytes written.
    pub async fn write(&self, cancel: &CancelToken, offset: u64, data: &[u8]) -> Result<u64> {
        let req = WriteRequest {
            offset,
            length: data.len() as u64,
        };
        let frame = Frame::new(Opcode::Write, req.encode_with_data(data));
        let resp = roundtrip(self.transport.as_ref(), cancel, frame).await?;
        let header = WriteResponse::decode(&resp.payload)?;
        if header.errno != errno::SUCCESS {
            return Err(ProxyError::from_errno(Opcode::Write, header.errno));
        }
        Ok(header.length)
    }

    /// Zero `length` bytes at `offset`.
    pub async fn zero(&self, cancel: &CancelToken, offset: u64, length: u64) -> Result<()> {
        let req = crate::wire::ZeroRequest { offset, length };
        let frame = Frame::new(Opcode::Zero, req.encode());
        let resp = roundtrip(self.transport.as_ref(), cancel, frame).await?;
        let status = StatusResponse::decode(&resp.payload)?;
        if status.errno != errno::SUCCESS {
            return Err(ProxyError::from_errno(Opcode::Zero, status.errno));
        }
        Ok(())
    }

    /// Unmap all of `ranges` in a single batched message.
    pub async fn unmap(&self, cancel: &CancelToken, ranges: &[ByteRange]) -> Result<()> {
        let req = UnmapRequest {
            ranges: ranges.to_vec(),
        };
        let frame = Frame::new(Opcode::Unmap, req.encode());
        let resp = roundtrip(self.transport.as_ref(), cancel, frame).await?;
        let status = StatusResponse::decode(&resp.payload)?;
        if status.errno != errno::SUCCESS {
            return Err(ProxyError::from_errno(Opcode::Unmap, status.errno));
        }
        Ok(())
    }

    /// Send the one-way Stop notice and shut the connection down. Best
    /// effort: a remote that already went away is not an error here.
    pub async fn stop(&self) {
        let frame = Frame::new(Opcode::Stop, Vec::new());
        if let Err(e) = self.transport.send_frame(&frame).await {
            warn!(error = %e, "proxy stop notice failed");
        }
        if let Err(e) = self.transport.shutdown().await {
            debug!(error = %e, "proxy transport shutdown failed");
        }
    }
}

/// One request/response exchange, racing the stop signal. If the signal
/// fires first the call returns [`ProxyError::Cancelled`] immediately; the
/// connection is considered dead from that point on (teardown closes it).
async fn roundtrip(
    transport: &dyn ProxyTransport,
    cancel: &CancelToken,
    frame: Frame,
) -> Result<Frame> {
    let Some(expected) = frame.opcode.response() else {
        return Err(ProxyError::InvalidFrame {
            reason: format!("opcode {:?} takes no response", frame.opcode),
        });
    };
    let exchange = async {
        transport.send_frame(&frame).await?;
        transport.recv_frame().await
    };
    let resp = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
        resp = exchange => resp?,
    };
    if resp.opcode != expected {
        return Err(ProxyError::UnexpectedResponse {
            expected,
            got: resp.opcode,
        });
    }
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use crate::loopback::{LoopbackProxy, LoopbackProxyConfig};
    use crate::transport::StreamTransport;
    use std::sync::Arc;

    async fn connected_client(cfg: LoopbackProxyConfig) -> (ProxyClient, Arc<LoopbackProxy>) {
        let server = Arc::new(LoopbackProxy::new(cfg));
        let (near, far) = tokio::io::duplex(256 * 1024);
        let srv = server.clone();
        tokio::spawn(async move { srv.serve(far).await });
        let (token, _handle) = cancel_pair();
        let transport = Box::new(StreamTransport::new(near, "loopback"));
        let client = ProxyClient::connect(transport, &token).await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_negotiation_caches_capabilities() {
        let (client, _server) = connected_client(LoopbackProxyConfig {
            size: 1 << 20,
            supports_unmap: true,
            supports_zero: true,
            ..Default::default()
        })
        .await;
        let caps = client.capabilities();
        assert_eq!(caps.file_size, 1 << 20);
        assert!(caps.supports_unmap);
        assert!(caps.supports_zero);
        assert!(!caps.read_only);
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let (client, _server) = connected_client(LoopbackProxyConfig {
            size: 1 << 20,
            ..Default::default()
        })
        .await;
        let (token, _handle) = cancel_pair();

        let data = vec![0x5A; 4096];
        let written = client.write(&token, 8192, &data).await.unwrap();
        assert_eq!(written, 4096);

        let read = client.read(&token, 8192, 4096).await.unwrap();
        assert_eq!(read, data);
    }

    #[tokio::test]
    async fn test_read_past_end_reports_end_of_data() {
        let (client, _server) = connected_client(LoopbackProxyConfig {
            size: 4096,
            ..Default::default()
        })
        .await;
        let (token, _handle) = cancel_pair();

        let result = client.read(&token, 8192, 512).await;
        assert!(matches!(result, Err(ProxyError::EndOfData)));
    }

    #[tokio::test]
    async fn test_read_straddling_end_is_short() {
        let (client, _server) = connected_client(LoopbackProxyConfig {
            size: 4096,
            ..Default::default()
        })
        .await;
        let (token, _handle) = cancel_pair();

        let data = client.read(&token, 4096 - 512, 1024).await.unwrap();
        assert_eq!(data.len(), 512);
    }

    #[tokio::test]
    async fn test_zero_and_unmap() {
        let (client, server) = connected_client(LoopbackProxyConfig {
            size: 1 << 16,
            supports_unmap: true,
            supports_zero: true,
            ..Default::default()
        })
        .await;
        let (token, _handle) = cancel_pair();

        client.write(&token, 0, &vec![0xFF; 8192]).await.unwrap();
        client.zero(&token, 0, 4096).await.unwrap();
        let head = client.read(&token, 0, 4096).await.unwrap();
        assert!(head.iter().all(|&b| b == 0));

        client
            .unmap(
                &token,
                &[ByteRange {
                    offset: 4096,
                    length: 4096,
                }],
            )
            .await
            .unwrap();
        let tail = client.read(&token, 4096, 4096).await.unwrap();
        assert!(tail.iter().all(|&b| b == 0));
        assert_eq!(server.zero_calls(), 1);
        assert_eq!(server.unmap_calls(), 1);
    }

    #[tokio::test]
    async fn test_zero_failure_double() {
        let (client, _server) = connected_client(LoopbackProxyConfig {
            size: 1 << 16,
            supports_zero: true,
            fail_zero: true,
            ..Default::default()
        })
        .await;
        let (token, _handle) = cancel_pair();

        let result = client.zero(&token, 0, 4096).await;
        assert!(matches!(result, Err(ProxyError::Unsupported)));
    }

    #[tokio::test]
    async fn test_read_only_remote_rejects_write() {
        let (client, _server) = connected_client(LoopbackProxyConfig {
            size: 1 << 16,
            read_only: true,
            ..Default::default()
        })
        .await;
        let (token, _handle) = cancel_pair();

        assert!(client.capabilities().read_only);
        let result = client.write(&token, 0, &[1, 2, 3, 4]).await;
        assert!(matches!(result, Err(ProxyError::ReadOnly)));
    }

    #[tokio::test]
    async fn test_cancel_aborts_inflight_call() {
        // A transport with no server attached: recv blocks forever.
        let (near, _far) = tokio::io::duplex(1024);
        let transport = Box::new(StreamTransport::new(near, "dead"));
        let (token, handle) = cancel_pair();

        let join = tokio::spawn(async move {
            ProxyClient::connect(transport, &token).await
        });
        tokio::task::yield_now().await;
        handle.cancel();
        let result = join.await.unwrap();
        assert!(matches!(result, Err(ProxyError::Cancelled)));
    }
}
