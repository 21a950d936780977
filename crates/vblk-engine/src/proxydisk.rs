//! Proxy-backed disk image.
//!
//! All operations are round-trips through the protocol client, executed
//! inline on the unit's worker and raced against the stop signal so a dead
//! remote cannot wedge teardown. Capabilities were negotiated once at
//! connection time and are never re-queried.

use std::sync::Arc;

use vblk_proxy::{ByteRange, CancelToken, ProxyCapabilities, ProxyClient, ProxyError};

use crate::error::{EngineError, EngineResult};

/// A disk image served by a remote proxy over an established connection.
#[derive(Clone)]
pub struct ProxyDisk {
    client: Arc<ProxyClient>,
    image_offset: u64,
}

impl ProxyDisk {
    /// Wrap a connected client.
    pub fn new(client: Arc<ProxyClient>, image_offset: u64) -> Self {
        Self {
            client,
            image_offset,
        }
    }

    /// Capabilities negotiated at connection time.
    pub fn capabilities(&self) -> &ProxyCapabilities {
        self.client.capabilities()
    }

    /// Read into `buf` at the logical byte `offset`. End-of-data from the
    /// remote — full or partial — leaves the unread tail zeroed and reports
    /// the full requested length, matching the end-of-backing-store
    /// semantics of the other backends.
    pub async fn read_at_owned(
        &self,
        cancel: &CancelToken,
        offset: u64,
        mut buf: Vec<u8>,
    ) -> (EngineResult<usize>, Vec<u8>) {
        let length = buf.len() as u64;
        match self
            .client
            .read(cancel, offset + self.image_offset, length)
            .await
        {
            Ok(data) => {
                let take = data.len().min(buf.len());
                buf[..take].copy_from_slice(&data[..take]);
                (Ok(buf.len()), buf)
            }
            Err(ProxyError::EndOfData) => (Ok(buf.len()), buf),
            Err(ProxyError::Cancelled) => (Err(EngineError::Cancelled), buf),
            Err(e) => (Err(e.into()), buf),
        }
    }

    /// Write `data` at the logical byte `offset`.
    pub async fn write_at(
        &self,
        cancel: &CancelToken,
        offset: u64,
        data: &[u8],
    ) -> EngineResult<usize> {
        match self
            .client
            .write(cancel, offset + self.image_offset, data)
            .await
        {
            Ok(n) => Ok(n as usize),
            Err(ProxyError::Cancelled) => Err(EngineError::Cancelled),
            Err(e) => Err(e.into()),
        }
    }

    /// Zero a byte range with a single Zero message.
    pub async fn zero_range(
        &self,
        cancel: &CancelToken,
        offset: u64,
        length: u64,
    ) -> EngineResult<()> {
        match self
            .client
            .zero(cancel, offset + self.image_offset, length)
            .await
        {
            Ok(()) => Ok(()),
            Err(ProxyError::Cancelled) => Err(EngineError::Cancelled),
            Err(e) => Err(e.into()),
        }
    }

    /// Unmap all ranges in one batched message.
    pub async fn unmap(&self, cancel: &CancelToken, ranges: &[(u64, u64)]) -> EngineResult<()> {
        let wire_ranges: Vec<ByteRange> = ranges
            .iter()
            .map(|&(offset, length)| ByteRange {
                offset: offset + self.image_offset,
                length,
            })
            .collect();
        match self.client.unmap(cancel, &wire_ranges).await {
            Ok(()) => Ok(()),
            Err(ProxyError::Cancelled) => Err(EngineError::Cancelled),
            Err(e) => Err(e.into()),
        }
    }

    /// Send the orderly Stop notice and close the connection. Called exactly
    /// once, from the worker's exit path.
    pub async fn stop(&self) {
        self.client.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vblk_proxy::{cancel_pair, LoopbackProxy, LoopbackProxyConfig, StreamTransport};

    async fn proxy_disk(cfg: LoopbackProxyConfig, image_offset: u64) -> ProxyDisk {
        let server = Arc::new(LoopbackProxy::new(cfg));
        let (near, far) = tokio::io::duplex(256 * 1024);
        tokio::spawn(async move { server.serve(far).await });
        let (token, _handle) = cancel_pair();
        let client = ProxyClient::connect(Box::new(StreamTransport::new(near, "test")), &token)
            .await
            .unwrap();
        ProxyDisk::new(Arc::new(client), image_offset)
    }

    #[tokio::test]
    async fn test_roundtrip_with_image_offset() {
        let disk = proxy_disk(
            LoopbackProxyConfig {
                size: 1 << 16,
                ..Default::default()
            },
            512,
        )
        .await;
        let (token, _handle) = cancel_pair();

        disk.write_at(&token, 0, &[1, 2, 3, 4]).await.unwrap();
        let (result, buf) = disk.read_at_owned(&token, 0, vec![0u8; 4]).await;
        assert_eq!(result.unwrap(), 4);
        assert_eq!(buf, vec![1, 2, 3, 4]);

        // The bytes landed past the image offset on the remote side.
        let (result, raw) = {
            let raw_disk = ProxyDisk::new(disk.client.clone(), 0);
            raw_disk.read_at_owned(&token, 512, vec![0u8; 4]).await
        };
        assert_eq!(result.unwrap(), 4);
        assert_eq!(raw, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_read_past_end_zero_fills_full_length() {
        let disk = proxy_disk(
            LoopbackProxyConfig {
                size: 4096,
                ..Default::default()
            },
            0,
        )
        .await;
        let (token, _handle) = cancel_pair();

        let (result, buf) = disk.read_at_owned(&token, 8192, vec![0u8; 512]).await;
        assert_eq!(result.unwrap(), 512);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_straddling_read_zero_fills_tail() {
        let disk = proxy_disk(
            LoopbackProxyConfig {
                size: 4096,
                ..Default::default()
            },
            0,
        )
        .await;
        let (token, _handle) = cancel_pair();

        disk.write_at(&token, 4096 - 256, &vec![0x99; 256])
            .await
            .unwrap();
        let (result, buf) = disk.read_at_owned(&token, 4096 - 256, vec![0u8; 1024]).await;
        assert_eq!(result.unwrap(), 1024);
        assert!(buf[..256].iter().all(|&b| b == 0x99));
        assert!(buf[256..].iter().all(|&b| b == 0));
    }
}
