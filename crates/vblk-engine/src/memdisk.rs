//! Memory-backed disk region.
//!
//! The region is owned exclusively by the unit's worker; all access is
//! single-threaded, so operations here are plain synchronous copies. Extend
//! allocates a fresh region, copies the overlapping prefix, and swaps — the
//! old region is released by its owning container.

use std::io::Read;
use std::os::unix::fs::FileExt;

use crate::error::{EngineError, EngineResult};

/// An in-process memory region serving as a virtual disk image.
pub struct MemDisk {
    region: Vec<u8>,
}

impl MemDisk {
    /// Allocate a zero-filled region of `size` bytes.
    pub fn allocate(size: u64) -> EngineResult<Self> {
        let size = usize::try_from(size).map_err(|_| EngineError::InsufficientResources {
            reason: format!("memory region of {size} bytes exceeds address space"),
        })?;
        Ok(Self {
            region: vec![0u8; size],
        })
    }

    /// Current region size in bytes.
    pub fn size(&self) -> u64 {
        self.region.len() as u64
    }

    fn span(&self, offset: u64, len: usize) -> EngineResult<std::ops::Range<usize>> {
        let start = usize::try_from(offset)
            .map_err(|_| EngineError::validation("offset exceeds address space"))?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.region.len())
            .ok_or_else(|| {
                EngineError::validation(format!(
                    "range {offset}+{len} outside region of {} bytes",
                    self.region.len()
                ))
            })?;
        Ok(start..end)
    }

    /// Copy bytes out of the region into `buf`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> EngineResult<()> {
        let span = self.span(offset, buf.len())?;
        buf.copy_from_slice(&self.region[span]);
        Ok(())
    }

    /// Copy `data` into the region.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> EngineResult<()> {
        let span = self.span(offset, data.len())?;
        self.region[span].copy_from_slice(data);
        Ok(())
    }

    /// Clear a byte range in place.
    pub fn zero_range(&mut self, offset: u64, length: u64) -> EngineResult<()> {
        let len = usize::try_from(length)
            .map_err(|_| EngineError::validation("zero length exceeds address space"))?;
        let span = self.span(offset, len)?;
        self.region[span].fill(0);
        Ok(())
    }

    /// Grow or shrink to `new_size`: allocate a new region, copy the
    /// overlapping prefix, and swap. Requires exclusive access, which the
    /// single worker per unit guarantees.
    pub fn extend_to(&mut self, new_size: u64) -> EngineResult<()> {
        let new_len = usize::try_from(new_size).map_err(|_| EngineError::InsufficientResources {
            reason: format!("memory region of {new_size} bytes exceeds address space"),
        })?;
        let mut replacement = vec![0u8; new_len];
        let keep = self.region.len().min(new_len);
        replacement[..keep].copy_from_slice(&self.region[..keep]);
        self.region = replacement;
        Ok(())
    }

    /// Load the initial image content from `file`, starting at
    /// `image_offset` in the file. A short file leaves the tail zeroed.
    pub fn preload_from(&mut self, file: &std::fs::File, image_offset: u64) -> EngineResult<()> {
        let mut filled = 0usize;
        while filled < self.region.len() {
            match file.read_at(&mut self.region[filled..], image_offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Load the initial image content from any reader (used by tests).
    pub fn preload_from_reader<R: Read>(&mut self, reader: &mut R) -> EngineResult<()> {
        let mut filled = 0usize;
        while filled < self.region.len() {
            match reader.read(&mut self.region[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_roundtrip() {
        let mut disk = MemDisk::allocate(1 << 16).unwrap();
        let data = vec![0xAA; 512];
        disk.write_at(0, &data).unwrap();

        let mut out = vec![0u8; 512];
        disk.read_at(0, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_zero_range_clears_middle() {
        let mut disk = MemDisk::allocate(4096).unwrap();
        disk.write_at(0, &vec![0xFF; 4096]).unwrap();
        disk.zero_range(1024, 1024).unwrap();

        let mut out = vec![0u8; 4096];
        disk.read_at(0, &mut out).unwrap();
        assert!(out[..1024].iter().all(|&b| b == 0xFF));
        assert!(out[1024..2048].iter().all(|&b| b == 0));
        assert!(out[2048..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let disk = MemDisk::allocate(4096).unwrap();
        let mut buf = vec![0u8; 512];
        assert!(disk.read_at(4096 - 256, &mut buf).is_err());
        assert!(disk.read_at(u64::MAX, &mut buf).is_err());
    }

    #[test]
    fn test_extend_preserves_prefix() {
        let mut disk = MemDisk::allocate(1 << 20).unwrap();
        let pattern: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
        disk.write_at(0, &pattern).unwrap();

        disk.extend_to(2 << 20).unwrap();
        assert_eq!(disk.size(), 2 << 20);

        let mut head = vec![0u8; 4096];
        disk.read_at(0, &mut head).unwrap();
        assert_eq!(head, pattern);

        // The grown tail is readable and zeroed.
        let mut tail = vec![0xEEu8; 4096];
        disk.read_at((2 << 20) - 4096, &mut tail).unwrap();
        assert!(tail.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_extend_shrink_truncates() {
        let mut disk = MemDisk::allocate(8192).unwrap();
        disk.write_at(0, &vec![0x11; 8192]).unwrap();
        disk.extend_to(4096).unwrap();
        assert_eq!(disk.size(), 4096);

        let mut out = vec![0u8; 4096];
        disk.read_at(0, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0x11));
    }

    #[test]
    fn test_preload_short_source_leaves_tail_zeroed() {
        let mut disk = MemDisk::allocate(4096).unwrap();
        let mut source = std::io::Cursor::new(vec![0x77u8; 1000]);
        disk.preload_from_reader(&mut source).unwrap();

        let mut out = vec![0u8; 4096];
        disk.read_at(0, &mut out).unwrap();
        assert!(out[..1000].iter().all(|&b| b == 0x77));
        assert!(out[1000..].iter().all(|&b| b == 0));
    }
}
