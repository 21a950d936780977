//! File-backed disk image.
//!
//! Positioned reads and writes run on the blocking thread pool so the unit's
//! worker keeps draining its queue while a transfer is in flight; the
//! completion pipeline reconciles buffers and results when the transfer
//! finishes. Zeroing uses filesystem hole punching, and unmap adds a batched
//! page-cache reclamation hint that a filesystem may refuse once and for all.

use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::device::BackendKind;
use crate::error::{EngineError, EngineResult};

/// Byte range within the backing file, already adjusted for the image offset.
pub type FileRange = (u64, u64);

/// A disk image stored in a local file, or in an anonymous unlinked file for
/// the helper-backed kind.
#[derive(Clone)]
pub struct FileDisk {
    file: Arc<std::fs::File>,
    kind: BackendKind,
    image_offset: u64,
    label: String,
}

impl FileDisk {
    /// Open (or create) the image file at `path`.
    ///
    /// A missing file is created only when the caller asked for a writable
    /// file unit with an explicit nonzero size. Returns the disk together
    /// with the current physical file size.
    pub fn open(
        path: &str,
        image_offset: u64,
        read_only: bool,
        create_if_missing: bool,
    ) -> EngineResult<(Self, u64)> {
        let mut options = std::fs::OpenOptions::new();
        options.read(true).write(!read_only);
        let file = match options.open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && create_if_missing => {
                debug!(path, "image file not found, creating");
                std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(path)
                    .map_err(|e| EngineError::BackendUnavailable {
                        reason: format!("cannot create image file {path}: {e}"),
                    })?
            }
            Err(e) => {
                return Err(EngineError::BackendUnavailable {
                    reason: format!("cannot open image file {path}: {e}"),
                })
            }
        };
        let physical = file
            .metadata()
            .map_err(|e| EngineError::BackendUnavailable {
                reason: format!("cannot stat image file {path}: {e}"),
            })?
            .len();
        Ok((
            Self {
                file: Arc::new(file),
                kind: BackendKind::File,
                image_offset,
                label: path.to_string(),
            },
            physical,
        ))
    }

    /// Create an anonymous unlinked backing file of `size` bytes. The space
    /// is reclaimed by the filesystem as soon as the unit is torn down.
    pub fn anonymous(size: u64) -> EngineResult<Self> {
        let file = tempfile::tempfile().map_err(|e| EngineError::BackendUnavailable {
            reason: format!("cannot create anonymous backing file: {e}"),
        })?;
        file.set_len(size)?;
        Ok(Self {
            file: Arc::new(file),
            kind: BackendKind::AweAlloc,
            image_offset: 0,
            label: "<anonymous>".to_string(),
        })
    }

    /// Which backend kind this disk serves.
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Display label (path or `<anonymous>`).
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Image byte offset applied before every access.
    pub fn image_offset(&self) -> u64 {
        self.image_offset
    }

    /// Current physical size of the backing file.
    pub fn physical_size(&self) -> EngineResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Set the physical size of the backing file.
    pub fn set_physical_size(&self, size: u64) -> EngineResult<()> {
        self.file.set_len(size)?;
        Ok(())
    }

    /// Read into `buf` at the logical byte `offset`, returning the buffer
    /// and the number of bytes actually backed by the file. The unread tail
    /// is left zeroed, which is exactly the end-of-backing-store semantic
    /// the dispatch layer reports as a full-length success.
    pub async fn read_at_owned(
        &self,
        offset: u64,
        mut buf: Vec<u8>,
    ) -> (EngineResult<usize>, Vec<u8>) {
        let file = self.file.clone();
        let position = offset + self.image_offset;
        let result = tokio::task::spawn_blocking(move || {
            let mut filled = 0usize;
            while filled < buf.len() {
                match file.read_at(&mut buf[filled..], position + filled as u64) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return (Err(EngineError::Io(e)), buf),
                }
            }
            (Ok(filled), buf)
        })
        .await;
        flatten_join(result)
    }

    /// Write `data` at the logical byte `offset`, returning the buffer for
    /// ownership transfer into the last-operation cache.
    pub async fn write_at_owned(
        &self,
        offset: u64,
        data: Vec<u8>,
    ) -> (EngineResult<usize>, Vec<u8>) {
        let file = self.file.clone();
        let position = offset + self.image_offset;
        let result = tokio::task::spawn_blocking(move || {
            match file.write_all_at(&data, position) {
                Ok(()) => (Ok(data.len()), data),
                Err(e) => (Err(EngineError::Io(e)), data),
            }
        })
        .await;
        flatten_join(result)
    }

    /// Zero a byte range by punching a hole in the backing file.
    pub async fn zero_range(&self, offset: u64, length: u64) -> EngineResult<()> {
        let file = self.file.clone();
        let position = offset + self.image_offset;
        tokio::task::spawn_blocking(move || punch_hole(&file, position, length))
            .await
            .map_err(join_error)?
    }

    /// Issue one batched reclamation hint for already-zeroed ranges.
    /// Returns [`EngineError::Unsupported`] when the filesystem refuses, so
    /// the caller can disable the hint permanently for this unit.
    pub async fn trim_ranges(&self, ranges: Vec<FileRange>) -> EngineResult<()> {
        let file = self.file.clone();
        let image_offset = self.image_offset;
        tokio::task::spawn_blocking(move || {
            for (offset, length) in ranges {
                trim_hint(&file, offset + image_offset, length)?;
            }
            Ok(())
        })
        .await
        .map_err(join_error)?
    }

    /// Flush file data to stable storage.
    pub async fn flush(&self) -> EngineResult<()> {
        let file = self.file.clone();
        tokio::task::spawn_blocking(move || file.sync_data().map_err(EngineError::Io))
            .await
            .map_err(join_error)?
    }
}

fn join_error(e: tokio::task::JoinError) -> EngineError {
    EngineError::InsufficientResources {
        reason: format!("blocking I/O task failed: {e}"),
    }
}

fn flatten_join(
    result: Result<(EngineResult<usize>, Vec<u8>), tokio::task::JoinError>,
) -> (EngineResult<usize>, Vec<u8>) {
    match result {
        Ok(pair) => pair,
        Err(e) => (Err(join_error(e)), Vec::new()),
    }
}

#[cfg(target_os = "linux")]
fn punch_hole(file: &std::fs::File, offset: u64, length: u64) -> EngineResult<()> {
    let rc = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            offset as libc::off_t,
            length as libc::off_t,
        )
    };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EOPNOTSUPP) {
            return Err(EngineError::unsupported(
                "filesystem does not support sparse zeroing",
            ));
        }
        return Err(EngineError::Io(err));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn punch_hole(file: &std::fs::File, offset: u64, length: u64) -> EngineResult<()> {
    // No hole punching available: write literal zeros in bounded chunks.
    const CHUNK: usize = 64 * 1024;
    let zeros = [0u8; CHUNK];
    let mut written = 0u64;
    while written < length {
        let take = CHUNK.min((length - written) as usize);
        file.write_all_at(&zeros[..take], offset + written)
            .map_err(EngineError::Io)?;
        written += take as u64;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn trim_hint(file: &std::fs::File, offset: u64, length: u64) -> EngineResult<()> {
    let rc = unsafe {
        libc::posix_fadvise(
            file.as_raw_fd(),
            offset as libc::off_t,
            length as libc::off_t,
            libc::POSIX_FADV_DONTNEED,
        )
    };
    if rc != 0 {
        warn!(rc, "reclamation hint refused");
        return Err(EngineError::unsupported(
            "filesystem does not accept reclamation hints",
        ));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn trim_hint(_file: &std::fs::File, _offset: u64, _length: u64) -> EngineResult<()> {
    Err(EngineError::unsupported(
        "reclamation hints unavailable on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn test_create_if_missing_and_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "disk.img");
        let (disk, physical) = FileDisk::open(&path, 0, false, true).unwrap();
        assert_eq!(physical, 0);

        disk.set_physical_size(1 << 16).unwrap();
        let data = vec![0xBC; 4096];
        let (result, _) = disk.write_at_owned(8192, data.clone()).await;
        assert_eq!(result.unwrap(), 4096);

        let (result, buf) = disk.read_at_owned(8192, vec![0u8; 4096]).await;
        assert_eq!(result.unwrap(), 4096);
        assert_eq!(buf, data);
    }

    #[tokio::test]
    async fn test_missing_file_without_create_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "absent.img");
        let result = FileDisk::open(&path, 0, true, false);
        assert!(matches!(
            result,
            Err(EngineError::BackendUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_past_end_leaves_tail_zeroed() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "short.img");
        std::fs::write(&path, vec![0x42u8; 1024]).unwrap();

        let (disk, physical) = FileDisk::open(&path, 0, true, false).unwrap();
        assert_eq!(physical, 1024);

        let (result, buf) = disk.read_at_owned(0, vec![0u8; 4096]).await;
        assert_eq!(result.unwrap(), 1024);
        assert!(buf[..1024].iter().all(|&b| b == 0x42));
        assert!(buf[1024..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_image_offset_applies_to_every_access() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "offset.img");
        let mut content = vec![0u8; 8192];
        content[4096..4100].copy_from_slice(&[9, 8, 7, 6]);
        std::fs::write(&path, &content).unwrap();

        let (disk, _) = FileDisk::open(&path, 4096, true, false).unwrap();
        let (result, buf) = disk.read_at_owned(0, vec![0u8; 4]).await;
        assert_eq!(result.unwrap(), 4);
        assert_eq!(buf, vec![9, 8, 7, 6]);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_zero_range_punches_hole() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "zero.img");
        std::fs::write(&path, vec![0xFFu8; 8192]).unwrap();

        let (disk, _) = FileDisk::open(&path, 0, false, false).unwrap();
        disk.zero_range(1024, 1024).await.unwrap();

        let (result, buf) = disk.read_at_owned(0, vec![0u8; 8192]).await;
        assert_eq!(result.unwrap(), 8192);
        assert!(buf[..1024].iter().all(|&b| b == 0xFF));
        assert!(buf[1024..2048].iter().all(|&b| b == 0));
        assert!(buf[2048..].iter().all(|&b| b == 0xFF));
    }

    #[tokio::test]
    async fn test_anonymous_disk() {
        let disk = FileDisk::anonymous(1 << 16).unwrap();
        assert_eq!(disk.kind(), BackendKind::AweAlloc);
        assert_eq!(disk.physical_size().unwrap(), 1 << 16);

        let (result, _) = disk.write_at_owned(0, vec![0x31; 512]).await;
        assert_eq!(result.unwrap(), 512);
        let (result, buf) = disk.read_at_owned(0, vec![0u8; 512]).await;
        assert_eq!(result.unwrap(), 512);
        assert!(buf.iter().all(|&b| b == 0x31));
    }

    #[tokio::test]
    async fn test_flush() {
        let disk = FileDisk::anonymous(4096).unwrap();
        disk.flush().await.unwrap();
    }
}
