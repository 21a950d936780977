//! The logical unit record shared between the front end, the worker, and
//! the completion pipeline.
//!
//! Data-path state that crosses contexts lives here behind atomics; the
//! last-operation cache has its own lock, held only for the pointer swap.
//! The backend handle itself is *not* here — it is owned by the worker and
//! released only after the worker has exited.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use vblk_proxy::{CancelHandle, CancelToken};

use crate::completion::{Completion, ResultClass};
use crate::device::{BackendKind, DeviceNumber};
use crate::error::{EngineError, EngineResult};
use crate::worker::{IoOp, OpKind, WorkItem};

/// Byte offset of the disk signature field in a master boot record.
const MBR_SIGNATURE_OFFSET: usize = 440;
/// Byte offset of the boot record marker.
const MBR_MARKER_OFFSET: usize = 510;

/// Generate a disk signature that is guaranteed nonzero in every byte.
/// Cosmetic only: the value just has to look like a real signature.
pub(crate) fn generate_fake_signature() -> u32 {
    (rand::random::<u32>() | 0x8080_8081) & 0xFEFE_FEFF
}

/// The most recent transfer routed through the async pipeline: range plus
/// the exclusively owned data buffer, replaced whole on every update.
struct LastIo {
    start_sector: u64,
    length: u64,
    buffer: Vec<u8>,
}

/// Range of the most recent cached transfer, without the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastIoInfo {
    /// First logical block of the cached transfer.
    pub start_sector: u64,
    /// Length of the cached transfer in bytes.
    pub length: u64,
}

/// Per-unit operation counters.
#[derive(Debug, Default)]
pub(crate) struct LuStats {
    reads_completed: AtomicU64,
    writes_completed: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    errors: AtomicU64,
}

/// Snapshot of the per-unit operation counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LuStatsSnapshot {
    /// Read operations completed successfully.
    pub reads_completed: u64,
    /// Write operations completed successfully.
    pub writes_completed: u64,
    /// Total bytes read.
    pub bytes_read: u64,
    /// Total bytes written.
    pub bytes_written: u64,
    /// Operations that completed with a non-success class.
    pub errors: u64,
}

struct LuFlags {
    read_only: AtomicBool,
    removable: AtomicBool,
    modified: AtomicBool,
    supports_zero: AtomicBool,
    supports_unmap: AtomicBool,
    no_file_level_trim: AtomicBool,
}

/// One virtual disk instance: identity, geometry, capability flags, the
/// last-operation cache, the stop signal, and the request queue into its
/// worker.
pub struct LogicalUnit {
    device: DeviceNumber,
    kind: BackendKind,
    image_offset: u64,
    name: Option<String>,
    block_power: AtomicU32,
    disk_size: AtomicU64,
    fake_signature: AtomicU32,
    flags: LuFlags,
    last_io: Mutex<Option<LastIo>>,
    stats: LuStats,
    stop_token: CancelToken,
    stop_handle: CancelHandle,
    queue: mpsc::UnboundedSender<WorkItem>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LogicalUnit {
    pub(crate) fn new(
        device: DeviceNumber,
        kind: BackendKind,
        image_offset: u64,
        name: Option<String>,
        queue: mpsc::UnboundedSender<WorkItem>,
        stop_token: CancelToken,
        stop_handle: CancelHandle,
    ) -> Self {
        Self {
            device,
            kind,
            image_offset,
            name,
            block_power: AtomicU32::new(crate::device::DEFAULT_BLOCK_POWER),
            disk_size: AtomicU64::new(0),
            fake_signature: AtomicU32::new(0),
            flags: LuFlags {
                read_only: AtomicBool::new(false),
                removable: AtomicBool::new(false),
                modified: AtomicBool::new(false),
                supports_zero: AtomicBool::new(false),
                supports_unmap: AtomicBool::new(false),
                no_file_level_trim: AtomicBool::new(false),
            },
            last_io: Mutex::new(None),
            stats: LuStats::default(),
            stop_token,
            stop_handle,
            queue,
            worker: Mutex::new(None),
        }
    }

    /// Identity of this unit.
    pub fn device(&self) -> DeviceNumber {
        self.device
    }

    /// Backend kind serving this unit.
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Image path, proxy address, or None for blank units.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Byte offset applied before every backend access.
    pub fn image_offset(&self) -> u64 {
        self.image_offset
    }

    /// Block size in bytes (always a power of two).
    pub fn block_size(&self) -> u32 {
        1u32 << self.block_power.load(Ordering::Relaxed)
    }

    /// Block-size power of two.
    pub fn block_power(&self) -> u32 {
        self.block_power.load(Ordering::Relaxed)
    }

    /// Virtual disk size in bytes.
    pub fn disk_size(&self) -> u64 {
        self.disk_size.load(Ordering::SeqCst)
    }

    /// Whether mutating operations are refused.
    pub fn is_read_only(&self) -> bool {
        self.flags.read_only.load(Ordering::Relaxed)
    }

    /// Whether the unit reports as removable media.
    pub fn is_removable(&self) -> bool {
        self.flags.removable.load(Ordering::Relaxed)
    }

    /// Whether any write or zero has reached the unit since creation.
    pub fn is_modified(&self) -> bool {
        self.flags.modified.load(Ordering::SeqCst)
    }

    /// Whether all-zero writes are redirected to the Zero operation.
    pub fn supports_zero(&self) -> bool {
        self.flags.supports_zero.load(Ordering::SeqCst)
    }

    /// Whether Unmap is meaningful for this unit's backend.
    pub fn supports_unmap(&self) -> bool {
        self.flags.supports_unmap.load(Ordering::SeqCst)
    }

    /// Whether the batched reclamation hint has been permanently disabled.
    pub fn no_file_level_trim(&self) -> bool {
        self.flags.no_file_level_trim.load(Ordering::SeqCst)
    }

    /// Range of the most recent cached transfer, if any.
    pub fn last_io(&self) -> Option<LastIoInfo> {
        self.last_io.lock().as_ref().map(|io| LastIoInfo {
            start_sector: io.start_sector,
            length: io.length,
        })
    }

    /// Snapshot of this unit's operation counters.
    pub fn stats(&self) -> LuStatsSnapshot {
        LuStatsSnapshot {
            reads_completed: self.stats.reads_completed.load(Ordering::Relaxed),
            writes_completed: self.stats.writes_completed.load(Ordering::Relaxed),
            bytes_read: self.stats.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.stats.bytes_written.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
        }
    }

    /// Token observed by blocking backend calls.
    pub fn stop_token(&self) -> &CancelToken {
        &self.stop_token
    }

    /// Whether teardown has been signalled.
    pub fn is_stopping(&self) -> bool {
        self.stop_token.is_cancelled()
    }

    // ------------------------------------------------------------------
    // Data-path entry points
    // ------------------------------------------------------------------

    /// Read `sector_count` blocks starting at `start_sector`. The returned
    /// completion carries the data buffer.
    pub async fn read(&self, start_sector: u64, sector_count: u32) -> EngineResult<Completion> {
        self.submit(IoOp::Read {
            start_sector,
            sector_count,
        })
        .await
    }

    /// Write `data` (whole blocks) starting at `start_sector`.
    pub async fn write(&self, start_sector: u64, data: Vec<u8>) -> EngineResult<Completion> {
        self.submit(IoOp::Write { start_sector, data }).await
    }

    /// Zero `sector_count` blocks starting at `start_sector`.
    pub async fn zero(&self, start_sector: u64, sector_count: u32) -> EngineResult<Completion> {
        self.submit(IoOp::Zero {
            start_sector,
            sector_count,
        })
        .await
    }

    /// Unmap the ranges described by a big-endian parameter list, exactly as
    /// received from the host storage stack.
    pub async fn unmap(&self, parameter_list: Vec<u8>) -> EngineResult<Completion> {
        self.submit(IoOp::Unmap { parameter_list }).await
    }

    /// Grow (or shrink, negative delta rejected by policy) the unit by
    /// `delta_bytes`.
    pub async fn extend(&self, delta_bytes: i64) -> EngineResult<Completion> {
        self.submit(IoOp::Extend { delta_bytes }).await
    }

    /// Flush backend buffers to stable storage.
    pub async fn flush(&self) -> EngineResult<Completion> {
        self.submit(IoOp::Flush).await
    }

    /// Ask the unit's own worker to remove the unit from its registry and
    /// exit. Resource release is deferred to the reclamation task.
    pub async fn detach(&self) -> EngineResult<Completion> {
        self.submit(IoOp::Detach).await
    }

    async fn submit(&self, op: IoOp) -> EngineResult<Completion> {
        let (reply, rx) = oneshot::channel();
        self.queue
            .send(WorkItem { op, reply })
            .map_err(|_| EngineError::Cancelled)?;
        rx.await.map_err(|_| EngineError::Cancelled)
    }

    // ------------------------------------------------------------------
    // Lifecycle plumbing (registry and worker only)
    // ------------------------------------------------------------------

    pub(crate) fn set_geometry(&self, block_power: u32, disk_size: u64) {
        self.block_power.store(block_power, Ordering::SeqCst);
        self.disk_size.store(disk_size, Ordering::SeqCst);
    }

    pub(crate) fn set_disk_size(&self, disk_size: u64) {
        self.disk_size.store(disk_size, Ordering::SeqCst);
    }

    pub(crate) fn set_read_only(&self, value: bool) {
        self.flags.read_only.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_removable(&self, value: bool) {
        self.flags.removable.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_modified(&self) {
        self.flags.modified.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_supports_zero(&self, value: bool) {
        self.flags.supports_zero.store(value, Ordering::SeqCst);
    }

    /// One-way downgrade after the first failed zero redirect.
    pub(crate) fn clear_supports_zero(&self) {
        self.flags.supports_zero.store(false, Ordering::SeqCst);
    }

    pub(crate) fn set_supports_unmap(&self, value: bool) {
        self.flags.supports_unmap.store(value, Ordering::SeqCst);
    }

    /// One-way downgrade after the first refused reclamation hint.
    pub(crate) fn set_no_file_level_trim(&self) {
        self.flags.no_file_level_trim.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_fake_signature(&self, signature: u32) {
        self.fake_signature.store(signature, Ordering::SeqCst);
    }

    /// Patch an all-zero boot-record signature in a completed sector-0 read.
    pub(crate) fn apply_fake_signature(&self, start_sector: u64, buf: &mut [u8]) {
        let signature = self.fake_signature.load(Ordering::Relaxed);
        if signature == 0 || start_sector != 0 || buf.len() < MBR_MARKER_OFFSET + 2 {
            return;
        }
        if buf[MBR_MARKER_OFFSET] != 0x55 || buf[MBR_MARKER_OFFSET + 1] != 0xAA {
            return;
        }
        if buf[MBR_SIGNATURE_OFFSET..MBR_SIGNATURE_OFFSET + 4] != [0, 0, 0, 0] {
            return;
        }
        buf[MBR_SIGNATURE_OFFSET..MBR_SIGNATURE_OFFSET + 4]
            .copy_from_slice(&signature.to_le_bytes());
        debug!(device = %self.device, signature, "patched fake disk signature");
    }

    /// Replace the last-operation cache entry, releasing the previous
    /// buffer. Never mutates a cached buffer in place.
    pub(crate) fn store_last_io(&self, start_sector: u64, length: u64, buffer: Vec<u8>) {
        let mut slot = self.last_io.lock();
        *slot = Some(LastIo {
            start_sector,
            length,
            buffer,
        });
    }

    /// Drop the cached buffer, if any. Part of resource release.
    pub(crate) fn clear_last_io(&self) {
        let cleared = self.last_io.lock().take();
        if let Some(io) = cleared {
            debug!(
                device = %self.device,
                start_sector = io.start_sector,
                length = io.length,
                "released last-operation cache buffer"
            );
        }
    }

    pub(crate) fn signal_stop(&self) {
        self.stop_handle.cancel();
    }

    pub(crate) fn set_worker(&self, handle: JoinHandle<()>) {
        *self.worker.lock() = Some(handle);
    }

    pub(crate) fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker.lock().take()
    }

    pub(crate) fn record_op(&self, op: OpKind, class: ResultClass, bytes: u64) {
        if class != ResultClass::Success {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match op {
            OpKind::Read => {
                self.stats.reads_completed.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_read.fetch_add(bytes, Ordering::Relaxed);
            }
            OpKind::Write | OpKind::Zero => {
                self.stats.writes_completed.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_written.fetch_add(bytes, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

impl std::fmt::Debug for LogicalUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalUnit")
            .field("device", &self.device)
            .field("kind", &self.kind)
            .field("disk_size", &self.disk_size())
            .field("block_size", &self.block_size())
            .field("read_only", &self.is_read_only())
            .finish()
    }
}
