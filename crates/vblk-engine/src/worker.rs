//! Per-unit worker: one sequential service task per logical unit.
//!
//! All data-path operations for one unit flow through its worker, so no two
//! operations run concurrently on the same unit. Memory and proxy transfers
//! complete inline on the worker context. File reads and writes are handed
//! to the async lower path with a private intermediate buffer and finish
//! through the completion pipeline on another context, letting the worker
//! move on to the next request while the transfer is in flight.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::completion::{self, Completion, ContextId, Transfer};
use crate::error::{EngineError, EngineResult};
use crate::lu::LogicalUnit;
use crate::memdisk::MemDisk;
use crate::registry::Registry;
use crate::unmap;

/// Operation kind, used by the completion pipeline and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Read,
    Write,
    Zero,
    Unmap,
    Extend,
    Flush,
    Detach,
}

/// One inbound request with its owned buffers.
pub(crate) enum IoOp {
    Read {
        start_sector: u64,
        sector_count: u32,
    },
    Write {
        start_sector: u64,
        data: Vec<u8>,
    },
    Zero {
        start_sector: u64,
        sector_count: u32,
    },
    Unmap {
        parameter_list: Vec<u8>,
    },
    Extend {
        delta_bytes: i64,
    },
    Flush,
    Detach,
}

/// A queued request: operation plus the completion channel back to the
/// front end. Created by the dispatch entry point, destroyed by whichever
/// completion path runs last.
pub(crate) struct WorkItem {
    pub op: IoOp,
    pub reply: oneshot::Sender<Completion>,
}

/// Everything a worker owns: the backend handle, its queue, and the
/// registry it reports teardown to.
pub(crate) struct LuWorker {
    pub lu: Arc<LogicalUnit>,
    pub backend: Backend,
    pub preload: Option<std::fs::File>,
    pub registry: Registry,
    pub queue: mpsc::UnboundedReceiver<WorkItem>,
    pub init_tx: oneshot::Sender<EngineResult<()>>,
}

enum Flow {
    Continue,
    Stop,
}

/// Worker entry point. Runs with the unit's device number as the current
/// task-local marker so teardown can tell "called from my own worker" apart
/// from an external caller.
pub(crate) async fn run(worker: LuWorker) {
    let device = worker.lu.device();
    crate::registry::CURRENT_DEVICE
        .scope(device, service_loop(worker))
        .await;
}

async fn service_loop(worker: LuWorker) {
    let LuWorker {
        lu,
        mut backend,
        preload,
        registry,
        mut queue,
        init_tx,
    } = worker;
    let ctx = ContextId::next();

    let init = initialize(&lu, &mut backend, preload).await;
    let failed = init.is_err();
    let _ = init_tx.send(init);
    if failed {
        return;
    }
    debug!(device = %lu.device(), "worker ready");

    loop {
        tokio::select! {
            biased;
            _ = lu.stop_token().cancelled() => {
                debug!(device = %lu.device(), "stop signalled");
                break;
            }
            item = queue.recv() => {
                let Some(item) = item else { break };
                match handle(&lu, &mut backend, &registry, ctx, item).await {
                    Flow::Continue => {}
                    Flow::Stop => break,
                }
            }
        }
    }

    if let Backend::Proxy(disk) = &backend {
        disk.stop().await;
    }
    debug!(device = %lu.device(), "worker exited");
}

/// Backend finalization that must run in the worker context before the
/// service loop: loading the initial image into a memory region.
async fn initialize(
    lu: &LogicalUnit,
    backend: &mut Backend,
    preload: Option<std::fs::File>,
) -> EngineResult<()> {
    if let (Backend::Memory(disk), Some(file)) = (&mut *backend, preload) {
        debug!(device = %lu.device(), "loading image into memory region");
        let owned = std::mem::replace(disk, MemDisk::allocate(0)?);
        let image_offset = lu.image_offset();
        let (result, owned) = tokio::task::spawn_blocking(move || {
            let mut owned = owned;
            let result = owned.preload_from(&file, image_offset);
            (result, owned)
        })
        .await
        .map_err(|e| EngineError::InsufficientResources {
            reason: format!("image preload task failed: {e}"),
        })?;
        *disk = owned;
        result?;
        // The image file closes here; the memory region is the disk now.
    }
    Ok(())
}

async fn handle(
    lu: &Arc<LogicalUnit>,
    backend: &mut Backend,
    registry: &Registry,
    ctx: ContextId,
    item: WorkItem,
) -> Flow {
    let WorkItem { op, reply } = item;
    match op {
        IoOp::Read {
            start_sector,
            sector_count,
        } => do_read(lu, backend, ctx, start_sector, sector_count, reply).await,
        IoOp::Write { start_sector, data } => {
            do_write(lu, backend, ctx, start_sector, data, reply).await
        }
        IoOp::Zero {
            start_sector,
            sector_count,
        } => do_zero(lu, backend, ctx, start_sector, sector_count, reply).await,
        IoOp::Unmap { parameter_list } => {
            do_unmap(lu, backend, ctx, parameter_list, reply).await
        }
        IoOp::Extend { delta_bytes } => do_extend(lu, backend, ctx, delta_bytes, reply).await,
        IoOp::Flush => {
            let result = match backend {
                Backend::File(disk) => disk.flush().await.map(|_| 0),
                _ => Ok(0),
            };
            inline(lu, ctx, OpKind::Flush, 0, 0, None, result, reply);
            Flow::Continue
        }
        IoOp::Detach => {
            debug!(device = %lu.device(), "worker-initiated teardown");
            let result = registry.destroy(lu.device()).await.map(|_| 0);
            inline(lu, ctx, OpKind::Detach, 0, 0, None, result, reply);
            Flow::Stop
        }
    }
}

async fn do_read(
    lu: &Arc<LogicalUnit>,
    backend: &mut Backend,
    ctx: ContextId,
    start_sector: u64,
    sector_count: u32,
    reply: oneshot::Sender<Completion>,
) -> Flow {
    let len = (sector_count as u64) << lu.block_power();
    let offset = match check_range(lu, start_sector, len) {
        Ok(offset) => offset,
        Err(e) => {
            inline(lu, ctx, OpKind::Read, start_sector, len, None, Err(e), reply);
            return Flow::Continue;
        }
    };
    let caller = vec![0u8; len as usize];
    match backend {
        Backend::Memory(disk) => {
            let mut caller = caller;
            let result = disk.read_at(offset, &mut caller).map(|_| len);
            inline(
                lu,
                ctx,
                OpKind::Read,
                start_sector,
                len,
                Some(caller),
                result,
                reply,
            );
            Flow::Continue
        }
        Backend::Proxy(disk) => {
            // Inline round-trip; the worker waits here, racing the stop
            // signal inside the client.
            let (result, caller) = disk.read_at_owned(lu.stop_token(), offset, caller).await;
            inline(
                lu,
                ctx,
                OpKind::Read,
                start_sector,
                len,
                Some(caller),
                result.map(|n| n as u64),
                reply,
            );
            Flow::Continue
        }
        Backend::File(disk) => {
            // Async lower path: transfer into a private intermediate buffer
            // on another context, then reconcile through the pipeline while
            // this worker keeps draining its queue.
            let disk = disk.clone();
            let lu = lu.clone();
            let intermediate = vec![0u8; len as usize];
            tokio::spawn(async move {
                let completing = ContextId::next();
                let (result, intermediate) = disk.read_at_owned(offset, intermediate).await;
                // A short transfer means end of backing store: the zeroed
                // tail stands in for the missing bytes and the full
                // requested length is reported.
                completion::finish(
                    &lu,
                    completing,
                    Transfer {
                        op: OpKind::Read,
                        start_sector,
                        transfer_len: len,
                        caller_buf: Some(caller),
                        intermediate: Some(intermediate),
                        copy_back: true,
                        origin: ctx,
                        reply,
                    },
                    result.map(|_| len),
                );
            });
            Flow::Continue
        }
    }
}

async fn do_write(
    lu: &Arc<LogicalUnit>,
    backend: &mut Backend,
    ctx: ContextId,
    start_sector: u64,
    data: Vec<u8>,
    reply: oneshot::Sender<Completion>,
) -> Flow {
    let len = data.len() as u64;
    if lu.is_read_only() {
        let err = EngineError::validation("unit is read-only");
        inline(lu, ctx, OpKind::Write, start_sector, len, None, Err(err), reply);
        return Flow::Continue;
    }
    let offset = match check_range(lu, start_sector, len) {
        Ok(offset) => offset,
        Err(e) => {
            inline(lu, ctx, OpKind::Write, start_sector, len, None, Err(e), reply);
            return Flow::Continue;
        }
    };
    lu.set_modified();

    // All-zero payloads take the Zero path while the optimization holds.
    // The first failure disables it for the lifetime of the unit and this
    // write (and all future ones) falls through to the literal path.
    if lu.supports_zero() && buffer_is_zero(&data) {
        let result = zero_backend(lu, backend, offset, len).await;
        match result {
            Ok(()) => {
                debug!(device = %lu.device(), offset, len, "write redirected to zero");
                inline(
                    lu,
                    ctx,
                    OpKind::Write,
                    start_sector,
                    len,
                    None,
                    Ok(len),
                    reply,
                );
                return Flow::Continue;
            }
            Err(e) => {
                warn!(
                    device = %lu.device(),
                    error = %e,
                    "zero-write optimization disabled for this unit"
                );
                lu.clear_supports_zero();
            }
        }
    }

    match backend {
        Backend::Memory(disk) => {
            let result = disk.write_at(offset, &data).map(|_| len);
            inline(lu, ctx, OpKind::Write, start_sector, len, None, result, reply);
            Flow::Continue
        }
        Backend::Proxy(disk) => {
            let result = disk
                .write_at(lu.stop_token(), offset, &data)
                .await
                .map(|n| n as u64);
            inline(lu, ctx, OpKind::Write, start_sector, len, None, result, reply);
            Flow::Continue
        }
        Backend::File(disk) => {
            // The request buffer becomes the private transfer buffer; once
            // handed to the async path it is owned by the completion
            // pipeline, which caches or drops it.
            let disk = disk.clone();
            let lu = lu.clone();
            tokio::spawn(async move {
                let completing = ContextId::next();
                let (result, buffer) = disk.write_at_owned(offset, data).await;
                completion::finish(
                    &lu,
                    completing,
                    Transfer {
                        op: OpKind::Write,
                        start_sector,
                        transfer_len: len,
                        caller_buf: None,
                        intermediate: Some(buffer),
                        copy_back: false,
                        origin: ctx,
                        reply,
                    },
                    result.map(|n| n as u64),
                );
            });
            Flow::Continue
        }
    }
}

async fn do_zero(
    lu: &Arc<LogicalUnit>,
    backend: &mut Backend,
    ctx: ContextId,
    start_sector: u64,
    sector_count: u32,
    reply: oneshot::Sender<Completion>,
) -> Flow {
    let len = (sector_count as u64) << lu.block_power();
    if lu.is_read_only() {
        let err = EngineError::validation("unit is read-only");
        inline(lu, ctx, OpKind::Zero, start_sector, len, None, Err(err), reply);
        return Flow::Continue;
    }
    let offset = match check_range(lu, start_sector, len) {
        Ok(offset) => offset,
        Err(e) => {
            inline(lu, ctx, OpKind::Zero, start_sector, len, None, Err(e), reply);
            return Flow::Continue;
        }
    };
    lu.set_modified();
    let result = zero_backend(lu, backend, offset, len).await.map(|_| len);
    inline(lu, ctx, OpKind::Zero, start_sector, len, None, result, reply);
    Flow::Continue
}

async fn zero_backend(
    lu: &LogicalUnit,
    backend: &mut Backend,
    offset: u64,
    len: u64,
) -> EngineResult<()> {
    match backend {
        Backend::Memory(disk) => disk.zero_range(offset, len),
        Backend::File(disk) => disk.zero_range(offset, len).await,
        Backend::Proxy(disk) => disk.zero_range(lu.stop_token(), offset, len).await,
    }
}

async fn do_unmap(
    lu: &Arc<LogicalUnit>,
    backend: &mut Backend,
    ctx: ContextId,
    parameter_list: Vec<u8>,
    reply: oneshot::Sender<Completion>,
) -> Flow {
    if !lu.supports_unmap() {
        let err = EngineError::unsupported(format!(
            "unmap not supported by {:?} backend",
            backend.kind()
        ));
        inline(lu, ctx, OpKind::Unmap, 0, 0, None, Err(err), reply);
        return Flow::Continue;
    }
    if lu.is_read_only() {
        let err = EngineError::validation("unit is read-only");
        inline(lu, ctx, OpKind::Unmap, 0, 0, None, Err(err), reply);
        return Flow::Continue;
    }
    let descriptors = match unmap::parse_parameter_list(&parameter_list) {
        Ok(descriptors) => descriptors,
        Err(e) => {
            inline(lu, ctx, OpKind::Unmap, 0, 0, None, Err(e), reply);
            return Flow::Continue;
        }
    };
    let block_power = lu.block_power();
    let ranges: Vec<(u64, u64)> = descriptors
        .iter()
        .map(|d| {
            (
                d.start_lba << block_power,
                (d.block_count as u64) << block_power,
            )
        })
        .collect();

    let result = match backend {
        Backend::Proxy(disk) => disk.unmap(lu.stop_token(), &ranges).await,
        Backend::File(disk) => {
            let mut result = Ok(());
            for &(offset, length) in &ranges {
                if let Err(e) = disk.zero_range(offset, length).await {
                    result = Err(e);
                    break;
                }
            }
            // One batched reclamation hint after the per-range zeroing; a
            // refusal disables the hint for this unit permanently, while
            // the sparse zeroing above keeps happening on later calls.
            if result.is_ok() && !lu.no_file_level_trim() {
                if let Err(e) = disk.trim_ranges(ranges.clone()).await {
                    warn!(
                        device = %lu.device(),
                        error = %e,
                        "file-level reclamation hint disabled for this unit"
                    );
                    lu.set_no_file_level_trim();
                }
            }
            result
        }
        Backend::Memory(_) => Err(EngineError::unsupported(
            "unmap not supported by memory backend",
        )),
    };
    inline(lu, ctx, OpKind::Unmap, 0, 0, None, result.map(|_| 0), reply);
    Flow::Continue
}

async fn do_extend(
    lu: &Arc<LogicalUnit>,
    backend: &mut Backend,
    ctx: ContextId,
    delta_bytes: i64,
    reply: oneshot::Sender<Completion>,
) -> Flow {
    let old_size = lu.disk_size();
    let new_size = old_size as i128 + delta_bytes as i128;
    if new_size <= 0 {
        let err = EngineError::validation(format!(
            "extend by {delta_bytes} from {old_size} leaves no device"
        ));
        inline(lu, ctx, OpKind::Extend, 0, 0, None, Err(err), reply);
        return Flow::Continue;
    }
    let new_size = new_size as u64;

    let result = match backend {
        Backend::Memory(disk) => disk.extend_to(new_size),
        // Proxy units trust the caller; the new size is just accepted.
        Backend::Proxy(_) => Ok(()),
        Backend::File(disk) => {
            if lu.image_offset() != 0 {
                // Growing could invalidate the skipped header region.
                Err(EngineError::validation(
                    "cannot extend an image with a nonzero offset",
                ))
            } else {
                match disk.physical_size() {
                    Ok(physical) if physical >= new_size => Ok(()),
                    Ok(_) => disk.set_physical_size(new_size),
                    Err(e) => Err(e),
                }
            }
        }
    };
    let result = result.map(|_| {
        lu.set_disk_size(new_size);
        debug!(device = %lu.device(), old_size, new_size, "unit extended");
        0
    });
    inline(lu, ctx, OpKind::Extend, 0, 0, None, result, reply);
    Flow::Continue
}

/// Finish an operation on the issuing context.
#[allow(clippy::too_many_arguments)]
fn inline(
    lu: &Arc<LogicalUnit>,
    ctx: ContextId,
    op: OpKind,
    start_sector: u64,
    transfer_len: u64,
    caller_buf: Option<Vec<u8>>,
    result: EngineResult<u64>,
    reply: oneshot::Sender<Completion>,
) {
    completion::finish(
        lu,
        ctx,
        Transfer {
            op,
            start_sector,
            transfer_len,
            caller_buf,
            intermediate: None,
            copy_back: false,
            origin: ctx,
            reply,
        },
        result,
    );
}

/// Bounds-check a transfer against the unit geometry; returns the logical
/// byte offset.
fn check_range(lu: &LogicalUnit, start_sector: u64, byte_len: u64) -> EngineResult<u64> {
    let block_power = lu.block_power();
    if start_sector > (u64::MAX >> block_power) {
        return Err(EngineError::validation("start sector out of range"));
    }
    let offset = start_sector << block_power;
    let end = offset
        .checked_add(byte_len)
        .ok_or_else(|| EngineError::validation("transfer length out of range"))?;
    if end > lu.disk_size() {
        return Err(EngineError::validation(format!(
            "transfer {offset}+{byte_len} outside device of {} bytes",
            lu.disk_size()
        )));
    }
    Ok(offset)
}

fn buffer_is_zero(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0)
}
