//! Unit registry and lifecycle: create, lookup, teardown, reclamation.
//!
//! The registry lock serializes membership changes only, never data-path
//! operations. Teardown is two-phase — signal stop, wait for the worker to
//! exit, release resources — with one twist: when teardown is invoked from
//! inside the unit's own worker, the wait-then-release half is deferred to a
//! process-wide reclamation task, because the calling stack is still running
//! inside the very context it would be waiting on.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use vblk_proxy::{cancel_pair, ProxyClient, ProxyTransport, TcpTransport};

use crate::backend::Backend;
use crate::device::{
    block_power_for, BackendKind, CreateParams, DeviceNumber, ProxyKind, MAX_ALIGNMENT,
};
use crate::error::{EngineError, EngineResult};
use crate::filedisk::FileDisk;
use crate::lu::{generate_fake_signature, LogicalUnit};
use crate::memdisk::MemDisk;
use crate::proxydisk::ProxyDisk;
use crate::worker::{self, LuWorker};

tokio::task_local! {
    /// Device number of the unit whose worker is running the current task.
    pub(crate) static CURRENT_DEVICE: DeviceNumber;
}

/// Snapshot of registry lifecycle counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    /// Units currently registered.
    pub units: usize,
    /// Units created since startup.
    pub created: u64,
    /// Units destroyed since startup.
    pub destroyed: u64,
    /// Deferred reclamations completed by the reaper.
    pub reclaimed: u64,
}

struct ReclaimRecord {
    lu: Arc<LogicalUnit>,
}

struct Inner {
    units: Mutex<BTreeMap<DeviceNumber, Arc<LogicalUnit>>>,
    reclaim_tx: mpsc::UnboundedSender<ReclaimRecord>,
    created: AtomicU64,
    destroyed: AtomicU64,
    reclaimed: Arc<AtomicU64>,
}

/// The registry of logical units. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    /// Create an empty registry and start its reclamation task. Must be
    /// called within a tokio runtime.
    pub fn new() -> Self {
        let (reclaim_tx, reclaim_rx) = mpsc::unbounded_channel();
        let reclaimed = Arc::new(AtomicU64::new(0));
        tokio::spawn(reaper(reclaim_rx, reclaimed.clone()));
        Self {
            inner: Arc::new(Inner {
                units: Mutex::new(BTreeMap::new()),
                reclaim_tx,
                created: AtomicU64::new(0),
                destroyed: AtomicU64::new(0),
                reclaimed,
            }),
        }
    }

    /// Look up a unit by device number.
    pub fn lookup(&self, device: DeviceNumber) -> Option<Arc<LogicalUnit>> {
        self.inner.units.lock().get(&device).cloned()
    }

    /// Device numbers of all registered units, in order.
    pub fn list(&self) -> Vec<DeviceNumber> {
        self.inner.units.lock().keys().copied().collect()
    }

    /// Number of registered units.
    pub fn len(&self) -> usize {
        self.inner.units.lock().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.units.lock().is_empty()
    }

    /// Lifecycle counter snapshot.
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            units: self.len(),
            created: self.inner.created.load(Ordering::Relaxed),
            destroyed: self.inner.destroyed.load(Ordering::Relaxed),
            reclaimed: self.inner.reclaimed.load(Ordering::Relaxed),
        }
    }

    /// Create a new unit: register it, initialize its backend, start its
    /// worker, and wait for the worker to report ready. Every failure after
    /// registration rolls back through [`Registry::destroy`], so a failed
    /// create never leaves a partially registered unit behind.
    pub async fn create(&self, params: CreateParams) -> EngineResult<Arc<LogicalUnit>> {
        let mut params = params.normalize()?;
        let device = params.device;
        let Some(kind) = params.kind else {
            return Err(EngineError::validation("backend kind unresolved"));
        };
        info!(%device, ?kind, "creating unit");

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (stop_token, stop_handle) = cancel_pair();
        let lu = Arc::new(LogicalUnit::new(
            device,
            kind,
            params.image_offset,
            params.file_name.clone(),
            queue_tx,
            stop_token,
            stop_handle,
        ));

        {
            // Membership changes only under the registry lock; the unit is
            // visible to lookups from here on, but serves no I/O until its
            // worker reports ready.
            let mut units = self.inner.units.lock();
            if units.contains_key(&device) {
                return Err(EngineError::Collision(device));
            }
            units.insert(device, lu.clone());
        }

        let (backend, preload) = match self.initialize(&lu, &mut params, kind).await {
            Ok(ready) => ready,
            Err(e) => {
                warn!(%device, error = %e, "backend initialization failed");
                self.destroy(device).await?;
                return Err(e);
            }
        };

        let (init_tx, init_rx) = oneshot::channel();
        let handle = tokio::spawn(worker::run(LuWorker {
            lu: lu.clone(),
            backend,
            preload,
            registry: self.clone(),
            queue: queue_rx,
            init_tx,
        }));
        lu.set_worker(handle);

        match init_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(%device, error = %e, "worker initialization failed");
                self.destroy(device).await?;
                return Err(e);
            }
            Err(_) => {
                self.destroy(device).await?;
                return Err(EngineError::InsufficientResources {
                    reason: "worker exited before reporting ready".to_string(),
                });
            }
        }

        self.inner.created.fetch_add(1, Ordering::Relaxed);
        info!(
            %device,
            ?kind,
            disk_size = lu.disk_size(),
            block_size = lu.block_size(),
            read_only = lu.is_read_only(),
            "unit created and ready"
        );
        Ok(lu)
    }

    /// Open/connect/allocate the backend and fill in unit geometry and
    /// capability flags. Runs before the worker starts.
    async fn initialize(
        &self,
        lu: &Arc<LogicalUnit>,
        params: &mut CreateParams,
        kind: BackendKind,
    ) -> EngineResult<(Backend, Option<std::fs::File>)> {
        let image_offset = params.image_offset;
        let mut sector_size = params.sector_size;
        let mut disk_size = params.disk_size;
        let mut read_only = params.read_only;
        let mut supports_zero = false;
        let mut supports_unmap = false;
        let mut preload = None;

        let backend = match kind {
            BackendKind::Memory => {
                if let Some(path) = &params.file_name {
                    let file =
                        std::fs::File::open(path).map_err(|e| EngineError::BackendUnavailable {
                            reason: format!("cannot open image file {path}: {e}"),
                        })?;
                    let physical = file.metadata()?.len();
                    if disk_size == 0 {
                        disk_size = physical.saturating_sub(image_offset);
                    }
                    preload = Some(file);
                }
                if disk_size == 0 {
                    return Err(EngineError::validation("disk size equals zero"));
                }
                Backend::Memory(MemDisk::allocate(disk_size)?)
            }
            BackendKind::AweAlloc => Backend::File(FileDisk::anonymous(disk_size)?),
            BackendKind::File => {
                let Some(path) = params.file_name.clone() else {
                    return Err(EngineError::validation("image file name required"));
                };
                let create_if_missing = disk_size > 0 && !read_only;
                let (disk, physical) =
                    FileDisk::open(&path, image_offset, read_only, create_if_missing)?;
                if params.sparse {
                    debug!(path = %path, "sparse backing requested");
                }
                if disk_size == 0 {
                    disk_size = physical.saturating_sub(image_offset);
                    if disk_size == 0 {
                        return Err(EngineError::validation("disk size equals zero"));
                    }
                } else if physical < disk_size + image_offset && !read_only {
                    // Grow the physical file to the requested geometry.
                    disk.set_physical_size(disk_size + image_offset)?;
                }
                supports_zero = true;
                supports_unmap = true;
                Backend::File(disk)
            }
            BackendKind::Proxy => {
                let transport: Box<dyn ProxyTransport> = match params.proxy_transport.take() {
                    Some(transport) => transport,
                    None => {
                        let Some(addr) = params.file_name.clone() else {
                            return Err(EngineError::validation("proxy address required"));
                        };
                        match params.proxy_kind {
                            ProxyKind::Tcp => Box::new(
                                TcpTransport::default().connect(&addr).await.map_err(|e| {
                                    EngineError::BackendUnavailable {
                                        reason: format!("cannot connect to proxy {addr}: {e}"),
                                    }
                                })?,
                            ),
                            other => {
                                return Err(EngineError::validation(format!(
                                    "{other:?} proxy requires a caller-established connection"
                                )))
                            }
                        }
                    }
                };
                let client =
                    ProxyClient::connect(transport, lu.stop_token())
                        .await
                        .map_err(|e| EngineError::BackendUnavailable {
                            reason: format!("proxy negotiation failed: {e}"),
                        })?;
                let caps = *client.capabilities();
                if caps.req_alignment > MAX_ALIGNMENT || !caps.req_alignment.is_power_of_two() {
                    return Err(EngineError::BackendUnavailable {
                        reason: format!("unsupported proxy alignment {}", caps.req_alignment),
                    });
                }
                if disk_size == 0 {
                    disk_size = caps.file_size.saturating_sub(image_offset);
                    if disk_size == 0 {
                        return Err(EngineError::validation("disk size equals zero"));
                    }
                }
                if caps.read_only {
                    read_only = true;
                }
                supports_zero = caps.supports_zero;
                supports_unmap = caps.supports_unmap;
                if caps.req_alignment > sector_size as u64 {
                    // A coarser backend alignment promotes the sector size.
                    sector_size = caps.req_alignment as u32;
                }
                Backend::Proxy(ProxyDisk::new(Arc::new(client), image_offset))
            }
        };

        lu.set_geometry(block_power_for(sector_size), disk_size);
        lu.set_read_only(read_only);
        lu.set_removable(params.removable);
        lu.set_supports_zero(supports_zero);
        lu.set_supports_unmap(supports_unmap);
        if params.fake_signature_if_zero && read_only {
            lu.set_fake_signature(generate_fake_signature());
        }
        Ok((backend, preload))
    }

    /// Tear a unit down. Idempotent: a device that is no longer registered
    /// is a no-op. When called from the unit's own worker, the wait-and-
    /// release half is handed to the reclamation task; otherwise it runs
    /// here synchronously.
    pub async fn destroy(&self, device: DeviceNumber) -> EngineResult<()> {
        let removed = { self.inner.units.lock().remove(&device) };
        let Some(lu) = removed else {
            debug!(%device, "destroy: device not registered");
            return Ok(());
        };
        self.inner.destroyed.fetch_add(1, Ordering::Relaxed);
        lu.signal_stop();

        let from_own_worker = CURRENT_DEVICE
            .try_with(|current| *current == device)
            .unwrap_or(false);
        if from_own_worker {
            // This stack is still executing inside the worker being torn
            // down; releasing here would pull the rug out from under it.
            debug!(%device, "teardown from own worker, deferring release");
            if self
                .inner
                .reclaim_tx
                .send(ReclaimRecord { lu })
                .is_err()
            {
                warn!(%device, "reclamation task gone, release leaks to drop");
            }
            return Ok(());
        }

        if let Some(handle) = lu.take_worker() {
            if let Err(e) = handle.await {
                warn!(%device, error = %e, "worker join failed");
            }
        }
        lu.clear_last_io();
        info!(%device, "unit destroyed");
        Ok(())
    }

    /// Grow a registered unit by `delta_bytes`, addressed by device number
    /// the way extend requests arrive from the front end.
    pub async fn extend(
        &self,
        device: DeviceNumber,
        delta_bytes: i64,
    ) -> EngineResult<crate::completion::Completion> {
        let lu = self
            .lookup(device)
            .ok_or(EngineError::NotFound(device))?;
        lu.extend(delta_bytes).await
    }

    /// Tear down every registered unit. Used for orderly shutdown.
    pub async fn remove_all(&self) -> EngineResult<()> {
        for device in self.list() {
            self.destroy(device).await?;
        }
        Ok(())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Long-lived reclamation task: waits for the terminating worker to fully
/// exit, then performs the release that the worker could not do itself.
async fn reaper(mut rx: mpsc::UnboundedReceiver<ReclaimRecord>, reclaimed: Arc<AtomicU64>) {
    while let Some(record) = rx.recv().await {
        let device = record.lu.device();
        if let Some(handle) = record.lu.take_worker() {
            if let Err(e) = handle.await {
                warn!(%device, error = %e, "worker join failed during reclamation");
            }
        }
        record.lu.clear_last_io();
        reclaimed.fetch_add(1, Ordering::SeqCst);
        debug!(%device, "deferred reclamation complete");
    }
    debug!("reclamation task drained");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_lookup_destroy() {
        let registry = Registry::new();
        let device = DeviceNumber::new(0, 0, 0);
        let lu = registry
            .create(CreateParams::memory(device, 1 << 20))
            .await
            .unwrap();
        assert_eq!(lu.disk_size(), 1 << 20);
        assert_eq!(lu.block_size(), 512);
        assert!(registry.lookup(device).is_some());
        assert_eq!(registry.len(), 1);

        registry.destroy(device).await.unwrap();
        assert!(registry.lookup(device).is_none());
        assert!(registry.is_empty());

        let stats = registry.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.destroyed, 1);
    }

    #[tokio::test]
    async fn test_duplicate_device_number_collides() {
        let registry = Registry::new();
        let device = DeviceNumber::new(1, 0, 0);
        registry
            .create(CreateParams::memory(device, 1 << 16))
            .await
            .unwrap();

        let result = registry.create(CreateParams::memory(device, 1 << 16)).await;
        assert!(matches!(result, Err(EngineError::Collision(d)) if d == device));
        // The losing create did not disturb the registry.
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(device).is_some());
    }

    #[tokio::test]
    async fn test_failed_create_leaves_no_partial_unit() {
        let registry = Registry::new();
        let device = DeviceNumber::new(2, 0, 0);
        // Missing image file, read-only, so create-if-missing is off.
        let params = CreateParams::file(device, "/nonexistent/vblk-test.img").with_read_only();
        let result = registry.create(params).await;
        assert!(matches!(
            result,
            Err(EngineError::BackendUnavailable { .. })
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_unknown_device_is_noop() {
        let registry = Registry::new();
        registry.destroy(DeviceNumber::new(9, 9, 9)).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_all() {
        let registry = Registry::new();
        for lun in 0..4 {
            registry
                .create(CreateParams::memory(DeviceNumber::new(0, 0, lun), 1 << 16))
                .await
                .unwrap();
        }
        assert_eq!(registry.len(), 4);
        registry.remove_all().await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_list_is_ordered() {
        let registry = Registry::new();
        for lun in [3u8, 1, 2, 0] {
            registry
                .create(CreateParams::memory(DeviceNumber::new(0, 0, lun), 1 << 16))
                .await
                .unwrap();
        }
        let listed = registry.list();
        let luns: Vec<u8> = listed.iter().map(|d| d.lun).collect();
        assert_eq!(luns, vec![0, 1, 2, 3]);
    }
}
