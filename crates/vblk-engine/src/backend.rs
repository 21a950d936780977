//! Backend abstraction: the single storage handle behind a unit.
//!
//! Exactly one variant is populated per unit for its whole lifetime. The
//! handle is owned by the unit's worker, so variant-specific policy runs
//! without any data-path lock; the worker releases it only on exit.

use crate::device::BackendKind;
use crate::filedisk::FileDisk;
use crate::memdisk::MemDisk;
use crate::proxydisk::ProxyDisk;

/// The storage implementation behind one logical unit.
pub enum Backend {
    /// In-process memory region.
    Memory(MemDisk),
    /// Local image file (named or anonymous).
    File(FileDisk),
    /// Remote proxy connection.
    Proxy(ProxyDisk),
}

impl Backend {
    /// Which backend kind this handle serves.
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Memory(_) => BackendKind::Memory,
            Backend::File(disk) => disk.kind(),
            Backend::Proxy(_) => BackendKind::Proxy,
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Memory(disk) => write!(f, "Backend::Memory({} bytes)", disk.size()),
            Backend::File(disk) => write!(f, "Backend::File({})", disk.label()),
            Backend::Proxy(_) => write!(f, "Backend::Proxy"),
        }
    }
}
