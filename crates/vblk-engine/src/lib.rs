#![warn(missing_docs)]

//! vblk engine: virtual disk core — unit registry, backend dispatch, and the
//! asynchronous completion pipeline.
//!
//! A logical unit (LU) is one virtual disk with its own identity, geometry,
//! and exactly one backend handle: an in-process memory region, a local
//! image file (named or anonymous), or a remote proxy connection. Each unit
//! owns one sequential worker task that serializes its data path; across
//! units, operations run fully in parallel. Teardown is a two-phase
//! stop/wait/release protocol with a deferred-reclamation path for
//! worker-initiated removal.

pub mod backend;
pub mod completion;
pub mod device;
pub mod error;
pub mod filedisk;
pub mod lu;
pub mod memdisk;
pub mod proxydisk;
pub mod registry;
pub mod unmap;

mod worker;

pub use backend::Backend;
pub use completion::{classify, Completion, CompletionPath, ResultClass};
pub use device::{
    block_power_for, BackendKind, CreateParams, DeviceNumber, ProxyKind, DEFAULT_SECTOR_SIZE_CD,
    DEFAULT_SECTOR_SIZE_HDD,
};
pub use error::{EngineError, EngineResult};
pub use filedisk::FileDisk;
pub use lu::{LastIoInfo, LogicalUnit, LuStatsSnapshot};
pub use memdisk::MemDisk;
pub use proxydisk::ProxyDisk;
pub use registry::{Registry, RegistryStats};
pub use unmap::{encode_parameter_list, parse_parameter_list, UnmapDescriptor};
