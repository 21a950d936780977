//! Device identity and creation parameters.
//!
//! This module defines the opaque device-number tuple that identifies a
//! logical unit, the backend/proxy kind enums, and the inbound creation
//! request with its normalization rules (type auto-selection, optical-image
//! detection, default geometry).

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Default sector size for hard-disk style units.
pub const DEFAULT_SECTOR_SIZE_HDD: u32 = 512;
/// Default sector size for optical-image units.
pub const DEFAULT_SECTOR_SIZE_CD: u32 = 2048;
/// Default block-size power of two when none can be derived (512 bytes).
pub const DEFAULT_BLOCK_POWER: u32 = 9;
/// Largest backend alignment requirement the engine accepts.
pub const MAX_ALIGNMENT: u64 = 4096;

/// Identity of one logical unit: an opaque (path, target, lun) tuple.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct DeviceNumber {
    /// Bus path identifier.
    pub path_id: u8,
    /// Target identifier on the path.
    pub target_id: u8,
    /// Logical unit number on the target.
    pub lun: u8,
}

impl DeviceNumber {
    /// Create a device number from its components.
    pub fn new(path_id: u8, target_id: u8, lun: u8) -> Self {
        Self {
            path_id,
            target_id,
            lun,
        }
    }

    /// Pack into a single comparable integer.
    pub fn as_long(&self) -> u32 {
        (self.path_id as u32) << 16 | (self.target_id as u32) << 8 | self.lun as u32
    }

    /// Unpack from the integer form produced by [`DeviceNumber::as_long`].
    pub fn from_long(long: u32) -> Self {
        Self {
            path_id: (long >> 16) as u8,
            target_id: (long >> 8) as u8,
            lun: long as u8,
        }
    }
}

impl std::fmt::Display for DeviceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.path_id, self.target_id, self.lun)
    }
}

/// The concrete storage implementation behind a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    /// In-process memory region.
    Memory,
    /// Image file on a local filesystem.
    File,
    /// Anonymous helper-backed file (no pathname, reclaimed on close).
    AweAlloc,
    /// Remote storage provider reached over a connection.
    Proxy,
}

/// Transport family used to reach a proxy backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyKind {
    /// TCP socket; the creation request's name field carries the address.
    Tcp,
    /// Named pipe or similar duplex byte stream.
    Pipe,
    /// Shared memory channel.
    SharedMemory,
    /// Caller-established connection handed over directly.
    Direct,
}

/// Inbound creation request for a new logical unit.
///
/// `proxy_transport` carries a pre-established connection for proxy kinds
/// whose setup lives outside the engine (pipe, shared memory, direct). For
/// [`ProxyKind::Tcp`] without a supplied transport the engine dials
/// `file_name` as a socket address.
pub struct CreateParams {
    /// Identity for the new unit.
    pub device: DeviceNumber,
    /// Backend type; `None` selects Memory or File based on `file_name`.
    pub kind: Option<BackendKind>,
    /// Virtual disk size in bytes; 0 derives the size from the backing.
    pub disk_size: u64,
    /// Byte offset applied before every backend access (skipped header).
    pub image_offset: u64,
    /// Sector size in bytes; 0 selects a default for the unit type.
    pub sector_size: u32,
    /// Refuse all mutating operations.
    pub read_only: bool,
    /// Report the unit as removable media.
    pub removable: bool,
    /// Request sparse backing where the backend supports it.
    pub sparse: bool,
    /// Patch an all-zero disk signature on read-only units with a generated
    /// nonzero value.
    pub fake_signature_if_zero: bool,
    /// Transport family for proxy units.
    pub proxy_kind: ProxyKind,
    /// Image path, proxy address, or None.
    pub file_name: Option<String>,
    /// Pre-established proxy connection, when the caller owns setup.
    pub proxy_transport: Option<Box<dyn vblk_proxy::ProxyTransport>>,
}

impl std::fmt::Debug for CreateParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreateParams")
            .field("device", &self.device)
            .field("kind", &self.kind)
            .field("disk_size", &self.disk_size)
            .field("image_offset", &self.image_offset)
            .field("sector_size", &self.sector_size)
            .field("read_only", &self.read_only)
            .field("removable", &self.removable)
            .field("sparse", &self.sparse)
            .field("fake_signature_if_zero", &self.fake_signature_if_zero)
            .field("proxy_kind", &self.proxy_kind)
            .field("file_name", &self.file_name)
            .field("proxy_transport", &self.proxy_transport.is_some())
            .finish()
    }
}

impl CreateParams {
    fn base(device: DeviceNumber) -> Self {
        Self {
            device,
            kind: None,
            disk_size: 0,
            image_offset: 0,
            sector_size: 0,
            read_only: false,
            removable: false,
            sparse: false,
            fake_signature_if_zero: false,
            proxy_kind: ProxyKind::Tcp,
            file_name: None,
            proxy_transport: None,
        }
    }

    /// Parameters for a memory-backed unit of `disk_size` bytes.
    pub fn memory(device: DeviceNumber, disk_size: u64) -> Self {
        Self {
            kind: Some(BackendKind::Memory),
            disk_size,
            ..Self::base(device)
        }
    }

    /// Parameters for a file-backed unit over `path`.
    pub fn file(device: DeviceNumber, path: impl Into<String>) -> Self {
        Self {
            kind: Some(BackendKind::File),
            file_name: Some(path.into()),
            ..Self::base(device)
        }
    }

    /// Parameters for an anonymous helper-file unit of `disk_size` bytes.
    pub fn awe_alloc(device: DeviceNumber, disk_size: u64) -> Self {
        Self {
            kind: Some(BackendKind::AweAlloc),
            disk_size,
            ..Self::base(device)
        }
    }

    /// Parameters for a proxy unit dialing `addr` over TCP.
    pub fn proxy_tcp(device: DeviceNumber, addr: impl Into<String>) -> Self {
        Self {
            kind: Some(BackendKind::Proxy),
            proxy_kind: ProxyKind::Tcp,
            file_name: Some(addr.into()),
            ..Self::base(device)
        }
    }

    /// Parameters for a proxy unit over a caller-established connection.
    pub fn proxy_direct(
        device: DeviceNumber,
        transport: Box<dyn vblk_proxy::ProxyTransport>,
    ) -> Self {
        Self {
            kind: Some(BackendKind::Proxy),
            proxy_kind: ProxyKind::Direct,
            proxy_transport: Some(transport),
            ..Self::base(device)
        }
    }

    /// Set the virtual disk size.
    pub fn with_disk_size(mut self, disk_size: u64) -> Self {
        self.disk_size = disk_size;
        self
    }

    /// Set the image byte offset.
    pub fn with_image_offset(mut self, image_offset: u64) -> Self {
        self.image_offset = image_offset;
        self
    }

    /// Set the sector size.
    pub fn with_sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size = sector_size;
        self
    }

    /// Mark the unit read-only.
    pub fn with_read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Mark the unit as removable media.
    pub fn with_removable(mut self) -> Self {
        self.removable = true;
        self
    }

    /// Request sparse backing.
    pub fn with_sparse(mut self) -> Self {
        self.sparse = true;
        self
    }

    /// Enable fake-signature patching for read-only units.
    pub fn with_fake_signature(mut self) -> Self {
        self.fake_signature_if_zero = true;
        self
    }

    /// Apply type auto-selection, optical-image detection, and default
    /// geometry; reject parameter combinations that can never produce a
    /// usable unit.
    pub fn normalize(mut self) -> EngineResult<Self> {
        if let Some(name) = &self.file_name {
            if name.is_empty() {
                self.file_name = None;
            }
        }

        // Auto-select type if not specified: a name means a file image, no
        // name means a blank memory disk.
        let kind = match self.kind {
            Some(kind) => kind,
            None => {
                if self.file_name.is_some() {
                    BackendKind::File
                } else {
                    BackendKind::Memory
                }
            }
        };
        self.kind = Some(kind);

        // Optical images are read-only removable media with 2 KiB sectors.
        let mut is_optical = false;
        if kind == BackendKind::File {
            if let Some(name) = &self.file_name {
                let lower = name.to_ascii_lowercase();
                if lower.ends_with(".iso") || lower.ends_with(".bin") || lower.ends_with(".nrg") {
                    is_optical = true;
                    self.read_only = true;
                    self.removable = true;
                }
            }
        }

        if self.file_name.is_none() {
            let sizeable_blank = matches!(kind, BackendKind::Memory | BackendKind::AweAlloc)
                && self.disk_size > 0;
            let supplied_connection =
                kind == BackendKind::Proxy && self.proxy_transport.is_some();
            if !sizeable_blank && !supplied_connection {
                return Err(EngineError::validation(
                    "blank names are only supported for non-zero size memory units",
                ));
            }
        }

        if kind == BackendKind::Proxy
            && self.proxy_kind == ProxyKind::Tcp
            && self.proxy_transport.is_none()
            && self.file_name.is_none()
        {
            return Err(EngineError::validation("proxy address required"));
        }

        if self.sector_size == 0 {
            self.sector_size = if is_optical {
                DEFAULT_SECTOR_SIZE_CD
            } else {
                DEFAULT_SECTOR_SIZE_HDD
            };
        }

        Ok(self)
    }
}

/// Compute the block-size power of two for a sector size, flooring
/// non-power-of-two values and falling back to the 512-byte default.
pub fn block_power_for(sector_size: u32) -> u32 {
    let mut power = 0u32;
    let mut size = sector_size;
    while size > 1 {
        size >>= 1;
        power += 1;
    }
    if power == 0 {
        DEFAULT_BLOCK_POWER
    } else {
        power
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_number_pack_unpack() {
        let dev = DeviceNumber::new(1, 2, 3);
        assert_eq!(DeviceNumber::from_long(dev.as_long()), dev);
        assert_eq!(format!("{dev}"), "1:2:3");
    }

    #[test]
    fn test_device_number_ordering() {
        let a = DeviceNumber::new(0, 0, 1);
        let b = DeviceNumber::new(0, 1, 0);
        assert!(a < b);
        assert!(a.as_long() < b.as_long());
    }

    #[test]
    fn test_auto_select_memory_without_name() {
        let params = CreateParams::base(DeviceNumber::default());
        let params = CreateParams {
            disk_size: 1 << 20,
            ..params
        };
        let normalized = params.normalize().unwrap();
        assert_eq!(normalized.kind, Some(BackendKind::Memory));
        assert_eq!(normalized.sector_size, DEFAULT_SECTOR_SIZE_HDD);
    }

    #[test]
    fn test_auto_select_file_with_name() {
        let mut params = CreateParams::base(DeviceNumber::default());
        params.file_name = Some("/tmp/disk.img".to_string());
        let normalized = params.normalize().unwrap();
        assert_eq!(normalized.kind, Some(BackendKind::File));
    }

    #[test]
    fn test_optical_detection_forces_flags() {
        let params = CreateParams::file(DeviceNumber::default(), "/images/boot.ISO");
        let normalized = params.normalize().unwrap();
        assert!(normalized.read_only);
        assert!(normalized.removable);
        assert_eq!(normalized.sector_size, DEFAULT_SECTOR_SIZE_CD);
    }

    #[test]
    fn test_blank_name_zero_size_rejected() {
        let params = CreateParams::memory(DeviceNumber::default(), 0);
        assert!(matches!(
            params.normalize(),
            Err(EngineError::Validation { .. })
        ));
    }

    #[test]
    fn test_blank_name_nonzero_memory_accepted() {
        let params = CreateParams::memory(DeviceNumber::default(), 4096);
        assert!(params.normalize().is_ok());
    }

    #[test]
    fn test_empty_string_name_treated_as_blank() {
        let mut params = CreateParams::file(DeviceNumber::default(), "");
        params.disk_size = 0;
        assert!(matches!(
            params.normalize(),
            Err(EngineError::Validation { .. })
        ));
    }

    #[test]
    fn test_tcp_proxy_without_address_rejected() {
        let mut params = CreateParams::memory(DeviceNumber::default(), 4096);
        params.kind = Some(BackendKind::Proxy);
        assert!(matches!(
            params.normalize(),
            Err(EngineError::Validation { .. })
        ));
    }

    #[test]
    fn test_block_power_for_common_sizes() {
        assert_eq!(block_power_for(512), 9);
        assert_eq!(block_power_for(2048), 11);
        assert_eq!(block_power_for(4096), 12);
        // Non-powers of two floor to the next power below.
        assert_eq!(block_power_for(520), 9);
        // Degenerate sizes fall back to the default.
        assert_eq!(block_power_for(0), DEFAULT_BLOCK_POWER);
        assert_eq!(block_power_for(1), DEFAULT_BLOCK_POWER);
    }
}
