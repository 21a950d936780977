//! Unmap descriptor table decoding.
//!
//! The front end hands over the raw parameter list exactly as it arrived
//! from the host storage stack: an 8-byte header followed by 16-byte block
//! descriptors, all multi-byte fields big-endian. Everything is converted to
//! host order here, at the boundary, and the declared lengths are checked
//! against the transfer bounds before any descriptor is processed.

use crate::error::{EngineError, EngineResult};

/// Size of the parameter list header.
pub const UNMAP_HEADER_LEN: usize = 8;
/// Size of one block descriptor.
pub const UNMAP_DESCRIPTOR_LEN: usize = 16;

/// One unmap block descriptor in host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnmapDescriptor {
    /// First logical block of the range.
    pub start_lba: u64,
    /// Number of blocks in the range.
    pub block_count: u32,
}

impl UnmapDescriptor {
    /// Encode into the 16-byte big-endian wire form (used by tests and
    /// front-end shims building parameter lists).
    pub fn encode(&self) -> [u8; UNMAP_DESCRIPTOR_LEN] {
        let mut out = [0u8; UNMAP_DESCRIPTOR_LEN];
        out[0..8].copy_from_slice(&self.start_lba.to_be_bytes());
        out[8..12].copy_from_slice(&self.block_count.to_be_bytes());
        out
    }
}

/// Build a full parameter list (header plus descriptors) in wire form.
pub fn encode_parameter_list(descriptors: &[UnmapDescriptor]) -> Vec<u8> {
    let descr_bytes = descriptors.len() * UNMAP_DESCRIPTOR_LEN;
    let mut out = Vec::with_capacity(UNMAP_HEADER_LEN + descr_bytes);
    out.extend_from_slice(&((descr_bytes + 6) as u16).to_be_bytes());
    out.extend_from_slice(&(descr_bytes as u16).to_be_bytes());
    out.extend_from_slice(&[0u8; 4]);
    for d in descriptors {
        out.extend_from_slice(&d.encode());
    }
    out
}

/// Decode a parameter list, validating the declared descriptor length
/// against the actual transfer bounds before touching any descriptor.
pub fn parse_parameter_list(table: &[u8]) -> EngineResult<Vec<UnmapDescriptor>> {
    if table.len() < UNMAP_HEADER_LEN {
        return Err(EngineError::validation(format!(
            "unmap parameter list truncated: {} bytes",
            table.len()
        )));
    }
    let descr_len = u16::from_be_bytes([table[2], table[3]]) as usize;
    if descr_len + UNMAP_HEADER_LEN > table.len() {
        return Err(EngineError::validation(format!(
            "unmap descriptor length {descr_len} exceeds transfer of {} bytes",
            table.len()
        )));
    }
    let count = descr_len / UNMAP_DESCRIPTOR_LEN;
    let mut descriptors = Vec::with_capacity(count);
    for i in 0..count {
        let base = UNMAP_HEADER_LEN + i * UNMAP_DESCRIPTOR_LEN;
        let d = &table[base..base + UNMAP_DESCRIPTOR_LEN];
        descriptors.push(UnmapDescriptor {
            start_lba: u64::from_be_bytes([d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]]),
            block_count: u32::from_be_bytes([d[8], d[9], d[10], d[11]]),
        });
    }
    Ok(descriptors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let descriptors = vec![
            UnmapDescriptor {
                start_lba: 0,
                block_count: 8,
            },
            UnmapDescriptor {
                start_lba: 0x1_0000_0000,
                block_count: 256,
            },
        ];
        let table = encode_parameter_list(&descriptors);
        let parsed = parse_parameter_list(&table).unwrap();
        assert_eq!(parsed, descriptors);
    }

    #[test]
    fn test_fields_are_big_endian_on_the_wire() {
        let d = UnmapDescriptor {
            start_lba: 0x0102_0304_0506_0708,
            block_count: 0x0A0B_0C0D,
        };
        let encoded = d.encode();
        assert_eq!(
            &encoded[0..8],
            &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );
        assert_eq!(&encoded[8..12], &[0x0A, 0x0B, 0x0C, 0x0D]);
    }

    #[test]
    fn test_declared_length_beyond_transfer_rejected() {
        let descriptors = vec![UnmapDescriptor {
            start_lba: 0,
            block_count: 1,
        }];
        let mut table = encode_parameter_list(&descriptors);
        // Claim one more descriptor than the transfer carries.
        let bogus = (2 * UNMAP_DESCRIPTOR_LEN) as u16;
        table[2..4].copy_from_slice(&bogus.to_be_bytes());
        assert!(matches!(
            parse_parameter_list(&table),
            Err(EngineError::Validation { .. })
        ));
    }

    #[test]
    fn test_truncated_header_rejected() {
        assert!(parse_parameter_list(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_empty_descriptor_list() {
        let table = encode_parameter_list(&[]);
        assert!(parse_parameter_list(&table).unwrap().is_empty());
    }
}
