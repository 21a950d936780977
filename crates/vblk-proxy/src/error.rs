//! Error types for the proxy protocol client.

use thiserror::Error;

use crate::wire::Opcode;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Error variants for proxy protocol operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Connection attempt did not complete within the configured timeout.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectTimeout {
        /// Address the connection was attempted to.
        addr: String,
        /// Timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// A received frame failed structural validation.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// Description of the validation failure.
        reason: String,
    },

    /// Frame carried the wrong magic number.
    #[error("invalid magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic {
        /// The magic number this client speaks.
        expected: u32,
        /// The magic number received.
        got: u32,
    },

    /// Frame carried an unsupported protocol version.
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// The version this client speaks.
        expected: u8,
        /// The version received.
        got: u8,
    },

    /// Frame payload exceeds the protocol maximum.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Declared payload size.
        size: u64,
        /// Maximum allowed payload size.
        max: u64,
    },

    /// Frame carried an opcode this client does not understand.
    #[error("unknown opcode: 0x{0:02X}")]
    UnknownOpcode(u8),

    /// The response opcode did not match the request that was sent.
    #[error("unexpected response: expected {expected:?}, got {got:?}")]
    UnexpectedResponse {
        /// Opcode expected for this round-trip.
        expected: Opcode,
        /// Opcode actually received.
        got: Opcode,
    },

    /// The remote side rejected the request with a protocol error code.
    #[error("remote error code {code} for {op:?}")]
    Remote {
        /// Operation that failed.
        op: Opcode,
        /// Protocol error code (see [`crate::wire::errno`]).
        code: u64,
    },

    /// The remote side reported end of backing store for a read.
    #[error("read past end of remote backing store")]
    EndOfData,

    /// The remote side is read-only and refused a mutating request.
    #[error("remote backing store is read-only")]
    ReadOnly,

    /// The remote side is transiently unable to serve the request.
    #[error("remote backing store busy")]
    Busy,

    /// The remote side does not implement the requested operation.
    #[error("operation not supported by remote backing store")]
    Unsupported,

    /// The stop signal fired while the round-trip was in flight.
    #[error("proxy call cancelled by stop signal")]
    Cancelled,

    /// Wraps transport-level I/O errors.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Map a protocol error code into the matching typed variant.
    pub(crate) fn from_errno(op: Opcode, code: u64) -> Self {
        use crate::wire::errno;
        match code {
            errno::END_OF_DATA => ProxyError::EndOfData,
            errno::READ_ONLY => ProxyError::ReadOnly,
            errno::BUSY => ProxyError::Busy,
            errno::UNSUPPORTED => ProxyError::Unsupported,
            other => ProxyError::Remote { op, code: other },
        }
    }
}
