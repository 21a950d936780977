//! Error types for the engine.

use thiserror::Error;

use crate::device::DeviceNumber;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Error variants for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A unit with the same device number already exists.
    #[error("device {0} already exists")]
    Collision(DeviceNumber),

    /// No unit with this device number is registered.
    #[error("device {0} not found")]
    NotFound(DeviceNumber),

    /// Request parameters were rejected before touching any backend.
    #[error("invalid parameters: {reason}")]
    Validation {
        /// Description of the rejected parameter.
        reason: String,
    },

    /// An allocation or task spawn failed.
    #[error("out of resources: {reason}")]
    InsufficientResources {
        /// Description of the exhausted resource.
        reason: String,
    },

    /// The backend could not be opened or connected.
    #[error("backend unavailable: {reason}")]
    BackendUnavailable {
        /// Description of the open/connect failure.
        reason: String,
    },

    /// The operation is not meaningful for the active backend.
    #[error("operation not supported: {reason}")]
    Unsupported {
        /// Which operation/backend combination was rejected.
        reason: String,
    },

    /// A read reached past the end of the backing store. Internal: the
    /// dispatch path converts this into a zero-filled successful read.
    #[error("read past end of backing store")]
    EndOfData,

    /// The unit's stop signal fired while the operation was in flight.
    #[error("operation cancelled by stop signal")]
    Cancelled,

    /// Wraps standard I/O errors from file-backed units.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wraps proxy protocol errors from proxy-backed units.
    #[error("proxy error: {0}")]
    Proxy(#[from] vblk_proxy::ProxyError),
}

impl EngineError {
    /// Shorthand for a validation error with a formatted reason.
    pub fn validation(reason: impl Into<String>) -> Self {
        EngineError::Validation {
            reason: reason.into(),
        }
    }

    /// Shorthand for an unsupported-operation error.
    pub fn unsupported(reason: impl Into<String>) -> Self {
        EngineError::Unsupported {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_result_alias() {
        let ok: EngineResult<u32> = Ok(7);
        assert!(ok.is_ok());

        let err: EngineResult<u32> = Err(EngineError::Cancelled);
        assert!(err.is_err());
    }

    #[test]
    fn test_collision_display() {
        let err = EngineError::Collision(DeviceNumber::new(0, 1, 2));
        assert_eq!(format!("{err}"), "device 0:1:2 already exists");
    }

    #[test]
    fn test_io_error_from_std() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: EngineError = io.into();
        assert!(matches!(err, EngineError::Io(_)));
    }

    #[test]
    fn test_proxy_error_from() {
        let err: EngineError = vblk_proxy::ProxyError::Cancelled.into();
        assert!(matches!(
            err,
            EngineError::Proxy(vblk_proxy::ProxyError::Cancelled)
        ));
    }
}
