//! Asynchronous completion pipeline.
//!
//! Backend transfers may finish on a different execution context than the
//! worker that issued them. Every completion funnels through [`finish`],
//! which in order: classifies the outcome for bus-status translation, copies
//! a private intermediate buffer back into the caller buffer for reads,
//! transfers intermediate-buffer ownership into the unit's last-operation
//! cache, and notifies the requester on the inline or deferred path
//! depending on which context is completing.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::lu::LogicalUnit;
use crate::worker::OpKind;

/// Classification of an operation's outcome, in terms the front end can
/// translate into bus status/sense codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultClass {
    /// The operation completed.
    Success,
    /// The request itself was bad; retrying it unchanged cannot succeed.
    IllegalRequest,
    /// Transient backend condition; the front end is expected to retry.
    DeviceBusy,
    /// Any other backend failure.
    HardwareError,
}

/// Which notification path delivered a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionPath {
    /// Completed synchronously on the issuing context.
    Inline,
    /// Routed through the deferred mechanism from a different context.
    Deferred,
}

/// Identity of an execution context, used to pick the notification path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    /// Allocate a fresh context identity.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ContextId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Final state of one work item, delivered to the front end.
#[derive(Debug)]
pub struct Completion {
    /// Outcome classification.
    pub class: ResultClass,
    /// Bytes transferred.
    pub bytes: u64,
    /// For reads: the caller buffer with the transferred data.
    pub data: Option<Vec<u8>>,
    /// Which notification path delivered this completion.
    pub path: CompletionPath,
    /// The underlying error when `class` is not `Success`.
    pub error: Option<EngineError>,
}

impl Completion {
    /// Whether the operation completed successfully.
    pub fn is_success(&self) -> bool {
        self.class == ResultClass::Success
    }
}

/// Classify an engine error for bus-status translation.
pub fn classify(error: &EngineError) -> ResultClass {
    use vblk_proxy::ProxyError;
    match error {
        EngineError::Validation { .. }
        | EngineError::Unsupported { .. }
        | EngineError::Collision(_)
        | EngineError::NotFound(_) => ResultClass::IllegalRequest,
        EngineError::Proxy(ProxyError::Busy) => ResultClass::DeviceBusy,
        EngineError::Io(e) if e.kind() == std::io::ErrorKind::InvalidInput => {
            ResultClass::IllegalRequest
        }
        _ => ResultClass::HardwareError,
    }
}

/// Everything the pipeline needs to finish one transfer.
pub(crate) struct Transfer {
    /// Operation kind, for stats and read-only-path decisions.
    pub op: OpKind,
    /// First logical block of the transfer.
    pub start_sector: u64,
    /// Requested transfer length in bytes.
    pub transfer_len: u64,
    /// The caller-provided buffer (reads only).
    pub caller_buf: Option<Vec<u8>>,
    /// Private intermediate buffer, when the caller buffer was not directly
    /// usable by the backend. Ownership ends here: it is either moved into
    /// the last-operation cache or dropped.
    pub intermediate: Option<Vec<u8>>,
    /// Copy the intermediate buffer back into the caller buffer on success.
    pub copy_back: bool,
    /// Context that issued the backend operation.
    pub origin: ContextId,
    /// Completion channel back to the front end.
    pub reply: oneshot::Sender<Completion>,
}

/// Run the completion pipeline for one finished transfer.
pub(crate) fn finish(
    lu: &LogicalUnit,
    completing: ContextId,
    transfer: Transfer,
    result: EngineResult<u64>,
) {
    let Transfer {
        op,
        start_sector,
        transfer_len,
        mut caller_buf,
        intermediate,
        copy_back,
        origin,
        reply,
    } = transfer;

    let (class, bytes, error) = match result {
        Ok(n) => (ResultClass::Success, n, None),
        Err(e) => (classify(&e), 0, Some(e)),
    };

    if class == ResultClass::Success && copy_back {
        if let (Some(caller), Some(private)) = (caller_buf.as_mut(), intermediate.as_ref()) {
            let n = caller.len().min(private.len());
            caller[..n].copy_from_slice(&private[..n]);
        }
    }

    if class == ResultClass::Success && op == OpKind::Read {
        if let Some(caller) = caller_buf.as_mut() {
            lu.apply_fake_signature(start_sector, caller);
        }
    }

    // Intermediate buffer ownership moves into the last-operation cache,
    // replacing (and thereby releasing) whatever was cached before.
    if let Some(private) = intermediate {
        lu.store_last_io(start_sector, transfer_len, private);
    }

    let path = if completing == origin {
        CompletionPath::Inline
    } else {
        CompletionPath::Deferred
    };

    lu.record_op(op, class, bytes);

    let completion = Completion {
        class,
        bytes,
        data: caller_buf,
        path,
        error,
    };
    if reply.send(completion).is_err() {
        debug!(device = %lu.device(), "completion dropped, requester gone");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_validation_is_illegal_request() {
        assert_eq!(
            classify(&EngineError::validation("bad")),
            ResultClass::IllegalRequest
        );
        assert_eq!(
            classify(&EngineError::unsupported("no")),
            ResultClass::IllegalRequest
        );
    }

    #[test]
    fn test_classify_busy_is_device_busy() {
        assert_eq!(
            classify(&EngineError::Proxy(vblk_proxy::ProxyError::Busy)),
            ResultClass::DeviceBusy
        );
    }

    #[test]
    fn test_classify_invalid_input_io() {
        let err = EngineError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "bad length",
        ));
        assert_eq!(classify(&err), ResultClass::IllegalRequest);
    }

    #[test]
    fn test_classify_other_failures_are_hardware_errors() {
        assert_eq!(
            classify(&EngineError::Cancelled),
            ResultClass::HardwareError
        );
        let err = EngineError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "gone",
        ));
        assert_eq!(classify(&err), ResultClass::HardwareError);
        assert_eq!(
            classify(&EngineError::InsufficientResources {
                reason: "pool".into()
            }),
            ResultClass::HardwareError
        );
    }

    #[test]
    fn test_context_ids_are_unique() {
        let a = ContextId::next();
        let b = ContextId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_result_class_serializes() {
        let json = serde_json::to_string(&ResultClass::DeviceBusy).unwrap();
        assert_eq!(json, "\"DeviceBusy\"");
    }
}
