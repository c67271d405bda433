use thiserror::Error;

use crate::trb::CompletionCode;

pub type Result<T> = std::result::Result<T, XhciError>;

/// Unified error type for ring, event and command operations.
///
/// Bookkeeping errors (`BadState`, `InvalidToken`, `Canceled`, `RingFull`) are returned
/// synchronously to the submitting caller. [`XhciError::Io`] means a ring's completion ordering can
/// no longer be trusted and the ring has to be torn down. [`XhciError::Completion`] carries the
/// hardware's per-request status and only ever reaches that request's completion path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum XhciError {
    #[error("ring is not initialized, faulted or already torn down")]
    BadState,

    #[error("ring already holds a live descriptor chain")]
    AlreadyInitialized,

    #[error("stale generation token {context} (ring is at {ring})")]
    InvalidToken { context: u64, ring: u64 },

    #[error("completion has no pending context")]
    Canceled,

    #[error("completed descriptor {completed:#x} does not match the oldest pending descriptor {expected:#x}")]
    Io { expected: u64, completed: u64 },

    #[error("out of DMA memory")]
    OutOfMemory,

    #[error("bus transaction initiator cannot map the buffer: {0}")]
    Capability(&'static str),

    #[error("required hardware capability is absent: {0}")]
    NotSupported(&'static str),

    #[error("transfer ring is full")]
    RingFull,

    #[error("controller reported completion code {0:?}")]
    Completion(CompletionCode),
}

impl XhciError {
    /// Whether this error means the controller itself is in an irrecoverable state.
    ///
    /// Continuations scheduled on the event ring shut the whole controller down when they resolve
    /// with such an error instead of handing a retryable status back to the caller.
    pub fn is_hardware_fatal(&self) -> bool {
        matches!(self, XhciError::BadState)
    }
}
