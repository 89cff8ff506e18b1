use crate::transfer::{Direction, TransferError};

pub type Result<T> = std::result::Result<T, MsdError>;

/// Synchronous failures of the class driver API. Asynchronous outcomes are reported through
/// [`crate::CompletionStatus`] instead.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum MsdError {
    #[error("invalid class handle")]
    InvalidHandle,
    #[error("a command or control request is already in flight")]
    Busy,
    #[error("failed to allocate class driver state")]
    AllocFail,
    #[error("data buffer exceeds the 32-bit CBW transfer length")]
    BufferTooLarge,
    #[error("no interface has been selected")]
    NoInterface,
    #[error("bulk {0:?} pipe is not open")]
    PipeNotOpen(Direction),
    #[error("transfer service error: {0}")]
    Transfer(#[from] TransferError),
}
