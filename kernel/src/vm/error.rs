use crate::block::BlockError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("a page is already registered at {0:#x}")]
    DuplicatePage(usize),
    #[error("{0:#x} is not a valid user address for this operation")]
    InvalidAddress(usize),
    #[error("no frame could be allocated or reclaimed")]
    AllocationFailure,
    #[error("swap device is full")]
    SwapExhausted,
    #[error("page at {0:#x} is not resident and has no swap slot")]
    MissingSwapSlot(usize),
    #[error("I/O error: {0}")]
    Io(#[from] IoError),
}

#[derive(Debug, Error)]
pub enum IoError {
    #[error(transparent)]
    Device(#[from] BlockError),
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
    #[error("short write: expected {expected} bytes, wrote {actual}")]
    ShortWrite { expected: usize, actual: usize },
}

impl From<BlockError> for VmError {
    fn from(err: BlockError) -> Self {
        Self::Io(err.into())
    }
}
