pub mod frame_allocator;
pub mod frame_table;

use core::{
    fmt,
    ops::{Deref, DerefMut},
};
use kidneyos_vm_shared::mem::PAGE_FRAME_SIZE;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub use frame_table::{FrameTable, Owner};

/// Index of a frame in the user pool.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub(crate) usize);

impl FrameId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Debug for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame#{}", self.0)
    }
}

/// The contents of one physical frame.
#[derive(FromZeroes, FromBytes, AsBytes)]
#[repr(transparent)]
pub struct PageBuf([u8; PAGE_FRAME_SIZE]);

impl PageBuf {
    pub fn zeroed() -> Self {
        Self::new_zeroed()
    }

    pub fn zero(&mut self) {
        self.0.fill(0);
    }
}

impl Deref for PageBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl DerefMut for PageBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_bytes_mut()
    }
}
