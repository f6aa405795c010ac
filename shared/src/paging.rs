// https://wiki.osdev.org/Paging
// https://wiki.osdev.org/Exceptions#Page_Fault

// Avoids lots of warnings about casting usize to u32 which cannot result in
// truncation for user addresses, which always sit below OFFSET.
#![allow(clippy::cast_possible_truncation)]

use crate::mem::PAGE_FRAME_SIZE;
use arbitrary_int::{u10, u12, u20};
use bitbybit::bitfield;
use core::mem::size_of;

pub const PAGE_DIRECTORY_LEN: usize = PAGE_FRAME_SIZE / size_of::<PageDirectoryEntry>();
pub const PAGE_TABLE_LEN: usize = PAGE_FRAME_SIZE / size_of::<PageTableEntry>();

#[bitfield(u32, default = 0)]
pub struct PageDirectoryEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bits(12..=31, rw)]
    page_table_address: u20,
}

#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

#[bitfield(u32)]
pub struct VirtualAddress {
    #[bits(22..=31, r)]
    page_directory_index: u10,
    #[bits(12..=21, r)]
    page_table_index: u10,
    #[bits(0..=11, r)]
    offset: u12,
}

impl VirtualAddress {
    /// Splits `addr`, or returns `None` if it does not fit in 32 bits.
    pub fn split(addr: usize) -> Option<Self> {
        let raw = u32::try_from(addr).ok()?;
        Some(Self::new_with_raw_value(raw))
    }

    pub fn directory_index(&self) -> usize {
        self.page_directory_index().value().into()
    }

    pub fn table_index(&self) -> usize {
        self.page_table_index().value().into()
    }
}

/// The error code the CPU pushes for a page fault (vector 0xE).
#[bitfield(u32, default = 0)]
pub struct PageFaultErrorCode {
    /// Set for a protection violation, clear when the page was not present.
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    write: bool,
    #[bit(2, rw)]
    user: bool,
}

impl PageFaultErrorCode {
    pub fn not_present(&self) -> bool {
        !self.present()
    }
}
