//! Per-process page tables.
//!
//! `PageManager` keeps a two-level x86 directory whose tables live in kernel
//! memory, and walks it the same way the MMU does: `access` sets the accessed
//! and dirty bits of the entry it translates through, and raises a page fault
//! error code where the hardware would.

use crate::mem::FrameId;
use alloc::{boxed::Box, vec::Vec};
use arbitrary_int::u20;
use kidneyos_vm_shared::{
    mem::is_kernel_address,
    paging::{
        PageDirectoryEntry, PageFaultErrorCode, PageTableEntry, VirtualAddress, PAGE_DIRECTORY_LEN,
        PAGE_TABLE_LEN,
    },
};

type PageTable = [PageTableEntry; PAGE_TABLE_LEN];

pub struct PageManager {
    directory: Box<[PageDirectoryEntry; PAGE_DIRECTORY_LEN]>,
    tables: Vec<Box<PageTable>>,
}

impl Default for PageManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PageManager {
    pub fn new() -> Self {
        Self {
            directory: Box::new([PageDirectoryEntry::DEFAULT; PAGE_DIRECTORY_LEN]),
            tables: Vec::new(),
        }
    }

    fn entry(&self, va: usize) -> Option<&PageTableEntry> {
        let va = VirtualAddress::split(va)?;
        let pde = self.directory[va.directory_index()];
        if !pde.present() {
            return None;
        }
        let table = &self.tables[pde.page_table_address().value() as usize];
        Some(&table[va.table_index()])
    }

    fn entry_mut(&mut self, va: usize) -> Option<&mut PageTableEntry> {
        let va = VirtualAddress::split(va)?;
        let pde = self.directory[va.directory_index()];
        if !pde.present() {
            return None;
        }
        let table = &mut self.tables[pde.page_table_address().value() as usize];
        Some(&mut table[va.table_index()])
    }

    /// Like `entry_mut`, but allocates the page table if it is missing.
    fn entry_or_insert(&mut self, va: usize) -> Option<&mut PageTableEntry> {
        let split = VirtualAddress::split(va)?;
        let pde = &mut self.directory[split.directory_index()];
        if !pde.present() {
            let index = u20::try_new(u32::try_from(self.tables.len()).ok()?).ok()?;
            self.tables.push(Box::new([PageTableEntry::DEFAULT; PAGE_TABLE_LEN]));
            *pde = PageDirectoryEntry::DEFAULT
                .with_present(true)
                .with_read_write(true)
                .with_user_supervisor(true)
                .with_page_table_address(index);
        }
        self.entry_mut(va)
    }

    /// Maps the user page containing `va` to `frame`. Fails for kernel
    /// addresses and for pages that are already mapped.
    #[allow(clippy::cast_possible_truncation)]
    pub fn map(&mut self, va: usize, frame: FrameId, writable: bool) -> bool {
        if is_kernel_address(va) {
            return false;
        }
        let Ok(frame_number) = u20::try_new(frame.index() as u32) else {
            return false;
        };
        let Some(pte) = self.entry_or_insert(va) else {
            return false;
        };
        if pte.present() {
            return false;
        }
        *pte = PageTableEntry::DEFAULT
            .with_present(true)
            .with_read_write(writable)
            .with_user_supervisor(true)
            .with_page_frame_address(frame_number);
        true
    }

    /// Removes the mapping for `va`, if there is one. The accessed and dirty
    /// bits are lost.
    pub fn unmap(&mut self, va: usize) {
        if let Some(pte) = self.entry_mut(va) {
            *pte = PageTableEntry::DEFAULT;
        }
    }

    fn present_entry(&self, va: usize) -> Option<&PageTableEntry> {
        self.entry(va).filter(|pte| pte.present())
    }

    pub fn lookup(&self, va: usize) -> Option<FrameId> {
        self.present_entry(va)
            .map(|pte| FrameId(pte.page_frame_address().value() as usize))
    }

    pub fn is_mapped(&self, va: usize) -> bool {
        self.present_entry(va).is_some()
    }

    pub fn is_writable(&self, va: usize) -> bool {
        self.present_entry(va).is_some_and(|pte| pte.read_write())
    }

    pub fn is_dirty(&self, va: usize) -> bool {
        self.present_entry(va).is_some_and(|pte| pte.dirty())
    }

    pub fn set_dirty(&mut self, va: usize, dirty: bool) {
        if let Some(pte) = self.entry_mut(va).filter(|pte| pte.present()) {
            *pte = pte.with_dirty(dirty);
        }
    }

    pub fn is_accessed(&self, va: usize) -> bool {
        self.present_entry(va).is_some_and(|pte| pte.accessed())
    }

    pub fn set_accessed(&mut self, va: usize, accessed: bool) {
        if let Some(pte) = self.entry_mut(va).filter(|pte| pte.present()) {
            *pte = pte.with_accessed(accessed);
        }
    }

    /// Translates `va` the way the MMU would for a `write` or read from user or
    /// kernel mode, updating the accessed and dirty bits on success.
    pub fn access(&mut self, va: usize, write: bool, user: bool) -> Result<FrameId, PageFaultErrorCode> {
        let fault = PageFaultErrorCode::DEFAULT.with_write(write).with_user(user);
        if user && is_kernel_address(va) {
            return Err(fault.with_present(self.is_mapped(va)));
        }
        let Some(pte) = self.entry_mut(va).filter(|pte| pte.present()) else {
            return Err(fault);
        };
        if write && !pte.read_write() {
            return Err(fault.with_present(true));
        }
        *pte = pte.with_accessed(true).with_dirty(pte.dirty() || write);
        Ok(FrameId(pte.page_frame_address().value() as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kidneyos_vm_shared::mem::{OFFSET, PAGE_FRAME_SIZE};

    #[test]
    fn map_and_lookup() {
        let mut pm = PageManager::new();
        assert!(pm.map(0x0804_8000, FrameId(3), true));
        assert_eq!(pm.lookup(0x0804_8000), Some(FrameId(3)));
        assert_eq!(pm.lookup(0x0804_8abc), Some(FrameId(3)));
        assert_eq!(pm.lookup(0x0804_9000), None);

        // Already mapped.
        assert!(!pm.map(0x0804_8000, FrameId(4), true));

        pm.unmap(0x0804_8000);
        assert_eq!(pm.lookup(0x0804_8000), None);
        assert!(pm.map(0x0804_8000, FrameId(4), false));
        assert!(!pm.is_writable(0x0804_8000));
    }

    #[test]
    fn rejects_kernel_addresses() {
        let mut pm = PageManager::new();
        assert!(!pm.map(OFFSET, FrameId(0), true));
        assert!(!pm.map(OFFSET + PAGE_FRAME_SIZE, FrameId(0), true));
    }

    #[test]
    fn access_tracks_accessed_and_dirty() {
        let mut pm = PageManager::new();
        let va = 0x1000_0000;
        pm.map(va, FrameId(1), true);
        assert!(!pm.is_accessed(va));

        assert!(matches!(pm.access(va + 4, false, true), Ok(FrameId(1))));
        assert!(pm.is_accessed(va));
        assert!(!pm.is_dirty(va));

        assert!(pm.access(va, true, true).is_ok());
        assert!(pm.is_dirty(va));

        pm.set_accessed(va, false);
        pm.set_dirty(va, false);
        assert!(!pm.is_accessed(va));
        assert!(!pm.is_dirty(va));
    }

    #[test]
    fn access_faults() {
        let mut pm = PageManager::new();
        let va = 0x2000_0000;

        let code = pm.access(va, false, true).unwrap_err();
        assert!(code.not_present());
        assert!(code.user());

        pm.map(va, FrameId(0), false);
        let code = pm.access(va, true, true).unwrap_err();
        assert!(!code.not_present());
        assert!(code.write());
        assert!(!pm.is_dirty(va));

        let code = pm.access(OFFSET, false, true).unwrap_err();
        assert!(code.not_present());
    }
}
