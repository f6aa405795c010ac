//! Demand-paged user virtual memory.
//!
//! Pages are registered lazily in each address space's supplemental page
//! table and only get a frame when first touched. When the user pool runs
//! dry a resident page is evicted: anonymous pages go to swap, file pages
//! are written back to their file if dirty.

mod address_space;
mod anon;
mod error;
pub mod fault;
mod file;
pub mod fork;
pub mod loader;
pub mod mmap;
mod page;
mod spt;

pub use address_space::{AddressSpace, AddressSpaceId};
pub use anon::AnonPage;
pub use error::{IoError, VmError};
pub use fault::{handle_fault, try_handle_fault, TrapFrame};
pub use file::FilePage;
pub use fork::copy_address_space;
pub use loader::{load_segment, setup_stack, SegmentLoader};
pub use mmap::{map_file, unmap_file};
pub use page::{FileBacking, Page, PageInitializer, PageKind, PageType};
pub use spt::{MmapRegion, SupplementalPageTable};

use crate::{block::BlockDevice, mem::FrameTable, swapping::SwapSpace};
use alloc::boxed::Box;
use kidneyos_vm_shared::mem::USER_POOL_FRAMES;
use log::info;

#[derive(Clone, Copy, Debug)]
pub struct VmConfig {
    /// Frames in the user pool.
    pub user_frames: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_frames: USER_POOL_FRAMES,
        }
    }
}

/// The machine-wide parts of the VM: the user frame pool and swap.
pub struct VmSystem {
    pub(crate) frames: FrameTable,
    pub(crate) swap: SwapSpace,
}

impl VmSystem {
    pub fn new(config: VmConfig, swap_device: Box<dyn BlockDevice>) -> Self {
        let frames = FrameTable::new(config.user_frames);
        let swap = SwapSpace::new(swap_device);
        info!(
            "vm: {} user frames, {} swap slots",
            frames.capacity(),
            swap.capacity()
        );
        Self { frames, swap }
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapSpace {
        &self.swap
    }

    /// Tears down `space` when its process exits.
    pub fn destroy_address_space(&self, space: &AddressSpace) {
        space.destroy(self);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::block::RamDisk;
    use alloc::{sync::Arc, vec::Vec};
    use kidneyos_vm_shared::mem::{PAGE_FRAME_SIZE, SECTORS_PER_PAGE};
    use std::thread;

    /// A VM with `frames` user frames and room for `swap_pages` pages of swap.
    pub(crate) fn vm_with(frames: usize, swap_pages: u32) -> VmSystem {
        VmSystem::new(
            VmConfig { user_frames: frames },
            Box::new(RamDisk::new(swap_pages * SECTORS_PER_PAGE)),
        )
    }

    const HEAP: usize = 0x0a00_0000;

    fn page(i: usize) -> usize {
        HEAP + i * PAGE_FRAME_SIZE
    }

    #[test]
    fn default_config_uses_full_pool() {
        assert_eq!(VmConfig::default().user_frames, USER_POOL_FRAMES);
    }

    #[test]
    fn duplicate_lazy_allocation_fails() {
        let space = AddressSpace::new();
        space.allocate_lazy(page(0), true, PageType::Anon, None).unwrap();
        assert!(space.spt().find(page(0) + 12).is_some());
        assert!(!space.page_manager().is_mapped(page(0)));
        assert!(matches!(
            space.allocate_lazy(page(0) + 12, true, PageType::Anon, None),
            Err(VmError::DuplicatePage(_))
        ));
        assert!(matches!(
            space.allocate_lazy(0x8000_0000, true, PageType::Anon, None),
            Err(VmError::InvalidAddress(_))
        ));
        assert_eq!(space.spt().len(), 1);
    }

    #[test]
    fn claim_unknown_address_fails() {
        let vm = vm_with(2, 2);
        let space = AddressSpace::new();
        assert!(matches!(space.claim(&vm, page(3)), Err(VmError::InvalidAddress(_))));
        assert_eq!(vm.frames().free_frames(), 2);
    }

    #[test]
    fn claim_is_idempotent() {
        let vm = vm_with(2, 2);
        let space = AddressSpace::new();
        space.allocate_lazy(page(0), true, PageType::Anon, None).unwrap();
        space.claim(&vm, page(0)).unwrap();
        space.claim(&vm, page(0) + 100).unwrap();
        assert_eq!(vm.frames().free_frames(), 1);
        assert_eq!(space.spt().find(page(0)).unwrap().kind(), PageKind::Anon);
    }

    #[test]
    fn anon_page_survives_eviction() {
        let vm = vm_with(1, 4);
        let space = AddressSpace::new();
        space.allocate_lazy(page(0), true, PageType::Anon, None).unwrap();
        space.allocate_lazy(page(1), true, PageType::Anon, None).unwrap();

        space.write_user(&vm, page(0) + 8, b"swapped").unwrap();
        space.write_user(&vm, page(1), b"other").unwrap();

        // The first page went to swap to make room, and was unmapped.
        assert!(!space.page_manager().is_mapped(page(0)));
        assert!(space.spt().find(page(0)).unwrap().frame().is_none());
        assert_eq!(vm.swap().used_slots(), 1);

        let mut buf = [0u8; 7];
        space.read_user(&vm, page(0) + 8, &mut buf).unwrap();
        assert_eq!(&buf, b"swapped");
        // Swapping back in frees the slot; the other page is in swap now.
        assert_eq!(vm.swap().used_slots(), 1);

        space.read_user(&vm, page(1), &mut buf[..5]).unwrap();
        assert_eq!(&buf[..5], b"other");
    }

    #[test]
    fn eviction_prefers_unreferenced_pages() {
        let vm = vm_with(2, 4);
        let space = AddressSpace::new();
        for i in 0..3 {
            space.allocate_lazy(page(i), true, PageType::Anon, None).unwrap();
        }
        space.claim(&vm, page(0)).unwrap();
        space.claim(&vm, page(1)).unwrap();
        // Only page 1 is referenced.
        space.write_user(&vm, page(1), &[1]).unwrap();

        space.claim(&vm, page(2)).unwrap();
        assert!(space.spt().find(page(0)).unwrap().frame().is_none());
        assert!(space.spt().find(page(1)).unwrap().frame().is_some());
    }

    #[test]
    fn swap_exhaustion_fails_fault() {
        let vm = vm_with(1, 0);
        let space = AddressSpace::new();
        space.allocate_lazy(page(0), true, PageType::Anon, None).unwrap();
        space.allocate_lazy(page(1), true, PageType::Anon, None).unwrap();
        space.write_user(&vm, page(0), &[5]).unwrap();

        assert!(space.write_user(&vm, page(1), &[6]).is_err());
        // The victim was left intact.
        let mut buf = [0u8];
        space.read_user(&vm, page(0), &mut buf).unwrap();
        assert_eq!(buf, [5]);
        assert!(space.page_manager().is_mapped(page(0)));
    }

    #[test]
    fn remove_releases_everything() {
        let vm = vm_with(1, 4);
        let space = AddressSpace::new();
        space.allocate_lazy(page(0), true, PageType::Anon, None).unwrap();
        space.allocate_lazy(page(1), true, PageType::Anon, None).unwrap();
        space.write_user(&vm, page(0), &[1]).unwrap();
        space.write_user(&vm, page(1), &[2]).unwrap();
        assert_eq!(vm.swap().used_slots(), 1);

        space.remove(&vm, page(0)).unwrap();
        assert_eq!(vm.swap().used_slots(), 0);
        space.remove(&vm, page(1)).unwrap();
        assert_eq!(vm.frames().free_frames(), 1);
        assert!(!space.page_manager().is_mapped(page(1)));
        assert!(matches!(space.remove(&vm, page(1)), Err(VmError::InvalidAddress(_))));
    }

    #[test]
    fn destroy_empties_address_space() {
        let vm = vm_with(2, 4);
        let space = AddressSpace::new();
        setup_stack(&vm, &space).unwrap();
        for i in 0..3 {
            space.allocate_lazy(page(i), true, PageType::Anon, None).unwrap();
            space.write_user(&vm, page(i), &[1]).unwrap();
        }
        vm.destroy_address_space(&space);
        assert!(space.spt().is_empty());
        assert_eq!(vm.frames().free_frames(), 2);
        assert_eq!(vm.swap().used_slots(), 0);
        assert!(vm.frames().installed().is_empty());
    }

    #[test]
    fn dropped_address_space_frames_are_reclaimed() {
        let vm = vm_with(1, 1);
        let first = AddressSpace::new();
        first.allocate_lazy(page(0), true, PageType::Anon, None).unwrap();
        first.write_user(&vm, page(0), &[1]).unwrap();
        drop(first);

        let second = AddressSpace::new();
        second.allocate_lazy(page(0), true, PageType::Anon, None).unwrap();
        second.write_user(&vm, page(0), &[2]).unwrap();
        assert_eq!(vm.swap().used_slots(), 0);
    }

    #[test]
    fn concurrent_processes_under_memory_pressure() {
        const PROCESSES: usize = 4;
        const PAGES: usize = 6;

        let vm = Arc::new(vm_with(8, 64));
        let handles: Vec<_> = (0..PROCESSES)
            .map(|p| {
                let vm = vm.clone();
                thread::spawn(move || {
                    let space = AddressSpace::new();
                    for i in 0..PAGES {
                        space.allocate_lazy(page(i), true, PageType::Anon, None).unwrap();
                    }
                    for round in 0..4u8 {
                        for i in 0..PAGES {
                            let value = [u8::try_from(p * PAGES + i).unwrap(), round];
                            space.write_user(&vm, page(i), &value).unwrap();
                        }
                        for i in 0..PAGES {
                            let mut buf = [0u8; 2];
                            space.read_user(&vm, page(i), &mut buf).unwrap();
                            assert_eq!(buf, [u8::try_from(p * PAGES + i).unwrap(), round]);
                        }
                    }
                    vm.destroy_address_space(&space);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(vm.frames().free_frames(), 8);
        assert_eq!(vm.swap().used_slots(), 0);
    }
}
