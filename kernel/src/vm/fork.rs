//! Duplicating an address space for `fork`.

use super::{
    loader::SegmentLoader,
    page::{FileBacking, PageInitializer, PageState, PageType},
    spt::MmapRegion,
    AddressSpace, VmError, VmSystem,
};
use crate::{fs::File, mem::PageBuf};
use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec::Vec};
use kidneyos_vm_shared::mem::PAGE_FRAME_SIZE;
use log::{debug, warn};

/// Fills a page with a copy taken from the parent at fork time.
struct Snapshot(Box<PageBuf>);

impl PageInitializer for Snapshot {
    fn initialize(&self, page: &mut [u8]) -> Result<(), VmError> {
        page.copy_from_slice(&self.0);
        Ok(())
    }
}

/// How one parent page is reproduced in the child.
enum PagePlan {
    Lazy {
        init: Option<Arc<dyn PageInitializer>>,
        target: PageType,
    },
    Anon {
        stack: bool,
    },
    File {
        backing: FileBacking,
        resident: bool,
    },
}

/// Makes `dst` a copy of `src`. The child gets private copies of every
/// materialized anonymous page and its own handles on every mapped file.
///
/// On failure `dst` is left empty.
pub fn copy_address_space(vm: &VmSystem, dst: &AddressSpace, src: &AddressSpace) -> Result<(), VmError> {
    let result = copy_pages(vm, dst, src);
    if result.is_err() {
        dst.destroy(vm);
    }
    result
}

fn copy_pages(vm: &VmSystem, dst: &AddressSpace, src: &AddressSpace) -> Result<(), VmError> {
    // One new handle per mapping, shared by all of its pages.
    let regions: BTreeMap<usize, MmapRegion> = src
        .spt()
        .regions()
        .map(|(start, region)| {
            let copy = MmapRegion {
                file: region.file.reopen(),
                pages: region.pages,
            };
            (start, copy)
        })
        .collect();
    let reopen = |va: usize, file: &Arc<dyn File>| -> Arc<dyn File> {
        regions
            .range(..=va)
            .next_back()
            .filter(|&(&start, region)| va < start + region.pages * PAGE_FRAME_SIZE)
            .map_or_else(|| file.reopen(), |(_, region)| region.file.clone())
    };

    let plans: Vec<(usize, bool, PagePlan)> = src
        .spt()
        .pages()
        .map(|page| {
            let plan = match &page.state {
                PageState::Uninit { init, target } => PagePlan::Lazy {
                    init: init.clone(),
                    target: target.clone(),
                },
                PageState::Anon(anon) => PagePlan::Anon { stack: anon.is_stack() },
                PageState::File(file) => PagePlan::File {
                    backing: file.backing().clone(),
                    resident: page.is_resident(),
                },
            };
            (page.va(), page.writable(), plan)
        })
        .collect();

    for (va, writable, plan) in plans {
        match plan {
            PagePlan::Lazy { init, target } => {
                // The initializer is shared; only write-back needs the
                // child's own handle.
                let target = match target {
                    PageType::File(backing) => PageType::File(FileBacking {
                        file: reopen(va, &backing.file),
                        ..backing
                    }),
                    target => target,
                };
                dst.allocate_lazy(va, writable, target, init)?;
            }
            PagePlan::Anon { stack } => {
                let snapshot = snapshot(vm, src, va)?;
                let ty = if stack { PageType::Stack } else { PageType::Anon };
                dst.allocate_lazy(va, writable, ty, Some(Arc::new(snapshot)))?;
                dst.claim(vm, va)?;
            }
            PagePlan::File {
                backing,
                resident: false,
            } => {
                let backing = FileBacking {
                    file: reopen(va, &backing.file),
                    ..backing
                };
                let init = Arc::new(SegmentLoader::new(backing.clone()));
                dst.allocate_lazy(va, writable, PageType::File(backing), Some(init))?;
            }
            PagePlan::File {
                backing,
                resident: true,
            } => {
                let dirty = src.page_manager().is_dirty(va);
                let snapshot = snapshot(vm, src, va)?;
                let backing = FileBacking {
                    file: reopen(va, &backing.file),
                    ..backing
                };
                dst.allocate_lazy(va, writable, PageType::File(backing), Some(Arc::new(snapshot)))?;
                dst.claim(vm, va)?;
                if dirty {
                    dst.page_manager().set_dirty(va, true);
                }
            }
        }
    }

    {
        let mut spt = dst.spt();
        for (start, region) in regions {
            spt.insert_region(start, region);
        }
    }
    dst.set_stack_bottom(src.stack_bottom());
    dst.save_user_stack_pointer(src.saved_user_stack_pointer());
    debug!("{:?}: forked from {:?}", dst.id(), src.id());
    Ok(())
}

/// Copies the current contents of `src`'s page at `va`, wherever they are.
fn snapshot(vm: &VmSystem, src: &AddressSpace, va: usize) -> Result<Snapshot, VmError> {
    let mut copy = Box::new(PageBuf::zeroed());
    if let Some(frame) = src.pin_resident(vm, va) {
        copy.copy_from_slice(&vm.frames.frame(frame).lock());
        vm.frames.install(frame, src.owner(va));
        return Ok(Snapshot(copy));
    }

    let spt = src.spt();
    match spt.find(va).map(|page| &page.state) {
        Some(PageState::Anon(anon)) => {
            let slot = anon.slot().ok_or(VmError::MissingSwapSlot(va))?;
            vm.swap.read_slot(slot, &mut copy)?;
        }
        Some(PageState::File(file)) => super::file::load(file.backing(), &mut copy)?,
        Some(PageState::Uninit { .. }) | None => {
            warn!("{:?}: fork snapshot of {va:#x} found no contents", src.id());
            return Err(VmError::InvalidAddress(va));
        }
    }
    Ok(Snapshot(copy))
}
