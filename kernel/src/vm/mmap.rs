//! Memory-mapped files.

use super::{
    loader::SegmentLoader,
    page::{FileBacking, PageType},
    spt::MmapRegion,
    AddressSpace, VmError, VmSystem,
};
use crate::fs::File;
use alloc::sync::Arc;
use core::cmp::min;
use kidneyos_vm_shared::mem::{is_kernel_address, is_page_aligned, page_round_down, PAGE_FRAME_SIZE};
use log::{debug, warn};

/// Maps `length` bytes of `file` starting at `offset` to user address
/// `addr`. Pages are loaded lazily; bytes past the end of the file read as
/// zero and are never written back.
///
/// Returns `addr` on success. On failure nothing is left mapped.
pub fn map_file(
    vm: &VmSystem,
    space: &AddressSpace,
    addr: usize,
    length: usize,
    writable: bool,
    file: &Arc<dyn File>,
    offset: u64,
) -> Result<usize, VmError> {
    let invalid = VmError::InvalidAddress(addr);
    if addr == 0 || !is_page_aligned(addr) || length == 0 || offset % PAGE_FRAME_SIZE as u64 != 0 {
        return Err(invalid);
    }
    let pages = length.div_ceil(PAGE_FRAME_SIZE);
    let span = pages.checked_mul(PAGE_FRAME_SIZE).ok_or(VmError::InvalidAddress(addr))?;
    let last_page = addr.checked_add(span - 1).ok_or(VmError::InvalidAddress(addr))?;
    if is_kernel_address(last_page) || offset.checked_add(span as u64).is_none() {
        return Err(invalid);
    }
    let file_length = file.length();
    if file_length == 0 {
        return Err(invalid);
    }

    let file = file.reopen();
    for i in 0..pages {
        let va = addr + i * PAGE_FRAME_SIZE;
        let page_offset = offset + (i * PAGE_FRAME_SIZE) as u64;
        let in_file = usize::try_from(file_length.saturating_sub(page_offset)).unwrap_or(usize::MAX);
        let read_bytes = min(min(in_file, length - i * PAGE_FRAME_SIZE), PAGE_FRAME_SIZE);
        let backing = FileBacking {
            file: file.clone(),
            offset: page_offset,
            read_bytes,
        };
        let init = Arc::new(SegmentLoader::new(backing.clone()));
        if let Err(err) = space.allocate_lazy(va, writable, PageType::File(backing), Some(init)) {
            for j in 0..i {
                let va = addr + j * PAGE_FRAME_SIZE;
                if let Err(undo) = space.remove(vm, va) {
                    warn!("{:?}: mmap rollback of {va:#x}: {undo}", space.id());
                }
            }
            return Err(err);
        }
    }

    space.spt().insert_region(addr, MmapRegion { file, pages });
    debug!("{:?}: mapped {pages} file pages at {addr:#x}", space.id());
    Ok(addr)
}

/// Undoes the `map_file` that returned `addr`, writing dirty pages back to
/// the file. Does nothing if no mapping starts at `addr`.
pub fn unmap_file(vm: &VmSystem, space: &AddressSpace, addr: usize) {
    let Some(region) = space.spt().take_region(page_round_down(addr)) else {
        return;
    };
    for i in 0..region.pages {
        let va = page_round_down(addr) + i * PAGE_FRAME_SIZE;
        if let Err(err) = space.remove(vm, va) {
            warn!("{:?}: munmap of {va:#x}: {err}", space.id());
        }
    }
    debug!("{:?}: unmapped {} file pages at {addr:#x}", space.id(), region.pages);
}
