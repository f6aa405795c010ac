//! Lazy loading of executable segments and the initial user stack.

use super::{
    file,
    page::{FileBacking, PageInitializer, PageType},
    AddressSpace, VmError, VmSystem,
};
use crate::fs::File;
use alloc::sync::Arc;
use core::cmp::min;
use kidneyos_vm_shared::mem::{is_page_aligned, PAGE_FRAME_SIZE, USER_STACK_TOP};
use log::{debug, warn};

/// Reads one page worth of a file into a frame on first touch, zero-filling
/// past `read_bytes`.
pub struct SegmentLoader {
    backing: FileBacking,
}

impl SegmentLoader {
    pub fn new(backing: FileBacking) -> Self {
        Self { backing }
    }
}

impl PageInitializer for SegmentLoader {
    fn initialize(&self, page: &mut [u8]) -> Result<(), VmError> {
        file::load(&self.backing, page)
    }
}

/// Registers the pages of a loadable segment: `read_bytes` bytes of `file`
/// from `offset`, followed by `zero_bytes` zeroes, starting at `upage`.
///
/// The pages are anonymous once loaded; changes never reach the file.
pub fn load_segment(
    space: &AddressSpace,
    file: &Arc<dyn File>,
    offset: u64,
    upage: usize,
    read_bytes: usize,
    zero_bytes: usize,
    writable: bool,
) -> Result<(), VmError> {
    let invalid = VmError::InvalidAddress(upage);
    let Some(total) = read_bytes.checked_add(zero_bytes) else {
        return Err(invalid);
    };
    if !is_page_aligned(upage)
        || offset % PAGE_FRAME_SIZE as u64 != 0
        || total % PAGE_FRAME_SIZE != 0
        || offset.checked_add(total as u64).is_none()
    {
        return Err(invalid);
    }

    let mut remaining = read_bytes;
    let pages = total / PAGE_FRAME_SIZE;
    for i in 0..pages {
        let page_read_bytes = min(remaining, PAGE_FRAME_SIZE);
        let backing = FileBacking {
            file: file.clone(),
            offset: offset + (i * PAGE_FRAME_SIZE) as u64,
            read_bytes: page_read_bytes,
        };
        let va = upage + i * PAGE_FRAME_SIZE;
        space.allocate_lazy(va, writable, PageType::Anon, Some(Arc::new(SegmentLoader::new(backing))))?;
        remaining -= page_read_bytes;
    }
    debug!("{:?}: segment of {pages} pages at {upage:#x}", space.id());
    Ok(())
}

/// Creates and claims the first stack page. Returns the initial stack
/// pointer.
pub fn setup_stack(vm: &VmSystem, space: &AddressSpace) -> Result<usize, VmError> {
    let va = USER_STACK_TOP - PAGE_FRAME_SIZE;
    space.allocate_lazy(va, true, PageType::Stack, None)?;
    if let Err(err) = space.claim(vm, va) {
        if let Err(undo) = space.remove(vm, va) {
            warn!("{:?}: stack setup rollback of {va:#x}: {undo}", space.id());
        }
        return Err(err);
    }
    space.set_stack_bottom(va);
    space.save_user_stack_pointer(USER_STACK_TOP);
    Ok(USER_STACK_TOP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fs::TempFile,
        vm::{tests::vm_with, PageKind},
    };
    use alloc::vec;

    #[test]
    fn segment_pages_load_lazily() {
        let vm = vm_with(4, 4);
        let space = AddressSpace::new();
        let file: Arc<dyn File> = TempFile::new(vec![3u8; 2 * PAGE_FRAME_SIZE]);
        let upage = 0x0804_8000;

        load_segment(&space, &file, PAGE_FRAME_SIZE as u64, upage, 100, 2 * PAGE_FRAME_SIZE - 100, false).unwrap();
        assert_eq!(space.spt().len(), 2);
        assert_eq!(space.spt().find(upage).unwrap().kind(), PageKind::Uninit);

        let mut buf = [0u8; 2];
        space.read_user(&vm, upage + 99, &mut buf).unwrap();
        assert_eq!(buf, [3, 0]);
        assert_eq!(space.spt().find(upage).unwrap().kind(), PageKind::Anon);
        assert_eq!(space.spt().find(upage + PAGE_FRAME_SIZE).unwrap().kind(), PageKind::Uninit);

        // Read-only segment.
        assert!(space.write_user(&vm, upage, &[1]).is_err());
    }

    #[test]
    fn segment_rejects_misaligned() {
        let space = AddressSpace::new();
        let file: Arc<dyn File> = TempFile::new(vec![0u8; 16]);
        assert!(load_segment(&space, &file, 0, 0x0804_8001, 16, PAGE_FRAME_SIZE - 16, true).is_err());
        assert!(load_segment(&space, &file, 0, 0x0804_8000, 16, 16, true).is_err());
        assert!(load_segment(&space, &file, 0, 0x0804_8000, usize::MAX, 1, true).is_err());
        let offset = u64::MAX & !(PAGE_FRAME_SIZE as u64 - 1);
        assert!(load_segment(&space, &file, offset, 0x0804_8000, 16, PAGE_FRAME_SIZE - 16, true).is_err());
        assert!(space.spt().is_empty());
    }

    #[test]
    fn stack_setup() {
        let vm = vm_with(2, 2);
        let space = AddressSpace::new();
        assert_eq!(setup_stack(&vm, &space).unwrap(), USER_STACK_TOP);
        assert_eq!(space.stack_bottom(), USER_STACK_TOP - PAGE_FRAME_SIZE);
        assert!(space.page_manager().is_mapped(USER_STACK_TOP - 4));

        space.write_user(&vm, USER_STACK_TOP - 4, &[1, 2, 3, 4]).unwrap();
        assert!(matches!(setup_stack(&vm, &space), Err(VmError::DuplicatePage(_))));
    }
}
