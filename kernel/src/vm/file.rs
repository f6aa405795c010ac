//! Pages backed by a file. Evicted contents are written back to the file if
//! dirty and otherwise simply dropped.

use super::{page::FileBacking, IoError, VmError};
use crate::{
    mem::{FrameId, PageBuf},
    paging::PageManager,
    sync::mutex::Mutex,
};
use core::cmp::min;
use kidneyos_vm_shared::mem::PAGE_FRAME_SIZE;
use log::trace;

pub struct FilePage {
    backing: FileBacking,
}

impl FilePage {
    pub(super) fn new(backing: FileBacking) -> Self {
        Self { backing }
    }

    pub fn backing(&self) -> &FileBacking {
        &self.backing
    }

    fn read_bytes(&self) -> usize {
        min(self.backing.read_bytes, PAGE_FRAME_SIZE)
    }

    pub(super) fn swap_in(&self, frame: &mut PageBuf) -> Result<(), VmError> {
        load(&self.backing, frame)
    }

    pub(super) fn swap_out(
        &self,
        va: usize,
        writable: bool,
        frame: FrameId,
        memory: &Mutex<PageBuf>,
        page_manager: &Mutex<PageManager>,
    ) -> Result<(), VmError> {
        let dirty = {
            let mut page_manager = page_manager.lock();
            let dirty = page_manager.is_dirty(va);
            page_manager.unmap(va);
            dirty
        };
        if !dirty {
            return Ok(());
        }
        self.write(&memory.lock()).inspect_err(|_| {
            let mut page_manager = page_manager.lock();
            page_manager.map(va, frame, writable);
            page_manager.set_dirty(va, true);
        })
    }

    /// Writes the page back if it is dirty and clears the dirty bit. The page
    /// stays mapped.
    pub(super) fn write_back(
        &self,
        va: usize,
        memory: &Mutex<PageBuf>,
        page_manager: &Mutex<PageManager>,
    ) -> Result<(), VmError> {
        if !page_manager.lock().is_dirty(va) {
            return Ok(());
        }
        self.write(&memory.lock())?;
        page_manager.lock().set_dirty(va, false);
        Ok(())
    }

    fn write(&self, frame: &PageBuf) -> Result<(), VmError> {
        let expected = self.read_bytes();
        let actual = self.backing.file.write_at(&frame[..expected], self.backing.offset);
        trace!("wrote {actual} bytes back at offset {}", self.backing.offset);
        if actual != expected {
            return Err(IoError::ShortWrite { expected, actual }.into());
        }
        Ok(())
    }
}

/// Reads `backing.read_bytes` bytes of the file into `frame` and zeroes the
/// rest.
pub(super) fn load(backing: &FileBacking, frame: &mut [u8]) -> Result<(), VmError> {
    let expected = min(backing.read_bytes, PAGE_FRAME_SIZE);
    let actual = backing.file.read_at(&mut frame[..expected], backing.offset);
    if actual != expected {
        return Err(IoError::ShortRead { expected, actual }.into());
    }
    frame[expected..].fill(0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fs::File,
        vm::{map_file, tests::vm_with, AddressSpace, PageKind},
    };
    use alloc::sync::Arc;

    /// A file that reports `length` bytes but only ever returns `available`.
    struct TruncatedFile {
        length: u64,
        available: usize,
    }

    impl File for TruncatedFile {
        fn reopen(&self) -> Arc<dyn File> {
            Arc::new(Self {
                length: self.length,
                available: self.available,
            })
        }

        fn read_at(&self, buf: &mut [u8], _offset: u64) -> usize {
            let n = min(buf.len(), self.available);
            buf[..n].fill(0xaa);
            n
        }

        fn write_at(&self, buf: &[u8], _offset: u64) -> usize {
            buf.len()
        }

        fn length(&self) -> u64 {
            self.length
        }
    }

    #[test]
    fn short_read_leaves_page_unmapped() {
        const ADDR: usize = 0x1000_0000;
        let vm = vm_with(2, 2);
        let space = AddressSpace::new();
        let file: Arc<dyn File> = Arc::new(TruncatedFile {
            length: 100,
            available: 3,
        });
        map_file(&vm, &space, ADDR, 100, true, &file, 0).unwrap();

        assert!(matches!(
            space.claim(&vm, ADDR),
            Err(VmError::Io(IoError::ShortRead {
                expected: 100,
                actual: 3
            }))
        ));
        assert!(!space.page_manager().is_mapped(ADDR));
        assert_eq!(vm.frames().free_frames(), 2);
        assert!(vm.frames().installed().is_empty());

        let spt = space.spt();
        let page = spt.find(ADDR).unwrap();
        assert!(page.frame().is_none());
        assert_eq!(page.kind(), PageKind::Uninit);
    }
}
