//! A process's user address space: its supplemental page table, its page
//! tables and its stack bookkeeping.
//!
//! Lock order is frame table, then supplemental page table, then page
//! manager, then frame contents, then swap. Nothing here calls into the
//! frame table while holding the supplemental page table lock, because
//! eviction takes the frame table lock first and then the victim's page
//! table.

use super::{
    fault::{handle_fault, TrapFrame},
    page::{Page, PageInitializer, PageType},
    spt::SupplementalPageTable,
    VmError, VmSystem,
};
use crate::{
    mem::{FrameId, Owner, PageBuf},
    paging::PageManager,
    swapping::SwapSpace,
    sync::mutex::{Mutex, MutexGuard},
};
use alloc::sync::{Arc, Weak};
use core::{
    cmp::min,
    fmt,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};
use kidneyos_vm_shared::mem::{is_kernel_address, page_offset, page_round_down, PAGE_FRAME_SIZE, USER_STACK_TOP};
use log::{trace, warn};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressSpaceId(u64);

impl fmt::Debug for AddressSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "as#{}", self.0)
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub struct AddressSpace {
    id: AddressSpaceId,
    this: Weak<AddressSpace>,
    spt: Mutex<SupplementalPageTable>,
    page_manager: Mutex<PageManager>,
    /// Lowest address of the stack pages created so far.
    stack_bottom: AtomicUsize,
    /// User `esp` saved on entry to the kernel, for faults taken in kernel
    /// mode on behalf of the process.
    user_esp: AtomicUsize,
}

impl AddressSpace {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: AddressSpaceId(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            this: this.clone(),
            spt: Mutex::new(SupplementalPageTable::new()),
            page_manager: Mutex::new(PageManager::new()),
            stack_bottom: AtomicUsize::new(USER_STACK_TOP),
            user_esp: AtomicUsize::new(USER_STACK_TOP),
        })
    }

    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    pub fn spt(&self) -> MutexGuard<SupplementalPageTable> {
        self.spt.lock()
    }

    pub fn page_manager(&self) -> MutexGuard<PageManager> {
        self.page_manager.lock()
    }

    pub fn stack_bottom(&self) -> usize {
        self.stack_bottom.load(Ordering::Acquire)
    }

    pub(super) fn set_stack_bottom(&self, bottom: usize) {
        self.stack_bottom.store(bottom, Ordering::Release);
    }

    /// Records the user stack pointer at a user-to-kernel transition.
    pub fn save_user_stack_pointer(&self, esp: usize) {
        self.user_esp.store(esp, Ordering::Release);
    }

    pub fn saved_user_stack_pointer(&self) -> usize {
        self.user_esp.load(Ordering::Acquire)
    }

    pub(crate) fn owner(&self, va: usize) -> Owner {
        Owner {
            space: self.this.clone(),
            space_id: self.id,
            va,
        }
    }

    /// Registers a lazily loaded page at `va`. Nothing is read or allocated
    /// until the page is first touched.
    pub fn allocate_lazy(
        &self,
        va: usize,
        writable: bool,
        ty: PageType,
        init: Option<Arc<dyn PageInitializer>>,
    ) -> Result<(), VmError> {
        if is_kernel_address(va) {
            return Err(VmError::InvalidAddress(va));
        }
        let va = page_round_down(va);
        trace!("{:?}: lazy {ty:?} page at {va:#x}", self.id);
        self.spt.lock().insert(Page::new(va, writable, ty, init))
    }

    /// Makes the page containing `va` resident. Succeeds immediately if it
    /// already is.
    pub fn claim(&self, vm: &VmSystem, va: usize) -> Result<(), VmError> {
        let va = page_round_down(va);
        match self.spt.lock().find(va) {
            None => return Err(VmError::InvalidAddress(va)),
            Some(page) if page.is_resident() => return Ok(()),
            Some(_) => {}
        }

        let frame = vm.frames.acquire(&vm.swap)?;
        match self.fill_frame(vm, va, frame) {
            Ok(true) => {
                vm.frames.install(frame, self.owner(va));
                Ok(())
            }
            Ok(false) => {
                vm.frames.release(frame);
                Ok(())
            }
            Err(err) => {
                vm.frames.release(frame);
                Err(err)
            }
        }
    }

    /// Maps `frame` at `va` and loads the page into it. Returns false if the
    /// page became resident in the meantime and `frame` went unused.
    fn fill_frame(&self, vm: &VmSystem, va: usize, frame: FrameId) -> Result<bool, VmError> {
        let mut spt = self.spt.lock();
        let page = spt.find_mut(va).ok_or(VmError::InvalidAddress(va))?;
        if page.is_resident() {
            return Ok(false);
        }
        if !self.page_manager.lock().map(va, frame, page.writable()) {
            return Err(VmError::InvalidAddress(va));
        }

        let result = page.swap_in(&mut vm.frames.frame(frame).lock(), &vm.swap);
        match result {
            Ok(()) => {
                page.frame = Some(frame);
                trace!("{:?}: {va:#x} resident in {frame:?}", self.id);
                Ok(true)
            }
            Err(err) => {
                self.page_manager.lock().unmap(va);
                Err(err)
            }
        }
    }

    /// Pins the frame behind `va`, if the page is resident.
    pub(super) fn pin_resident(&self, vm: &VmSystem, va: usize) -> Option<FrameId> {
        loop {
            let frame = self.spt.lock().find(va)?.frame()?;
            if vm.frames.pin(frame, self.id, va) {
                return Some(frame);
            }
            // Evicted between the lookup and the pin; look again.
        }
    }

    /// Removes the page containing `va`: writes back a dirty file page,
    /// unmaps it and releases its frame and swap slot.
    pub fn remove(&self, vm: &VmSystem, va: usize) -> Result<(), VmError> {
        let va = page_round_down(va);
        let frame = self.pin_resident(vm, va);
        let Some(mut page) = self.spt.lock().take(va) else {
            return Err(VmError::InvalidAddress(va));
        };
        page.frame = None;
        let result = page.destroy(frame.map(|f| vm.frames.frame(f)), &self.page_manager, &vm.swap);
        if let Some(frame) = frame {
            vm.frames.release(frame);
        }
        trace!("{:?}: removed {va:#x}", self.id);
        result
    }

    /// Removes every page and mapping. Dirty file pages are written back.
    pub fn destroy(&self, vm: &VmSystem) {
        let addresses = self.spt.lock().addresses();
        for va in addresses {
            if let Err(err) = self.remove(vm, va) {
                warn!("{:?}: while destroying {va:#x}: {err}", self.id);
            }
        }
        self.spt.lock().take_regions();
        self.set_stack_bottom(USER_STACK_TOP);
    }

    /// Saves the page at `va` out of `frame` so the frame can be reused.
    /// Called by eviction with the frame table locked.
    pub(crate) fn evict_page(
        &self,
        va: usize,
        frame: FrameId,
        memory: &Mutex<PageBuf>,
        swap: &SwapSpace,
    ) -> Result<(), VmError> {
        let mut spt = self.spt.lock();
        let Some(page) = spt.find_mut(va).filter(|page| page.frame() == Some(frame)) else {
            warn!("{:?}: {frame:?} is not the frame of {va:#x}", self.id);
            let mut page_manager = self.page_manager.lock();
            if page_manager.lookup(va) == Some(frame) {
                page_manager.unmap(va);
            }
            return Ok(());
        };
        page.swap_out(frame, memory, &self.page_manager, swap)?;
        page.frame = None;
        Ok(())
    }

    /// Copies `buf.len()` bytes out of user memory at `va`, faulting pages in
    /// as the process itself would.
    pub fn read_user(&self, vm: &VmSystem, va: usize, buf: &mut [u8]) -> Result<(), VmError> {
        let mut done = 0;
        self.for_each_user_chunk(vm, va, buf.len(), false, |bytes| {
            buf[done..done + bytes.len()].copy_from_slice(bytes);
            done += bytes.len();
        })
    }

    /// Copies `data` into user memory at `va`, faulting pages in and marking
    /// them dirty as the process itself would.
    pub fn write_user(&self, vm: &VmSystem, va: usize, data: &[u8]) -> Result<(), VmError> {
        let mut done = 0;
        self.for_each_user_chunk(vm, va, data.len(), true, |bytes| {
            bytes.copy_from_slice(&data[done..done + bytes.len()]);
            done += bytes.len();
        })
    }

    fn for_each_user_chunk<F>(&self, vm: &VmSystem, va: usize, len: usize, write: bool, mut op: F) -> Result<(), VmError>
    where
        F: FnMut(&mut [u8]),
    {
        let end = va.checked_add(len).ok_or(VmError::InvalidAddress(va))?;
        let mut addr = va;
        while addr < end {
            let offset = page_offset(addr);
            let chunk = min(end - addr, PAGE_FRAME_SIZE - offset);
            self.access_page(vm, addr, write, |page| op(&mut page[offset..offset + chunk]))?;
            addr += chunk;
        }
        Ok(())
    }

    /// Runs `op` on the frame behind `addr` with the page manager locked, so
    /// the frame cannot be evicted underneath it. Faults the page in first if
    /// needed.
    fn access_page<F>(&self, vm: &VmSystem, addr: usize, write: bool, mut op: F) -> Result<(), VmError>
    where
        F: FnMut(&mut PageBuf),
    {
        loop {
            let code = {
                let mut page_manager = self.page_manager.lock();
                match page_manager.access(addr, write, true) {
                    Ok(frame) => {
                        let mut memory = vm.frames.frame(frame).lock();
                        op(&mut *memory);
                        return Ok(());
                    }
                    Err(code) => code,
                }
            };
            let frame = TrapFrame {
                esp: self.saved_user_stack_pointer(),
            };
            if !handle_fault(vm, self, &frame, addr, true, write, code.not_present()) {
                return Err(VmError::InvalidAddress(addr));
            }
        }
    }
}
