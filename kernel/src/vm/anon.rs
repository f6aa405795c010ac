//! Pages with no backing file. Evicted contents go to swap.

use super::VmError;
use crate::{
    mem::{FrameId, PageBuf},
    paging::PageManager,
    swapping::{SwapSlot, SwapSpace},
    sync::mutex::Mutex,
};

pub struct AnonPage {
    /// Set while the page is evicted.
    slot: Option<SwapSlot>,
    stack: bool,
}

impl AnonPage {
    pub(super) fn new(stack: bool) -> Self {
        Self { slot: None, stack }
    }

    pub fn is_stack(&self) -> bool {
        self.stack
    }

    pub fn slot(&self) -> Option<SwapSlot> {
        self.slot
    }

    pub(super) fn swap_in(&mut self, va: usize, frame: &mut PageBuf, swap: &SwapSpace) -> Result<(), VmError> {
        let slot = self.slot.ok_or(VmError::MissingSwapSlot(va))?;
        swap.swap_in(slot, frame)?;
        self.slot = None;
        Ok(())
    }

    pub(super) fn swap_out(
        &mut self,
        va: usize,
        writable: bool,
        frame: FrameId,
        memory: &Mutex<PageBuf>,
        page_manager: &Mutex<PageManager>,
        swap: &SwapSpace,
    ) -> Result<(), VmError> {
        // Unmap first so the process cannot change the page while it is
        // being written out.
        page_manager.lock().unmap(va);
        match swap.swap_out(&memory.lock()) {
            Ok(slot) => {
                self.slot = Some(slot);
                Ok(())
            }
            Err(err) => {
                page_manager.lock().map(va, frame, writable);
                Err(err)
            }
        }
    }

    pub(super) fn destroy(self, swap: &SwapSpace) {
        if let Some(slot) = self.slot {
            swap.free(slot);
        }
    }
}
