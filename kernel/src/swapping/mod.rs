pub mod page_replacement;

use crate::{
    block::{BlockDevice, BlockSector, BLOCK_SECTOR_SIZE},
    mem::PageBuf,
    sync::mutex::Mutex,
    vm::VmError,
};
use alloc::boxed::Box;
use kidneyos_vm_shared::{bitmap::Bitmap, mem::SECTORS_PER_PAGE};
use log::{debug, trace};

/// A page-sized slot on the swap device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub fn index(self) -> usize {
        self.0
    }

    #[allow(clippy::cast_possible_truncation)]
    fn first_sector(self) -> BlockSector {
        self.0 as BlockSector * SECTORS_PER_PAGE
    }
}

struct SwapInner {
    /// One bit per slot; set when the slot holds a page.
    used: Bitmap,
    device: Box<dyn BlockDevice>,
}

/// Page-granular storage on a block device for anonymous pages that have
/// been evicted from memory.
pub struct SwapSpace {
    inner: Mutex<SwapInner>,
}

impl SwapSpace {
    /// Takes over `device`. Trailing sectors that do not fill a whole page are
    /// left unused.
    pub fn new(device: Box<dyn BlockDevice>) -> Self {
        let slots = (device.size() / SECTORS_PER_PAGE) as usize;
        debug!("swap: {slots} slots");
        Self {
            inner: Mutex::new(SwapInner {
                used: Bitmap::new(slots),
                device,
            }),
        }
    }

    /// Number of pages the device can hold.
    pub fn capacity(&self) -> usize {
        self.inner.lock().used.len()
    }

    pub fn used_slots(&self) -> usize {
        self.inner.lock().used.count(true)
    }

    pub fn is_used(&self, slot: SwapSlot) -> bool {
        self.inner.lock().used.get(slot.0)
    }

    /// Writes `page` to a free slot and claims the slot. The slot stays free
    /// if the write fails.
    pub fn swap_out(&self, page: &PageBuf) -> Result<SwapSlot, VmError> {
        let mut inner = self.inner.lock();
        let slot = inner.used.scan_and_flip(0, false).map(SwapSlot).ok_or(VmError::SwapExhausted)?;
        if let Err(err) = write_page(inner.device.as_mut(), slot, page) {
            inner.used.set(slot.0, false);
            return Err(err);
        }
        trace!("swap: wrote {slot:?}");
        Ok(slot)
    }

    /// Reads `slot` into `page` and frees the slot.
    pub fn swap_in(&self, slot: SwapSlot, page: &mut PageBuf) -> Result<(), VmError> {
        let mut inner = self.inner.lock();
        read_page(inner.device.as_mut(), slot, page)?;
        inner.used.set(slot.0, false);
        trace!("swap: read {slot:?}");
        Ok(())
    }

    /// Reads `slot` into `page` without freeing it.
    pub fn read_slot(&self, slot: SwapSlot, page: &mut PageBuf) -> Result<(), VmError> {
        let mut inner = self.inner.lock();
        read_page(inner.device.as_mut(), slot, page)
    }

    pub fn free(&self, slot: SwapSlot) {
        self.inner.lock().used.set(slot.0, false);
    }
}

/// Reads the `SECTORS_PER_PAGE` consecutive sectors of `slot` into `page`.
pub fn read_page(device: &mut dyn BlockDevice, slot: SwapSlot, page: &mut PageBuf) -> Result<(), VmError> {
    let mut sector = slot.first_sector();
    for chunk in page.chunks_exact_mut(BLOCK_SECTOR_SIZE) {
        device.read(sector, chunk)?;
        sector += 1;
    }
    Ok(())
}

/// Writes `page` to the `SECTORS_PER_PAGE` consecutive sectors of `slot`.
pub fn write_page(device: &mut dyn BlockDevice, slot: SwapSlot, page: &PageBuf) -> Result<(), VmError> {
    let mut sector = slot.first_sector();
    for chunk in page.chunks_exact(BLOCK_SECTOR_SIZE) {
        device.write(sector, chunk)?;
        sector += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block::{BlockError, RamDisk},
        vm::IoError,
    };

    fn filled(byte: u8) -> PageBuf {
        let mut page = PageBuf::zeroed();
        page.fill(byte);
        page
    }

    #[test]
    fn capacity_ignores_partial_pages() {
        let swap = SwapSpace::new(Box::new(RamDisk::new(SECTORS_PER_PAGE * 3 + 5)));
        assert_eq!(swap.capacity(), 3);
        assert_eq!(swap.used_slots(), 0);
    }

    #[test]
    fn swap_in_frees_slot() {
        let swap = SwapSpace::new(Box::new(RamDisk::new(SECTORS_PER_PAGE * 2)));
        let slot = swap.swap_out(&filled(0x5a)).unwrap();
        assert!(swap.is_used(slot));

        let mut page = PageBuf::zeroed();
        swap.swap_in(slot, &mut page).unwrap();
        assert!(page.iter().all(|&b| b == 0x5a));
        assert!(!swap.is_used(slot));
        assert_eq!(swap.used_slots(), 0);
    }

    #[test]
    fn read_slot_keeps_slot() {
        let swap = SwapSpace::new(Box::new(RamDisk::new(SECTORS_PER_PAGE)));
        let slot = swap.swap_out(&filled(1)).unwrap();
        let mut page = PageBuf::zeroed();
        swap.read_slot(slot, &mut page).unwrap();
        assert_eq!(page[0], 1);
        assert!(swap.is_used(slot));
        swap.free(slot);
        assert!(!swap.is_used(slot));
    }

    #[test]
    fn exhaustion() {
        let swap = SwapSpace::new(Box::new(RamDisk::new(SECTORS_PER_PAGE * 2)));
        let a = swap.swap_out(&filled(1)).unwrap();
        let b = swap.swap_out(&filled(2)).unwrap();
        assert_ne!(a, b);
        assert!(matches!(swap.swap_out(&filled(3)), Err(VmError::SwapExhausted)));

        swap.free(a);
        assert_eq!(swap.swap_out(&filled(3)).unwrap(), a);
    }

    struct FailingDisk;

    impl BlockDevice for FailingDisk {
        fn read(&mut self, _: BlockSector, _: &mut [u8]) -> Result<(), BlockError> {
            Err(BlockError::ReadError)
        }

        fn write(&mut self, _: BlockSector, _: &[u8]) -> Result<(), BlockError> {
            Err(BlockError::WriteError)
        }

        fn size(&self) -> BlockSector {
            SECTORS_PER_PAGE
        }
    }

    #[test]
    fn failed_write_leaves_slot_free() {
        let swap = SwapSpace::new(Box::new(FailingDisk));
        assert!(matches!(
            swap.swap_out(&filled(1)),
            Err(VmError::Io(IoError::Device(BlockError::WriteError)))
        ));
        assert_eq!(swap.used_slots(), 0);
    }
}
