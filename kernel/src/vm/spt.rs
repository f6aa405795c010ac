use super::{page::Page, VmError};
use crate::fs::File;
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use kidneyos_vm_shared::mem::page_round_down;

/// A file mapping created by `mmap`.
#[derive(Clone)]
pub struct MmapRegion {
    /// Handle opened for this mapping, independent of the caller's.
    pub file: Arc<dyn File>,
    pub pages: usize,
}

/// Every user page of one address space, keyed by page address.
#[derive(Default)]
pub struct SupplementalPageTable {
    pages: BTreeMap<usize, Page>,
    regions: BTreeMap<usize, MmapRegion>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn insert(&mut self, page: Page) -> Result<(), VmError> {
        let va = page.va();
        if self.pages.contains_key(&va) {
            return Err(VmError::DuplicatePage(va));
        }
        self.pages.insert(va, page);
        Ok(())
    }

    /// The page containing `va`.
    pub fn find(&self, va: usize) -> Option<&Page> {
        self.pages.get(&page_round_down(va))
    }

    pub fn find_mut(&mut self, va: usize) -> Option<&mut Page> {
        self.pages.get_mut(&page_round_down(va))
    }

    pub(super) fn take(&mut self, va: usize) -> Option<Page> {
        self.pages.remove(&page_round_down(va))
    }

    pub fn pages(&self) -> impl Iterator<Item = &Page> {
        self.pages.values()
    }

    pub fn addresses(&self) -> Vec<usize> {
        self.pages.keys().copied().collect()
    }

    pub fn region(&self, start: usize) -> Option<&MmapRegion> {
        self.regions.get(&start)
    }

    pub fn regions(&self) -> impl Iterator<Item = (usize, &MmapRegion)> {
        self.regions.iter().map(|(&start, region)| (start, region))
    }

    pub(super) fn insert_region(&mut self, start: usize, region: MmapRegion) {
        self.regions.insert(start, region);
    }

    pub(super) fn take_region(&mut self, start: usize) -> Option<MmapRegion> {
        self.regions.remove(&start)
    }

    pub(super) fn take_regions(&mut self) -> BTreeMap<usize, MmapRegion> {
        core::mem::take(&mut self.regions)
    }
}
