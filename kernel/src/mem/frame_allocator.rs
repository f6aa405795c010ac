mod placement_algorithms;

use crate::mem::FrameId;
use alloc::{boxed::Box, vec};
use bitbybit::bitfield;
use placement_algorithms::{NextFit, PlacementAlgorithm};

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    /// Allocated but not yet bound to a page, or temporarily held by a caller
    /// that is reading or tearing down its contents. Pinned frames are never
    /// chosen for eviction.
    #[bit(1, rw)]
    pinned: bool,
}

/// The fixed pool of frames handed out to user pages.
pub struct UserPool {
    core_map: Box<[CoreMapEntry]>,
    placement_algorithm: NextFit,
    frames_allocated: usize,
}

impl UserPool {
    pub fn new(num_frames: usize) -> Self {
        Self {
            core_map: vec![CoreMapEntry::DEFAULT; num_frames].into_boxed_slice(),
            placement_algorithm: NextFit::default(),
            frames_allocated: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.core_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.core_map.is_empty()
    }

    pub fn free_frames(&self) -> usize {
        self.core_map.len() - self.frames_allocated
    }

    /// Allocates one frame. The frame comes back pinned.
    pub fn alloc(&mut self) -> Option<FrameId> {
        let idx = self.placement_algorithm.place(&self.core_map)?;
        debug_assert!(!self.core_map[idx].allocated());
        self.core_map[idx] = CoreMapEntry::DEFAULT.with_allocated(true).with_pinned(true);
        self.frames_allocated += 1;
        Some(FrameId(idx))
    }

    /// Returns `frame` to the pool.
    pub fn dealloc(&mut self, frame: FrameId) {
        let entry = &mut self.core_map[frame.0];
        assert!(entry.allocated(), "double free of {frame:?}");
        *entry = CoreMapEntry::DEFAULT;
        self.frames_allocated -= 1;
    }

    pub fn is_pinned(&self, frame: FrameId) -> bool {
        self.core_map[frame.0].pinned()
    }

    pub fn set_pinned(&mut self, frame: FrameId, pinned: bool) {
        let entry = &mut self.core_map[frame.0];
        assert!(entry.allocated(), "pinning free {frame:?}");
        *entry = entry.with_pinned(pinned);
    }
}
