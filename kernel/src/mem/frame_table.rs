//! The global table of user frames and the eviction that refills it.
//!
//! Every allocated frame is either *pinned* (handed to a caller that is
//! filling, reading or tearing it down, and invisible to eviction) or
//! *installed* (owned by a resident page and sitting in the clock list).
//! Frames move between the two states only under the table lock, which is
//! also held for the whole of an eviction, so evictions are serialized.

use crate::{
    mem::{frame_allocator::UserPool, FrameId, PageBuf},
    swapping::{
        page_replacement::{PageReplacementPolicy, SecondChance},
        SwapSpace,
    },
    sync::mutex::Mutex,
    vm::{AddressSpace, AddressSpaceId, VmError},
};
use alloc::{
    boxed::Box,
    collections::VecDeque,
    sync::Weak,
    vec,
    vec::Vec,
};
use log::{debug, trace, warn};

/// The page a frame currently backs.
#[derive(Clone)]
pub struct Owner {
    pub space: Weak<AddressSpace>,
    pub space_id: AddressSpaceId,
    pub va: usize,
}

impl Owner {
    fn is(&self, space_id: AddressSpaceId, va: usize) -> bool {
        self.space_id == space_id && self.va == va
    }
}

struct FrameList {
    pool: UserPool,
    owners: Box<[Option<Owner>]>,
    /// Installed frames, oldest first.
    clock: VecDeque<FrameId>,
    policy: SecondChance,
}

pub struct FrameTable {
    list: Mutex<FrameList>,
    memory: Box<[Mutex<PageBuf>]>,
}

impl FrameTable {
    pub fn new(num_frames: usize) -> Self {
        debug!("frame table: {num_frames} user frames");
        Self {
            list: Mutex::new(FrameList {
                pool: UserPool::new(num_frames),
                owners: vec![None; num_frames].into_boxed_slice(),
                clock: VecDeque::with_capacity(num_frames),
                policy: SecondChance,
            }),
            memory: (0..num_frames).map(|_| Mutex::new(PageBuf::zeroed())).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    pub fn free_frames(&self) -> usize {
        self.list.lock().pool.free_frames()
    }

    /// Frames currently backing resident pages, oldest first.
    pub fn installed(&self) -> Vec<FrameId> {
        self.list.lock().clock.iter().copied().collect()
    }

    /// The contents of `frame`.
    pub fn frame(&self, frame: FrameId) -> &Mutex<PageBuf> {
        &self.memory[frame.0]
    }

    /// Returns the id and page address of the page `frame` backs.
    pub fn owner(&self, frame: FrameId) -> Option<(AddressSpaceId, usize)> {
        self.list.lock().owners[frame.0]
            .as_ref()
            .map(|owner| (owner.space_id, owner.va))
    }

    /// Hands out a zeroed, pinned frame, evicting a resident page if the pool
    /// is empty.
    ///
    /// Callers must not hold any address space's page table lock.
    pub fn acquire(&self, swap: &SwapSpace) -> Result<FrameId, VmError> {
        let mut list = self.list.lock();
        let frame = match list.pool.alloc() {
            Some(frame) => frame,
            None => self.evict(&mut list, swap)?,
        };
        drop(list);

        self.memory[frame.0].lock().zero();
        trace!("acquired {frame:?}");
        Ok(frame)
    }

    /// Binds a pinned frame to the page that now lives in it and makes it
    /// eligible for eviction.
    pub fn install(&self, frame: FrameId, owner: Owner) {
        let mut list = self.list.lock();
        debug_assert!(list.pool.is_pinned(frame));
        list.owners[frame.0] = Some(owner);
        list.pool.set_pinned(frame, false);
        list.clock.push_back(frame);
    }

    /// Pins `frame` if it still backs page `va` of address space `space_id`.
    ///
    /// Once pinned, the frame is unbound from its page and will not be
    /// evicted; the caller must `install` or `release` it.
    pub fn pin(&self, frame: FrameId, space_id: AddressSpaceId, va: usize) -> bool {
        let mut list = self.list.lock();
        let bound = list.owners[frame.0]
            .as_ref()
            .is_some_and(|owner| owner.is(space_id, va));
        if !bound {
            return false;
        }
        list.owners[frame.0] = None;
        list.clock.retain(|&f| f != frame);
        list.pool.set_pinned(frame, true);
        true
    }

    /// Returns a pinned frame to the pool.
    pub fn release(&self, frame: FrameId) {
        let mut list = self.list.lock();
        debug_assert!(list.pool.is_pinned(frame));
        list.pool.dealloc(frame);
        trace!("released {frame:?}");
    }

    /// Reclaims an installed frame. On success the victim page has been
    /// saved and unmapped and the frame comes back pinned.
    fn evict(&self, list: &mut FrameList, swap: &SwapSpace) -> Result<FrameId, VmError> {
        let FrameList {
            pool,
            owners,
            clock,
            policy,
        } = list;

        let victim = policy.select_victim(clock, |frame| {
            let referenced = owners[frame.0].as_ref().is_some_and(Self::take_accessed);
            if referenced {
                trace!("clock: {frame:?} referenced, skipping");
            }
            referenced
        });
        // Everything was referenced; fall back to the oldest frame.
        let frame = victim.or_else(|| clock.pop_front()).ok_or(VmError::AllocationFailure)?;

        let Some(owner) = owners[frame.0].take() else {
            warn!("evict: {frame:?} in the clock list has no owner");
            pool.set_pinned(frame, true);
            return Ok(frame);
        };

        // The owner may already be gone, in which case there is nothing to save.
        if let Some(space) = owner.space.upgrade() {
            if let Err(err) = space.evict_page(owner.va, frame, &self.memory[frame.0], swap) {
                warn!("evict: failed to save {:#x} from {frame:?}: {err}", owner.va);
                owners[frame.0] = Some(owner);
                clock.push_front(frame);
                return Err(err);
            }
        }

        debug!("evicted {:#x} of {:?} from {frame:?}", owner.va, owner.space_id);
        pool.set_pinned(frame, true);
        Ok(frame)
    }

    /// Reads and clears the accessed bit of the page `owner` describes. Pages
    /// whose address space is gone count as unreferenced.
    fn take_accessed(owner: &Owner) -> bool {
        let Some(space) = owner.space.upgrade() else {
            return false;
        };
        let mut page_manager = space.page_manager();
        let accessed = page_manager.is_accessed(owner.va);
        if accessed {
            page_manager.set_accessed(owner.va, false);
        }
        accessed
    }
}
