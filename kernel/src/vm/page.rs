use super::{anon::AnonPage, file::FilePage, VmError};
use crate::{
    fs::File,
    mem::{FrameId, PageBuf},
    paging::PageManager,
    swapping::SwapSpace,
    sync::mutex::Mutex,
};
use alloc::sync::Arc;
use core::fmt;

/// Fills a freshly allocated frame the first time a lazy page is touched.
pub trait PageInitializer: Send + Sync {
    fn initialize(&self, page: &mut [u8]) -> Result<(), VmError>;
}

/// Where a file-backed page's contents come from.
#[derive(Clone)]
pub struct FileBacking {
    pub file: Arc<dyn File>,
    pub offset: u64,
    /// Bytes read from the file; the rest of the page is zero.
    pub read_bytes: usize,
}

impl fmt::Debug for FileBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBacking")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .finish_non_exhaustive()
    }
}

/// What a page becomes once it is first made resident.
#[derive(Clone, Debug)]
pub enum PageType {
    Anon,
    /// An anonymous page that is part of the user stack.
    Stack,
    File(FileBacking),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageKind {
    Uninit,
    Anon,
    File,
}

pub(super) enum PageState {
    Uninit {
        init: Option<Arc<dyn PageInitializer>>,
        target: PageType,
    },
    Anon(AnonPage),
    File(FilePage),
}

/// One page of a user address space.
pub struct Page {
    va: usize,
    writable: bool,
    pub(super) frame: Option<FrameId>,
    pub(super) state: PageState,
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("va", &format_args!("{:#x}", self.va))
            .field("writable", &self.writable)
            .field("frame", &self.frame)
            .field("kind", &self.kind())
            .finish()
    }
}

impl Page {
    pub(super) fn new(
        va: usize,
        writable: bool,
        target: PageType,
        init: Option<Arc<dyn PageInitializer>>,
    ) -> Self {
        Self {
            va,
            writable,
            frame: None,
            state: PageState::Uninit { init, target },
        }
    }

    pub fn va(&self) -> usize {
        self.va
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn frame(&self) -> Option<FrameId> {
        self.frame
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    /// The page's current variant.
    pub fn kind(&self) -> PageKind {
        match self.state {
            PageState::Uninit { .. } => PageKind::Uninit,
            PageState::Anon(_) => PageKind::Anon,
            PageState::File(_) => PageKind::File,
        }
    }

    /// The kind the page has or will have once materialized.
    pub fn page_type(&self) -> PageKind {
        match &self.state {
            PageState::Uninit {
                target: PageType::File(_),
                ..
            }
            | PageState::File(_) => PageKind::File,
            PageState::Uninit { .. } | PageState::Anon(_) => PageKind::Anon,
        }
    }

    pub fn is_stack(&self) -> bool {
        match &self.state {
            PageState::Uninit { target, .. } => matches!(target, PageType::Stack),
            PageState::Anon(anon) => anon.is_stack(),
            PageState::File(_) => false,
        }
    }

    /// Fills `frame` with the page's contents. An uninitialized page turns
    /// into its target variant and stays uninitialized if that fails.
    pub(super) fn swap_in(&mut self, frame: &mut PageBuf, swap: &SwapSpace) -> Result<(), VmError> {
        match &mut self.state {
            PageState::Uninit { init, target } => {
                let mut state = match target {
                    PageType::Anon => PageState::Anon(AnonPage::new(false)),
                    PageType::Stack => PageState::Anon(AnonPage::new(true)),
                    PageType::File(backing) => PageState::File(FilePage::new(backing.clone())),
                };
                match (init.as_ref(), &mut state) {
                    (Some(init), _) => init.initialize(frame)?,
                    (None, PageState::File(file)) => file.swap_in(frame)?,
                    (None, _) => frame.fill(0),
                }
                self.state = state;
                Ok(())
            }
            PageState::Anon(anon) => anon.swap_in(self.va, frame, swap),
            PageState::File(file) => file.swap_in(frame),
        }
    }

    /// Saves the contents of `frame` and unmaps the page. The mapping is left
    /// in place on failure.
    pub(super) fn swap_out(
        &mut self,
        frame: FrameId,
        memory: &Mutex<PageBuf>,
        page_manager: &Mutex<PageManager>,
        swap: &SwapSpace,
    ) -> Result<(), VmError> {
        match &mut self.state {
            // Never resident, so nothing to save.
            PageState::Uninit { .. } => {
                page_manager.lock().unmap(self.va);
                Ok(())
            }
            PageState::Anon(anon) => anon.swap_out(self.va, self.writable, frame, memory, page_manager, swap),
            PageState::File(file) => file.swap_out(self.va, self.writable, frame, memory, page_manager),
        }
    }

    /// Tears the page down: writes back a dirty file page held in `memory`,
    /// unmaps it and frees its swap slot.
    pub(super) fn destroy(
        self,
        memory: Option<&Mutex<PageBuf>>,
        page_manager: &Mutex<PageManager>,
        swap: &SwapSpace,
    ) -> Result<(), VmError> {
        let result = match (&self.state, memory) {
            (PageState::File(file), Some(memory)) => file.write_back(self.va, memory, page_manager),
            _ => Ok(()),
        };
        page_manager.lock().unmap(self.va);
        match self.state {
            PageState::Uninit { .. } | PageState::File(_) => {}
            PageState::Anon(anon) => anon.destroy(swap),
        }
        result
    }
}
