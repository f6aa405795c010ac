//! The slice of the file system interface the pager depends on.

use crate::sync::mutex::Mutex;
use alloc::{sync::Arc, vec::Vec};
use core::cmp::min;

/// An open file handle.
///
/// Handles are reference counted; the file is closed when the last `Arc` to
/// the handle is dropped. Reads and writes never change the file's length:
/// a write that runs past end-of-file is truncated.
pub trait File: Send + Sync {
    /// Opens a new handle to the same underlying file. The new handle stays
    /// valid after this one is closed.
    fn reopen(&self) -> Arc<dyn File>;

    /// Reads up to `buf.len()` bytes starting at `offset`, returning the number
    /// of bytes read.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize;

    /// Writes up to `buf.len()` bytes starting at `offset`, returning the
    /// number of bytes written.
    fn write_at(&self, buf: &[u8], offset: u64) -> usize;

    /// Size of the file in bytes.
    fn length(&self) -> u64;
}

/// A file that lives entirely in kernel memory.
pub struct TempFile {
    data: Arc<Mutex<Vec<u8>>>,
}

impl TempFile {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: Arc::new(Mutex::new(data)),
        })
    }

    /// Copy of the file's current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Number of handles, including this one, open on the underlying file.
    pub fn open_handles(&self) -> usize {
        Arc::strong_count(&self.data)
    }

    fn clamp(len: usize, offset: u64, requested: usize) -> Option<(usize, usize)> {
        let start = usize::try_from(offset).ok().filter(|&start| start < len)?;
        Some((start, min(requested, len - start)))
    }
}

impl File for TempFile {
    fn reopen(&self) -> Arc<dyn File> {
        Arc::new(TempFile {
            data: self.data.clone(),
        })
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let data = self.data.lock();
        let Some((start, n)) = Self::clamp(data.len(), offset, buf.len()) else {
            return 0;
        };
        buf[..n].copy_from_slice(&data[start..start + n]);
        n
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> usize {
        let mut data = self.data.lock();
        let Some((start, n)) = Self::clamp(data.len(), offset, buf.len()) else {
            return 0;
        };
        data[start..start + n].copy_from_slice(&buf[..n]);
        n
    }

    fn length(&self) -> u64 {
        self.data.lock().len() as u64
    }
}
