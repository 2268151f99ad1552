use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

use mem::{PgOff, PAGE_SIZE};
use utils::{SysError, SysResult};

use crate::AddressSpace;

#[derive(Default)]
struct PageState {
    locked: bool,
    uptodate: bool,
    error: bool,
    referenced: bool,
    readahead: bool,
    dirty: bool,
    mapping: Weak<AddressSpace>,
}

/// One page of cached file content.
///
/// The lock flag serializes content mutation and cache removal; the
/// uptodate flag says the content matches the backing store. Both use the
/// page's condvar rather than polling, so a filler completing from another
/// thread wakes every waiter through [`Page::end_io`]. `Arc` strong counts
/// stand in for the page refcount.
pub struct Page {
    index: PgOff,
    state: Mutex<PageState>,
    cond: Condvar,
    data: Mutex<Vec<u8>>,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.lock().unwrap();
        f.debug_struct("Page")
            .field("index", &self.index)
            .field("locked", &s.locked)
            .field("uptodate", &s.uptodate)
            .field("error", &s.error)
            .finish()
    }
}

impl Page {
    /// A free-standing zeroed page destined for offset `index`.
    pub fn new(index: PgOff) -> Arc<Self> {
        Arc::new(Self {
            index,
            state: Mutex::new(PageState::default()),
            cond: Condvar::new(),
            data: Mutex::new(vec![0; PAGE_SIZE as usize]),
        })
    }

    pub fn index(&self) -> PgOff {
        self.index
    }

    fn state(&self) -> MutexGuard<'_, PageState> {
        self.state.lock().unwrap()
    }

    /// Blocks until the page lock is acquired.
    pub fn lock(&self) {
        let mut s = self.state();
        while s.locked {
            s = self.cond.wait(s).unwrap();
        }
        s.locked = true;
    }

    pub fn try_lock(&self) -> bool {
        let mut s = self.state();
        if s.locked {
            false
        } else {
            s.locked = true;
            true
        }
    }

    pub fn unlock(&self) {
        let mut s = self.state();
        debug_assert!(s.locked);
        s.locked = false;
        drop(s);
        self.cond.notify_all();
    }

    /// Blocks until the lock is released, without taking it.
    pub fn wait_unlocked(&self) {
        let mut s = self.state();
        while s.locked {
            s = self.cond.wait(s).unwrap();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state().locked
    }

    /// Blocks until the page becomes uptodate, or fails with `EIO` if the
    /// fill completed with an error instead.
    pub fn wait_uptodate(&self) -> SysResult<()> {
        let mut s = self.state();
        while !s.uptodate && !s.error {
            s = self.cond.wait(s).unwrap();
        }
        if s.error {
            return Err(SysError::new(libc::EIO));
        }
        Ok(())
    }

    pub fn is_uptodate(&self) -> bool {
        self.state().uptodate
    }

    pub fn set_uptodate(&self) {
        self.state().uptodate = true;
        self.cond.notify_all();
    }

    pub fn has_error(&self) -> bool {
        self.state().error
    }

    /// Clears a recorded fill error, returning whether one was set. The
    /// fault path uses this to retry a failed read once.
    pub fn test_and_clear_error(&self) -> bool {
        let mut s = self.state();
        std::mem::replace(&mut s.error, false)
    }

    pub fn mark_referenced(&self) {
        self.state().referenced = true;
    }

    pub fn is_referenced(&self) -> bool {
        self.state().referenced
    }

    pub fn set_readahead(&self) {
        self.state().readahead = true;
    }

    pub fn is_readahead(&self) -> bool {
        self.state().readahead
    }

    /// Consumes the readahead marker. True exactly once per mark.
    pub fn test_and_clear_readahead(&self) -> bool {
        let mut s = self.state();
        std::mem::replace(&mut s.readahead, false)
    }

    pub fn mark_dirty(&self) {
        self.state().dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.state().dirty
    }

    /// The address space this page is cached in, if it still is. A `None`
    /// from a page that was looked up means a truncation raced us.
    pub fn mapping(&self) -> Option<Arc<AddressSpace>> {
        self.state().mapping.upgrade()
    }

    pub fn mapping_is(&self, mapping: &Arc<AddressSpace>) -> bool {
        match self.state().mapping.upgrade() {
            Some(m) => Arc::ptr_eq(&m, mapping),
            None => false,
        }
    }

    pub(crate) fn set_mapping(&self, mapping: &Arc<AddressSpace>) {
        self.state().mapping = Arc::downgrade(mapping);
    }

    pub(crate) fn clear_mapping(&self) {
        let mut s = self.state();
        s.mapping = Weak::new();
        s.uptodate = false;
        drop(s);
        self.cond.notify_all();
    }

    /// I/O completion. For reads, success marks the page uptodate and
    /// failure records the error with uptodate cleared; either way the page
    /// lock the submitter held is released and waiters wake. Write errors
    /// only record the error flag; the writer observes it and surfaces
    /// `EIO`.
    pub fn end_io(&self, is_write: bool, err: i32) {
        let mut s = self.state();
        if err != 0 {
            logger::warn!(
                "i/o completion with error {} on page {} (write: {})",
                err,
                self.index,
                is_write
            );
            s.error = true;
            if !is_write {
                s.uptodate = false;
            }
        } else if !is_write {
            s.uptodate = true;
        }
        debug_assert!(s.locked);
        s.locked = false;
        drop(s);
        self.cond.notify_all();
    }

    /// Copies page content starting at `offset` within the page.
    pub fn read(&self, offset: usize, dst: &mut [u8]) {
        let data = self.data.lock().unwrap();
        dst.copy_from_slice(&data[offset..offset + dst.len()]);
    }

    /// Overwrites page content starting at `offset`. Callers hold the page
    /// lock.
    pub fn write(&self, offset: usize, src: &[u8]) {
        let mut data = self.data.lock().unwrap();
        data[offset..offset + src.len()].copy_from_slice(src);
    }

    pub fn zero(&self) {
        let mut data = self.data.lock().unwrap();
        data.iter_mut().for_each(|b| *b = 0);
    }
}
