use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use mem::{bytes_to_pgoff, size_in_pages, PgOff};
use utils::{err_libc, SysError, SysResult};

use crate::{BackingStore, Page};

/// Lookup behavior knobs for [`AddressSpace::get_or_create`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FindOpts {
    /// Allocate and insert a fresh page on miss.
    pub create: bool,
    /// Return the page locked.
    pub lock: bool,
    /// Fail with `EAGAIN` instead of sleeping on a contended page lock.
    pub nowait: bool,
}

impl FindOpts {
    pub fn create_locked() -> Self {
        Self {
            create: true,
            lock: true,
            nowait: false,
        }
    }
}

/// Per-file sparse index from page offset to cached page.
///
/// Insertion is atomic fail-if-exists: two racing creators both try, the
/// loser gets `EEXIST`, drops its page and retries the lookup. The index
/// itself never blocks; all sleeping happens on individual page locks.
pub struct AddressSpace {
    backing: Arc<dyn BackingStore>,
    pages: RwLock<HashMap<PgOff, Arc<Page>>>,
    // total successful insertions minus removals
    page_count: AtomicUsize,
    // file size in bytes; shrunk by truncate
    size: AtomicU64,
}

impl AddressSpace {
    pub fn new(backing: Arc<dyn BackingStore>, size: u64) -> Arc<Self> {
        Arc::new(Self {
            backing,
            pages: RwLock::new(HashMap::new()),
            page_count: AtomicUsize::new(0),
            size: AtomicU64::new(size),
        })
    }

    /// File size in bytes.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// One past the last valid page offset.
    pub fn page_limit(&self) -> PgOff {
        size_in_pages(self.size())
    }

    pub fn page_count(&self) -> usize {
        self.page_count.load(Ordering::Relaxed)
    }

    pub fn backing(&self) -> &Arc<dyn BackingStore> {
        &self.backing
    }

    pub fn lookup(&self, offset: PgOff) -> Option<Arc<Page>> {
        self.pages.read().unwrap().get(&offset).cloned()
    }

    /// Binds `page` to this space at `offset`. Fails with `EEXIST` when the
    /// slot is already taken, leaving both the page and the index untouched.
    pub fn insert(self: &Arc<Self>, page: &Arc<Page>, offset: PgOff) -> SysResult<()> {
        debug_assert_eq!(page.index(), offset);
        let mut pages = self.pages.write().unwrap();
        if pages.contains_key(&offset) {
            return Err(SysError::new(libc::EEXIST));
        }
        // The back-reference is set before the slot becomes visible, so any
        // lookup that finds the page also sees its mapping.
        page.set_mapping(self);
        pages.insert(offset, Arc::clone(page));
        self.page_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Lookup with optional creation and locking.
    ///
    /// When a found page's mapping no longer points here after its lock is
    /// taken, a truncation won the race; the page is unlocked and the
    /// lookup restarts. `Ok(None)` only when `opts.create` is unset.
    pub fn get_or_create(
        self: &Arc<Self>,
        offset: PgOff,
        opts: FindOpts,
    ) -> SysResult<Option<Arc<Page>>> {
        loop {
            if let Some(page) = self.lookup(offset) {
                if opts.lock {
                    if opts.nowait {
                        if !page.try_lock() {
                            return err_libc!(libc::EAGAIN);
                        }
                    } else {
                        page.lock();
                    }
                    if !page.mapping_is(self) {
                        page.unlock();
                        continue;
                    }
                }
                page.mark_referenced();
                return Ok(Some(page));
            }
            if !opts.create {
                return Ok(None);
            }
            let page = Page::new(offset);
            if opts.lock {
                // Fresh and unshared, cannot contend.
                page.lock();
            }
            match self.insert(&page, offset) {
                Ok(()) => return Ok(Some(page)),
                Err(e) if e.code() == libc::EEXIST => {
                    // Lost the insertion race; take the winner's page.
                    if opts.lock {
                        page.unlock();
                    }
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The "read this offset, populating on miss" path: returns an uptodate
    /// page, running `filler` under the page lock when needed. A fill
    /// failure is a recoverable `EIO`.
    pub fn read_populate_with<F>(self: &Arc<Self>, offset: PgOff, filler: F) -> SysResult<Arc<Page>>
    where
        F: Fn(&Arc<Page>) -> SysResult<()>,
    {
        let page = self
            .get_or_create(offset, FindOpts::create_locked())?
            .unwrap();
        if page.is_uptodate() {
            page.unlock();
            return Ok(page);
        }
        // A stale error from an earlier failed fill must not mask this
        // attempt's outcome.
        page.test_and_clear_error();
        if let Err(e) = filler(&page) {
            page.unlock();
            return Err(e);
        }
        // The filler owns the lock from here; it unlocks through end_io,
        // which is what wakes this wait.
        page.wait_uptodate()?;
        Ok(page)
    }

    /// [`read_populate_with`](Self::read_populate_with) using the backing
    /// store's reader.
    pub fn read_populate(self: &Arc<Self>, offset: PgOff) -> SysResult<Arc<Page>> {
        let backing = Arc::clone(&self.backing);
        self.read_populate_with(offset, move |page| backing.read_page(page))
    }

    /// Shrinks the file to `new_size` bytes and evicts every whole page past
    /// the new end. Evicted pages keep their content for existing holders
    /// but lose their mapping back-reference, which is how concurrent
    /// lookups detect the race.
    ///
    /// The shrunk size is published before any page is touched, and each
    /// page is unbound only under its page lock. A holder that revalidated
    /// the mapping and the file bounds under the lock therefore finishes
    /// before the page leaves the cache.
    pub fn truncate(&self, new_size: u64) {
        let old = self.size.swap(new_size, Ordering::AcqRel);
        if new_size >= old {
            return;
        }
        let limit = size_in_pages(new_size);
        let evicted: Vec<Arc<Page>> = {
            let pages = self.pages.read().unwrap();
            pages
                .iter()
                .filter(|&(&off, _)| off >= limit)
                .map(|(_, page)| Arc::clone(page))
                .collect()
        };
        for page in evicted {
            page.lock();
            let mut pages = self.pages.write().unwrap();
            // A racing creator may have replaced the slot while we slept
            // on the lock; only the page we snapshotted is ours to evict.
            let current = pages
                .get(&page.index())
                .map_or(false, |cur| Arc::ptr_eq(cur, &page));
            if current {
                pages.remove(&page.index());
                page.clear_mapping();
                self.page_count.fetch_sub(1, Ordering::Relaxed);
            }
            drop(pages);
            page.unlock();
        }
        logger::debug!(
            "truncated to {} bytes ({} pages remain)",
            new_size,
            self.page_count()
        );
    }

    /// Byte offset of `pos` within its page together with the page offset.
    pub fn page_of(pos: u64) -> (PgOff, usize) {
        (bytes_to_pgoff(pos), (pos & (mem::PAGE_SIZE as u64 - 1)) as usize)
    }
}
