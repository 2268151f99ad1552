use std::sync::{Arc, Mutex};

use mem::PgOff;
use memmap::{VmFault, VmFaultResult, VmaOps};
use pagecache::{AddressSpace, FindOpts, Page};
use readahead::{ReadaheadState, DEFAULT_RA_PAGES};

/// File-backed fault operations over a page cache and a readahead state.
///
/// `fault` is the per-access state machine: bounds check, lookup, lock or
/// retry, truncation recheck, populate, bounds recheck under lock, then
/// hand the locked uptodate page up for installation.
pub struct FileMapping {
    mapping: Arc<AddressSpace>,
    ra: Mutex<ReadaheadState>,
}

impl FileMapping {
    pub fn new(mapping: Arc<AddressSpace>) -> Self {
        Self::with_ra_pages(mapping, DEFAULT_RA_PAGES)
    }

    pub fn with_ra_pages(mapping: Arc<AddressSpace>, ra_pages: u64) -> Self {
        Self {
            mapping,
            ra: Mutex::new(ReadaheadState::new(ra_pages)),
        }
    }

    pub fn mapping(&self) -> &Arc<AddressSpace> {
        &self.mapping
    }

    // Takes the page lock, or reports that the caller should back off and
    // re-enter the whole fault. A first-attempt fault whose caller can
    // tolerate a retry waits for the lock without holding it, then retries
    // from scratch: the world may have changed while it slept.
    fn lock_page_or_retry(&self, page: &Page, vmf: &VmFault<'_>) -> bool {
        if page.try_lock() {
            return true;
        }
        if vmf.flags.allow_retry && !vmf.flags.tried {
            page.wait_unlocked();
            return false;
        }
        page.lock();
        true
    }
}

impl VmaOps for FileMapping {
    fn fault(&self, vmf: &VmFault<'_>) -> VmFaultResult {
        let mapping = &self.mapping;
        if vmf.pgoff >= mapping.page_limit() {
            return VmFaultResult::SigBus;
        }
        let mut major = false;
        let mut retried_io = false;
        loop {
            let page = match mapping.lookup(vmf.pgoff) {
                Some(page) => {
                    if !vmf.flags.tried
                        && !vmf.vma.flags().rand_read
                        && page.is_readahead()
                    {
                        self.ra
                            .lock()
                            .unwrap()
                            .async_readahead(mapping, &page, vmf.pgoff, 1);
                    }
                    if !self.lock_page_or_retry(&page, vmf) {
                        return VmFaultResult::Retry;
                    }
                    page
                }
                None => {
                    // First access to this offset: backing I/O is needed.
                    major = true;
                    if !vmf.vma.flags().rand_read {
                        self.ra.lock().unwrap().readaround(mapping, vmf.pgoff);
                    }
                    match mapping.get_or_create(vmf.pgoff, FindOpts::create_locked()) {
                        Ok(Some(page)) => page,
                        _ => return VmFaultResult::Oom,
                    }
                }
            };

            // A truncation may have unbound the page while we were taking
            // its lock; start over against the current cache contents.
            if !page.mapping_is(mapping) {
                page.unlock();
                continue;
            }

            if !page.is_uptodate() {
                page.test_and_clear_error();
                if mapping.backing().read_page(&page).is_err() {
                    page.unlock();
                    return VmFaultResult::SigBus;
                }
                match page.wait_uptodate() {
                    // The completion released the lock; go around to
                    // reacquire it and re-validate.
                    Ok(()) => continue,
                    Err(_) => {
                        if retried_io {
                            return VmFaultResult::SigBus;
                        }
                        retried_io = true;
                        continue;
                    }
                }
            }

            // The file may have shrunk since the entry check; under the
            // page lock this answer is stable.
            if vmf.pgoff >= mapping.page_limit() {
                page.unlock();
                return VmFaultResult::SigBus;
            }
            return VmFaultResult::Done { page, major };
        }
    }

    fn map_pages(
        &self,
        _vmf: &VmFault<'_>,
        start_pgoff: PgOff,
        end_pgoff: PgOff,
    ) -> Vec<(PgOff, Arc<Page>)> {
        let limit = self.mapping.page_limit();
        let mut out = Vec::new();
        for off in start_pgoff..=end_pgoff {
            if off >= limit {
                break;
            }
            let page = match self.mapping.lookup(off) {
                Some(page) => page,
                // The batch covers a contiguous resident run only.
                None => break,
            };
            if !page.try_lock() {
                break;
            }
            if !page.mapping_is(&self.mapping)
                || !page.is_uptodate()
                || page.is_readahead()
            {
                page.unlock();
                break;
            }
            // Handed over locked; the caller unlocks after installation,
            // which keeps eviction from unbinding the page in between.
            out.push((off, page));
        }
        out
    }
}
