use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use mem::{AccessType, Addr, AddrRange, PgOff, PAGE_SIZE};
use memmap::{FaultFlags, VmArea, VmFault, VmFaultResult, VmFlags};
use pagecache::{AddressSpace, Page};
use utils::{bail_libc, SysError, SysResult};
use vmalloc::VmapSpace;

use crate::{AnonMapping, FileMapping, PageTables, Sv39PageTables};

/// Speculative installation window after a successful fault, in pages.
const FAULT_AROUND_PAGES: u64 = 16;

/// What a fault ultimately came to, in architecture-level terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    Done,
    /// The handler slept after dropping the caller's outer lock; re-enter.
    Retry,
    SigBus,
    Oom,
}

#[derive(Default)]
pub struct MmStats {
    faults: AtomicU64,
    major_faults: AtomicU64,
}

impl MmStats {
    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    pub fn major_faults(&self) -> u64 {
        self.major_faults.load(Ordering::Relaxed)
    }
}

/// One address space: the range allocator, the mapping descriptors it
/// resolved, and the translations installed by faults.
///
/// The allocator's allocated ranges carry weak back-references; the strong
/// owner of every [`VmArea`] is this struct, so dropping it tears the whole
/// space down.
pub struct MemoryManager {
    space: Mutex<VmapSpace<Weak<VmArea>>>,
    vmas: Mutex<HashMap<u64, Arc<VmArea>>>,
    tables: Mutex<Box<dyn PageTables>>,
    stats: MmStats,
}

impl MemoryManager {
    pub fn new(start: u64, end: u64) -> Self {
        Self::with_tables(start, end, Box::new(Sv39PageTables::new()))
    }

    pub fn with_tables(start: u64, end: u64, tables: Box<dyn PageTables>) -> Self {
        Self {
            space: Mutex::new(VmapSpace::new(start, end)),
            vmas: Mutex::new(HashMap::new()),
            tables: Mutex::new(tables),
            stats: MmStats::default(),
        }
    }

    pub fn stats(&self) -> &MmStats {
        &self.stats
    }

    /// Maps `len` bytes of `backing` starting at page offset `pgoff`.
    pub fn map_file(
        &self,
        len: u64,
        flags: VmFlags,
        backing: Arc<AddressSpace>,
        pgoff: PgOff,
    ) -> SysResult<AddrRange> {
        let ops = Arc::new(FileMapping::new(backing));
        self.map(len, flags, pgoff, ops)
    }

    /// Reserves `len` bytes of zero-fill anonymous memory. Stack regions
    /// are flagged as growing downward.
    pub fn map_anon(&self, len: u64, perms: AccessType, stack: bool) -> SysResult<AddrRange> {
        let len_aligned = match Addr(len).round_up() {
            Some(a) if a.0 > 0 => a.0,
            _ => bail_libc!(libc::EINVAL),
        };
        let flags = VmFlags {
            perms,
            shared: false,
            grows_down: stack,
            rand_read: false,
        };
        let ops = Arc::new(AnonMapping::new(len_aligned));
        self.map(len, flags, 0, ops)
    }

    fn map(
        &self,
        len: u64,
        flags: VmFlags,
        pgoff: PgOff,
        ops: Arc<dyn memmap::VmaOps>,
    ) -> SysResult<AddrRange> {
        let len = match Addr(len).round_up() {
            Some(a) if a.0 > 0 => a.0,
            _ => bail_libc!(libc::EINVAL),
        };
        let mut space = self.space.lock().unwrap();
        let addr = space.alloc(len, PAGE_SIZE as u64, 1, u64::MAX, Weak::new())?;
        let range = AddrRange {
            start: addr.0,
            end: addr.0 + len,
        };
        let vma = Arc::new(VmArea::new(range, flags, pgoff, ops));
        // Bind the reverse-lookup reference now that the area exists.
        *space.find_mut(addr.0).expect("fresh allocation vanished").1 = Arc::downgrade(&vma);
        drop(space);
        self.vmas.lock().unwrap().insert(range.start, vma);
        logger::debug!("mapped {:?} ({:?})", range, flags.perms);
        Ok(range)
    }

    /// Unmaps a previously mapped range. The range must match a mapping
    /// exactly.
    pub fn unmap(&self, range: AddrRange) -> SysResult<()> {
        let mut vmas = self.vmas.lock().unwrap();
        match vmas.get(&range.start) {
            Some(vma) if vma.range() == range => {}
            _ => bail_libc!(libc::EINVAL),
        }
        self.space.lock().unwrap().free(range)?;
        vmas.remove(&range.start);
        drop(vmas);
        let removed = self.tables.lock().unwrap().remove(range);
        logger::debug!("unmapped {:?}, dropped {} translations", range, removed);
        Ok(())
    }

    /// The mapping covering `addr`, if one exists.
    pub fn find_vma(&self, addr: u64) -> Option<Arc<VmArea>> {
        self.space
            .lock()
            .unwrap()
            .find(addr)
            .and_then(|(_, weak)| weak.upgrade())
    }

    /// Current translation for `addr`, with its entry bits.
    pub fn translate(&self, addr: u64) -> Option<(Arc<Page>, u64)> {
        self.tables.lock().unwrap().translate(Addr(addr))
    }

    /// Handles one fault at `addr` for `access`. A `Retry` verdict from the
    /// mapping's handler is honored once: the second entry carries the
    /// `tried` flag and blocks instead.
    pub fn handle_fault(&self, addr: u64, access: AccessType) -> FaultOutcome {
        let first = FaultFlags {
            allow_retry: true,
            tried: false,
            write: access.write,
        };
        match self.fault_once(addr, access, first) {
            FaultOutcome::Retry => {
                let again = FaultFlags {
                    allow_retry: true,
                    tried: true,
                    write: access.write,
                };
                self.fault_once(addr, access, again)
            }
            outcome => outcome,
        }
    }

    fn fault_once(&self, addr: u64, access: AccessType, flags: FaultFlags) -> FaultOutcome {
        self.stats.faults.fetch_add(1, Ordering::Relaxed);
        let vma = match self.find_vma(addr) {
            Some(vma) => vma,
            None => return FaultOutcome::SigBus,
        };
        if !vma.check_access(access) {
            return FaultOutcome::SigBus;
        }
        let vmf = VmFault {
            vma: &vma,
            address: Addr(addr).round_down(),
            pgoff: vma.pgoff_of(addr),
            flags,
        };
        match vma.ops().fault(&vmf) {
            VmFaultResult::Done { page, major } => {
                if major {
                    self.stats.major_faults.fetch_add(1, Ordering::Relaxed);
                }
                let installed = self.tables.lock().unwrap().install(
                    vmf.address,
                    &page,
                    vma.flags().perms,
                    flags.write,
                );
                if flags.write {
                    page.mark_dirty();
                }
                page.unlock();
                match installed {
                    Ok(_) => {
                        // Installed, or a concurrent fault won; both are done.
                        self.map_around(&vma, &vmf);
                        FaultOutcome::Done
                    }
                    Err(_) => FaultOutcome::SigBus,
                }
            }
            VmFaultResult::Retry => FaultOutcome::Retry,
            VmFaultResult::SigBus => FaultOutcome::SigBus,
            VmFaultResult::Oom => FaultOutcome::Oom,
        }
    }

    // Speculatively installs translations for resident pages just past the
    // faulting one. Failures are ignored; every page here is optional.
    fn map_around(&self, vma: &Arc<VmArea>, vmf: &VmFault<'_>) {
        let last = vma.pgoff_of(vma.range().end - 1);
        let start = vmf.pgoff + 1;
        let end = (vmf.pgoff + FAULT_AROUND_PAGES).min(last);
        if start > end {
            return;
        }
        let batch = vma.ops().map_pages(vmf, start, end);
        if batch.is_empty() {
            return;
        }
        let mut tables = self.tables.lock().unwrap();
        for (off, page) in &batch {
            let _ = tables.install(vma.addr_of(*off), page, vma.flags().perms, false);
            page.unlock();
        }
        logger::debug!("fault-around installed {} pages after {}", batch.len(), vmf.pgoff);
    }

    /// Eagerly faults every page of `range` in. The prefault counterpart of
    /// demand paging, used for locked or latency-sensitive mappings.
    pub fn populate(&self, range: AddrRange, access: AccessType) -> SysResult<()> {
        let mut addr = Addr(range.start).round_down().0;
        while addr < range.end {
            match self.handle_fault(addr, access) {
                FaultOutcome::Done => {}
                FaultOutcome::Retry => bail_libc!(libc::EAGAIN),
                FaultOutcome::SigBus => return Err(SysError::new_bus_error(libc::EFAULT)),
                FaultOutcome::Oom => bail_libc!(libc::ENOMEM),
            }
            addr += PAGE_SIZE as u64;
        }
        Ok(())
    }
}
