//! Mapping descriptors: the [`VmArea`] a fault resolves against, its flag
//! set, and the per-mapping fault operations table.

mod vma;

pub use vma::{VmArea, VmFlags};

use std::sync::Arc;

use mem::{Addr, PgOff};
use pagecache::Page;

/// Everything a mapping's fault handler needs to know about one fault.
pub struct VmFault<'a> {
    pub vma: &'a VmArea,
    /// Faulting address, rounded down to its page.
    pub address: Addr,
    /// Offset of the faulting page within the mapping's backing object.
    pub pgoff: PgOff,
    pub flags: FaultFlags,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FaultFlags {
    /// The caller can tolerate a `Retry` verdict (it holds a droppable
    /// outer lock).
    pub allow_retry: bool,
    /// This fault already retried once; handlers must block instead of
    /// asking for another retry.
    pub tried: bool,
    /// The access that faulted was a write.
    pub write: bool,
}

impl FaultFlags {
    pub fn first_attempt() -> Self {
        Self {
            allow_retry: true,
            tried: false,
            write: false,
        }
    }
}

/// Verdict of a [`VmaOps::fault`] call.
pub enum VmFaultResult {
    /// The page is resident, uptodate, and handed over **locked**; the
    /// caller installs the translation and unlocks. `major` means backing
    /// I/O had to be started.
    Done { page: Arc<Page>, major: bool },
    /// The caller must drop its outer lock and re-enter from scratch.
    Retry,
    SigBus,
    Oom,
}

/// Per-mapping fault operations.
pub trait VmaOps: Send + Sync {
    fn fault(&self, vmf: &VmFault<'_>) -> VmFaultResult;

    /// Batch variant around a fault: every already-resident, uptodate,
    /// non-readahead-marked page in `[start_pgoff, end_pgoff]` whose lock
    /// was free, for speculative installation. Every returned page is held
    /// **locked**; the caller installs its translation and unlocks it.
    /// Purely an optimization; the default offers nothing.
    fn map_pages(
        &self,
        vmf: &VmFault<'_>,
        start_pgoff: PgOff,
        end_pgoff: PgOff,
    ) -> Vec<(PgOff, Arc<Page>)> {
        let (_, _, _) = (vmf, start_pgoff, end_pgoff);
        Vec::new()
    }
}
