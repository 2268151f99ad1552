use std::sync::Arc;

use memmap::{VmFault, VmFaultResult, VmaOps};
use pagecache::{AddressSpace, FindOpts, VecBacking};

/// Zero-fill demand paging for anonymous regions (stack, heap,
/// vmalloc-style reservations). Pages live in a private address space over
/// an empty backing store, so repeated faults on one offset converge on the
/// same page.
pub struct AnonMapping {
    mapping: Arc<AddressSpace>,
}

impl AnonMapping {
    pub fn new(len: u64) -> Self {
        Self {
            mapping: AddressSpace::new(VecBacking::new(Vec::new()), len),
        }
    }
}

impl VmaOps for AnonMapping {
    fn fault(&self, vmf: &VmFault<'_>) -> VmFaultResult {
        if vmf.pgoff >= self.mapping.page_limit() {
            return VmFaultResult::SigBus;
        }
        let page = match self.mapping.get_or_create(vmf.pgoff, FindOpts::create_locked()) {
            Ok(Some(page)) => page,
            _ => return VmFaultResult::Oom,
        };
        // Fresh pages come zeroed; that is already the valid content.
        if !page.is_uptodate() {
            page.set_uptodate();
        }
        VmFaultResult::Done { page, major: false }
    }
}
