//! Virtual address range allocator.
//!
//! A [`VmapSpace`] keeps two parallel indices over one address space: a
//! free-space tree augmented with per-subtree maximum gap size, and an
//! unaugmented tree of allocated ranges carrying a caller tag (typically a
//! weak reference to the owning mapping descriptor, for reverse lookup).
//! Every byte of the managed span is in exactly one tree at all times, and
//! free ranges are maximal: freeing coalesces with address-adjacent free
//! neighbors before reinsertion.

use mem::{Addr, AddrRange};
use utils::{bail_libc, bit::is_power_of_two, SysError, SysResult};
use vmtree::{MaxGap, NoAugment, RangeTree};

/// Address 0 is never handed out; it stays the null sentinel.
pub const VMAP_MIN_ADDR: u64 = 1;

/// How a requested block sits inside the free range that satisfied it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FitType {
    // exactly covers the free range
    Full,
    // starts at the free range's start, ends before its end
    LeftEdge,
    // ends at the free range's end, starts after its start
    RightEdge,
    // strictly interior, leaves a remainder on both sides
    Split,
}

fn classify_fit(free: AddrRange, req: AddrRange) -> FitType {
    debug_assert!(free.is_superset_of(&req));
    match (req.start == free.start, req.end == free.end) {
        (true, true) => FitType::Full,
        (true, false) => FitType::LeftEdge,
        (false, true) => FitType::RightEdge,
        (false, false) => FitType::Split,
    }
}

pub struct VmapSpace<T> {
    free: RangeTree<MaxGap, ()>,
    allocated: RangeTree<NoAugment, T>,
}

impl<T> VmapSpace<T> {
    /// A space with no managed span at all. Allocation fails with a `Busy`
    /// error until [`seed`](Self::seed) is called.
    pub fn empty() -> Self {
        Self {
            free: RangeTree::new(),
            allocated: RangeTree::new(),
        }
    }

    /// A space managing `[start, end)`.
    pub fn new(start: u64, end: u64) -> Self {
        let mut s = Self::empty();
        s.seed(start, end);
        s
    }

    /// Donates `[start, end)` to the free pool. The span must not overlap
    /// anything already managed.
    pub fn seed(&mut self, start: u64, end: u64) {
        let start = start.max(VMAP_MIN_ADDR);
        assert!(start < end, "empty seed span");
        self.free.insert(AddrRange { start, end }, ());
    }

    /// Allocates `size` bytes aligned to `align` (a power of two) from the
    /// lowest-addressed free range inside `[vstart, vend)` that fits.
    pub fn alloc(
        &mut self,
        size: u64,
        align: u64,
        vstart: u64,
        vend: u64,
        tag: T,
    ) -> SysResult<Addr> {
        if size == 0 || !is_power_of_two(align) || vstart >= vend {
            return Err(SysError::new_with_msg(
                libc::EINVAL,
                format!(
                    "bad vmap request: size {:#x} align {:#x} window [{:#x}, {:#x})",
                    size, align, vstart, vend
                ),
            ));
        }
        if self.free.is_empty() && self.allocated.is_empty() {
            return Err(SysError::busy());
        }
        let vstart = vstart.max(VMAP_MIN_ADDR);

        let id = match self.free.find_lowest_match(size, align, vstart) {
            Some(id) => id,
            None => bail_libc!(libc::ENOMEM),
        };
        let free_range = self.free.range(id);
        // find_lowest_match proved the aligned block fits within the range,
        // so neither of these can overflow.
        let start = self
            .free
            .aligned_start(id, align, vstart)
            .ok_or_else(|| SysError::new(libc::ENOMEM))?;
        let end = match start.checked_add(size) {
            Some(end) if end <= vend => end,
            _ => bail_libc!(libc::ENOMEM),
        };
        let req = AddrRange { start, end };

        match classify_fit(free_range, req) {
            FitType::Full => {
                self.free.remove(id);
            }
            FitType::LeftEdge => {
                self.free.adjust_start(id, req.end);
            }
            FitType::RightEdge => {
                self.free.adjust_end(id, req.start);
            }
            FitType::Split => {
                debug_assert!(
                    free_range.can_split_at(req.start) && free_range.can_split_at(req.end)
                );
                // Keep the matched node as the right remainder; the left
                // remainder goes in as a fresh node.
                self.free.adjust_start(id, req.end);
                self.free.insert(
                    AddrRange {
                        start: free_range.start,
                        end: req.start,
                    },
                    (),
                );
            }
        }
        self.allocated.insert(req, tag);
        logger::debug!("vmap alloc {:?} from free range {:?}", req, free_range);
        Ok(Addr(start))
    }

    /// Releases an allocated range and returns its tag. The range must match
    /// an allocation exactly.
    pub fn free(&mut self, range: AddrRange) -> SysResult<T> {
        let id = match self.allocated.find(range.start) {
            Some(id) if self.allocated.range(id) == range => id,
            _ => bail_libc!(libc::EINVAL),
        };
        let (_, tag) = self.allocated.remove(id);
        self.merge_free(range);
        logger::debug!("vmap free {:?}", range);
        Ok(tag)
    }

    // Inserts a range into the free tree, absorbing the address-adjacent
    // free neighbors so no two adjacent free ranges ever coexist.
    fn merge_free(&mut self, range: AddrRange) {
        let mut range = range;
        let next = self.free.first_at_or_after(range.start);
        let prev = match next {
            Some(n) => self.free.prev_of(n),
            None => self.free.last(),
        };
        if let Some(n) = next {
            if self.free.range(n).start == range.end {
                let (r, ()) = self.free.remove(n);
                range.end = r.end;
            }
        }
        if let Some(p) = prev {
            if self.free.range(p).end == range.start {
                // Extending in place keeps the node's list position valid.
                self.free.adjust_end(p, range.end);
                return;
            }
        }
        self.free.insert(range, ());
    }

    /// Reverse lookup: the allocated range containing `addr` and its tag.
    pub fn find(&self, addr: u64) -> Option<(AddrRange, &T)> {
        let id = self.allocated.find(addr)?;
        Some((self.allocated.range(id), self.allocated.value(id)))
    }

    pub fn find_mut(&mut self, addr: u64) -> Option<(AddrRange, &mut T)> {
        let id = self.allocated.find(addr)?;
        Some((self.allocated.range(id), self.allocated.value_mut(id)))
    }

    /// Total free bytes under management.
    pub fn span_free(&self) -> u64 {
        self.free.ranges().iter().map(|r| r.len()).sum()
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }

    /// Free ranges in address order. Test and logging helper.
    pub fn free_ranges(&self) -> Vec<AddrRange> {
        self.free.ranges()
    }
}
