use std::sync::Arc;

use mem::{bytes_to_pgoff, AccessType, Addr, AddrRange, PgOff};

use crate::VmaOps;

#[derive(Debug, Clone, Copy, Default)]
pub struct VmFlags {
    pub perms: AccessType,
    pub shared: bool,
    /// Stack-style mapping that may extend downward.
    pub grows_down: bool,
    /// Access pattern hint: disables readahead for this mapping.
    pub rand_read: bool,
}

impl VmFlags {
    pub fn private(perms: AccessType) -> Self {
        Self {
            perms,
            shared: false,
            grows_down: false,
            rand_read: false,
        }
    }
}

/// One contiguous region of address space with uniform permissions and
/// backing. Owned by the address space that created it; the allocator keeps
/// only a weak back-reference for reverse lookup.
pub struct VmArea {
    range: AddrRange,
    flags: VmFlags,
    /// Page offset of `range.start` within the backing object.
    pgoff: PgOff,
    ops: Arc<dyn VmaOps>,
}

impl std::fmt::Debug for VmArea {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmArea")
            .field("range", &self.range)
            .field("flags", &self.flags)
            .field("pgoff", &self.pgoff)
            .finish()
    }
}

impl VmArea {
    pub fn new(range: AddrRange, flags: VmFlags, pgoff: PgOff, ops: Arc<dyn VmaOps>) -> Self {
        debug_assert!(Addr(range.start).is_page_aligned() && Addr(range.end).is_page_aligned());
        Self {
            range,
            flags,
            pgoff,
            ops,
        }
    }

    pub fn range(&self) -> AddrRange {
        self.range
    }

    pub fn flags(&self) -> VmFlags {
        self.flags
    }

    pub fn ops(&self) -> &Arc<dyn VmaOps> {
        &self.ops
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.range.contains(addr)
    }

    /// Backing-object page offset for a virtual address inside this area.
    pub fn pgoff_of(&self, addr: u64) -> PgOff {
        debug_assert!(self.contains(addr));
        self.pgoff + bytes_to_pgoff(addr - self.range.start)
    }

    /// Virtual page address mapping the given backing-object offset.
    pub fn addr_of(&self, pgoff: PgOff) -> Addr {
        debug_assert!(pgoff >= self.pgoff);
        Addr(self.range.start + ((pgoff - self.pgoff) << mem::PAGE_SHIFT))
    }

    /// Whether this area's permissions cover the attempted access.
    pub fn check_access(&self, access: AccessType) -> bool {
        self.flags.perms.is_superset_of(access)
    }
}
