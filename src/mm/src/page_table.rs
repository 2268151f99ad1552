use std::sync::Arc;

use mem::{AccessType, Addr, AddrRange, PAGE_SIZE, PAGE_SHIFT};
use pagecache::Page;
use utils::{bail_libc, SysError, SysResult};

pub const PTE_V: u64 = 1 << 0;
pub const PTE_R: u64 = 1 << 1;
pub const PTE_W: u64 = 1 << 2;
pub const PTE_X: u64 = 1 << 3;
pub const PTE_U: u64 = 1 << 4;
pub const PTE_A: u64 = 1 << 6;
pub const PTE_D: u64 = 1 << 7;

/// Sv39 covers 39 bits of virtual address.
const VA_BITS: u32 = 39;
const LEVELS: u32 = 3;
const ENTRIES: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallResult {
    Installed,
    /// A valid entry was already there; it is never overwritten. A
    /// concurrent fault won, which is success for the loser too.
    AlreadyMapped,
}

/// Translation store the fault machine installs into.
pub trait PageTables: Send {
    fn install(
        &mut self,
        addr: Addr,
        page: &Arc<Page>,
        perms: AccessType,
        dirty: bool,
    ) -> SysResult<InstallResult>;

    /// Drops every leaf inside `range`, returning how many were present.
    fn remove(&mut self, range: AddrRange) -> usize;

    fn translate(&self, addr: Addr) -> Option<(Arc<Page>, u64)>;
}

enum Entry {
    Next(Box<Table>),
    Leaf { page: Arc<Page>, bits: u64 },
}

struct Table {
    slots: Vec<Option<Entry>>,
}

impl Table {
    fn new() -> Self {
        Self {
            slots: (0..ENTRIES).map(|_| None).collect(),
        }
    }
}

/// Software model of the RISC-V Sv39 three-level page table: 9-bit virtual
/// page number slices, leaves only at the last level, intermediate tables
/// allocated on demand.
pub struct Sv39PageTables {
    root: Table,
    installed: usize,
}

fn vpn(addr: Addr, level: u32) -> usize {
    ((addr.0 >> (PAGE_SHIFT as u32 + 9 * level)) & 0x1ff) as usize
}

fn leaf_bits(perms: AccessType, dirty: bool) -> u64 {
    let mut bits = PTE_V | PTE_U | PTE_A;
    if perms.read {
        bits |= PTE_R;
    }
    if perms.write {
        bits |= PTE_W;
    }
    if perms.execute {
        bits |= PTE_X;
    }
    if dirty {
        bits |= PTE_D;
    }
    bits
}

impl Sv39PageTables {
    pub fn new() -> Self {
        Self {
            root: Table::new(),
            installed: 0,
        }
    }

    pub fn installed(&self) -> usize {
        self.installed
    }
}

impl Default for Sv39PageTables {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTables for Sv39PageTables {
    fn install(
        &mut self,
        addr: Addr,
        page: &Arc<Page>,
        perms: AccessType,
        dirty: bool,
    ) -> SysResult<InstallResult> {
        if addr.0 >= 1 << VA_BITS {
            bail_libc!(libc::EFAULT);
        }
        let addr = addr.round_down();
        let mut table = &mut self.root;
        for level in (1..LEVELS).rev() {
            let slot = &mut table.slots[vpn(addr, level)];
            table = match slot {
                Some(Entry::Next(next)) => &mut **next,
                Some(Entry::Leaf { .. }) => return Ok(InstallResult::AlreadyMapped),
                None => {
                    *slot = Some(Entry::Next(Box::new(Table::new())));
                    match slot {
                        Some(Entry::Next(next)) => &mut **next,
                        _ => unreachable!(),
                    }
                }
            };
        }
        let slot = &mut table.slots[vpn(addr, 0)];
        if slot.is_some() {
            return Ok(InstallResult::AlreadyMapped);
        }
        *slot = Some(Entry::Leaf {
            page: Arc::clone(page),
            bits: leaf_bits(perms, dirty),
        });
        self.installed += 1;
        Ok(InstallResult::Installed)
    }

    fn remove(&mut self, range: AddrRange) -> usize {
        let mut removed = 0;
        let mut addr = Addr(range.start).round_down();
        while addr.0 < range.end {
            if addr.0 < 1 << VA_BITS {
                let mut table = Some(&mut self.root);
                for level in (1..LEVELS).rev() {
                    table = match table
                        .and_then(|t| t.slots[vpn(addr, level)].as_mut())
                    {
                        Some(Entry::Next(next)) => Some(&mut **next),
                        _ => None,
                    };
                }
                if let Some(t) = table {
                    if t.slots[vpn(addr, 0)].take().is_some() {
                        removed += 1;
                        self.installed -= 1;
                    }
                }
            }
            addr = match addr.add_length(PAGE_SIZE as u64) {
                Some(a) => a,
                None => break,
            };
        }
        removed
    }

    fn translate(&self, addr: Addr) -> Option<(Arc<Page>, u64)> {
        if addr.0 >= 1 << VA_BITS {
            return None;
        }
        let addr = addr.round_down();
        let mut table = &self.root;
        for level in (1..LEVELS).rev() {
            table = match table.slots[vpn(addr, level)].as_ref()? {
                Entry::Next(next) => &**next,
                Entry::Leaf { .. } => return None,
            };
        }
        match table.slots[vpn(addr, 0)].as_ref()? {
            Entry::Leaf { page, bits } => Some((Arc::clone(page), *bits)),
            Entry::Next(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vpn_slicing() {
        struct Test {
            addr: u64,
            level: u32,
            want: usize,
        }
        let tests = [
            Test { addr: 0x0000_0000_1000, level: 0, want: 1 },
            Test { addr: 0x0000_0020_0000, level: 1, want: 1 },
            Test { addr: 0x0000_4000_0000, level: 2, want: 1 },
            Test { addr: 0x1f_ffff_f000, level: 0, want: 0x1ff },
            Test { addr: 0x1f_ffff_f000, level: 1, want: 0x1ff },
        ];
        for test in &tests {
            assert_eq!(
                vpn(Addr(test.addr), test.level),
                test.want,
                "addr {:#x} level {}",
                test.addr,
                test.level
            );
        }
    }

    #[test]
    fn install_then_translate() {
        let mut pt = Sv39PageTables::new();
        let page = Page::new(0);
        let r = pt
            .install(Addr(0x4000_1000), &page, AccessType::read_write(), true)
            .unwrap();
        assert_eq!(r, InstallResult::Installed);
        let (found, bits) = pt.translate(Addr(0x4000_1abc)).unwrap();
        assert!(Arc::ptr_eq(&found, &page));
        assert_eq!(bits & (PTE_V | PTE_R | PTE_W | PTE_D), PTE_V | PTE_R | PTE_W | PTE_D);
        assert_eq!(bits & PTE_X, 0);
        assert_eq!(pt.installed(), 1);
    }

    #[test]
    fn present_entry_is_never_clobbered() {
        let mut pt = Sv39PageTables::new();
        let first = Page::new(0);
        let second = Page::new(0);
        pt.install(Addr(0x1000), &first, AccessType::read(), false)
            .unwrap();
        let r = pt
            .install(Addr(0x1000), &second, AccessType::read_write(), true)
            .unwrap();
        assert_eq!(r, InstallResult::AlreadyMapped);
        let (found, bits) = pt.translate(Addr(0x1000)).unwrap();
        assert!(Arc::ptr_eq(&found, &first));
        assert_eq!(bits & PTE_W, 0);
    }

    #[test]
    fn remove_clears_a_range() {
        let mut pt = Sv39PageTables::new();
        for i in 0..8u64 {
            pt.install(Addr(0x10000 + i * 0x1000), &Page::new(i), AccessType::read(), false)
                .unwrap();
        }
        let removed = pt.remove(AddrRange { start: 0x12000, end: 0x15000 });
        assert_eq!(removed, 3);
        assert!(pt.translate(Addr(0x12000)).is_none());
        assert!(pt.translate(Addr(0x11000)).is_some());
        assert!(pt.translate(Addr(0x15000)).is_some());
        assert_eq!(pt.installed(), 5);
    }

    #[test]
    fn out_of_range_addresses_fault() {
        let mut pt = Sv39PageTables::new();
        let err = pt
            .install(Addr(1 << 39), &Page::new(0), AccessType::read(), false)
            .unwrap_err();
        assert_eq!(err, SysError::new(libc::EFAULT));
        assert!(pt.translate(Addr(1 << 39)).is_none());
    }
}
