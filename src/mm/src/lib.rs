//! The memory-management core tied together: mapping creation through the
//! range allocator, per-mapping fault handling over the page cache, and
//! translation installation into software Sv39 page tables.

mod anon;
mod file_mapping;
mod memory_manager;
mod page_table;

pub use anon::AnonMapping;
pub use file_mapping::FileMapping;
pub use memory_manager::{FaultOutcome, MemoryManager, MmStats};
pub use page_table::{
    InstallResult, PageTables, Sv39PageTables, PTE_A, PTE_D, PTE_R, PTE_U, PTE_V, PTE_W, PTE_X,
};

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mem::{AccessType, Addr, AddrRange, PAGE_SIZE};
    use memmap::{FaultFlags, VmArea, VmFault, VmFaultResult, VmaOps, VmFlags};
    use pagecache::{AddressSpace, VecBacking};

    use super::*;

    const PSZ: u64 = PAGE_SIZE as u64;

    fn file_space(pages: usize) -> Arc<AddressSpace> {
        let size = pages * PAGE_SIZE as usize;
        AddressSpace::new(VecBacking::patterned(size), size as u64)
    }

    fn mm() -> MemoryManager {
        MemoryManager::new(0x1000, 1 << 30)
    }

    #[test]
    fn file_fault_installs_translation() {
        let mm = mm();
        let backing = file_space(32);
        let range = mm
            .map_file(8 * PSZ, VmFlags::private(AccessType::read()), Arc::clone(&backing), 0)
            .unwrap();
        let addr = range.start + 2 * PSZ + 0x123;
        assert_eq!(mm.handle_fault(addr, AccessType::read()), FaultOutcome::Done);

        let (page, bits) = mm.translate(addr).unwrap();
        assert_eq!(page.index(), 2);
        assert_ne!(bits & PTE_V, 0);
        assert_ne!(bits & PTE_R, 0);
        assert_eq!(bits & PTE_W, 0);
        // The installed page carries the file's bytes for that offset.
        let mut buf = [0u8; 4];
        page.read(0, &mut buf);
        let base = 2 * PAGE_SIZE as usize;
        let want: Vec<u8> = (base..base + 4).map(|i| (i % 251) as u8).collect();
        assert_eq!(&buf[..], &want[..]);
        assert_eq!(mm.stats().major_faults(), 1);
    }

    #[test]
    fn fault_is_idempotent() {
        let mm = mm();
        let backing = file_space(8);
        let range = mm
            .map_file(4 * PSZ, VmFlags::private(AccessType::read()), backing, 0)
            .unwrap();
        assert_eq!(mm.handle_fault(range.start, AccessType::read()), FaultOutcome::Done);
        let (first, _) = mm.translate(range.start).unwrap();

        assert_eq!(mm.handle_fault(range.start, AccessType::read()), FaultOutcome::Done);
        let (second, _) = mm.translate(range.start).unwrap();
        // The second run found everything in place and changed nothing.
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn permission_violation_is_sigbus() {
        let mm = mm();
        let range = mm
            .map_file(4 * PSZ, VmFlags::private(AccessType::read()), file_space(8), 0)
            .unwrap();
        assert_eq!(
            mm.handle_fault(range.start, AccessType::write()),
            FaultOutcome::SigBus
        );
        assert!(mm.translate(range.start).is_none());
    }

    #[test]
    fn unmapped_address_is_sigbus() {
        let mm = mm();
        assert_eq!(
            mm.handle_fault(0x7000_0000, AccessType::read()),
            FaultOutcome::SigBus
        );
    }

    #[test]
    fn fault_past_eof_is_sigbus() {
        // The mapping is longer than the file; touching the tail faults.
        let mm = mm();
        let range = mm
            .map_file(8 * PSZ, VmFlags::private(AccessType::read()), file_space(4), 0)
            .unwrap();
        assert_eq!(
            mm.handle_fault(range.start + 6 * PSZ, AccessType::read()),
            FaultOutcome::SigBus
        );
        assert_eq!(
            mm.handle_fault(range.start + 3 * PSZ, AccessType::read()),
            FaultOutcome::Done
        );
    }

    #[test]
    fn truncation_between_faults_is_sigbus() {
        let mm = mm();
        let backing = file_space(8);
        let range = mm
            .map_file(8 * PSZ, VmFlags::private(AccessType::read()), Arc::clone(&backing), 0)
            .unwrap();
        assert_eq!(
            mm.handle_fault(range.start + 5 * PSZ, AccessType::read()),
            FaultOutcome::Done
        );
        backing.truncate(2 * PSZ);
        assert_eq!(
            mm.handle_fault(range.start + 6 * PSZ, AccessType::read()),
            FaultOutcome::SigBus
        );
    }

    #[test]
    fn anon_pages_are_zeroed_and_dirty_on_write() {
        let mm = mm();
        let range = mm
            .map_anon(4 * PSZ, AccessType::read_write(), true)
            .unwrap();
        assert_eq!(
            mm.handle_fault(range.start + PSZ, AccessType::write()),
            FaultOutcome::Done
        );
        let (page, bits) = mm.translate(range.start + PSZ).unwrap();
        assert_ne!(bits & PTE_D, 0);
        assert!(page.is_dirty());
        let mut buf = [0u8; 16];
        page.read(0, &mut buf);
        assert_eq!(buf, [0u8; 16]);
        // No backing I/O for anonymous memory.
        assert_eq!(mm.stats().major_faults(), 0);

        let vma = mm.find_vma(range.start).unwrap();
        assert!(vma.flags().grows_down);
    }

    #[test]
    fn anon_refault_hits_the_same_page() {
        let mm = mm();
        let range = mm.map_anon(PSZ, AccessType::read_write(), false).unwrap();
        assert_eq!(mm.handle_fault(range.start, AccessType::write()), FaultOutcome::Done);
        let (page, _) = mm.translate(range.start).unwrap();
        page.write(0, b"persist");
        mm.unmap(range).unwrap();

        // A fresh mapping gets fresh zero pages, not the old content.
        let range2 = mm.map_anon(PSZ, AccessType::read_write(), false).unwrap();
        assert_eq!(mm.handle_fault(range2.start, AccessType::read()), FaultOutcome::Done);
        let (fresh, _) = mm.translate(range2.start).unwrap();
        assert!(!Arc::ptr_eq(&page, &fresh));
        let mut buf = [0u8; 7];
        fresh.read(0, &mut buf);
        assert_eq!(&buf, b"\0\0\0\0\0\0\0");
    }

    #[test]
    fn unmap_restores_the_space() {
        let mm = mm();
        let mm_free = {
            let r = mm.map_anon(PSZ, AccessType::read(), false).unwrap();
            mm.unmap(r).unwrap();
            // All bytes back in the pool once nothing is mapped.
            mm.find_vma(r.start).map(|_| ()).is_none()
        };
        assert!(mm_free);

        let a = mm.map_anon(4 * PSZ, AccessType::read(), false).unwrap();
        let b = mm
            .map_file(4 * PSZ, VmFlags::private(AccessType::read()), file_space(8), 0)
            .unwrap();
        mm.populate(a, AccessType::read()).unwrap();
        mm.unmap(a).unwrap();
        assert!(mm.find_vma(a.start).is_none());
        assert!(mm.translate(a.start).is_none());
        // The neighbor is untouched.
        assert!(mm.find_vma(b.start).is_some());

        let err = mm.unmap(a).unwrap_err();
        assert_eq!(err.code(), libc::EINVAL);
    }

    #[test]
    fn populate_prefaults_every_page() {
        let mm = mm();
        let range = mm
            .map_file(6 * PSZ, VmFlags::private(AccessType::read()), file_space(16), 0)
            .unwrap();
        mm.populate(range, AccessType::read()).unwrap();
        let mut addr = range.start;
        while addr < range.end {
            assert!(mm.translate(addr).is_some(), "no translation at {:#x}", addr);
            addr += PSZ;
        }
    }

    #[test]
    fn fault_around_installs_resident_neighbors() {
        let mm = mm();
        let backing = file_space(64);
        let range = mm
            .map_file(32 * PSZ, VmFlags::private(AccessType::read()), Arc::clone(&backing), 0)
            .unwrap();
        // One fault; read-around populates the cache and fault-around
        // installs the resident run without further faults.
        assert_eq!(mm.handle_fault(range.start + 8 * PSZ, AccessType::read()), FaultOutcome::Done);
        assert_eq!(mm.stats().faults(), 1);
        let (neighbor, _) = mm.translate(range.start + 9 * PSZ).unwrap();
        assert!(!neighbor.is_locked());
    }

    #[test]
    fn batched_pages_stay_locked_until_installed() {
        let backing = file_space(16);
        for off in 0..6 {
            backing.read_populate(off).unwrap();
        }
        let ops = FileMapping::new(Arc::clone(&backing));
        let vma = VmArea::new(
            AddrRange { start: 0x10000, end: 0x20000 },
            VmFlags::private(AccessType::read()),
            0,
            Arc::new(NeverCalled),
        );
        let vmf = VmFault {
            vma: &vma,
            address: Addr(0x10000),
            pgoff: 0,
            flags: FaultFlags::first_attempt(),
        };
        let batch = ops.map_pages(&vmf, 1, 5);
        assert_eq!(batch.len(), 5);
        // An eviction racing the batch has to wait on these locks until
        // the caller has installed and released each page.
        for (_, page) in &batch {
            assert!(page.is_locked());
        }
        for (_, page) in batch {
            page.unlock();
        }
    }

    #[test]
    fn rand_read_mapping_faults_one_page_at_a_time() {
        let mm = mm();
        let backing = file_space(64);
        let mut flags = VmFlags::private(AccessType::read());
        flags.rand_read = true;
        let range = mm
            .map_file(32 * PSZ, flags, Arc::clone(&backing), 0)
            .unwrap();
        assert_eq!(mm.handle_fault(range.start + 8 * PSZ, AccessType::read()), FaultOutcome::Done);
        // No readahead: exactly the demanded page is cached.
        assert_eq!(backing.page_count(), 1);
    }

    #[test]
    fn file_offset_mappings_translate_through_pgoff() {
        let mm = mm();
        let backing = file_space(32);
        // Map the file starting at its fifth page.
        let range = mm
            .map_file(4 * PSZ, VmFlags::private(AccessType::read()), backing, 5)
            .unwrap();
        assert_eq!(mm.handle_fault(range.start, AccessType::read()), FaultOutcome::Done);
        let (page, _) = mm.translate(range.start).unwrap();
        assert_eq!(page.index(), 5);
    }

    #[test]
    fn locked_page_forces_retry_then_completion() {
        let mm = Arc::new(mm());
        let backing = file_space(8);
        let range = mm
            .map_file(4 * PSZ, VmFlags::private(AccessType::read()), Arc::clone(&backing), 0)
            .unwrap();
        let page = backing.read_populate(0).unwrap();
        page.lock();

        let handle = {
            let mm = Arc::clone(&mm);
            let addr = range.start;
            std::thread::spawn(move || mm.handle_fault(addr, AccessType::read()))
        };
        std::thread::sleep(std::time::Duration::from_millis(30));
        page.unlock();
        assert_eq!(handle.join().unwrap(), FaultOutcome::Done);
        // First attempt came back Retry, the re-entry finished the job.
        assert_eq!(mm.stats().faults(), 2);
    }

    #[test]
    fn vma_handler_reports_retry_to_a_first_attempt() {
        let backing = file_space(4);
        let ops = FileMapping::new(Arc::clone(&backing));
        let vma = VmArea::new(
            AddrRange { start: 0x10000, end: 0x14000 },
            VmFlags::private(AccessType::read()),
            0,
            Arc::new(NeverCalled),
        );
        let page = backing.read_populate(1).unwrap();
        page.lock();
        let unlocker = {
            let page = Arc::clone(&page);
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                page.unlock();
            })
        };
        let vmf = VmFault {
            vma: &vma,
            address: Addr(0x11000),
            pgoff: 1,
            flags: FaultFlags::first_attempt(),
        };
        // First attempt: waits for the lock, then asks to be re-entered.
        assert!(matches!(ops.fault(&vmf), VmFaultResult::Retry));
        unlocker.join().unwrap();
        // The tried re-entry must block and finish instead.
        let vmf = VmFault {
            flags: FaultFlags { allow_retry: true, tried: true, write: false },
            ..vmf
        };
        match ops.fault(&vmf) {
            VmFaultResult::Done { page, .. } => page.unlock(),
            _ => panic!("tried fault must complete"),
        }
    }

    struct NeverCalled;

    impl VmaOps for NeverCalled {
        fn fault(&self, _: &VmFault<'_>) -> VmFaultResult {
            unreachable!()
        }
    }

    #[test]
    fn random_fault_storm_settles_consistently() {
        use rand::prelude::SliceRandom;
        use rand::Rng;

        let mm = mm();
        let pages = 64u64;
        let range = mm
            .map_anon(pages * PSZ, AccessType::read_write(), false)
            .unwrap();
        let mut rng = rand::thread_rng();
        let mut order: Vec<u64> = (0..pages).collect();
        order.shuffle(&mut rng);
        for &p in &order {
            let jitter = rng.gen_range(0..PSZ);
            assert_eq!(
                mm.handle_fault(range.start + p * PSZ + jitter, AccessType::write()),
                FaultOutcome::Done
            );
        }
        for p in 0..pages {
            let (page, _) = mm.translate(range.start + p * PSZ).unwrap();
            assert_eq!(page.index(), p);
        }
    }
}
