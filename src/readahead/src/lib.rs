//! Sequential-read detection and speculative page-cache population.
//!
//! A [`ReadaheadState`] lives with each open file. On a cache miss during a
//! sequential read the window is placed (or grown) ahead of the reader; when
//! the reader consumes a page carrying the readahead marker the window is
//! extended again before the reader ever misses. Population never blocks on
//! completion; only the page the caller actually demanded is waited for, by
//! the caller.

use std::sync::Arc;

use mem::{bytes_to_pgoff, PgOff};
use pagecache::{AddressSpace, Page};
use utils::SysResult;

/// 32 pages (128KiB), the conventional default window cap.
pub const DEFAULT_RA_PAGES: u64 = 32;

#[derive(Debug)]
pub struct ReadaheadState {
    /// First page of the current window.
    pub start: PgOff,
    /// Window length in pages.
    pub size: u64,
    /// Trailing sub-window; hitting its first page triggers the next batch.
    pub async_size: u64,
    /// Hard cap on `size`. Zero disables readahead.
    ra_pages: u64,
    /// Byte position of the last read, for sequentiality detection.
    pub prev_pos: u64,
}

impl ReadaheadState {
    pub fn new(ra_pages: u64) -> Self {
        Self {
            start: 0,
            size: 0,
            async_size: 0,
            ra_pages,
            prev_pos: u64::MAX,
        }
    }

    pub fn ra_pages(&self) -> u64 {
        self.ra_pages
    }

    // First window scales with the request so small reads do not drag in
    // the full cap.
    fn initial_window(&self, req: u64) -> u64 {
        let max = self.ra_pages;
        let size = req.max(1).next_power_of_two();
        if size <= max / 32 {
            size * 4
        } else if size <= max / 4 {
            size * 2
        } else {
            max
        }
    }

    // Grow the current window, doubling (quadrupling while small) up to
    // the cap.
    fn next_window(&self) -> u64 {
        let max = self.ra_pages;
        let cur = self.size;
        if cur < max / 16 {
            cur * 4
        } else if cur <= max / 2 {
            cur * 2
        } else {
            max
        }
    }

    /// Cache miss at `offset` during a read of `req` more pages. Places a
    /// forward window and populates it.
    pub fn sync_readahead(&mut self, mapping: &Arc<AddressSpace>, offset: PgOff, req: u64) {
        if self.ra_pages == 0 {
            return;
        }
        if offset == self.start + self.size && self.size > 0 {
            // Missed exactly past the current window: sequential, grow.
            self.start = offset;
            self.size = self.next_window();
            self.async_size = self.size;
        } else if offset == 0 || offset.wrapping_sub(bytes_to_pgoff(self.prev_pos)) <= 1 {
            // Start of file or contiguous with the previous read.
            self.start = offset;
            self.size = self.initial_window(req);
            self.async_size = self.size.saturating_sub(req).max(1).min(self.size);
        } else {
            // Random access: read just what was asked, grow nothing.
            self.start = offset;
            self.size = req.min(self.ra_pages);
            self.async_size = 0;
        }
        self.submit(mapping);
    }

    /// The page found at `offset` carried the readahead marker: the batch
    /// that brought it in is being consumed, so extend ahead now. Clears
    /// the marker.
    pub fn async_readahead(
        &mut self,
        mapping: &Arc<AddressSpace>,
        page: &Page,
        offset: PgOff,
        req: u64,
    ) {
        if self.ra_pages == 0 {
            return;
        }
        if !page.test_and_clear_readahead() {
            return;
        }
        // Skip everything already resident; the window starts at the first
        // gap.
        let limit = mapping.page_limit();
        let horizon = offset.saturating_add(self.ra_pages).min(limit);
        let mut start = offset + 1;
        while start < horizon && mapping.lookup(start).is_some() {
            start += 1;
        }
        if start >= horizon {
            return;
        }
        self.start = start;
        self.size = self.next_window().max(req.min(self.ra_pages));
        self.async_size = self.size;
        self.submit(mapping);
    }

    /// First-fault read-around for a mapped file: a window centered on the
    /// faulting offset.
    pub fn readaround(&mut self, mapping: &Arc<AddressSpace>, offset: PgOff) {
        if self.ra_pages == 0 {
            return;
        }
        self.start = offset.saturating_sub(self.ra_pages / 2);
        self.size = self.ra_pages;
        self.async_size = self.ra_pages / 4;
        self.submit(mapping);
    }

    // Populates every absent page of the window, marking the page at
    // start + size - async_size so its consumption triggers the next batch.
    // Reads are submitted, never waited on.
    fn submit(&mut self, mapping: &Arc<AddressSpace>) -> usize {
        let end = (self.start + self.size).min(mapping.page_limit());
        let marker = self.start + self.size - self.async_size;
        let mut populated = 0;
        for off in self.start..end {
            if mapping.lookup(off).is_some() {
                continue;
            }
            let page = Page::new(off);
            page.lock();
            if mapping.insert(&page, off).is_err() {
                // A racing reader beat us to this slot.
                page.unlock();
                continue;
            }
            if off == marker && self.async_size > 0 {
                page.set_readahead();
            }
            if let Err(e) = mapping.backing().read_page(&page) {
                logger::warn!("readahead submit failed at page {}: {}", off, e);
                page.unlock();
            }
            populated += 1;
        }
        logger::debug!(
            "readahead window [{}, {}) populated {} pages",
            self.start,
            end,
            populated
        );
        populated
    }
}

/// Buffered read through the cache: the `read(2)` path. Misses trigger
/// synchronous readahead, marker hits trigger asynchronous readahead, and
/// only the demanded page is waited on. Returns the bytes copied, short at
/// end of file.
pub fn read_at(
    mapping: &Arc<AddressSpace>,
    ra: &mut ReadaheadState,
    pos: u64,
    buf: &mut [u8],
) -> SysResult<usize> {
    let file_size = mapping.size();
    if pos >= file_size {
        return Ok(0);
    }
    let want = (buf.len() as u64).min(file_size - pos) as usize;
    let mut copied = 0;
    while copied < want {
        let cur = pos + copied as u64;
        let (pgoff, in_page) = AddressSpace::page_of(cur);
        let remaining_pages = mem::size_in_pages((want - copied) as u64);

        match mapping.lookup(pgoff) {
            None => ra.sync_readahead(mapping, pgoff, remaining_pages),
            Some(page) => {
                if page.is_readahead() {
                    ra.async_readahead(mapping, &page, pgoff, remaining_pages);
                }
            }
        }
        let page = mapping.read_populate(pgoff)?;

        let chunk = (mem::PAGE_SIZE as usize - in_page).min(want - copied);
        page.read(in_page, &mut buf[copied..copied + chunk]);
        copied += chunk;
        ra.prev_pos = cur + chunk as u64;
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use mem::PAGE_SIZE;
    use pagecache::VecBacking;

    use super::*;

    fn space(pages: usize) -> Arc<AddressSpace> {
        let size = pages * PAGE_SIZE as usize;
        AddressSpace::new(VecBacking::patterned(size), size as u64)
    }

    #[test]
    fn window_growth() {
        struct Test {
            cur: u64,
            want: u64,
        }
        let ra = |size| ReadaheadState {
            start: 0,
            size,
            async_size: 0,
            ra_pages: 32,
            prev_pos: 0,
        };
        let tests = [
            Test { cur: 1, want: 4 },
            Test { cur: 2, want: 4 },
            Test { cur: 4, want: 8 },
            Test { cur: 16, want: 32 },
            Test { cur: 32, want: 32 },
        ];
        for test in &tests {
            assert_eq!(ra(test.cur).next_window(), test.want, "cur={}", test.cur);
        }
    }

    #[test]
    fn initial_miss_populates_forward_window() {
        let m = space(64);
        let mut ra = ReadaheadState::new(32);
        ra.sync_readahead(&m, 0, 1);
        assert!(ra.size >= 1);
        for off in 0..ra.size {
            assert!(m.lookup(off).is_some(), "page {} missing", off);
        }
        // A marker page sits at the async boundary.
        let marker = ra.start + ra.size - ra.async_size;
        assert!(m.lookup(marker).unwrap().is_readahead());
    }

    #[test]
    fn marker_hit_extends_window() {
        let m = space(256);
        let mut ra = ReadaheadState::new(32);
        ra.sync_readahead(&m, 0, 1);
        let first_size = ra.size;
        let marker = ra.start + ra.size - ra.async_size;

        let page = m.lookup(marker).unwrap();
        ra.async_readahead(&m, &page, marker, 1);
        assert!(!page.is_readahead());
        assert!(ra.size >= first_size);
        // The new window begins past the previously populated run.
        assert!(ra.start >= first_size);
        for off in ra.start..ra.start + ra.size {
            assert!(m.lookup(off).is_some(), "page {} missing", off);
        }
    }

    #[test]
    fn random_access_does_not_grow() {
        let m = space(256);
        let mut ra = ReadaheadState::new(32);
        ra.prev_pos = 0;
        ra.sync_readahead(&m, 100, 2);
        assert_eq!((ra.start, ra.size, ra.async_size), (100, 2, 0));
        assert!(m.lookup(100).is_some());
        assert!(m.lookup(101).is_some());
        assert!(m.lookup(102).is_none());
    }

    #[test]
    fn zero_cap_disables_readahead() {
        let m = space(16);
        let mut ra = ReadaheadState::new(0);
        ra.sync_readahead(&m, 0, 4);
        assert_eq!(m.page_count(), 0);
        ra.readaround(&m, 4);
        assert_eq!(m.page_count(), 0);
    }

    #[test]
    fn readaround_centers_on_fault() {
        let m = space(256);
        let mut ra = ReadaheadState::new(32);
        ra.readaround(&m, 100);
        assert_eq!(ra.start, 100 - 16);
        assert_eq!(ra.size, 32);
        assert_eq!(ra.async_size, 8);
        for off in ra.start..ra.start + ra.size {
            assert!(m.lookup(off).is_some());
        }
        // Near the start of the file the window clamps to zero.
        let m2 = space(64);
        let mut ra2 = ReadaheadState::new(32);
        ra2.readaround(&m2, 3);
        assert_eq!(ra2.start, 0);
    }

    #[test]
    fn window_clips_at_eof() {
        let m = space(10);
        let mut ra = ReadaheadState::new(32);
        ra.sync_readahead(&m, 8, 4);
        assert!(m.lookup(9).is_some());
        assert_eq!(m.page_count() as u64, m.page_limit() - 8);
    }

    #[test]
    fn read_at_round_trip() {
        let psz = PAGE_SIZE as usize;
        let m = space(8);
        let mut ra = ReadaheadState::new(8);
        // Straddle a page boundary.
        let pos = psz as u64 - 7;
        let mut buf = vec![0u8; 20];
        assert_eq!(read_at(&m, &mut ra, pos, &mut buf).unwrap(), 20);
        let want: Vec<u8> = (pos as usize..pos as usize + 20).map(|i| (i % 251) as u8).collect();
        assert_eq!(buf, want);
        assert_eq!(ra.prev_pos, pos + 20);
    }

    #[test]
    fn read_at_is_short_at_eof() {
        let psz = PAGE_SIZE as usize;
        let m = space(2);
        let mut ra = ReadaheadState::new(8);
        let mut buf = vec![0u8; psz];
        let pos = (2 * psz - 100) as u64;
        assert_eq!(read_at(&m, &mut ra, pos, &mut buf).unwrap(), 100);
        assert_eq!(read_at(&m, &mut ra, (2 * psz) as u64, &mut buf).unwrap(), 0);
    }

    #[test]
    fn sequential_reads_stay_ahead_of_the_reader() {
        let psz = PAGE_SIZE as usize;
        let m = space(128);
        let mut ra = ReadaheadState::new(16);
        let mut buf = vec![0u8; psz];
        for page in 0..64u64 {
            assert_eq!(read_at(&m, &mut ra, page * psz as u64, &mut buf).unwrap(), psz);
        }
        // The window has run ahead of the last page read.
        assert!(m.lookup(64).is_some());
    }
}
