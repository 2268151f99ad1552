use std::sync::{Arc, Mutex};

use mem::PAGE_SIZE;
use utils::SysResult;

use crate::Page;

/// Read side of the storage a cache sits in front of.
///
/// `read_page` is handed a locked page and must complete it through
/// [`Page::end_io`], possibly from another thread. It returns `Err` only
/// when the read could not be submitted at all; the caller then unlocks the
/// page itself.
pub trait BackingStore: Send + Sync {
    fn read_page(&self, page: &Arc<Page>) -> SysResult<()>;
}

/// In-memory backing store over a byte vector. Reads complete synchronously.
pub struct VecBacking {
    data: Mutex<Vec<u8>>,
}

impl VecBacking {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(data),
        })
    }

    /// `len` bytes where byte `i` holds `i % 251`. Distinct per offset, so
    /// tests can tell pages apart.
    pub fn patterned(len: usize) -> Arc<Self> {
        Self::new((0..len).map(|i| (i % 251) as u8).collect())
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BackingStore for VecBacking {
    fn read_page(&self, page: &Arc<Page>) -> SysResult<()> {
        let data = self.data.lock().unwrap();
        let start = (page.index() << mem::PAGE_SHIFT) as usize;
        if start >= data.len() {
            // Past end of the store: a zeroed page is the valid content.
            page.zero();
        } else {
            let end = data.len().min(start + PAGE_SIZE as usize);
            page.write(0, &data[start..end]);
        }
        page.end_io(false, 0);
        Ok(())
    }
}

/// A backing store whose reads always fail, for exercising error paths.
pub struct FailingBacking;

impl BackingStore for FailingBacking {
    fn read_page(&self, page: &Arc<Page>) -> SysResult<()> {
        page.end_io(false, libc::EIO);
        Ok(())
    }
}
