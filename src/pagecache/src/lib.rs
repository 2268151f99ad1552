//! Per-file page cache: a sparse offset-to-page index with demand
//! population, per-page lock and uptodate protocols, and truncation.

mod address_space;
mod backing;
mod page;

pub use address_space::{AddressSpace, FindOpts};
pub use backing::{BackingStore, FailingBacking, VecBacking};
pub use page::Page;
