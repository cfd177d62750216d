//! A single series' live state: its value width and the current, published
//! page index, plus the single-writer gate enforced at `begin`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::page_index::PageIndex;
use crate::{Error, Result};

pub(crate) struct Series {
    pub series_id: u64,
    pub value_size: u64,
    pub current_index: RwLock<Arc<PageIndex>>,
    writer_active: AtomicBool,
    index_addr: AtomicU64,
    index_size: AtomicU64,
}

impl Series {
    pub(crate) fn new(series_id: u64, value_size: u64, index: PageIndex) -> Self {
        Self {
            series_id,
            value_size,
            current_index: RwLock::new(Arc::new(index)),
            writer_active: AtomicBool::new(false),
            index_addr: AtomicU64::new(0),
            index_size: AtomicU64::new(0),
        }
    }

    /// Record where this series' page index currently lives on disk, so the
    /// series directory can be rebuilt on the next commit.
    pub(crate) fn set_index_location(&self, addr: u64, size: u64) {
        self.index_addr.store(addr, Ordering::Release);
        self.index_size.store(size, Ordering::Release);
    }

    pub(crate) fn index_location(&self) -> (u64, u64) {
        (
            self.index_addr.load(Ordering::Acquire),
            self.index_size.load(Ordering::Acquire),
        )
    }

    pub(crate) fn snapshot(&self) -> Arc<PageIndex> {
        self.current_index.read().unwrap().clone()
    }

    pub(crate) fn publish(&self, index: PageIndex) {
        *self.current_index.write().unwrap() = Arc::new(index);
    }

    /// Fails with `Busy` rather than blocking: per-series writes are
    /// single-writer and a conflicting writer should fail fast, not queue.
    pub(crate) fn acquire_writer(&self) -> Result<()> {
        self.writer_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::Busy(format!("series {} already has an active writer", self.series_id)))
    }

    pub(crate) fn release_writer(&self) {
        self.writer_active.store(false, Ordering::Release);
    }
}
