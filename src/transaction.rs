//! A handle on one series' data, held exclusively by at most one writer at a
//! time. Reads see a stable snapshot of the series' page index; writes are
//! buffered in a private working index and only become visible to other
//! transactions on `commit`.

use std::cell::Cell;
use std::collections::HashSet;
use std::sync::Arc;

use log::debug;

use crate::cursor::Cursor;
use crate::database::DatabaseInner;
use crate::page_index::{PageIndex, PageIndexEntry};
use crate::page_map::{PageId, PageMap};
use crate::series::Series;
use crate::{Error, Result};

pub struct Transaction {
    db: Arc<DatabaseInner>,
    series: Arc<Series>,
    readonly: bool,
    working_index: Vec<PageIndexEntry>,
    /// Page ids this transaction's `working_index` inherited from the
    /// series' published snapshot at `begin`. Any of these still being
    /// mutated in place would be visible to concurrent readers before
    /// commit, so a cursor must shadow them first (see `Cursor::ensure_private`).
    base_page_ids: HashSet<PageId>,
    /// Page ids this transaction has actually dirtied: freshly allocated
    /// pages and shadow copies. Only these get flushed on commit and
    /// discarded on abort.
    dirtied_pages: HashSet<PageId>,
    released: Cell<bool>,
}

impl Transaction {
    pub(crate) fn begin(db: Arc<DatabaseInner>, series_id: u64, readonly: bool) -> Result<Transaction> {
        let series = db.lookup_series(series_id)?;

        if !readonly {
            if db.is_readonly() {
                return Err(Error::InvalidArgument("database is read-only".to_string()));
            }
            series.acquire_writer()?;
        }

        let snapshot = series.snapshot();
        let working_index = snapshot.entries().to_vec();
        let base_page_ids = working_index.iter().map(|e| e.page_id).collect();

        debug!(
            "begin txn series={} readonly={} pages={}",
            series_id,
            readonly,
            working_index.len()
        );

        Ok(Transaction {
            db,
            series,
            readonly,
            working_index,
            base_page_ids,
            dirtied_pages: HashSet::new(),
            released: Cell::new(false),
        })
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn series_id(&self) -> u64 {
        self.series.series_id
    }

    pub fn value_size(&self) -> u64 {
        self.series.value_size
    }

    pub(crate) fn page_map(&self) -> &Arc<PageMap> {
        &self.db.page_map
    }

    pub(crate) fn working_index(&self) -> &[PageIndexEntry] {
        &self.working_index
    }

    pub(crate) fn working_index_mut(&mut self) -> &mut Vec<PageIndexEntry> {
        &mut self.working_index
    }

    /// Whether `id` is still the same page the series' currently-published
    /// index points at, i.e. a writer must shadow it before mutating.
    pub(crate) fn is_shared(&self, id: PageId) -> bool {
        self.base_page_ids.contains(&id)
    }

    /// Record that `id` is a page this transaction owns and has dirtied
    /// (a shadow copy or a freshly allocated page). Flushed on commit,
    /// discarded on abort.
    pub(crate) fn mark_dirtied(&mut self, id: PageId) {
        self.dirtied_pages.insert(id);
    }

    pub(crate) fn page_soft_cap_bytes(&self) -> usize {
        self.db.options.page_soft_cap_bytes
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(Error::InvalidArgument("transaction is read-only".to_string()));
        }
        Ok(())
    }

    /// Open a cursor over this transaction's working page index. Mutations
    /// made through the cursor are visible to later reads via the same
    /// cursor or a fresh one, but are invisible to other transactions until
    /// `commit`.
    pub fn cursor(&mut self) -> Cursor<'_> {
        Cursor::new(self)
    }

    /// Flush every dirty page touched by this transaction's working index,
    /// write a new page index extent, fold the new location into the series
    /// directory, and publish the new index for future readers.
    ///
    /// A failure at any step is reported as `Error::CommitFailed` wrapping
    /// the underlying cause; the writer slot is released either way, since
    /// the transaction is consumed regardless of outcome.
    pub fn commit(self) -> Result<()> {
        self.check_writable()?;
        let result = self.commit_inner();
        self.release();
        result.map_err(|e| Error::CommitFailed(Box::new(e)))
    }

    fn commit_inner(&self) -> Result<()> {
        for &page_id in &self.dirtied_pages {
            let info = self
                .db
                .page_map
                .get_page_info(page_id)
                .ok_or_else(|| Error::CorruptData(format!("page {:?} vanished from page map", page_id)))?;

            if !info.is_dirty {
                continue;
            }

            let mut buf = crate::page_buffer::PageBuffer::new(info.value_size);
            if !self.db.page_map.get_page(page_id, &mut buf)? {
                return Err(Error::CorruptData(format!("page {:?} vanished from page map", page_id)));
            }

            let encoded = buf.encode();
            let (disk_addr, disk_size) = self.db.append_page_extent(&encoded)?;
            self.db
                .page_map
                .flush_page(page_id, info.version, disk_addr, disk_size)?;
        }

        let new_index = PageIndex::new(self.working_index.clone());
        let (index_addr, index_size) = self.db.write_index_extent(self.series.series_id, &new_index)?;
        self.series.set_index_location(index_addr, index_size);

        {
            let series_map = self.db.series.lock().unwrap();
            self.db.write_series_directory_and_superblock(&series_map)?;
        }

        self.series.publish(new_index);

        debug!(
            "committed txn series={} pages={}",
            self.series.series_id,
            self.working_index.len()
        );

        Ok(())
    }

    /// Discards every page this transaction privately dirtied (shadow
    /// copies and fresh allocations); none of them were ever published, so
    /// nothing else can be referencing them.
    pub fn abort(self) {
        debug!(
            "abort txn series={} discarding={}",
            self.series.series_id,
            self.dirtied_pages.len()
        );
        for &page_id in &self.dirtied_pages {
            let _ = self.db.page_map.delete_page(page_id);
        }
        self.release();
    }

    fn release(&self) {
        if !self.released.get() {
            self.released.set(true);
            if !self.readonly {
                self.series.release_writer();
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.release();
    }
}
