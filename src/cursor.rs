//! Ordered iteration and point mutation over one transaction's working page
//! index. `next` always leaves the cursor either resolved on a real sample
//! or cleanly invalid; there is no one-past-the-end limbo state.

use crate::page_buffer::PageBuffer;
use crate::page_index::{PageIndex, PageIndexEntry};
use crate::page_map::PageId;
use crate::transaction::Transaction;
use crate::{Error, Result};

pub struct Cursor<'a> {
    txn: &'a mut Transaction,
    page_pos: usize,
    page_id: Option<PageId>,
    page_buf: PageBuffer,
    page_buf_valid: bool,
    slot: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(txn: &'a mut Transaction) -> Self {
        let value_size = txn.value_size();
        Self {
            txn,
            page_pos: 0,
            page_id: None,
            page_buf: PageBuffer::new(value_size),
            page_buf_valid: false,
            slot: 0,
        }
    }

    fn entry_at(&self, pos: usize) -> Option<PageIndexEntry> {
        self.txn.working_index().get(pos).copied()
    }

    fn load_page(&mut self, pos: usize) -> Result<bool> {
        let entry = match self.entry_at(pos) {
            Some(e) => e,
            None => {
                self.page_id = None;
                return Ok(false);
            }
        };

        let mut buf = PageBuffer::new(self.txn.value_size());
        if !self.txn.page_map().get_page(entry.page_id, &mut buf)? {
            return Err(Error::CorruptData(format!(
                "page {:?} missing from page map",
                entry.page_id
            )));
        }

        self.page_pos = pos;
        self.page_id = Some(entry.page_id);
        self.page_buf = buf;
        Ok(true)
    }

    pub fn valid(&self) -> bool {
        self.page_buf_valid
    }

    pub fn seek_to_first(&mut self) -> Result<bool> {
        if !self.load_page(0)? {
            self.page_buf_valid = false;
            return Ok(false);
        }
        self.slot = 0;
        self.page_buf_valid = !self.page_buf.is_empty();
        Ok(self.page_buf_valid)
    }

    pub fn seek_to_last(&mut self) -> Result<bool> {
        let len = self.txn.working_index().len();
        if len == 0 || !self.load_page(len - 1)? {
            self.page_buf_valid = false;
            return Ok(false);
        }
        self.slot = self.page_buf.size().saturating_sub(1);
        self.page_buf_valid = !self.page_buf.is_empty();
        Ok(self.page_buf_valid)
    }

    /// Land on the first sample with timestamp `>= ts` (ties favor the
    /// earliest equal sample), or go invalid if none exists. The owning
    /// page is found by a binary search of the page index; the slot within
    /// it by a binary search of its timestamps.
    pub fn seek_to(&mut self, ts: u64) -> Result<bool> {
        let entries = self.txn.working_index().to_vec();
        if entries.is_empty() {
            self.page_buf_valid = false;
            return Ok(false);
        }

        let pos = PageIndex::new(entries).find(ts);
        if !self.load_page(pos)? {
            self.page_buf_valid = false;
            return Ok(false);
        }

        match self.page_buf.ceil_index(ts) {
            Some(slot) => {
                self.slot = slot;
                self.page_buf_valid = true;
            }
            None => {
                // Nothing in this page reaches `ts`; by construction the
                // next page's first sample is the smallest one that does.
                self.page_buf_valid = self.load_page(self.page_pos + 1)? && !self.page_buf.is_empty();
                self.slot = 0;
            }
        }

        Ok(self.page_buf_valid)
    }

    pub fn get(&self) -> Result<(u64, Vec<u8>)> {
        if !self.page_buf_valid {
            return Err(Error::InvalidArgument(
                "cursor is not positioned on a sample".to_string(),
            ));
        }
        let ts = self.page_buf.get_timestamp(self.slot)?;
        let value = self.page_buf.value_at(self.slot)?.to_vec();
        Ok((ts, value))
    }

    pub fn next(&mut self) -> Result<bool> {
        if !self.page_buf_valid {
            return Ok(false);
        }

        if self.slot + 1 < self.page_buf.size() {
            self.slot += 1;
            return Ok(true);
        }

        if !self.load_page(self.page_pos + 1)? {
            self.page_buf_valid = false;
            return Ok(false);
        }
        self.slot = 0;
        self.page_buf_valid = !self.page_buf.is_empty();
        Ok(self.page_buf_valid)
    }

    pub fn update(&mut self, value: &[u8]) -> Result<()> {
        self.txn.check_writable()?;
        if !self.page_buf_valid {
            return Err(Error::InvalidArgument(
                "cursor is not positioned on a sample".to_string(),
            ));
        }

        let page_id = self.ensure_private()?;
        let slot = self.slot;
        let value_owned = value.to_vec();

        self.txn
            .page_map()
            .modify_page(page_id, |buf| buf.update(slot, &value_owned).is_ok())?;
        self.page_buf.update(slot, value)?;
        Ok(())
    }

    /// Insert `(ts, value)` into the current page, splitting it if the
    /// write pushes it past the configured soft cap. Lands at `self.slot`,
    /// the position `seek_to` left the cursor on; the caller is responsible
    /// for having seeked there first.
    pub fn insert(&mut self, ts: u64, value: &[u8]) -> Result<()> {
        self.txn.check_writable()?;
        if self.page_id.is_none() {
            return self.start_series(ts, value);
        }

        let page_id = self.ensure_private()?;
        let pos = self.slot;
        let value_owned = value.to_vec();

        self.txn
            .page_map()
            .modify_page(page_id, |buf| buf.insert(pos, ts, &value_owned).is_ok())?;
        self.page_buf.insert(pos, ts, value)?;
        self.slot = pos;
        self.page_buf_valid = true;

        self.maybe_split(page_id)
    }

    /// Append `(ts, value)` to the end of the series, starting the series'
    /// first page if it has none yet.
    pub fn append(&mut self, ts: u64, value: &[u8]) -> Result<()> {
        self.txn.check_writable()?;

        let len = self.txn.working_index().len();
        if len == 0 {
            return self.start_series(ts, value);
        }

        if self.page_pos != len - 1 || self.page_id.is_none() {
            self.load_page(len - 1)?;
        }

        let page_id = self.ensure_private()?;
        let value_owned = value.to_vec();

        self.txn
            .page_map()
            .modify_page(page_id, |buf| buf.append(ts, &value_owned).is_ok())?;
        self.page_buf.append(ts, value)?;
        self.slot = self.page_buf.size() - 1;
        self.page_buf_valid = true;

        self.maybe_split(page_id)
    }

    /// If `self.page_id` still points at the same page the series' published
    /// index references, allocate a private copy, mutate `working_index` to
    /// point at it instead, and re-home the cursor there. A writer must
    /// never mutate a page a concurrent reader's snapshot can still see.
    fn ensure_private(&mut self) -> Result<PageId> {
        let page_id = self.page_id.expect("cursor positioned on a page");

        let page_id = if self.txn.is_shared(page_id) {
            let value_size = self.txn.value_size();
            let shadow_id = self.txn.page_map().alloc_page(value_size);
            let buf_copy = self.page_buf.clone();
            self.txn
                .page_map()
                .modify_page(shadow_id, |buf| {
                    *buf = buf_copy.clone();
                    true
                })?;

            let first_timestamp = self.txn.working_index()[self.page_pos].first_timestamp;
            self.txn.working_index_mut()[self.page_pos] = PageIndexEntry {
                first_timestamp,
                page_id: shadow_id,
            };
            self.page_id = Some(shadow_id);
            shadow_id
        } else {
            page_id
        };

        self.txn.mark_dirtied(page_id);
        Ok(page_id)
    }

    fn start_series(&mut self, ts: u64, value: &[u8]) -> Result<()> {
        let value_size = self.txn.value_size();
        let page_id = self.txn.page_map().alloc_page(value_size);
        let value_owned = value.to_vec();

        self.txn
            .page_map()
            .modify_page(page_id, |buf| buf.append(ts, &value_owned).is_ok())?;
        self.txn.mark_dirtied(page_id);

        self.txn.working_index_mut().push(PageIndexEntry {
            first_timestamp: ts,
            page_id,
        });

        self.page_pos = self.txn.working_index().len() - 1;
        self.page_id = Some(page_id);
        self.page_buf = PageBuffer::new(value_size);
        self.page_buf.append(ts, value)?;
        self.slot = 0;
        self.page_buf_valid = true;
        Ok(())
    }

    /// Split `page_id` in half if it has grown past the soft cap, inserting
    /// a new index entry for the right half and re-homing the cursor on
    /// whichever half `self.slot` now falls in.
    fn maybe_split(&mut self, page_id: PageId) -> Result<()> {
        let soft_cap = self.txn.page_soft_cap_bytes();
        if self.page_buf.encoded_len() <= soft_cap || self.page_buf.size() < 2 {
            return Ok(());
        }

        let mut left = self.page_buf.clone();
        let right = left.split_at_median();
        let right_first_ts = right
            .get_timestamp(0)
            .expect("split_at_median never returns an empty half when size >= 2");

        let slot_in_left = self.slot < left.size();
        let new_slot = if slot_in_left {
            self.slot
        } else {
            self.slot - left.size()
        };

        self.txn.page_map().modify_page(page_id, |buf| {
            *buf = left.clone();
            true
        })?;

        let value_size = self.txn.value_size();
        let right_page_id = self.txn.page_map().alloc_page(value_size);
        self.txn.page_map().modify_page(right_page_id, |buf| {
            *buf = right.clone();
            true
        })?;
        self.txn.mark_dirtied(right_page_id);

        let pos = self.page_pos;
        self.txn.working_index_mut().insert(
            pos + 1,
            PageIndexEntry {
                first_timestamp: right_first_ts,
                page_id: right_page_id,
            },
        );

        if slot_in_left {
            self.page_buf = left;
        } else {
            self.page_pos = pos + 1;
            self.page_id = Some(right_page_id);
            self.page_buf = right;
        }
        self.slot = new_slot;

        Ok(())
    }
}
