//! The process-wide directory of pages: id -> live buffer, disk location,
//! version, and refcount. `PageMap` owns every `PageBuffer` the engine has
//! touched and is the only thing that talks to the backing file.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, trace};

use crate::cache::Cache;
use crate::file::File;
use crate::page_buffer::PageBuffer;
use crate::{Error, Result};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(u64);

impl PageId {
    pub(crate) fn new(id: u64) -> Self {
        debug_assert!(id != 0, "page id 0 is reserved");
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub version: u64,
    pub is_dirty: bool,
    pub disk_addr: u64,
    pub disk_size: u64,
    pub value_size: u64,
}

struct MutableState {
    buffer: Option<PageBuffer>,
    version: u64,
    value_size: u64,
    disk_addr: u64,
    disk_size: u64,
    dirty: bool,
    pending_delete: bool,
}

struct PageMapEntry {
    state: Mutex<MutableState>,
    refcount: AtomicU64,
}

/// RAII pin: blocks eviction of the entry for as long as it's held, and
/// sweeps a pending delete on drop if this was the last reference out.
struct PinGuard<'a> {
    map: &'a PageMap,
    id: PageId,
    entry: Arc<PageMapEntry>,
}

impl<'a> Drop for PinGuard<'a> {
    fn drop(&mut self) {
        if self.entry.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.map.sweep_if_unreferenced(self.id, &self.entry);
        }
    }
}

pub struct PageMap {
    file: Arc<dyn File>,
    directory: Mutex<HashMap<PageId, Arc<PageMapEntry>>>,
    next_page_id: AtomicU64,
    eviction_order: Mutex<Cache<PageId>>,
    capacity: usize,
}

impl PageMap {
    pub fn new(file: Arc<dyn File>, capacity: usize) -> Self {
        Self {
            file,
            directory: Mutex::new(HashMap::new()),
            next_page_id: AtomicU64::new(1),
            eviction_order: Mutex::new(Cache::new()),
            capacity,
        }
    }

    /// Restore `next_page_id` so freshly allocated ids never collide with
    /// ones already referenced from an on-disk page index.
    pub fn observe_page_id(&self, id: PageId) {
        self.next_page_id.fetch_max(id.get() + 1, Ordering::AcqRel);
    }

    fn new_page_id(&self) -> PageId {
        PageId::new(self.next_page_id.fetch_add(1, Ordering::AcqRel))
    }

    pub fn alloc_page(&self, value_size: u64) -> PageId {
        let id = self.new_page_id();
        let entry = Arc::new(PageMapEntry {
            state: Mutex::new(MutableState {
                buffer: Some(PageBuffer::new(value_size)),
                version: 0,
                value_size,
                disk_addr: 0,
                disk_size: 0,
                dirty: true,
                pending_delete: false,
            }),
            refcount: AtomicU64::new(0),
        });

        self.directory.lock().unwrap().insert(id, entry);
        self.eviction_order.lock().unwrap().insert(id);
        trace!("alloc_page: {:?} value_size={}", id, value_size);
        id
    }

    pub fn add_cold_page(&self, value_size: u64, disk_addr: u64, disk_size: u64) -> PageId {
        let id = self.new_page_id();
        let entry = Arc::new(PageMapEntry {
            state: Mutex::new(MutableState {
                buffer: None,
                version: 0,
                value_size,
                disk_addr,
                disk_size,
                dirty: false,
                pending_delete: false,
            }),
            refcount: AtomicU64::new(0),
        });

        self.directory.lock().unwrap().insert(id, entry);
        id
    }

    /// Register a page id whose on-disk location is already known, reusing
    /// `id` rather than allocating a new one. Used when replaying a series'
    /// page index at database open.
    pub fn register_cold_page(&self, id: PageId, value_size: u64, disk_addr: u64, disk_size: u64) {
        let entry = Arc::new(PageMapEntry {
            state: Mutex::new(MutableState {
                buffer: None,
                version: 0,
                value_size,
                disk_addr,
                disk_size,
                dirty: false,
                pending_delete: false,
            }),
            refcount: AtomicU64::new(0),
        });

        self.directory.lock().unwrap().insert(id, entry);
        self.observe_page_id(id);
    }

    pub fn get_page_info(&self, id: PageId) -> Option<PageInfo> {
        let entry = self.lookup(id)?;
        let state = entry.state.lock().unwrap();
        Some(PageInfo {
            version: state.version,
            is_dirty: state.dirty,
            disk_addr: state.disk_addr,
            disk_size: state.disk_size,
            value_size: state.value_size,
        })
    }

    fn lookup(&self, id: PageId) -> Option<Arc<PageMapEntry>> {
        self.directory.lock().unwrap().get(&id).cloned()
    }

    fn pin(&self, id: PageId, entry: Arc<PageMapEntry>) -> PinGuard<'_> {
        entry.refcount.fetch_add(1, Ordering::AcqRel);
        PinGuard {
            map: self,
            id,
            entry,
        }
    }

    fn load(&self, disk_addr: u64, disk_size: u64, value_size: u64) -> Result<PageBuffer> {
        let mut raw = vec![0u8; disk_size as usize];
        self.file.read_at(&mut raw, disk_addr)?;

        let page = PageBuffer::decode(&raw)?;
        if page.value_size() != value_size {
            return Err(Error::CorruptData(format!(
                "page at {} has value_size {} but index expects {}",
                disk_addr,
                page.value_size(),
                value_size
            )));
        }

        Ok(page)
    }

    fn ensure_resident(&self, id: PageId, state: &mut MutableState) -> Result<()> {
        if state.buffer.is_some() {
            return Ok(());
        }

        debug!(
            "loading page {:?} from disk_addr={} disk_size={}",
            id, state.disk_addr, state.disk_size
        );
        state.buffer = Some(self.load(state.disk_addr, state.disk_size, state.value_size)?);
        self.eviction_order.lock().unwrap().insert(id);
        self.enforce_capacity();
        Ok(())
    }

    /// Returns `true` and fills `out` if `id` is a known page; `false` if not.
    pub fn get_page(&self, id: PageId, out: &mut PageBuffer) -> Result<bool> {
        let entry = match self.lookup(id) {
            Some(e) => e,
            None => return Ok(false),
        };

        let _pin = self.pin(id, entry.clone());
        let mut state = entry.state.lock().unwrap();
        self.ensure_resident(id, &mut state)?;
        *out = state.buffer.as_ref().expect("just made resident").clone();
        Ok(true)
    }

    /// Apply `f` to the page's buffer under its exclusive lock. Returning
    /// `false` from `f` rolls the mutation back; returning `true` commits it
    /// and bumps the page's version.
    pub fn modify_page(&self, id: PageId, mut f: impl FnMut(&mut PageBuffer) -> bool) -> Result<()> {
        let entry = self
            .lookup(id)
            .ok_or_else(|| Error::NotFound(format!("page {:?}", id)))?;

        let _pin = self.pin(id, entry.clone());
        let mut state = entry.state.lock().unwrap();
        self.ensure_resident(id, &mut state)?;

        let mut candidate = state.buffer.clone().expect("just made resident");
        if f(&mut candidate) {
            state.buffer = Some(candidate);
            state.dirty = true;
            state.version += 1;
            trace!("modify_page: {:?} -> version {}", id, state.version);
        }

        Ok(())
    }

    /// Record that `version` has been persisted at `(disk_addr, disk_size)`.
    /// `dirty` is cleared unless a newer version has since been written.
    pub fn flush_page(&self, id: PageId, version: u64, disk_addr: u64, disk_size: u64) -> Result<()> {
        let entry = self
            .lookup(id)
            .ok_or_else(|| Error::NotFound(format!("page {:?}", id)))?;

        {
            let mut state = entry.state.lock().unwrap();
            state.disk_addr = disk_addr;
            state.disk_size = disk_size;
            if state.version == version {
                state.dirty = false;
            }
        }

        self.sweep_if_unreferenced(id, &entry);
        Ok(())
    }

    pub fn delete_page(&self, id: PageId) -> Result<()> {
        let entry = self
            .lookup(id)
            .ok_or_else(|| Error::NotFound(format!("page {:?}", id)))?;

        {
            let mut state = entry.state.lock().unwrap();
            state.pending_delete = true;
        }

        self.sweep_if_unreferenced(id, &entry);
        Ok(())
    }

    fn sweep_if_unreferenced(&self, id: PageId, entry: &Arc<PageMapEntry>) {
        if entry.refcount.load(Ordering::Acquire) != 0 {
            return;
        }

        let mut state = entry.state.lock().unwrap();
        if state.pending_delete {
            drop(state);
            self.directory.lock().unwrap().remove(&id);
            self.eviction_order.lock().unwrap().remove(id);
            debug!("freed page {:?}", id);
        } else if !state.dirty && state.buffer.is_some() {
            state.buffer = None;
            drop(state);
            trace!("evicted resident buffer for {:?}", id);
        }
    }

    fn enforce_capacity(&self) {
        let resident = self.directory.lock().unwrap().len();
        if resident <= self.capacity {
            return;
        }

        let candidates: Vec<PageId> = self.eviction_order.lock().unwrap().candidates().collect();
        for id in candidates {
            let entry = match self.lookup(id) {
                Some(e) => e,
                None => continue,
            };

            if entry.refcount.load(Ordering::Acquire) != 0 {
                continue;
            }

            let mut state = entry.state.lock().unwrap();
            if !state.dirty && state.buffer.is_some() {
                state.buffer = None;
                drop(state);
                self.eviction_order.lock().unwrap().remove(id);
                trace!("capacity eviction: {:?}", id);
                return;
            }
        }
    }
}

impl std::fmt::Debug for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PageId({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::mock::MemoryFile;

    fn map() -> PageMap {
        PageMap::new(Arc::new(MemoryFile::default()), 1024)
    }

    #[test]
    fn alloc_then_get_round_trips() {
        let map = map();
        let id = map.alloc_page(4);

        map.modify_page(id, |buf| {
            buf.append(10, &[1, 2, 3, 4]).unwrap();
            true
        })
        .unwrap();

        let mut out = PageBuffer::new(4);
        assert!(map.get_page(id, &mut out).unwrap());
        assert_eq!(out.get_timestamp(0).unwrap(), 10);
    }

    #[test]
    fn get_page_on_unknown_id_returns_false() {
        let map = map();
        let mut out = PageBuffer::new(4);
        assert!(!map.get_page(PageId::new(999), &mut out).unwrap());
    }

    #[test]
    fn modify_page_rollback_on_false() {
        let map = map();
        let id = map.alloc_page(4);
        map.modify_page(id, |buf| {
            buf.append(1, &[0, 0, 0, 0]).unwrap();
            true
        })
        .unwrap();

        let info_before = map.get_page_info(id).unwrap();

        map.modify_page(id, |buf| {
            buf.append(2, &[1, 1, 1, 1]).unwrap();
            false
        })
        .unwrap();

        let info_after = map.get_page_info(id).unwrap();
        assert_eq!(info_before.version, info_after.version);

        let mut out = PageBuffer::new(4);
        map.get_page(id, &mut out).unwrap();
        assert_eq!(out.size(), 1);
    }

    #[test]
    fn flush_then_load_from_disk() {
        let map = map();
        let id = map.alloc_page(4);
        map.modify_page(id, |buf| {
            buf.append(7, &[9, 9, 9, 9]).unwrap();
            true
        })
        .unwrap();

        let mut buf_copy = PageBuffer::new(4);
        map.get_page(id, &mut buf_copy).unwrap();
        let encoded = buf_copy.encode();
        map.file.write_at(&encoded, 100).unwrap();
        map.flush_page(id, 1, 100, encoded.len() as u64).unwrap();

        let info = map.get_page_info(id).unwrap();
        assert!(!info.is_dirty);
    }
}
