//! The database root: file handle, series registry, and the commit protocol
//! that publishes a new page index and superblock atomically.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut, BytesMut};
use log::{debug, info};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::file::{File, OsFile};
use crate::page_index::{PageIndex, PageIndexEntry};
use crate::page_map::{PageId, PageMap};
use crate::series::Series;
use crate::transaction::Transaction;
use crate::{Error, Result};

const MAGIC: [u8; 8] = *b"ZDB00001";
const SUPERBLOCK_SIZE: u64 = 4 * 1024;
const EXTENT_HEADER_LEN: u64 = 16;

const EXTENT_KIND_PAGE: u64 = 0;
const EXTENT_KIND_INDEX: u64 = 1;
const EXTENT_KIND_SERIES_DIR: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    ReadOnly,
    ReadWrite,
    CreateIfMissing,
}

/// Tunable parameters. See the crate-level docs for the invariants these
/// values participate in (page split, eviction, and commit durability).
#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub page_soft_cap_bytes: usize,
    pub page_cache_capacity: usize,
    pub fsync_on_commit: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            page_soft_cap_bytes: 64 * 1024,
            page_cache_capacity: 1024,
            fsync_on_commit: true,
        }
    }
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy)]
#[repr(C)]
struct SuperblockHeader {
    magic: [u8; 8],
    generation: U64,
    index_root_addr: U64,
    index_root_size: U64,
    crc32: U32,
}

pub struct Database {
    pub(crate) inner: Arc<DatabaseInner>,
}

pub(crate) struct DatabaseInner {
    file: Arc<dyn File>,
    pub(crate) page_map: Arc<PageMap>,
    pub(crate) series: Mutex<HashMap<u64, Arc<Series>>>,
    append_cursor: AtomicU64,
    generation: AtomicU64,
    pub(crate) options: Options,
    readonly: bool,
}

impl Database {
    pub fn open(path: impl AsRef<Path>, mode: Mode) -> Result<Self> {
        Self::open_with_options(path, mode, Options::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, mode: Mode, options: Options) -> Result<Self> {
        let readonly = matches!(mode, Mode::ReadOnly);

        let std_file = OpenOptions::new()
            .read(true)
            .write(!readonly)
            .create(matches!(mode, Mode::CreateIfMissing))
            .open(path.as_ref())?;

        let file: Arc<dyn File> = Arc::new(OsFile::new(std_file));
        let page_map = Arc::new(PageMap::new(file.clone(), options.page_cache_capacity));

        let file_len = file.len()?;

        let inner = if file_len < SUPERBLOCK_SIZE {
            info!("creating new database at {:?}", path.as_ref());
            let inner = DatabaseInner {
                file,
                page_map,
                series: Mutex::new(HashMap::new()),
                append_cursor: AtomicU64::new(SUPERBLOCK_SIZE),
                generation: AtomicU64::new(0),
                options,
                readonly,
            };
            inner.write_series_directory_and_superblock(&HashMap::new())?;
            inner
        } else {
            info!("recovering database at {:?}", path.as_ref());
            let mut raw = vec![0u8; SUPERBLOCK_SIZE as usize];
            file.read_at(&mut raw, 0)?;

            let header_len = std::mem::size_of::<SuperblockHeader>();
            let header = SuperblockHeader::read_from_bytes(&raw[..header_len])
                .map_err(|_| Error::CorruptData("superblock header decode failed".to_string()))?;

            if header.magic != MAGIC {
                return Err(Error::CorruptData("bad superblock magic".to_string()));
            }

            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&raw[..header_len - 4]);
            if hasher.finalize() != header.crc32.get() {
                return Err(Error::CorruptData("superblock crc mismatch".to_string()));
            }

            let append_cursor = file_len.max(SUPERBLOCK_SIZE);

            let mut inner = DatabaseInner {
                file,
                page_map,
                series: Mutex::new(HashMap::new()),
                append_cursor: AtomicU64::new(append_cursor),
                generation: AtomicU64::new(header.generation.get()),
                options,
                readonly,
            };

            inner.recover(header.index_root_addr.get(), header.index_root_size.get())?;
            inner
        };

        Ok(Self { inner: Arc::new(inner) })
    }

    pub fn create_series(&self, series_id: u64, value_size: u64) -> Result<()> {
        self.inner.create_series(series_id, value_size)
    }

    pub fn begin(&self, series_id: u64, readonly: bool) -> Result<Transaction> {
        Transaction::begin(self.inner.clone(), series_id, readonly)
    }
}

impl DatabaseInner {
    fn recover(&mut self, dir_addr: u64, dir_size: u64) -> Result<()> {
        let dir_payload = self.read_payload(dir_addr, dir_size)?;
        let mut buf = &dir_payload[..];

        if buf.len() < 8 {
            return Err(Error::CorruptData("series directory too short".to_string()));
        }
        let count = buf.get_u64_le();

        let mut series_map = HashMap::new();

        for _ in 0..count {
            if buf.len() < 32 {
                return Err(Error::CorruptData("series directory entry truncated".to_string()));
            }
            let series_id = buf.get_u64_le();
            let value_size = buf.get_u64_le();
            let index_addr = buf.get_u64_le();
            let index_size = buf.get_u64_le();

            let index_payload = self.read_payload(index_addr, index_size)?;
            let mut index_buf = &index_payload[..];
            if index_buf.len() < 16 {
                return Err(Error::CorruptData("index payload too short".to_string()));
            }
            let stored_series_id = index_buf.get_u64_le();
            if stored_series_id != series_id {
                return Err(Error::CorruptData(format!(
                    "index payload series id mismatch: expected {}, got {}",
                    series_id, stored_series_id
                )));
            }
            let n = index_buf.get_u64_le();

            let mut entries = Vec::with_capacity(n as usize);
            for _ in 0..n {
                if index_buf.len() < 32 {
                    return Err(Error::CorruptData("index entry truncated".to_string()));
                }
                let first_timestamp = index_buf.get_u64_le();
                let page_id = index_buf.get_u64_le();
                let page_disk_addr = index_buf.get_u64_le();
                let page_disk_size = index_buf.get_u64_le();

                let page_id = PageId::new(page_id);
                self.page_map
                    .register_cold_page(page_id, value_size, page_disk_addr, page_disk_size);

                entries.push(PageIndexEntry {
                    first_timestamp,
                    page_id,
                });
            }

            let series = Series::new(series_id, value_size, PageIndex::new(entries));
            series.set_index_location(index_addr, index_size);
            series_map.insert(series_id, Arc::new(series));
        }

        debug!("recovered {} series", series_map.len());
        *self.series.lock().unwrap() = series_map;
        Ok(())
    }

    fn create_series(&self, series_id: u64, value_size: u64) -> Result<()> {
        if self.readonly {
            return Err(Error::InvalidArgument("database is read-only".to_string()));
        }

        let mut series_map = self.series.lock().unwrap();
        if series_map.contains_key(&series_id) {
            return Err(Error::AlreadyExists(format!("series {}", series_id)));
        }

        let series = Series::new(series_id, value_size, PageIndex::empty());
        let (index_addr, index_size) = self.write_index_extent(series_id, &PageIndex::empty())?;
        series.set_index_location(index_addr, index_size);

        series_map.insert(series_id, Arc::new(series));
        self.write_series_directory_and_superblock(&series_map)?;
        info!("created series {} (value_size={})", series_id, value_size);
        Ok(())
    }

    pub(crate) fn lookup_series(&self, series_id: u64) -> Result<Arc<Series>> {
        self.series
            .lock()
            .unwrap()
            .get(&series_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("series {}", series_id)))
    }

    pub(crate) fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub(crate) fn append_extent(&self, kind: u64, payload: &[u8]) -> Result<(u64, u64)> {
        if self.readonly {
            return Err(Error::InvalidArgument("database is read-only".to_string()));
        }

        let total = EXTENT_HEADER_LEN + payload.len() as u64;
        let offset = self.append_cursor.fetch_add(total, Ordering::AcqRel);

        let mut buf = BytesMut::with_capacity(total as usize);
        buf.put_u64_le(kind);
        buf.put_u64_le(payload.len() as u64);
        buf.put_slice(payload);

        self.file.write_at(&buf, offset)?;
        Ok((offset + EXTENT_HEADER_LEN, payload.len() as u64))
    }

    fn read_payload(&self, addr: u64, size: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; size as usize];
        self.file.read_at(&mut buf, addr)?;
        Ok(buf)
    }

    pub(crate) fn append_page_extent(&self, payload: &[u8]) -> Result<(u64, u64)> {
        self.append_extent(EXTENT_KIND_PAGE, payload)
    }

    pub(crate) fn write_index_extent(&self, series_id: u64, index: &PageIndex) -> Result<(u64, u64)> {
        let mut payload = BytesMut::new();
        payload.put_u64_le(series_id);
        payload.put_u64_le(index.size() as u64);

        for entry in index.entries() {
            let info = self
                .page_map
                .get_page_info(entry.page_id)
                .expect("indexed page must be known to the page map");

            payload.put_u64_le(entry.first_timestamp);
            payload.put_u64_le(entry.page_id.get());
            payload.put_u64_le(info.disk_addr);
            payload.put_u64_le(info.disk_size);
        }

        self.append_extent(EXTENT_KIND_INDEX, &payload)
    }

    pub(crate) fn write_series_directory_and_superblock(
        &self,
        series_map: &HashMap<u64, Arc<Series>>,
    ) -> Result<()> {
        let mut payload = BytesMut::new();
        payload.put_u64_le(series_map.len() as u64);

        for series in series_map.values() {
            let (index_addr, index_size) = series.index_location();
            payload.put_u64_le(series.series_id);
            payload.put_u64_le(series.value_size);
            payload.put_u64_le(index_addr);
            payload.put_u64_le(index_size);
        }

        let (dir_addr, dir_size) = self.append_extent(EXTENT_KIND_SERIES_DIR, &payload)?;
        self.write_superblock(dir_addr, dir_size)
    }

    fn write_superblock(&self, index_root_addr: u64, index_root_size: u64) -> Result<()> {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        let mut header = SuperblockHeader {
            magic: MAGIC,
            generation: U64::new(generation),
            index_root_addr: U64::new(index_root_addr),
            index_root_size: U64::new(index_root_size),
            crc32: U32::new(0),
        };

        let header_len = std::mem::size_of::<SuperblockHeader>();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header.as_bytes()[..header_len - 4]);
        header.crc32 = U32::new(hasher.finalize());

        let mut block = vec![0u8; SUPERBLOCK_SIZE as usize];
        block[..header_len].copy_from_slice(header.as_bytes());

        self.file.write_at(&block, 0)?;
        if self.options.fsync_on_commit {
            self.file.sync_data()?;
        }

        debug!(
            "wrote superblock: generation={} index_root_addr={} index_root_size={}",
            generation, index_root_addr, index_root_size
        );
        Ok(())
    }
}
