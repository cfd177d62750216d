//! The backing-file abstraction. `read_at`/`write_at` take absolute offsets
//! so concurrent callers never race on a shared file cursor, matching the
//! page map's "no seek" I/O discipline (see the crate-level docs).

use std::fs::File as StdFile;
use std::os::unix::fs::FileExt;

use crate::Result;

pub trait File: Send + Sync {
    fn len(&self) -> Result<u64>;
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()>;
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()>;
    fn sync_data(&self) -> Result<()>;
}

/// A real on-disk file, using `pread`/`pwrite` so reads never require `&mut
/// self` and multiple readers can proceed without serializing on a seek.
pub struct OsFile {
    inner: StdFile,
}

impl OsFile {
    pub fn new(inner: StdFile) -> Self {
        Self { inner }
    }
}

impl File for OsFile {
    fn len(&self) -> Result<u64> {
        Ok(self.inner.metadata()?.len())
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.inner.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.inner.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync_data(&self) -> Result<()> {
        self.inner.sync_data()?;
        Ok(())
    }
}
