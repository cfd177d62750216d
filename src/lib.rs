//! `zdb` is an embedded, transactional time-series page store.
//!
//! A database holds any number of independently addressable *series*, each a
//! sorted sequence of `(timestamp, value)` samples with a fixed value width.
//! Samples are grouped into fixed-layout pages, pages are indexed per-series
//! by a [`PageIndex`], and the [`PageMap`] owns the in-memory buffers and
//! disk locations for every page in the file.
//!
//! Readers open a snapshot-isolated [`Transaction`] and drive it with a
//! [`Cursor`]; writers do the same but may mutate through the cursor and
//! must `commit()` to publish a new page index.

mod cache;
mod cursor;
mod database;
mod file;
mod page_buffer;
mod page_index;
mod page_map;
mod series;
mod transaction;

pub use cursor::Cursor;
pub use database::{Database, Mode, Options};
pub use page_buffer::PageBuffer;
pub use page_index::PageIndex;
pub use page_map::{PageId, PageInfo, PageMap};
pub use transaction::Transaction;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("corrupt data: {0}")]
    CorruptData(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("commit failed: {0}")]
    CommitFailed(Box<Error>),
}
