//! Storage engine for SlotDB
//!
//! This crate provides the low-level storage primitives: slotted pages of
//! fixed-width records, the page files that hold them, and the buffer pool
//! that caches pages and enforces strict two-phase locking per transaction.

pub mod buffer;
pub mod catalog;
pub mod config;
pub mod file;
pub mod lock;
pub mod page;
pub mod record;
pub mod transaction;

pub use buffer::{BufferPool, PageRef, Permission};
pub use catalog::Catalog;
pub use config::StorageConfig;
pub use file::{DbFile, FileId, HeapFile};
pub use lock::{LockManager, LockMode};
pub use page::{HeapPage, PageId, RecordId};
pub use record::{FieldType, Record, Schema, Value};
pub use transaction::TransactionId;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Page {0} not found")]
    PageNotFound(PageId),

    #[error("Page {0} is full")]
    PageFull(PageId),

    #[error("Record {0} not found")]
    RecordNotFound(String),

    #[error("Record does not match schema: {0}")]
    SchemaMismatch(String),

    #[error("Buffer pool is full: all {0} cached pages are dirty")]
    BufferPoolFull(usize),

    #[error("Transaction {0} aborted: {1}")]
    TransactionAborted(TransactionId, String),

    #[error("Table {0} not found")]
    TableNotFound(String),

    #[error("Invalid catalog entry at line {line}: {reason}")]
    CatalogParse { line: usize, reason: String },

    #[error("Corrupt data: {0}")]
    Corrupt(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// True for the abort signal raised when a lock cannot be granted.
    pub fn is_abort(&self) -> bool {
        matches!(self, StorageError::TransactionAborted(..))
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
