// storage/src/file/mod.rs

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, trace};
use parking_lot::Mutex;

use crate::buffer::{BufferPool, Permission};
use crate::config::StorageConfig;
use crate::page::{slot_count, HeapPage, PageId};
use crate::record::{Record, Schema};
use crate::transaction::TransactionId;
use crate::{Result, StorageError};

pub type FileId = u32;

/// A table's storage: a sequence of fixed-size pages in one physical file.
///
/// Record-level operations go through the buffer pool so that they are
/// locked and cached like every other page access; only `read_page` and
/// `write_page` touch the disk directly.
pub trait DbFile: Send + Sync + fmt::Debug {
    fn id(&self) -> FileId;

    fn schema(&self) -> &Arc<Schema>;

    fn page_size(&self) -> usize;

    fn page_count(&self) -> Result<u32>;

    fn read_page(&self, page_number: u32) -> Result<Bytes>;

    fn write_page(&self, page_number: u32, data: &[u8]) -> Result<()>;

    /// Stores `record`, stamping its record id, and returns the pages it
    /// modified.
    fn insert_record(
        &self,
        pool: &BufferPool,
        tid: TransactionId,
        record: &mut Record,
    ) -> Result<Vec<PageId>>;

    fn delete_record(
        &self,
        pool: &BufferPool,
        tid: TransactionId,
        record: &Record,
    ) -> Result<Vec<PageId>>;

    /// Every record in page then slot order, read under shared locks.
    fn scan(&self, pool: &BufferPool, tid: TransactionId) -> Result<Vec<Record>>;
}

/// Unordered file of slotted pages.
pub struct HeapFile {
    id: FileId,
    path: PathBuf,
    schema: Arc<Schema>,
    page_size: usize,
    file: Mutex<File>,
}

impl HeapFile {
    /// Opens `path`, creating an empty file if it does not exist yet.
    pub fn open(path: &Path, schema: Arc<Schema>, config: &StorageConfig) -> Result<Self> {
        config.validate()?;
        if slot_count(config.page_size, schema.record_width()) == 0 {
            return Err(StorageError::InvalidArgument(format!(
                "{}-byte records do not fit on a {}-byte page",
                schema.record_width(),
                config.page_size
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let path = path.canonicalize()?;
        let id = crc32fast::hash(path.to_string_lossy().as_bytes());

        let heap_file = Self {
            id,
            path,
            schema,
            page_size: config.page_size,
            file: Mutex::new(file),
        };
        // refuse files whose length is not a whole number of pages
        let pages = heap_file.page_count()?;
        debug!(
            "Opened heap file {} (id {}) with {} pages",
            heap_file.path.display(),
            id,
            pages
        );
        Ok(heap_file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes an empty page after the last one and returns its number.
    fn append_empty_page(&self) -> Result<u32> {
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        let page_number = self.pages_for_len(len)?;
        file.seek(SeekFrom::Start(len))?;
        file.write_all(&HeapPage::empty_page_data(self.page_size))?;
        file.sync_data()?;
        debug!("Appended page {} to file {}", page_number, self.id);
        Ok(page_number)
    }

    fn pages_for_len(&self, len: u64) -> Result<u32> {
        let page_size = self.page_size as u64;
        if len % page_size != 0 {
            return Err(StorageError::Corrupt(format!(
                "file {} is {} bytes, not a multiple of the {}-byte page size",
                self.path.display(),
                len,
                page_size
            )));
        }
        u32::try_from(len / page_size).map_err(|_| {
            StorageError::Corrupt(format!("file {} has too many pages", self.path.display()))
        })
    }

    fn offset(&self, page_number: u32) -> u64 {
        page_number as u64 * self.page_size as u64
    }
}

impl fmt::Debug for HeapFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapFile")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("schema", &self.schema.to_string())
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl DbFile for HeapFile {
    fn id(&self) -> FileId {
        self.id
    }

    fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> Result<u32> {
        let len = self.file.lock().metadata()?.len();
        self.pages_for_len(len)
    }

    fn read_page(&self, page_number: u32) -> Result<Bytes> {
        let pid = PageId::new(self.id, page_number);
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        if self.offset(page_number) + self.page_size as u64 > len {
            return Err(StorageError::PageNotFound(pid));
        }

        file.seek(SeekFrom::Start(self.offset(page_number)))?;
        let mut buffer = vec![0u8; self.page_size];
        file.read_exact(&mut buffer)?;
        trace!("Read page {}", pid);
        Ok(Bytes::from(buffer))
    }

    fn write_page(&self, page_number: u32, data: &[u8]) -> Result<()> {
        if data.len() != self.page_size {
            return Err(StorageError::InvalidArgument(format!(
                "page image is {} bytes, expected {}",
                data.len(),
                self.page_size
            )));
        }
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        // in place, or appending exactly the next page
        if self.offset(page_number) > len {
            return Err(StorageError::InvalidArgument(format!(
                "page {} is past the end of file {}",
                page_number, self.id
            )));
        }

        file.seek(SeekFrom::Start(self.offset(page_number)))?;
        file.write_all(data)?;
        file.sync_data()?;
        trace!("Wrote page {}:{}", self.id, page_number);
        Ok(())
    }

    fn insert_record(
        &self,
        pool: &BufferPool,
        tid: TransactionId,
        record: &mut Record,
    ) -> Result<Vec<PageId>> {
        if !record.conforms_to(&self.schema) {
            return Err(StorageError::SchemaMismatch(format!(
                "record [{}] does not fit schema [{}] of file {}",
                record, self.schema, self.id
            )));
        }

        for page_number in 0..self.page_count()? {
            let pid = PageId::new(self.id, page_number);
            let page = pool.get_page(tid, pid, Permission::Write)?;
            let mut page = page.write();
            if page.empty_slot_count() > 0 {
                page.insert_record(record)?;
                page.mark_dirty(Some(tid));
                return Ok(vec![pid]);
            }
        }

        let pid = PageId::new(self.id, self.append_empty_page()?);
        let page = pool.get_page(tid, pid, Permission::Write)?;
        let mut page = page.write();
        page.insert_record(record)?;
        page.mark_dirty(Some(tid));
        Ok(vec![pid])
    }

    fn delete_record(
        &self,
        pool: &BufferPool,
        tid: TransactionId,
        record: &Record,
    ) -> Result<Vec<PageId>> {
        let rid = record
            .rid()
            .ok_or_else(|| StorageError::RecordNotFound(format!("[{}] has no record id", record)))?;
        if rid.page_id.file_id != self.id || rid.page_id.page_number >= self.page_count()? {
            return Err(StorageError::RecordNotFound(format!(
                "{} is not part of file {}",
                rid, self.id
            )));
        }

        let page = pool.get_page(tid, rid.page_id, Permission::Write)?;
        let mut page = page.write();
        page.delete_record(rid)?;
        page.mark_dirty(Some(tid));
        Ok(vec![rid.page_id])
    }

    fn scan(&self, pool: &BufferPool, tid: TransactionId) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        for page_number in 0..self.page_count()? {
            let page = pool.get_page(tid, PageId::new(self.id, page_number), Permission::Read)?;
            records.extend(page.read().iter().cloned());
        }
        Ok(records)
    }
}
