//! Slotted page codec.
//!
//! Layout of a page of `page_size` bytes holding records `width` bytes wide:
//!
//! ```text
//! +----------------------+--------+--------+-----+--------------+---------+
//! | bitmap (header_size) | slot 0 | slot 1 | ... | slot n-1     | padding |
//! +----------------------+--------+--------+-----+--------------+---------+
//! ```
//!
//! `n = floor(page_size * 8 / (width * 8 + 1))`, and bit `i` of the bitmap
//! (least significant bit first within its byte) is set iff slot `i` holds a
//! record. Bytes of empty slots and the trailing padding are unconstrained and
//! carried through untouched.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::file::FileId;
use crate::record::{Record, Schema};
use crate::transaction::TransactionId;
use crate::{Result, StorageError};

/// A page of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId {
    pub file_id: FileId,
    pub page_number: u32,
}

impl PageId {
    pub fn new(file_id: FileId, page_number: u32) -> Self {
        Self {
            file_id,
            page_number,
        }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_id, self.page_number)
    }
}

/// An occupied slot of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub page_id: PageId,
    pub slot: usize,
}

impl RecordId {
    pub fn new(page_id: PageId, slot: usize) -> Self {
        Self { page_id, slot }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.page_id, self.slot)
    }
}

/// Number of slots a page of `page_size` bytes holds for records of
/// `width` bytes, counting one bitmap bit per slot.
pub fn slot_count(page_size: usize, width: usize) -> usize {
    (page_size * 8) / (width * 8 + 1)
}

/// Bitmap bytes needed for `slots` slots.
pub fn header_size(slots: usize) -> usize {
    slots.div_ceil(8)
}

/// Decoded image of one page: the raw bytes plus the records of its
/// occupied slots, and the bookkeeping the buffer pool needs for recovery.
#[derive(Debug, Clone)]
pub struct HeapPage {
    pid: PageId,
    schema: Arc<Schema>,
    data: Vec<u8>,
    records: Vec<Option<Record>>,
    dirtied_by: Option<TransactionId>,
    before_image: Bytes,
}

impl HeapPage {
    /// Parses `bytes`, which must be exactly one page long.
    pub fn decode(pid: PageId, bytes: &[u8], page_size: usize, schema: Arc<Schema>) -> Result<Self> {
        if bytes.len() != page_size {
            return Err(StorageError::Corrupt(format!(
                "page {} is {} bytes, expected {}",
                pid,
                bytes.len(),
                page_size
            )));
        }

        let width = schema.record_width();
        let slots = slot_count(page_size, width);
        let header = header_size(slots);

        let mut records = Vec::with_capacity(slots);
        for slot in 0..slots {
            if bytes[slot / 8] & (1 << (slot % 8)) == 0 {
                records.push(None);
                continue;
            }
            let start = header + slot * width;
            let mut record = Record::decode_from(&schema, &bytes[start..start + width])?;
            record.set_rid(Some(RecordId::new(pid, slot)));
            records.push(Some(record));
        }

        Ok(Self {
            pid,
            schema,
            data: bytes.to_vec(),
            records,
            dirtied_by: None,
            before_image: Bytes::copy_from_slice(bytes),
        })
    }

    /// A page with every slot empty.
    pub fn empty(pid: PageId, page_size: usize, schema: Arc<Schema>) -> Self {
        let data = Self::empty_page_data(page_size);
        let slots = slot_count(page_size, schema.record_width());
        Self {
            pid,
            schema,
            before_image: Bytes::copy_from_slice(&data),
            data,
            records: vec![None; slots],
            dirtied_by: None,
        }
    }

    pub fn empty_page_data(page_size: usize) -> Vec<u8> {
        vec![0u8; page_size]
    }

    /// Current image, `page_size` bytes.
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }

    pub fn id(&self) -> PageId {
        self.pid
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn slot_count(&self) -> usize {
        self.records.len()
    }

    pub fn header_size(&self) -> usize {
        header_size(self.records.len())
    }

    pub fn is_slot_used(&self, slot: usize) -> bool {
        matches!(self.records.get(slot), Some(Some(_)))
    }

    pub fn empty_slot_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_none()).count()
    }

    /// Stores `record` in the lowest empty slot and stamps its record id.
    pub fn insert_record(&mut self, record: &mut Record) -> Result<RecordId> {
        if !record.conforms_to(&self.schema) {
            return Err(StorageError::SchemaMismatch(format!(
                "record [{}] does not fit schema [{}] of page {}",
                record, self.schema, self.pid
            )));
        }
        let slot = self
            .records
            .iter()
            .position(Option::is_none)
            .ok_or(StorageError::PageFull(self.pid))?;

        let width = self.schema.record_width();
        let start = self.header_size() + slot * width;
        let mut dst = &mut self.data[start..start + width];
        record.encode_into(&self.schema, &mut dst)?;
        self.set_slot_bit(slot, true);

        let rid = RecordId::new(self.pid, slot);
        record.set_rid(Some(rid));
        self.records[slot] = Some(record.clone());
        Ok(rid)
    }

    /// Frees the slot `rid` points at.
    pub fn delete_record(&mut self, rid: RecordId) -> Result<()> {
        if rid.page_id != self.pid || !self.is_slot_used(rid.slot) {
            return Err(StorageError::RecordNotFound(rid.to_string()));
        }
        self.set_slot_bit(rid.slot, false);
        self.records[rid.slot] = None;
        Ok(())
    }

    /// Occupied records in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Record> + '_ {
        self.records.iter().flatten()
    }

    /// Owned snapshot of the occupied records in slot order.
    pub fn scan(&self) -> Vec<Record> {
        self.iter().cloned().collect()
    }

    pub fn record(&self, slot: usize) -> Option<&Record> {
        self.records.get(slot).and_then(Option::as_ref)
    }

    /// Flags the page dirty on behalf of `tid`, or clean with `None`.
    pub fn mark_dirty(&mut self, tid: Option<TransactionId>) {
        self.dirtied_by = tid;
    }

    /// The transaction that last dirtied the page, if it is dirty.
    pub fn is_dirty(&self) -> Option<TransactionId> {
        self.dirtied_by
    }

    pub fn before_image_data(&self) -> &Bytes {
        &self.before_image
    }

    /// The page as it was last loaded or flushed.
    pub fn before_image(&self) -> Result<HeapPage> {
        Self::decode(
            self.pid,
            &self.before_image,
            self.before_image.len(),
            self.schema.clone(),
        )
    }

    /// Adopts the current image as the recovery point.
    pub fn set_before_image(&mut self) {
        self.before_image = self.encode();
    }

    fn set_slot_bit(&mut self, slot: usize, used: bool) {
        let mask = 1u8 << (slot % 8);
        if used {
            self.data[slot / 8] |= mask;
        } else {
            self.data[slot / 8] &= !mask;
        }
    }
}
