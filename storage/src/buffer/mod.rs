//! Manages the buffer pool, the fixed-capacity cache every page access goes
//! through.
//!
//! Pages are locked per transaction with strict two-phase locking. Commit
//! forces a transaction's dirty pages to disk; abort restores them from their
//! before-images. Dirty pages are never evicted, which is what makes abort
//! possible without a log.
//!
//! One mutex guards the page table and the dirty sets. Disk reads and writes
//! happen outside it: a load re-checks the table before caching its copy,
//! and flushes work on page handles cloned out of the table. A resident page
//! is only evicted while clean and unreferenced, so every caller holding a
//! handle sees the one cached instance.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info, trace};
use parking_lot::{Mutex, RwLock};
use rand::seq::IteratorRandom;

use crate::catalog::Catalog;
use crate::config::StorageConfig;
use crate::file::FileId;
use crate::lock::{LockManager, LockMode};
use crate::page::{HeapPage, PageId};
use crate::record::Record;
use crate::transaction::TransactionId;
use crate::{Result, StorageError};

/// Shared handle to a resident page. Every caller asking for the same page
/// while it stays cached gets the same instance.
pub type PageRef = Arc<RwLock<HeapPage>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Read,
    Write,
}

impl Permission {
    fn lock_mode(self) -> LockMode {
        match self {
            Permission::Read => LockMode::Shared,
            Permission::Write => LockMode::Exclusive,
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    pages: HashMap<PageId, PageRef>,
    dirtied: HashMap<TransactionId, HashSet<PageId>>,
}

#[derive(Debug)]
pub struct BufferPool {
    catalog: Arc<Catalog>,
    capacity: usize,
    locks: LockManager,
    state: Mutex<PoolState>,
}

impl BufferPool {
    pub fn new(catalog: Arc<Catalog>, config: &StorageConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            catalog,
            capacity: config.pool_capacity,
            locks: LockManager::new(config.lock_timeout),
            state: Mutex::new(PoolState::default()),
        })
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of pages currently resident.
    pub fn cached_pages(&self) -> usize {
        self.state.lock().pages.len()
    }

    /// Locks `pid` for `tid` and returns the resident page, loading it
    /// (and evicting a clean page if the pool is full) when necessary.
    ///
    /// Blocks while another transaction holds a conflicting lock. Fails with
    /// [`StorageError::TransactionAborted`] on deadlock or timeout and with
    /// [`StorageError::BufferPoolFull`] when every cached page is dirty or
    /// still referenced by a caller.
    pub fn get_page(&self, tid: TransactionId, pid: PageId, perm: Permission) -> Result<PageRef> {
        self.locks.acquire(tid, pid, perm.lock_mode())?;

        if let Some(page) = self.state.lock().pages.get(&pid) {
            trace!("{} hit page {}", tid, pid);
            return Ok(page.clone());
        }

        let file = self.catalog.file(pid.file_id)?;
        let data = file.read_page(pid.page_number)?;
        let page = HeapPage::decode(pid, &data, file.page_size(), file.schema().clone())?;

        let mut state = self.state.lock();
        // another sharer may have loaded it meanwhile
        if let Some(page) = state.pages.get(&pid) {
            return Ok(page.clone());
        }
        if state.pages.len() >= self.capacity {
            Self::evict_page(&mut state, self.capacity)?;
        }
        let page = Arc::new(RwLock::new(page));
        state.pages.insert(pid, page.clone());
        debug!("{} loaded page {}", tid, pid);
        Ok(page)
    }

    /// Adds `record` to table `table_id`; the pages it lands on become dirty
    /// on behalf of `tid`.
    pub fn insert_record(&self, tid: TransactionId, table_id: FileId, record: &mut Record) -> Result<()> {
        let file = self.catalog.file(table_id)?;
        let touched = file.insert_record(self, tid, record)?;
        self.mark_dirty(tid, &touched);
        Ok(())
    }

    /// Removes `record` from the table its record id points into.
    pub fn delete_record(&self, tid: TransactionId, record: &Record) -> Result<()> {
        let rid = record
            .rid()
            .ok_or_else(|| StorageError::RecordNotFound(format!("[{}] has no record id", record)))?;
        let file = self.catalog.file(rid.page_id.file_id)?;
        let touched = file.delete_record(self, tid, record)?;
        self.mark_dirty(tid, &touched);
        Ok(())
    }

    /// Every record of table `table_id`, read under `tid`'s shared locks.
    pub fn scan(&self, tid: TransactionId, table_id: FileId) -> Result<Vec<Record>> {
        self.catalog.file(table_id)?.scan(self, tid)
    }

    fn mark_dirty(&self, tid: TransactionId, touched: &[PageId]) {
        let mut state = self.state.lock();
        for pid in touched {
            if let Some(page) = state.pages.get(pid) {
                page.write().mark_dirty(Some(tid));
            }
            state.dirtied.entry(tid).or_default().insert(*pid);
        }
    }

    /// Writes `pid` back if it is resident and dirty, making its current
    /// image the new before-image.
    pub fn flush_page(&self, pid: PageId) -> Result<()> {
        let page = self.state.lock().pages.get(&pid).cloned();
        match page {
            Some(page) => self.write_back(pid, &page),
            None => Ok(()),
        }
    }

    fn write_back(&self, pid: PageId, page: &PageRef) -> Result<()> {
        let mut page = page.write();
        if page.is_dirty().is_none() {
            return Ok(());
        }
        let file = self.catalog.file(pid.file_id)?;
        file.write_page(pid.page_number, &page.encode())?;
        page.mark_dirty(None);
        page.set_before_image();
        debug!("Flushed page {}", pid);
        Ok(())
    }

    /// Flushes every page `tid` dirtied.
    pub fn flush_pages(&self, tid: TransactionId) -> Result<()> {
        let pages: Vec<(PageId, PageRef)> = {
            let state = self.state.lock();
            let Some(dirtied) = state.dirtied.get(&tid) else {
                return Ok(());
            };
            dirtied
                .iter()
                .filter_map(|pid| state.pages.get(pid).map(|page| (*pid, page.clone())))
                .collect()
        };
        for (pid, page) in &pages {
            self.write_back(*pid, page)?;
        }
        Ok(())
    }

    /// Flushes every dirty resident page. Writes uncommitted data to disk, so
    /// it is meant for shutdown and tests only.
    pub fn flush_all_pages(&self) -> Result<()> {
        let pages: Vec<(PageId, PageRef)> = self
            .state
            .lock()
            .pages
            .iter()
            .map(|(pid, page)| (*pid, page.clone()))
            .collect();
        for (pid, page) in &pages {
            self.write_back(*pid, page)?;
        }
        Ok(())
    }

    /// Drops `pid` from the cache without writing it back.
    pub fn discard_page(&self, pid: PageId) {
        if self.state.lock().pages.remove(&pid).is_some() {
            debug!("Discarded page {}", pid);
        }
    }

    pub fn holds_lock(&self, tid: TransactionId, pid: PageId) -> bool {
        self.locks.holds(tid, pid).is_some()
    }

    /// Releases `tid`'s lock on `pid` before the transaction ends. This
    /// breaks two-phase locking; only use it for pages `tid` neither read
    /// results from nor modified.
    pub fn release_page(&self, tid: TransactionId, pid: PageId) {
        self.locks.release(tid, pid);
    }

    /// Forces `tid`'s dirty pages to disk and releases its locks.
    pub fn commit(&self, tid: TransactionId) -> Result<()> {
        self.flush_pages(tid)?;
        self.state.lock().dirtied.remove(&tid);
        self.locks.release_all(tid);
        info!("{} committed", tid);
        Ok(())
    }

    /// Restores every page `tid` dirtied to its before-image and releases
    /// its locks. Nothing is written to disk.
    pub fn abort(&self, tid: TransactionId) -> Result<()> {
        let restored = {
            let mut state = self.state.lock();
            let dirtied = state.dirtied.remove(&tid).unwrap_or_default();
            let mut restored = Ok(());
            for pid in &dirtied {
                let Some(page) = state.pages.get(pid).cloned() else {
                    continue;
                };
                let before = page.read().before_image();
                match before {
                    Ok(before) => *page.write() = before,
                    Err(e) => {
                        // next access rereads the page from disk
                        state.pages.remove(pid);
                        restored = Err(e);
                    }
                }
            }
            restored
        };
        self.locks.release_all(tid);
        info!("{} aborted", tid);
        restored
    }

    pub fn transaction_complete(&self, tid: TransactionId, commit: bool) -> Result<()> {
        if commit {
            self.commit(tid)
        } else {
            self.abort(tid)
        }
    }

    /// Removes a random clean page that no caller holds a handle to.
    fn evict_page(state: &mut PoolState, capacity: usize) -> Result<()> {
        let victim = state
            .pages
            .iter()
            .filter(|(_, page)| Arc::strong_count(page) == 1 && is_clean(page))
            .map(|(pid, _)| *pid)
            .choose(&mut rand::thread_rng())
            .ok_or(StorageError::BufferPoolFull(capacity))?;

        state.pages.remove(&victim);
        debug!("Evicted page {}", victim);
        Ok(())
    }
}

/// A page someone is writing to right now counts as dirty.
fn is_clean(page: &PageRef) -> bool {
    page.try_read().is_some_and(|p| p.is_dirty().is_none())
}
