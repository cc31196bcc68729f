//! Page-granularity strict two-phase locking.
//!
//! One mutex guards the whole lock table and one condition variable wakes
//! waiters whenever a lock is released or a waiter gives up. Waiters on a page
//! are served in arrival order. Deadlocks are caught two ways: a wait-for
//! graph aborts the requester that would close a cycle, and every wait is
//! bounded by the configured timeout.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::page::PageId;
use crate::transaction::TransactionId;
use crate::{Result, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Default)]
struct PageLock {
    sharing: HashSet<TransactionId>,
    exclusive: Option<TransactionId>,
    waiting: VecDeque<(TransactionId, LockMode)>,
}

impl PageLock {
    fn held_by(&self, tid: TransactionId) -> Option<LockMode> {
        if self.exclusive == Some(tid) {
            Some(LockMode::Exclusive)
        } else if self.sharing.contains(&tid) {
            Some(LockMode::Shared)
        } else {
            None
        }
    }

    /// Other transactions whose locks keep `tid` from getting `mode`.
    fn conflicting_holders(&self, tid: TransactionId, mode: LockMode) -> Vec<TransactionId> {
        let mut holders: Vec<_> = self.exclusive.iter().copied().filter(|h| *h != tid).collect();
        if mode == LockMode::Exclusive {
            holders.extend(self.sharing.iter().copied().filter(|h| *h != tid));
        }
        holders
    }

    fn is_unused(&self) -> bool {
        self.sharing.is_empty() && self.exclusive.is_none() && self.waiting.is_empty()
    }

    fn is_first_waiter(&self, tid: TransactionId) -> bool {
        self.waiting.front().map(|(t, _)| *t) == Some(tid)
    }

    fn stop_waiting(&mut self, tid: TransactionId) {
        self.waiting.retain(|(t, _)| *t != tid);
    }
}

#[derive(Debug, Default)]
struct LockTable {
    pages: HashMap<PageId, PageLock>,
    held: HashMap<TransactionId, HashSet<PageId>>,
    waits_for: HashMap<TransactionId, HashSet<TransactionId>>,
}

impl LockTable {
    /// Grants `mode` to `tid` if compatible with the current holders,
    /// upgrading a sole shared holder in place.
    fn try_grant(&mut self, tid: TransactionId, pid: PageId, mode: LockMode) -> bool {
        let lock = self.pages.entry(pid).or_default();
        match (lock.held_by(tid), mode) {
            (Some(LockMode::Exclusive), _) | (Some(LockMode::Shared), LockMode::Shared) => {
                return true
            }
            _ => {}
        }
        if !lock.conflicting_holders(tid, mode).is_empty() {
            return false;
        }
        match mode {
            LockMode::Shared => {
                lock.sharing.insert(tid);
            }
            LockMode::Exclusive => {
                if lock.sharing.remove(&tid) {
                    debug!("{} upgraded lock on page {} to exclusive", tid, pid);
                }
                lock.exclusive = Some(tid);
            }
        }
        self.held.entry(tid).or_default().insert(pid);
        true
    }

    fn release(&mut self, tid: TransactionId, pid: PageId) {
        if let Some(lock) = self.pages.get_mut(&pid) {
            lock.sharing.remove(&tid);
            if lock.exclusive == Some(tid) {
                lock.exclusive = None;
            }
            if lock.is_unused() {
                self.pages.remove(&pid);
            }
        }
        if let Some(pages) = self.held.get_mut(&tid) {
            pages.remove(&pid);
            if pages.is_empty() {
                self.held.remove(&tid);
            }
        }
    }

    fn stop_waiting(&mut self, tid: TransactionId, pid: PageId) {
        if let Some(lock) = self.pages.get_mut(&pid) {
            lock.stop_waiting(tid);
            if lock.is_unused() {
                self.pages.remove(&pid);
            }
        }
        self.waits_for.remove(&tid);
    }

    fn forget(&mut self, tid: TransactionId) {
        self.waits_for.remove(&tid);
        for waited_on in self.waits_for.values_mut() {
            waited_on.remove(&tid);
        }
    }

    /// True when following wait-for edges from `start` leads back to it.
    fn closes_cycle(&self, start: TransactionId) -> bool {
        let mut visited = HashSet::new();
        let mut stack: Vec<TransactionId> = self
            .waits_for
            .get(&start)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        while let Some(tid) = stack.pop() {
            if tid == start {
                return true;
            }
            if !visited.insert(tid) {
                continue;
            }
            if let Some(next) = self.waits_for.get(&tid) {
                stack.extend(next.iter().copied());
            }
        }
        false
    }
}

#[derive(Debug)]
pub struct LockManager {
    table: Mutex<LockTable>,
    cvar: Condvar,
    timeout: Duration,
}

impl LockManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            cvar: Condvar::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Blocks until `tid` holds `mode` on `pid`.
    ///
    /// Fails with [`StorageError::TransactionAborted`] if waiting would
    /// deadlock or the timeout elapses; the caller must then abort `tid`.
    pub fn acquire(&self, tid: TransactionId, pid: PageId, mode: LockMode) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let mut table = self.table.lock();

        if table.try_grant(tid, pid, mode) {
            trace!("{} granted {:?} on page {}", tid, mode, pid);
            return Ok(());
        }

        debug!("{} waiting for {:?} lock on page {}", tid, mode, pid);
        table.pages.entry(pid).or_default().waiting.push_back((tid, mode));

        loop {
            let holders = table
                .pages
                .get(&pid)
                .map(|lock| lock.conflicting_holders(tid, mode))
                .unwrap_or_default();
            table.waits_for.insert(tid, holders.into_iter().collect());
            if table.closes_cycle(tid) {
                table.stop_waiting(tid, pid);
                self.cvar.notify_all();
                warn!("{} aborted: deadlock waiting for page {}", tid, pid);
                return Err(StorageError::TransactionAborted(
                    tid,
                    format!("deadlock waiting for {:?} lock on page {}", mode, pid),
                ));
            }

            let timed_out = self.cvar.wait_until(&mut table, deadline).timed_out();

            // upgrades skip the queue
            let my_turn = table
                .pages
                .get(&pid)
                .is_some_and(|lock| lock.is_first_waiter(tid) || lock.held_by(tid).is_some());
            if my_turn && table.try_grant(tid, pid, mode) {
                table.stop_waiting(tid, pid);
                // later shared waiters may be compatible too
                self.cvar.notify_all();
                debug!("{} granted {:?} on page {} after waiting", tid, mode, pid);
                return Ok(());
            }

            if timed_out {
                table.stop_waiting(tid, pid);
                self.cvar.notify_all();
                warn!("{} aborted: timed out waiting for page {}", tid, pid);
                return Err(StorageError::TransactionAborted(
                    tid,
                    format!(
                        "timed out after {:?} waiting for {:?} lock on page {}",
                        self.timeout, mode, pid
                    ),
                ));
            }
        }
    }

    pub fn release(&self, tid: TransactionId, pid: PageId) {
        let mut table = self.table.lock();
        table.release(tid, pid);
        self.cvar.notify_all();
    }

    pub fn release_all(&self, tid: TransactionId) {
        let mut table = self.table.lock();
        let pages = table.held.remove(&tid).unwrap_or_default();
        for pid in &pages {
            table.release(tid, *pid);
        }
        table.forget(tid);
        self.cvar.notify_all();
        debug!("{} released {} page locks", tid, pages.len());
    }

    pub fn holds(&self, tid: TransactionId, pid: PageId) -> Option<LockMode> {
        self.table.lock().pages.get(&pid).and_then(|lock| lock.held_by(tid))
    }

    pub fn locked_pages(&self, tid: TransactionId) -> Vec<PageId> {
        let mut pages: Vec<_> = self
            .table
            .lock()
            .held
            .get(&tid)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default();
        pages.sort();
        pages
    }
}
