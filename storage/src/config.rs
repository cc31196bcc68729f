use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{Result, StorageError};

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const DEFAULT_POOL_CAPACITY: usize = 50;
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(500);

/// Tunables shared by the page files and the buffer pool.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StorageConfig {
    /// Size in bytes of every page in a file.
    pub page_size: usize,
    /// Maximum number of decoded pages the buffer pool keeps resident.
    pub pool_capacity: usize,
    /// How long a lock request may block before the transaction is aborted.
    pub lock_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl StorageConfig {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_pool_capacity(mut self, pool_capacity: usize) -> Self {
        self.pool_capacity = pool_capacity;
        self
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(StorageError::InvalidArgument(
                "page size must be non-zero".to_string(),
            ));
        }
        if self.pool_capacity == 0 {
            return Err(StorageError::InvalidArgument(
                "buffer pool capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
