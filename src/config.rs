use serde::{Deserialize, Serialize};

use crate::types::{
    DEFAULT_KDF_ITERATIONS, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_KDF_ITERATIONS, MIN_PAGE_SIZE,
    error::DatabaseError,
};

/// What a write transaction does when another writer is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriterWait {
    /// Wait until the active writer finishes.
    Block,
    /// Return `Conflict` immediately.
    Fail,
    /// Wait up to `millis`, then return `Conflict`.
    Timeout { millis: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Only used when creating a database; existing files keep their own.
    pub page_size: usize,
    /// PBKDF2 rounds for new databases and rekeys.
    pub kdf_iterations: u32,
    /// Checkpoint after a commit once the WAL holds this many frames. 0 disables.
    pub checkpoint_interval_frames: u64,
    pub writer_wait: WriterWait,
    pub max_page_count: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            checkpoint_interval_frames: 1000,
            writer_wait: WriterWait::Block,
            max_page_count: u32::MAX as u64,
        }
    }
}

impl Config {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_kdf_iterations(mut self, kdf_iterations: u32) -> Self {
        self.kdf_iterations = kdf_iterations;
        self
    }

    pub fn with_checkpoint_interval(mut self, frames: u64) -> Self {
        self.checkpoint_interval_frames = frames;
        self
    }

    pub fn with_writer_wait(mut self, writer_wait: WriterWait) -> Self {
        self.writer_wait = writer_wait;
        self
    }

    pub fn with_max_page_count(mut self, max_page_count: u64) -> Self {
        self.max_page_count = max_page_count;
        self
    }

    pub fn validate(&self) -> Result<(), DatabaseError> {
        if !self.page_size.is_power_of_two()
            || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size)
        {
            return Err(DatabaseError::InvalidConfig {
                reason: format!(
                    "page size {} must be a power of two between {} and {}",
                    self.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
                ),
            });
        }
        if self.kdf_iterations < MIN_KDF_ITERATIONS {
            return Err(DatabaseError::InvalidConfig {
                reason: format!(
                    "kdf iterations {} below minimum {}",
                    self.kdf_iterations, MIN_KDF_ITERATIONS
                ),
            });
        }
        // Header page plus the root leaf
        if self.max_page_count < 2 {
            return Err(DatabaseError::InvalidConfig {
                reason: format!("max page count {} leaves no room for a tree", self.max_page_count),
            });
        }
        Ok(())
    }
}
