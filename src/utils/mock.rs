use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
};

use tempfile::TempDir;

use crate::{
    config::Config,
    database::Database,
    storage::{PageRead, PageWrite, wal::wal_path_for},
    types::{MIN_KDF_ITERATIONS, PageId, error::DatabaseError},
};

/// Cheap key derivation so tests do not spend their time in PBKDF2.
pub fn test_config() -> Config {
    Config::default().with_kdf_iterations(MIN_KDF_ITERATIONS)
}

/// A database path inside a private temporary directory, removed on drop
/// together with its WAL.
pub struct TempDatabase {
    _dir: TempDir,
    path: PathBuf,
}

impl TempDatabase {
    pub fn new() -> io::Result<Self> {
        Self::with_prefix("sandi_test")
    }

    pub fn with_prefix(prefix: &str) -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix(prefix).tempdir()?;
        let path = dir.path().join("test.db");
        Ok(Self { _dir: dir, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn wal_path(&self) -> PathBuf {
        wal_path_for(&self.path)
    }

    pub fn open(&self, passphrase: &str) -> Result<Database, DatabaseError> {
        Database::open(&self.path, passphrase, test_config())
    }

    pub fn open_with(&self, passphrase: &str, config: Config) -> Result<Database, DatabaseError> {
        Database::open(&self.path, passphrase, config)
    }
}

/// In-memory page view for exercising the B-tree without files or a cipher.
#[derive(Debug, Clone)]
pub struct MemoryPages {
    capacity: usize,
    pages: HashMap<PageId, Vec<u8>>,
    free: Vec<PageId>,
    next_page_id: PageId,
}

impl MemoryPages {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pages: HashMap::new(),
            free: Vec::new(),
            // Page 0 is reserved for the header in real files
            next_page_id: 1,
        }
    }

    /// Pages currently allocated.
    pub fn live_pages(&self) -> usize {
        self.pages.len()
    }

    /// Pages ever allocated, freed ones included.
    pub fn high_water_mark(&self) -> PageId {
        self.next_page_id
    }
}

impl PageRead for MemoryPages {
    fn page_capacity(&self) -> usize {
        self.capacity
    }

    fn read_page(&self, page_id: PageId) -> Result<Vec<u8>, DatabaseError> {
        self.pages
            .get(&page_id)
            .cloned()
            .ok_or_else(|| DatabaseError::corrupted_page(page_id, "page not allocated"))
    }
}

impl PageWrite for MemoryPages {
    fn write_page(&mut self, page_id: PageId, data: Vec<u8>) -> Result<(), DatabaseError> {
        if data.len() != self.capacity {
            return Err(DatabaseError::InvalidPageSize {
                expected: self.capacity,
                actual: data.len(),
            });
        }
        self.pages.insert(page_id, data);
        Ok(())
    }

    fn allocate_page(&mut self) -> Result<PageId, DatabaseError> {
        let page_id = self.free.pop().unwrap_or_else(|| {
            self.next_page_id += 1;
            self.next_page_id - 1
        });
        self.pages.insert(page_id, vec![0u8; self.capacity]);
        Ok(page_id)
    }

    fn free_page(&mut self, page_id: PageId) -> Result<(), DatabaseError> {
        if self.pages.remove(&page_id).is_none() {
            return Err(DatabaseError::corrupted_page(page_id, "double free"));
        }
        self.free.push(page_id);
        Ok(())
    }
}
