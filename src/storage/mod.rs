pub mod bplus_tree;
pub mod freelist;
pub mod header;
pub mod page_store;
pub mod scan;
pub mod wal;

use crate::types::{PageId, error::DatabaseError};

const SANDI_MAGIC: &[u8; 16] = b"SANDI DB v0.1\0\0\0";
const SANDI_FORMAT_VERSION: u32 = 1;

/// Read access to plaintext pages as seen by one transaction.
pub trait PageRead {
    /// Plaintext bytes in every B-tree page.
    fn page_capacity(&self) -> usize;

    fn read_page(&self, page_id: PageId) -> Result<Vec<u8>, DatabaseError>;
}

/// Write access to pages; writes stay private until the owner commits.
pub trait PageWrite: PageRead {
    fn write_page(&mut self, page_id: PageId, data: Vec<u8>) -> Result<(), DatabaseError>;

    fn allocate_page(&mut self) -> Result<PageId, DatabaseError>;

    fn free_page(&mut self, page_id: PageId) -> Result<(), DatabaseError>;
}
