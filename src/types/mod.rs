pub mod entry;
pub mod error;
pub mod node;
pub mod page;

// Common type aliases
pub type PageId = u64;
pub type TransactionId = u64;
pub type FrameId = u64;

// Page geometry
pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const MIN_PAGE_SIZE: usize = 1024;
pub const MAX_PAGE_SIZE: usize = 65536;
pub const PAGE_HEADER_SIZE: usize = 24; // Per-node header inside the plaintext
pub const SLOT_DIRECTORY_ENTRY_SIZE: usize = 4; // offset (2 bytes) + length (2 bytes)

// Plaintext file header at the start of page 0
pub const FILE_HEADER_SIZE: usize = 64;

// Cipher geometry
pub const KEY_SIZE: usize = 32; // AES-256
pub const NONCE_SIZE: usize = 12; // 96-bit GCM nonce
pub const TAG_SIZE: usize = 16;
pub const SALT_SIZE: usize = 16;
pub const ENCRYPTION_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

// Key derivation cost
pub const DEFAULT_KDF_ITERATIONS: u32 = 256_000;
pub const MIN_KDF_ITERATIONS: u32 = 1_000;

// Leaf cell: key_len(2) + value_len(4); interior cell: child(8) + key_len(2)
pub const LEAF_CELL_OVERHEAD: usize = 6;
pub const INTERIOR_CELL_OVERHEAD: usize = 10;

/// Plaintext bytes available in a B-tree page for a given on-disk page size.
pub fn usable_size(page_size: usize) -> usize {
    page_size - ENCRYPTION_OVERHEAD
}

/// Largest key + value accepted for a node capacity (usable size).
///
/// Chosen so that every node, leaf or interior, holds at least four cells.
pub fn max_record_size(usable: usize) -> usize {
    (usable - PAGE_HEADER_SIZE) / 4 - (INTERIOR_CELL_OVERHEAD + SLOT_DIRECTORY_ENTRY_SIZE)
}
