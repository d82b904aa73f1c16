use bincode::{Decode, Encode, config};

use crate::{
    cipher::{CIPHER_AES_256_GCM, KDF_PBKDF2_HMAC_SHA512},
    storage::{SANDI_FORMAT_VERSION, SANDI_MAGIC},
    types::{
        ENCRYPTION_OVERHEAD, FILE_HEADER_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE, PageId, SALT_SIZE,
        TransactionId, error::DatabaseError,
    },
};

fn header_config() -> impl config::Config {
    config::standard().with_fixed_int_encoding()
}

/// Plaintext prefix of page 0: everything needed to derive the key.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct FileHeader {
    pub magic: [u8; 16],
    pub format_version: u32,
    pub page_size: u32,
    pub cipher_id: u8,
    pub kdf_id: u8,
    pub kdf_iterations: u32,
    pub salt: [u8; SALT_SIZE],
}

impl FileHeader {
    pub fn new(page_size: usize, kdf_iterations: u32, salt: [u8; SALT_SIZE]) -> Self {
        Self {
            magic: *SANDI_MAGIC,
            format_version: SANDI_FORMAT_VERSION,
            page_size: page_size as u32,
            cipher_id: CIPHER_AES_256_GCM,
            kdf_id: KDF_PBKDF2_HMAC_SHA512,
            kdf_iterations,
            salt,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size as usize
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DatabaseError> {
        let mut buffer =
            bincode::encode_to_vec(self, header_config()).map_err(|e| DatabaseError::SerializationError {
                details: format!("file header: {}", e),
            })?;
        buffer.resize(FILE_HEADER_SIZE, 0);
        Ok(buffer)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DatabaseError> {
        if bytes.len() < FILE_HEADER_SIZE {
            return Err(DatabaseError::CorruptedDatabase {
                reason: "Header too short".to_string(),
            });
        }
        if &bytes[..SANDI_MAGIC.len()] != SANDI_MAGIC {
            return Err(DatabaseError::CorruptedDatabase {
                reason: "Invalid Sandi magic number".to_string(),
            });
        }
        let (header, _): (FileHeader, usize) =
            bincode::decode_from_slice(&bytes[..FILE_HEADER_SIZE], header_config()).map_err(|e| {
                DatabaseError::CorruptedDatabase {
                    reason: format!("undecodable file header: {}", e),
                }
            })?;

        if header.format_version != SANDI_FORMAT_VERSION {
            return Err(DatabaseError::CorruptedDatabase {
                reason: format!("Unsupported format version: {}", header.format_version),
            });
        }
        let page_size = header.page_size();
        if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(DatabaseError::CorruptedDatabase {
                reason: format!("Unsupported page size: {}", page_size),
            });
        }
        if header.cipher_id != CIPHER_AES_256_GCM || header.kdf_id != KDF_PBKDF2_HMAC_SHA512 {
            return Err(DatabaseError::CorruptedDatabase {
                reason: format!(
                    "Unknown cipher parameters: cipher={}, kdf={}",
                    header.cipher_id, header.kdf_id
                ),
            });
        }
        Ok(header)
    }
}

/// Encrypted part of page 0. Rewritten by every committed write transaction.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct DatabaseHeader {
    pub root_page_id: PageId,
    /// First free page, 0 when the free-list is empty.
    pub freelist_head: PageId,
    pub freelist_count: u64,
    /// High-water mark: page ids at or past it do not exist.
    pub page_count: u64,
    pub last_txn_id: TransactionId,
    pub change_counter: u64,
}

impl DatabaseHeader {
    /// Header of a fresh database: page 0 is the header, page 1 the empty root leaf.
    pub fn new() -> Self {
        Self {
            root_page_id: 1,
            freelist_head: 0,
            freelist_count: 0,
            page_count: 2,
            last_txn_id: 0,
            change_counter: 0,
        }
    }

    /// Plaintext bytes available for the header inside page 0.
    pub fn body_size(page_size: usize) -> usize {
        page_size - FILE_HEADER_SIZE - ENCRYPTION_OVERHEAD
    }

    pub fn to_body(&self, page_size: usize) -> Result<Vec<u8>, DatabaseError> {
        let mut buffer =
            bincode::encode_to_vec(self, header_config()).map_err(|e| DatabaseError::SerializationError {
                details: format!("database header: {}", e),
            })?;
        buffer.resize(Self::body_size(page_size), 0);
        Ok(buffer)
    }

    pub fn from_body(bytes: &[u8]) -> Result<Self, DatabaseError> {
        let (header, _): (DatabaseHeader, usize) =
            bincode::decode_from_slice(bytes, header_config())
                .map_err(|e| DatabaseError::corrupted_page(0, format!("undecodable header: {}", e)))?;
        if header.page_count < 2 || header.root_page_id == 0 || header.root_page_id >= header.page_count {
            return Err(DatabaseError::corrupted_page(
                0,
                format!(
                    "root page {} outside of {} pages",
                    header.root_page_id, header.page_count
                ),
            ));
        }
        Ok(header)
    }
}

impl Default for DatabaseHeader {
    fn default() -> Self {
        Self::new()
    }
}
