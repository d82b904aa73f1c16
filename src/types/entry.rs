use crate::types::{
    INTERIOR_CELL_OVERHEAD, LEAF_CELL_OVERHEAD, PageId, SLOT_DIRECTORY_ENTRY_SIZE,
    error::DatabaseError,
};

/// Key/value record stored in a leaf cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl LeafEntry {
    pub fn new(key: &[u8], value: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            value: value.to_vec(),
        }
    }

    /// Bytes this entry occupies in a page, slot included.
    pub fn footprint(&self) -> usize {
        LEAF_CELL_OVERHEAD + self.key.len() + self.value.len() + SLOT_DIRECTORY_ENTRY_SIZE
    }

    /// Serialize entry as key_len(2) | value_len(4) | key | value
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(LEAF_CELL_OVERHEAD + self.key.len() + self.value.len());
        bytes.extend_from_slice(&(self.key.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.key);
        bytes.extend_from_slice(&self.value);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DatabaseError> {
        if bytes.len() < LEAF_CELL_OVERHEAD {
            return Err(DatabaseError::SerializationError {
                details: "Insufficient bytes for leaf cell header".to_string(),
            });
        }
        let key_len = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        let value_len = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize;
        if bytes.len() != LEAF_CELL_OVERHEAD + key_len + value_len {
            return Err(DatabaseError::SerializationError {
                details: format!(
                    "Leaf cell length {} does not match key {} + value {}",
                    bytes.len(),
                    key_len,
                    value_len
                ),
            });
        }
        let key_end = LEAF_CELL_OVERHEAD + key_len;
        Ok(Self {
            key: bytes[LEAF_CELL_OVERHEAD..key_end].to_vec(),
            value: bytes[key_end..].to_vec(),
        })
    }
}

/// Separator key and the child holding keys below it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteriorEntry {
    pub key: Vec<u8>,
    pub child: PageId,
}

impl InteriorEntry {
    pub fn new(key: Vec<u8>, child: PageId) -> Self {
        Self { key, child }
    }

    pub fn footprint(key: &[u8]) -> usize {
        INTERIOR_CELL_OVERHEAD + key.len() + SLOT_DIRECTORY_ENTRY_SIZE
    }

    /// Serialize entry as child(8) | key_len(2) | key
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(INTERIOR_CELL_OVERHEAD + self.key.len());
        bytes.extend_from_slice(&self.child.to_le_bytes());
        bytes.extend_from_slice(&(self.key.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&self.key);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DatabaseError> {
        if bytes.len() < INTERIOR_CELL_OVERHEAD {
            return Err(DatabaseError::SerializationError {
                details: "Interior entry too short".to_string(),
            });
        }
        let mut child = [0u8; 8];
        child.copy_from_slice(&bytes[0..8]);
        let key_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        if bytes.len() != INTERIOR_CELL_OVERHEAD + key_len {
            return Err(DatabaseError::SerializationError {
                details: "Interior entry key data incomplete".to_string(),
            });
        }
        Ok(Self {
            key: bytes[INTERIOR_CELL_OVERHEAD..].to_vec(),
            child: u64::from_le_bytes(child),
        })
    }
}
