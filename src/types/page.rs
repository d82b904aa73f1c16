use crate::types::{PAGE_HEADER_SIZE, PageId, SLOT_DIRECTORY_ENTRY_SIZE, error::DatabaseError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Free = 1,
    Interior = 5,
    Leaf = 13,
}

impl PageType {
    pub fn from_u8(value: u8) -> Result<Self, DatabaseError> {
        match value {
            1 => Ok(PageType::Free),
            5 => Ok(PageType::Interior),
            13 => Ok(PageType::Leaf),
            _ => Err(DatabaseError::InvalidPageType(value)),
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlotEntry {
    pub offset: u16, // Offset from beginning of page
    pub length: u16, // Length of the cell
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlotDirectory {
    pub slots: Vec<SlotEntry>,
}

/*
 * Page Layout (plaintext, before encryption)
 * ┌─────────────────────────────────────────────────────────────────┐
 * │                    PAGE HEADER (24 bytes)                       │
 * │  page_id(8) | page_type(1) | cell_count(2) |                    │
 * │  free_space_offset(2) | right_pointer(8) | reserved(3)          │
 * ├─────────────────────────────────────────────────────────────────┤
 * │                  SLOT DIRECTORY (in key order)                  │
 * │  [slot0: offset(2)|len(2)] [slot1: offset(2)|len(2)] ...        │
 * ├─────────────────────────────────────────────────────────────────┤
 * │                    FREE SPACE                                   │
 * ├─────────────────────────────────────────────────────────────────┤
 * │                   CELL DATA                                     │
 * │  [...cell N...] [...cell 2...] [...cell 1...] [...cell 0...]    │
 * └─────────────────────────────────────────────────────────────────┘
 *
 * right_pointer: next leaf (leaf), right-most child (interior),
 * next free page (free). u64::MAX represents None.
 */

#[derive(Debug, Clone)]
pub struct Page {
    pub page_id: PageId,
    pub page_type: PageType,
    pub right_pointer: Option<PageId>,

    // Slotted page structure
    pub slot_directory: SlotDirectory,
    pub free_space_offset: u16,
    pub cell_count: u16,

    // Data storage
    pub data: Vec<u8>,
}

impl Page {
    pub fn new(page_id: PageId, page_type: PageType, size: usize) -> Self {
        Self {
            page_id,
            page_type,
            right_pointer: None,
            slot_directory: SlotDirectory { slots: Vec::new() },
            free_space_offset: size as u16,
            cell_count: 0,
            data: vec![0; size],
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Serialize the page to bytes following the documented layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let size = self.size();
        let mut buffer = vec![0u8; size];
        let mut offset = 0;

        buffer[offset..offset + 8].copy_from_slice(&self.page_id.to_le_bytes());
        offset += 8;

        buffer[offset] = self.page_type.as_u8();
        offset += 1;

        buffer[offset..offset + 2].copy_from_slice(&self.cell_count.to_le_bytes());
        offset += 2;

        buffer[offset..offset + 2].copy_from_slice(&self.free_space_offset.to_le_bytes());
        offset += 2;

        let right_pointer = self.right_pointer.unwrap_or(u64::MAX);
        buffer[offset..offset + 8].copy_from_slice(&right_pointer.to_le_bytes());

        // reserved bytes stay zero
        offset = PAGE_HEADER_SIZE;

        for slot in &self.slot_directory.slots {
            buffer[offset..offset + 2].copy_from_slice(&slot.offset.to_le_bytes());
            offset += 2;
            buffer[offset..offset + 2].copy_from_slice(&slot.length.to_le_bytes());
            offset += 2;
        }

        let data_start = self.free_space_offset as usize;
        buffer[data_start..].copy_from_slice(&self.data[data_start..]);

        buffer
    }

    /// Deserialize a page, checking that it really is `expected_page_id`.
    pub fn from_bytes(expected_page_id: PageId, bytes: &[u8]) -> Result<Self, DatabaseError> {
        let size = bytes.len();
        if size < PAGE_HEADER_SIZE {
            return Err(DatabaseError::InvalidPageSize {
                expected: PAGE_HEADER_SIZE,
                actual: size,
            });
        }

        let page_id = read_u64(bytes, 0);
        if page_id != expected_page_id {
            return Err(DatabaseError::corrupted_page(
                expected_page_id,
                format!("page header names page {}", page_id),
            ));
        }
        let page_type = PageType::from_u8(bytes[8])?;
        let cell_count = u16::from_le_bytes([bytes[9], bytes[10]]);
        let free_space_offset = u16::from_le_bytes([bytes[11], bytes[12]]);
        let right_pointer = match read_u64(bytes, 13) {
            u64::MAX => None,
            pointer => Some(pointer),
        };

        if free_space_offset as usize > size {
            return Err(DatabaseError::corrupted_page(
                page_id,
                format!("Invalid free_space_offset: {}", free_space_offset),
            ));
        }

        let mut offset = PAGE_HEADER_SIZE;
        let mut slots = Vec::with_capacity(cell_count as usize);
        for _ in 0..cell_count {
            if offset + SLOT_DIRECTORY_ENTRY_SIZE > free_space_offset as usize {
                return Err(DatabaseError::corrupted_page(
                    page_id,
                    "Slot directory overlaps cell data",
                ));
            }

            let slot_offset = u16::from_le_bytes([bytes[offset], bytes[offset + 1]]);
            let length = u16::from_le_bytes([bytes[offset + 2], bytes[offset + 3]]);
            offset += SLOT_DIRECTORY_ENTRY_SIZE;

            if (slot_offset as usize) < free_space_offset as usize
                || slot_offset as usize + length as usize > size
            {
                return Err(DatabaseError::corrupted_page(
                    page_id,
                    format!(
                        "Slot at offset {} with length {} is outside the cell area",
                        slot_offset, length
                    ),
                ));
            }

            slots.push(SlotEntry {
                offset: slot_offset,
                length,
            });
        }

        Ok(Page {
            page_id,
            page_type,
            right_pointer,
            slot_directory: SlotDirectory { slots },
            free_space_offset,
            cell_count,
            data: bytes.to_vec(),
        })
    }

    pub fn available_space(&self) -> usize {
        let slot_directory_size = self.slot_directory.slots.len() * SLOT_DIRECTORY_ENTRY_SIZE;
        (self.free_space_offset as usize).saturating_sub(PAGE_HEADER_SIZE + slot_directory_size)
    }

    pub fn can_fit(&self, data_size: usize) -> bool {
        self.available_space() >= data_size + SLOT_DIRECTORY_ENTRY_SIZE
    }

    /// Append a cell after the existing ones; slot order is cell order.
    pub fn insert_cell(&mut self, data: &[u8]) -> Result<usize, DatabaseError> {
        if !self.can_fit(data.len()) {
            return Err(DatabaseError::corrupted_page(
                self.page_id,
                format!("cell of {} bytes does not fit", data.len()),
            ));
        }

        // Cells grow downward from the end of the page
        let new_offset = self.free_space_offset - data.len() as u16;
        let start = new_offset as usize;
        self.data[start..start + data.len()].copy_from_slice(data);

        let slot_index = self.slot_directory.slots.len();
        self.slot_directory.slots.push(SlotEntry {
            offset: new_offset,
            length: data.len() as u16,
        });

        self.free_space_offset = new_offset;
        self.cell_count += 1;

        Ok(slot_index)
    }

    pub fn get_cell(&self, slot_index: usize) -> Option<&[u8]> {
        self.slot_directory.slots.get(slot_index).map(|slot| {
            let start = slot.offset as usize;
            &self.data[start..start + slot.length as usize]
        })
    }

    pub fn cells(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.slot_directory.slots.len()).filter_map(move |i| self.get_cell(i))
    }
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}
