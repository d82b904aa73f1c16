use crc32fast::Hasher;

use crate::types::{PageId, TransactionId};

pub fn calculate_frame_checksum(
    kind: u8,
    txn_id: TransactionId,
    page_id: PageId,
    payload: &[u8],
) -> u32 {
    let mut hasher = Hasher::new();

    hasher.update(&[kind]);
    hasher.update(&txn_id.to_le_bytes());
    hasher.update(&page_id.to_le_bytes());
    hasher.update(&(payload.len() as u32).to_le_bytes());
    hasher.update(payload);

    hasher.finalize()
}

pub fn verify_frame_checksum(
    kind: u8,
    txn_id: TransactionId,
    page_id: PageId,
    payload: &[u8],
    expected_checksum: u32,
) -> bool {
    calculate_frame_checksum(kind, txn_id, page_id, payload) == expected_checksum
}
