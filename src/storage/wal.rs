use std::{
    collections::{BTreeSet, HashMap},
    ffi::OsString,
    fs::{File, OpenOptions},
    io::{BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};

use crate::{
    storage::page_store::PageStore,
    types::{FrameId, PageId, TransactionId, error::DatabaseError},
    utils::hash::{calculate_frame_checksum, verify_frame_checksum},
};

const WAL_MAGIC: &[u8; 8] = b"SANDIWAL";
const WAL_VERSION: u32 = 1;
pub const WAL_HEADER_SIZE: u64 = 24; // magic(8) | version(4) | page_size(4) | checkpoint_seq(8)
pub const FRAME_HEADER_SIZE: u64 = 25; // kind(1) | txn_id(8) | page_id(8) | length(4) | crc32(4)

const FRAME_KIND_PAGE: u8 = 1;
const FRAME_KIND_COMMIT: u8 = 2;

/// Where a committed page image lives in the log.
#[derive(Debug, Clone, Copy)]
struct FrameRef {
    txn_id: TransactionId,
    payload_offset: u64,
}

/// Frames appended by a transaction that has not committed yet.
#[derive(Debug)]
struct PendingTxn {
    txn_id: TransactionId,
    start_offset: u64,
    frames: Vec<(PageId, u64)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointStats {
    pub frames: u64,
    pub pages: u64,
}

struct FrameHeader {
    kind: u8,
    txn_id: TransactionId,
    page_id: PageId,
    length: u32,
    checksum: u32,
}

impl FrameHeader {
    fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE as usize] {
        let mut buffer = [0u8; FRAME_HEADER_SIZE as usize];
        buffer[0] = self.kind;
        buffer[1..9].copy_from_slice(&self.txn_id.to_le_bytes());
        buffer[9..17].copy_from_slice(&self.page_id.to_le_bytes());
        buffer[17..21].copy_from_slice(&self.length.to_le_bytes());
        buffer[21..25].copy_from_slice(&self.checksum.to_le_bytes());
        buffer
    }

    fn from_bytes(bytes: &[u8; FRAME_HEADER_SIZE as usize]) -> Self {
        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        let u32_at = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        Self {
            kind: bytes[0],
            txn_id: u64_at(1),
            page_id: u64_at(9),
            length: u32_at(17),
            checksum: u32_at(21),
        }
    }
}

/// Append-only log of encrypted page images.
///
/// Frames of a transaction become visible to snapshot reads only after its
/// commit frame has been written and synced. The in-memory index maps each
/// page to its committed versions in log order.
pub struct Wal {
    file: File,
    path: PathBuf,
    page_size: usize,
    checkpoint_seq: u64,
    index: HashMap<PageId, Vec<FrameRef>>,
    pending: Option<PendingTxn>,
    end_offset: u64,
    next_frame_id: FrameId,
    committed_frames: u64,
    last_committed: Option<TransactionId>,
    recovered: bool,
}

pub fn wal_path_for(db_path: &Path) -> PathBuf {
    let mut wal_os: OsString = db_path.as_os_str().to_os_string();
    wal_os.push("-wal");
    PathBuf::from(wal_os)
}

impl Wal {
    /// Open (or create) the log. Call [`Wal::recover`] before appending.
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        let checkpoint_seq = if len < WAL_HEADER_SIZE {
            write_header(&mut file, page_size, 0)?;
            file.set_len(WAL_HEADER_SIZE)?;
            file.sync_all()?;
            0
        } else {
            read_header(&mut file, page_size)?
        };

        Ok(Self {
            file,
            path: path.to_path_buf(),
            page_size,
            checkpoint_seq,
            index: HashMap::new(),
            pending: None,
            end_offset: WAL_HEADER_SIZE,
            next_frame_id: 0,
            committed_frames: 0,
            last_committed: None,
            recovered: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Committed frames currently in the log.
    pub fn frame_count(&self) -> u64 {
        self.committed_frames
    }

    pub fn checkpoint_seq(&self) -> u64 {
        self.checkpoint_seq
    }

    /// Newest transaction whose frames are still in the log.
    pub fn newest_commit(&self) -> Option<TransactionId> {
        if self.committed_frames == 0 {
            None
        } else {
            self.last_committed
        }
    }

    /// Scan the log, keep every transaction that reached its commit frame and
    /// cut off everything after the last one.
    pub fn recover(&mut self) -> Result<BTreeSet<TransactionId>, DatabaseError> {
        if self.pending.is_some() {
            return Err(DatabaseError::Conflict);
        }
        self.index.clear();
        self.committed_frames = 0;
        self.next_frame_id = 0;

        let file_len = self.file.metadata()?.len();
        self.file.seek(SeekFrom::Start(WAL_HEADER_SIZE))?;
        let mut reader = BufReader::new(&self.file);

        let mut committed = BTreeSet::new();
        let mut to_publish: Vec<PendingTxn> = Vec::new();
        let mut last_committed = None;
        let mut offset = WAL_HEADER_SIZE;
        let mut valid_end = WAL_HEADER_SIZE;
        let mut current: Option<PendingTxn> = None;
        let mut header_bytes = [0u8; FRAME_HEADER_SIZE as usize];
        let mut payload = vec![0u8; self.page_size];

        loop {
            if reader.read_exact(&mut header_bytes).is_err() {
                break;
            }
            let frame = FrameHeader::from_bytes(&header_bytes);
            let payload_offset = offset + FRAME_HEADER_SIZE;

            match frame.kind {
                FRAME_KIND_PAGE => {
                    if frame.length as usize != self.page_size
                        || reader.read_exact(&mut payload).is_err()
                        || !verify_frame_checksum(
                            frame.kind,
                            frame.txn_id,
                            frame.page_id,
                            &payload,
                            frame.checksum,
                        )
                    {
                        break;
                    }
                    if last_committed.is_some_and(|last| frame.txn_id <= last) {
                        break;
                    }
                    let same_txn = current.as_ref().is_some_and(|txn| txn.txn_id == frame.txn_id);
                    if !same_txn {
                        if let Some(abandoned) = current.take() {
                            debug!(txn_id = abandoned.txn_id, "discarding frames without commit");
                        }
                        current = Some(PendingTxn {
                            txn_id: frame.txn_id,
                            start_offset: offset,
                            frames: Vec::new(),
                        });
                    }
                    if let Some(txn) = current.as_mut() {
                        txn.frames.push((frame.page_id, payload_offset));
                    }
                    offset = payload_offset + frame.length as u64;
                }
                FRAME_KIND_COMMIT => {
                    if frame.length != 0
                        || !verify_frame_checksum(frame.kind, frame.txn_id, frame.page_id, &[], frame.checksum)
                    {
                        break;
                    }
                    let Some(txn) = current.take() else {
                        break;
                    };
                    if txn.txn_id != frame.txn_id || txn.frames.len() as u64 != frame.page_id {
                        break;
                    }
                    offset = payload_offset;
                    valid_end = offset;
                    last_committed = Some(txn.txn_id);
                    committed.insert(txn.txn_id);
                    to_publish.push(txn);
                }
                _ => break,
            }
        }
        drop(reader);

        for txn in &to_publish {
            self.publish(txn.txn_id, &txn.frames);
        }

        if file_len > valid_end {
            warn!(
                path = %self.path.display(),
                discarded_bytes = file_len - valid_end,
                "truncating uncommitted WAL tail"
            );
            self.file.set_len(valid_end)?;
            self.file.sync_all()?;
        }
        self.end_offset = valid_end;
        self.recovered = true;

        if !committed.is_empty() {
            info!(
                transactions = committed.len(),
                frames = self.committed_frames,
                "recovered committed WAL transactions"
            );
        }
        Ok(committed)
    }

    /// Append one page image for `txn_id`. Not durable until [`Wal::commit`].
    pub fn append(
        &mut self,
        txn_id: TransactionId,
        page_id: PageId,
        image: &[u8],
    ) -> Result<FrameId, DatabaseError> {
        if !self.recovered {
            return Err(DatabaseError::CorruptedWal {
                offset: self.end_offset,
                reason: "append before recovery".to_string(),
            });
        }
        if image.len() != self.page_size {
            return Err(DatabaseError::InvalidPageSize {
                expected: self.page_size,
                actual: image.len(),
            });
        }
        match &self.pending {
            Some(pending) if pending.txn_id != txn_id => return Err(DatabaseError::Conflict),
            Some(_) => {}
            None => {
                if self.last_committed.is_some_and(|last| txn_id <= last) {
                    return Err(DatabaseError::CorruptedWal {
                        offset: self.end_offset,
                        reason: format!("transaction id {} is not newer than the last commit", txn_id),
                    });
                }
                self.pending = Some(PendingTxn {
                    txn_id,
                    start_offset: self.end_offset,
                    frames: Vec::new(),
                });
            }
        }

        let header = FrameHeader {
            kind: FRAME_KIND_PAGE,
            txn_id,
            page_id,
            length: image.len() as u32,
            checksum: calculate_frame_checksum(FRAME_KIND_PAGE, txn_id, page_id, image),
        };
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE as usize + image.len());
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(image);

        self.file.seek(SeekFrom::Start(self.end_offset))?;
        self.file.write_all(&frame)?;

        let payload_offset = self.end_offset + FRAME_HEADER_SIZE;
        self.end_offset += frame.len() as u64;
        if let Some(pending) = self.pending.as_mut() {
            pending.frames.push((page_id, payload_offset));
        }
        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;
        Ok(frame_id)
    }

    /// Write the commit frame, sync, then publish the frames to snapshot reads.
    pub fn commit(&mut self, txn_id: TransactionId) -> Result<(), DatabaseError> {
        let frame_count = match &self.pending {
            Some(pending) if pending.txn_id == txn_id => pending.frames.len() as u64,
            _ => {
                return Err(DatabaseError::CorruptedWal {
                    offset: self.end_offset,
                    reason: format!("commit of transaction {} without frames", txn_id),
                });
            }
        };

        let header = FrameHeader {
            kind: FRAME_KIND_COMMIT,
            txn_id,
            page_id: frame_count,
            length: 0,
            checksum: calculate_frame_checksum(FRAME_KIND_COMMIT, txn_id, frame_count, &[]),
        };
        self.file.seek(SeekFrom::Start(self.end_offset))?;
        self.file.write_all(&header.to_bytes())?;
        self.file.sync_data()?;

        self.end_offset += FRAME_HEADER_SIZE;
        if let Some(pending) = self.pending.take() {
            self.publish(pending.txn_id, &pending.frames);
        }
        debug!(txn_id, frames = frame_count, "WAL commit durable");
        Ok(())
    }

    /// Forget the frames of an uncommitted transaction. No-op when none are pending.
    pub fn rollback(&mut self, txn_id: TransactionId) -> Result<(), DatabaseError> {
        let start = match &self.pending {
            Some(pending) if pending.txn_id == txn_id => pending.start_offset,
            _ => return Ok(()),
        };
        self.pending = None;
        self.end_offset = start;
        self.file.set_len(start)?;
        debug!(txn_id, "WAL frames rolled back");
        Ok(())
    }

    /// Newest committed image of `page_id` visible at `snapshot`.
    pub fn read_page(
        &mut self,
        page_id: PageId,
        snapshot: TransactionId,
    ) -> Result<Option<Vec<u8>>, DatabaseError> {
        let Some(frame) = self
            .index
            .get(&page_id)
            .and_then(|versions| versions.iter().rev().find(|f| f.txn_id <= snapshot))
            .copied()
        else {
            return Ok(None);
        };
        let mut image = vec![0u8; self.page_size];
        self.file.seek(SeekFrom::Start(frame.payload_offset))?;
        self.file.read_exact(&mut image)?;
        Ok(Some(image))
    }

    /// Newest committed image of `page_id`, whatever the snapshot.
    pub fn latest_image(&mut self, page_id: PageId) -> Result<Option<Vec<u8>>, DatabaseError> {
        self.read_page(page_id, TransactionId::MAX)
    }

    /// Copy the newest committed image of every page into the main file, sync
    /// it, then empty the log.
    pub fn checkpoint(&mut self, store: &mut PageStore) -> Result<CheckpointStats, DatabaseError> {
        if self.pending.is_some() {
            return Err(DatabaseError::Conflict);
        }
        let stats = CheckpointStats {
            frames: self.committed_frames,
            pages: self.index.len() as u64,
        };
        if stats.frames == 0 {
            return Ok(stats);
        }

        let mut pages: Vec<PageId> = self.index.keys().copied().collect();
        pages.sort_unstable();
        for page_id in pages {
            if let Some(image) = self.latest_image(page_id)? {
                store.write_image(page_id, &image)?;
            }
        }
        store.flush()?;

        self.checkpoint_seq += 1;
        write_header(&mut self.file, self.page_size, self.checkpoint_seq)?;
        self.file.set_len(WAL_HEADER_SIZE)?;
        self.file.sync_all()?;

        self.index.clear();
        self.end_offset = WAL_HEADER_SIZE;
        self.committed_frames = 0;
        self.next_frame_id = 0;

        info!(
            checkpoint_seq = self.checkpoint_seq,
            frames = stats.frames,
            pages = stats.pages,
            "checkpoint complete"
        );
        Ok(stats)
    }

    fn publish(&mut self, txn_id: TransactionId, frames: &[(PageId, u64)]) {
        for &(page_id, payload_offset) in frames {
            self.index.entry(page_id).or_default().push(FrameRef {
                txn_id,
                payload_offset,
            });
        }
        self.committed_frames += frames.len() as u64;
        self.next_frame_id = self.next_frame_id.max(self.committed_frames);
        self.last_committed = Some(txn_id);
    }
}

fn write_header(file: &mut File, page_size: usize, checkpoint_seq: u64) -> Result<(), DatabaseError> {
    let mut header = [0u8; WAL_HEADER_SIZE as usize];
    header[0..8].copy_from_slice(WAL_MAGIC);
    header[8..12].copy_from_slice(&WAL_VERSION.to_le_bytes());
    header[12..16].copy_from_slice(&(page_size as u32).to_le_bytes());
    header[16..24].copy_from_slice(&checkpoint_seq.to_le_bytes());
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)?;
    Ok(())
}

fn read_header(file: &mut File, expected_page_size: usize) -> Result<u64, DatabaseError> {
    let mut header = [0u8; WAL_HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header)?;

    if &header[0..8] != WAL_MAGIC {
        return Err(DatabaseError::CorruptedWal {
            offset: 0,
            reason: "invalid WAL header (bad magic)".to_string(),
        });
    }
    let version = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    if version != WAL_VERSION {
        return Err(DatabaseError::CorruptedWal {
            offset: 8,
            reason: format!("unsupported WAL version {}", version),
        });
    }
    let page_size = u32::from_le_bytes([header[12], header[13], header[14], header[15]]) as usize;
    if page_size != expected_page_size {
        return Err(DatabaseError::CorruptedWal {
            offset: 12,
            reason: format!(
                "WAL page size {} does not match database page size {}",
                page_size, expected_page_size
            ),
        });
    }
    let mut seq = [0u8; 8];
    seq.copy_from_slice(&header[16..24]);
    Ok(u64::from_le_bytes(seq))
}
