use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    cipher::{PageCodec, derive_key, generate_salt},
    config::Config,
    storage::{
        bplus_tree::BPlusTree,
        freelist,
        header::{DatabaseHeader, FileHeader},
        page_store::PageStore,
        wal::{CheckpointStats, Wal, wal_path_for},
    },
    transaction::{Transaction, TransactionManager, TransactionMode},
    types::{
        FILE_HEADER_SIZE, PageId, TransactionId,
        error::DatabaseError,
        node::{LeafNode, Node},
        usable_size,
    },
};

/// Result of [`Database::checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    Completed(CheckpointStats),
    /// A writer is active, or a reader still needs a WAL version.
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub page_size: usize,
    pub page_count: u64,
    pub free_pages: u64,
    pub wal_frames: u64,
    pub checkpoint_seq: u64,
    pub last_committed: TransactionId,
    pub active_readers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub page_count: u64,
    pub tree_height: usize,
    pub entries: u64,
    pub leaf_pages: u64,
    pub interior_pages: u64,
    pub free_pages: u64,
}

/// Releases writer admission, and exclusive access if taken, when dropped.
struct WriterGuard<'a> {
    manager: &'a TransactionManager,
    snapshot: TransactionId,
    exclusive: bool,
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        if self.exclusive {
            self.manager.release_exclusive();
        } else {
            self.manager.release_writer();
        }
    }
}

/// An open encrypted database.
///
/// Locks are always taken WAL first, then the page store.
pub struct Database {
    path: PathBuf,
    config: Config,
    page_size: usize,
    wal: Mutex<Wal>,
    store: Mutex<PageStore>,
    manager: TransactionManager,
}

fn open_error(path: &Path, reason: impl Into<String>) -> DatabaseError {
    DatabaseError::Open {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

impl Database {
    /// Open the database at `path`, creating it when the file is missing or empty.
    pub fn open<P: AsRef<Path>>(path: P, passphrase: &str, config: Config) -> Result<Self, DatabaseError> {
        config.validate()?;
        let path = path.as_ref();
        let is_new = match fs::metadata(path) {
            Ok(metadata) => metadata.len() == 0,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => return Err(open_error(path, e.to_string())),
        };

        let (store, wal, last_committed) = if is_new {
            Self::create_files(path, passphrase, &config)?
        } else {
            Self::open_files(path, passphrase, &config)?
        };

        let manager = TransactionManager::new(last_committed, config.writer_wait);
        let database = Self {
            path: path.to_path_buf(),
            page_size: store.page_size(),
            config,
            wal: Mutex::new(wal),
            store: Mutex::new(store),
            manager,
        };

        {
            let mut wal = database.wal.lock();
            let mut store = database.store.lock();
            wal.checkpoint(&mut store)?;
        }
        info!(
            path = %path.display(),
            page_size = database.page_size,
            last_committed,
            created = is_new,
            "database opened"
        );
        Ok(database)
    }

    fn create_files(
        path: &Path,
        passphrase: &str,
        config: &Config,
    ) -> Result<(PageStore, Wal, TransactionId), DatabaseError> {
        let salt = generate_salt();
        let key = derive_key(passphrase.as_bytes(), &salt, config.kdf_iterations)?;
        let file_header = FileHeader::new(config.page_size, config.kdf_iterations, salt);
        let mut store = PageStore::create(path, PageCodec::new(&key), file_header)
            .map_err(|e| open_error(path, e.to_string()))?;

        let header = DatabaseHeader::new();
        let root = Node::Leaf(LeafNode::default());
        store.write_page(0, &header.to_body(config.page_size)?)?;
        store.write_page(header.root_page_id, &root.to_bytes(header.root_page_id, store.usable_size())?)?;
        store.flush()?;

        // A log left over from an earlier file at this path is meaningless now
        let wal_path = wal_path_for(path);
        if wal_path.exists() {
            fs::remove_file(&wal_path)?;
        }
        let mut wal = Wal::open(&wal_path, config.page_size)?;
        wal.recover()?;

        debug!(path = %path.display(), page_size = config.page_size, "created database files");
        Ok((store, wal, header.last_txn_id))
    }

    fn open_files(
        path: &Path,
        passphrase: &str,
        config: &Config,
    ) -> Result<(PageStore, Wal, TransactionId), DatabaseError> {
        let main_image = PageStore::read_header_image(path).map_err(|e| open_error(path, e.to_string()))?;
        let page_size = FileHeader::from_bytes(&main_image)
            .map_err(|e| open_error(path, e.to_string()))?
            .page_size();
        if page_size != config.page_size {
            debug!(
                file_page_size = page_size,
                configured = config.page_size,
                "existing database keeps its page size"
            );
        }

        let mut wal = Wal::open(wal_path_for(path), page_size).map_err(|e| open_error(path, e.to_string()))?;
        let recovered = wal.recover()?;

        // After an interrupted rekey the newest header (and salt) is in the log
        let image = wal.latest_image(0)?.unwrap_or(main_image);
        let file_header = FileHeader::from_bytes(&image[..FILE_HEADER_SIZE])
            .map_err(|e| open_error(path, e.to_string()))?;
        if file_header.page_size() != page_size {
            return Err(open_error(path, "page size changed inside the log"));
        }

        let key = derive_key(passphrase.as_bytes(), &file_header.salt, file_header.kdf_iterations)?;
        let store = PageStore::open(path, PageCodec::new(&key), file_header)?;
        let header = DatabaseHeader::from_body(&store.decode_page(0, &image)?)?;

        if let Some(&newest) = recovered.last() {
            if newest != header.last_txn_id {
                return Err(DatabaseError::CorruptedDatabase {
                    reason: format!(
                        "header records transaction {} but the log ends at {}",
                        header.last_txn_id, newest
                    ),
                });
            }
        }
        Ok((store, wal, header.last_txn_id))
    }

    /// Checkpoint and sync everything. Dropping without `close` leaves the
    /// log for recovery on the next open.
    pub fn close(self) -> Result<(), DatabaseError> {
        let mut wal = self.wal.lock();
        let mut store = self.store.lock();
        let stats = wal.checkpoint(&mut store)?;
        store.flush()?;
        info!(path = %self.path.display(), frames = stats.frames, "database closed");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn page_capacity(&self) -> usize {
        usable_size(self.page_size)
    }

    pub(crate) fn manager(&self) -> &TransactionManager {
        &self.manager
    }

    pub fn begin(&self, mode: TransactionMode) -> Result<Transaction<'_>, DatabaseError> {
        Transaction::begin(self, mode)
    }

    pub fn begin_read(&self) -> Result<Transaction<'_>, DatabaseError> {
        self.begin(TransactionMode::Read)
    }

    pub fn begin_write(&self) -> Result<Transaction<'_>, DatabaseError> {
        self.begin(TransactionMode::Write)
    }

    /// Plaintext of `page_id` as of `snapshot`: the log first, then the main file.
    pub(crate) fn read_committed_page(
        &self,
        page_id: PageId,
        snapshot: TransactionId,
    ) -> Result<Vec<u8>, DatabaseError> {
        // The log guard stays held so rekey cannot swap the codec under the image
        let mut wal = self.wal.lock();
        let image = wal.read_page(page_id, snapshot)?;
        let mut store = self.store.lock();
        match image {
            Some(image) => store.decode_page(page_id, &image),
            None => store.read_page(page_id),
        }
    }

    pub(crate) fn read_header(&self, snapshot: TransactionId) -> Result<DatabaseHeader, DatabaseError> {
        DatabaseHeader::from_body(&self.read_committed_page(0, snapshot)?)
    }

    /// Append a writer's pages plus the header page as one log transaction.
    /// Called with writer admission held.
    pub(crate) fn commit_write(
        &self,
        txn_id: TransactionId,
        header: &DatabaseHeader,
        dirty: &BTreeMap<PageId, Vec<u8>>,
    ) -> Result<(), DatabaseError> {
        let images = {
            let store = self.store.lock();
            let mut images = Vec::with_capacity(dirty.len() + 1);
            images.push((0, store.encode_page(0, &header.to_body(self.page_size)?)?));
            for (&page_id, data) in dirty {
                images.push((page_id, store.encode_page(page_id, data)?));
            }
            images
        };

        let mut wal = self.wal.lock();
        if let Err(e) = append_transaction(&mut wal, txn_id, &images) {
            if let Err(rollback_error) = wal.rollback(txn_id) {
                warn!(txn_id, error = %rollback_error, "failed to discard WAL frames");
            }
            return Err(e);
        }
        self.manager.publish_commit(txn_id);
        debug!(txn_id, pages = images.len(), "commit published");

        let threshold = self.config.checkpoint_interval_frames;
        if threshold > 0 && wal.frame_count() >= threshold {
            match self.checkpoint_locked(&mut wal) {
                Ok(CheckpointOutcome::Busy) => debug!("automatic checkpoint deferred by readers"),
                Ok(CheckpointOutcome::Completed(_)) => {}
                Err(e) => warn!(error = %e, "automatic checkpoint failed"),
            }
        }
        Ok(())
    }

    /// Copy committed log frames into the main file and truncate the log.
    ///
    /// Returns `Busy` instead of waiting when a writer is active or a reader's
    /// snapshot is older than the newest logged commit.
    pub fn checkpoint(&self) -> Result<CheckpointOutcome, DatabaseError> {
        let Some(_writer) = self.try_writer() else {
            debug!("checkpoint skipped, writer active");
            return Ok(CheckpointOutcome::Busy);
        };
        let mut wal = self.wal.lock();
        self.checkpoint_locked(&mut wal)
    }

    fn checkpoint_locked(&self, wal: &mut Wal) -> Result<CheckpointOutcome, DatabaseError> {
        if let (Some(newest), Some(oldest)) = (wal.newest_commit(), self.manager.oldest_snapshot()) {
            if oldest < newest {
                debug!(oldest_snapshot = oldest, newest_commit = newest, "checkpoint busy");
                return Ok(CheckpointOutcome::Busy);
            }
        }
        let mut store = self.store.lock();
        Ok(CheckpointOutcome::Completed(wal.checkpoint(&mut store)?))
    }

    fn try_writer(&self) -> Option<WriterGuard<'_>> {
        self.manager.try_acquire_writer().map(|snapshot| WriterGuard {
            manager: &self.manager,
            snapshot,
            exclusive: false,
        })
    }

    /// Re-encrypt every page under a key derived from `new_passphrase` and a
    /// fresh salt. Needs exclusive access: fails with `Conflict` while any
    /// reader is open, and new readers wait until it finishes.
    pub fn rekey(&self, new_passphrase: &str) -> Result<(), DatabaseError> {
        let salt = generate_salt();
        let key = derive_key(new_passphrase.as_bytes(), &salt, self.config.kdf_iterations)?;
        let new_codec = PageCodec::new(&key);
        let new_file_header = FileHeader::new(self.page_size, self.config.kdf_iterations, salt);

        let snapshot = self.manager.acquire_exclusive()?;
        let writer = WriterGuard {
            manager: &self.manager,
            snapshot,
            exclusive: true,
        };
        let txn_id = writer.snapshot + 1;

        let mut wal = self.wal.lock();
        let mut store = self.store.lock();
        wal.checkpoint(&mut store)?;

        let mut header = DatabaseHeader::from_body(&store.read_page(0)?)?;
        header.last_txn_id = txn_id;
        header.change_counter += 1;
        let mut plaintexts = Vec::with_capacity(header.page_count as usize);
        plaintexts.push(header.to_body(self.page_size)?);
        for page_id in 1..header.page_count {
            plaintexts.push(store.read_page(page_id)?);
        }

        let old_codec = store.codec().clone();
        let old_file_header = store.file_header().clone();
        store.rekey(new_codec, new_file_header);

        let mut images = Vec::with_capacity(plaintexts.len());
        let mut encoded = Ok(());
        for (page_id, plaintext) in plaintexts.iter().enumerate() {
            match store.encode_page(page_id as PageId, plaintext) {
                Ok(image) => images.push((page_id as PageId, image)),
                Err(e) => {
                    encoded = Err(e);
                    break;
                }
            }
        }
        if let Err(e) = encoded.and_then(|()| append_transaction(&mut wal, txn_id, &images)) {
            if let Err(rollback_error) = wal.rollback(txn_id) {
                warn!(txn_id, error = %rollback_error, "failed to discard rekey frames");
            }
            store.rekey(old_codec, old_file_header);
            return Err(e);
        }
        self.manager.publish_commit(txn_id);

        // Every image in the main file still uses the old key
        wal.checkpoint(&mut store)?;
        info!(txn_id, pages = images.len(), "database rekeyed");
        Ok(())
    }

    pub fn stats(&self) -> Result<DatabaseStats, DatabaseError> {
        let txn = self.begin_read()?;
        let header = txn.header().clone();
        let (wal_frames, checkpoint_seq) = {
            let wal = self.wal.lock();
            (wal.frame_count(), wal.checkpoint_seq())
        };
        Ok(DatabaseStats {
            page_size: self.page_size,
            page_count: header.page_count,
            free_pages: header.freelist_count,
            wal_frames,
            checkpoint_seq,
            last_committed: txn.snapshot(),
            // Not counting the reader this call holds
            active_readers: self.manager.active_readers().saturating_sub(1),
        })
    }

    /// Verify the tree and the free-list at the current snapshot and check
    /// that together with the header they account for every page.
    pub fn integrity_check(&self) -> Result<IntegrityReport, DatabaseError> {
        let txn = self.begin_read()?;
        let header = txn.header().clone();
        let tree = BPlusTree::new(header.root_page_id).check(&txn)?;
        let free_pages = freelist::walk(&txn, &header)?;

        let free_set: BTreeSet<PageId> = free_pages.iter().copied().collect();
        if free_set.len() != free_pages.len() {
            return Err(DatabaseError::CorruptedDatabase {
                reason: "free-list contains a page twice".to_string(),
            });
        }
        if let Some(page_id) = tree.page_ids.intersection(&free_set).next() {
            return Err(DatabaseError::corrupted_page(*page_id, "page is both in the tree and free"));
        }
        let accounted = 1 + tree.page_ids.len() as u64 + free_set.len() as u64;
        if accounted != header.page_count {
            return Err(DatabaseError::CorruptedDatabase {
                reason: format!(
                    "{} pages accounted for, header records {}",
                    accounted, header.page_count
                ),
            });
        }

        Ok(IntegrityReport {
            page_count: header.page_count,
            tree_height: tree.height,
            entries: tree.entries,
            leaf_pages: tree.leaf_pages,
            interior_pages: tree.interior_pages,
            free_pages: free_set.len() as u64,
        })
    }
}

fn append_transaction(
    wal: &mut Wal,
    txn_id: TransactionId,
    images: &[(PageId, Vec<u8>)],
) -> Result<(), DatabaseError> {
    for (page_id, image) in images {
        wal.append(txn_id, *page_id, image)?;
    }
    wal.commit(txn_id)
}
