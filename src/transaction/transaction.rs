use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use crate::{
    database::Database,
    storage::{
        PageRead, PageWrite, bplus_tree::BPlusTree, freelist, header::DatabaseHeader, scan::Scan,
    },
    transaction::{TransactionMode, TransactionState},
    types::{PageId, TransactionId, error::DatabaseError},
};

/// Undo information for the operation in progress.
#[derive(Debug)]
struct Savepoint {
    header: DatabaseHeader,
    /// Dirty state of each page before its first write in this operation;
    /// `None` means the page was clean.
    pages: HashMap<PageId, Option<Vec<u8>>>,
}

/// A read or write transaction borrowing its [`Database`].
///
/// Readers see the snapshot taken at begin. The single writer buffers its
/// pages privately and publishes them atomically on commit. Dropping an
/// active transaction rolls it back.
pub struct Transaction<'db> {
    db: &'db Database,
    id: TransactionId,
    mode: TransactionMode,
    snapshot: TransactionId,
    state: TransactionState,
    header: DatabaseHeader,
    dirty: BTreeMap<PageId, Vec<u8>>,
    savepoint: Option<Savepoint>,
}

impl<'db> Transaction<'db> {
    pub(crate) fn begin(db: &'db Database, mode: TransactionMode) -> Result<Self, DatabaseError> {
        let manager = db.manager();
        let snapshot = match mode {
            TransactionMode::Read => manager.begin_read(),
            TransactionMode::Write => manager.acquire_writer()?,
        };

        let header = match db.read_header(snapshot) {
            Ok(header) => header,
            Err(e) => {
                match mode {
                    TransactionMode::Read => manager.end_read(snapshot),
                    TransactionMode::Write => manager.release_writer(),
                }
                return Err(e);
            }
        };

        // A writer is identified by the commit id it will publish
        let id = match mode {
            TransactionMode::Read => snapshot,
            TransactionMode::Write => snapshot + 1,
        };
        debug!(txn_id = id, ?mode, snapshot, "transaction begun");

        Ok(Self {
            db,
            id,
            mode,
            snapshot,
            state: TransactionState::Active,
            header,
            dirty: BTreeMap::new(),
            savepoint: None,
        })
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn snapshot(&self) -> TransactionId {
        self.snapshot
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub(crate) fn header(&self) -> &DatabaseHeader {
        &self.header
    }

    fn tree(&self) -> BPlusTree {
        BPlusTree::new(self.header.root_page_id)
    }

    fn ensure_active(&self) -> Result<(), DatabaseError> {
        if self.state != TransactionState::Active {
            return Err(DatabaseError::TransactionClosed);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<(), DatabaseError> {
        self.ensure_active()?;
        if self.mode != TransactionMode::Write {
            return Err(DatabaseError::ReadOnlyTransaction);
        }
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        self.ensure_active()?;
        self.tree().get(self, key)
    }

    /// Insert or replace `key`.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), DatabaseError> {
        self.ensure_writable()?;
        self.with_savepoint(|txn| {
            let mut tree = txn.tree();
            tree.put(txn, key, value)?;
            txn.header.root_page_id = tree.root_page_id;
            Ok(())
        })
    }

    /// Remove `key`, returning whether it existed.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool, DatabaseError> {
        self.ensure_writable()?;
        self.with_savepoint(|txn| {
            let mut tree = txn.tree();
            let existed = tree.delete(txn, key)?;
            txn.header.root_page_id = tree.root_page_id;
            Ok(existed)
        })
    }

    /// Records with `low <= key < high` in key order.
    pub fn scan(&self, low: Option<&[u8]>, high: Option<&[u8]>) -> Result<Scan<'_, Self>, DatabaseError> {
        self.ensure_active()?;
        Ok(self.tree().scan(self, low, high))
    }

    /// Run one operation so that a failure leaves no trace of it.
    fn with_savepoint<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<T, DatabaseError>,
    ) -> Result<T, DatabaseError> {
        self.savepoint = Some(Savepoint {
            header: self.header.clone(),
            pages: HashMap::new(),
        });
        let result = op(self);
        let savepoint = self.savepoint.take();
        if let (Err(e), Some(savepoint)) = (&result, savepoint) {
            debug!(txn_id = self.id, error = %e, "operation failed, restoring savepoint");
            self.header = savepoint.header;
            for (page_id, previous) in savepoint.pages {
                match previous {
                    Some(data) => self.dirty.insert(page_id, data),
                    None => self.dirty.remove(&page_id),
                };
            }
        }
        result
    }

    /// Make the transaction's writes durable and visible to later snapshots.
    ///
    /// On failure the transaction ends rolled back.
    pub fn commit(&mut self) -> Result<(), DatabaseError> {
        self.ensure_active()?;
        let manager = self.db.manager();
        match self.mode {
            TransactionMode::Read => {
                manager.end_read(self.snapshot);
                self.state = TransactionState::Committed;
                Ok(())
            }
            TransactionMode::Write => {
                let result = if self.dirty.is_empty() {
                    Ok(())
                } else {
                    let mut header = self.header.clone();
                    header.last_txn_id = self.id;
                    header.change_counter += 1;
                    self.db.commit_write(self.id, &header, &self.dirty)
                };
                self.dirty.clear();
                manager.release_writer();
                match result {
                    Ok(()) => {
                        self.state = TransactionState::Committed;
                        debug!(txn_id = self.id, "transaction committed");
                        Ok(())
                    }
                    Err(e) => {
                        self.state = TransactionState::RolledBack;
                        warn!(txn_id = self.id, error = %e, "commit failed, transaction rolled back");
                        Err(e)
                    }
                }
            }
        }
    }

    /// Discard everything. Safe to call more than once.
    pub fn rollback(&mut self) {
        if self.state != TransactionState::Active {
            return;
        }
        self.state = TransactionState::RolledBack;
        self.dirty.clear();
        self.savepoint = None;
        let manager = self.db.manager();
        match self.mode {
            TransactionMode::Read => manager.end_read(self.snapshot),
            TransactionMode::Write => manager.release_writer(),
        }
        debug!(txn_id = self.id, "transaction rolled back");
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.rollback();
    }
}

impl PageRead for Transaction<'_> {
    fn page_capacity(&self) -> usize {
        self.db.page_capacity()
    }

    fn read_page(&self, page_id: PageId) -> Result<Vec<u8>, DatabaseError> {
        if let Some(data) = self.dirty.get(&page_id) {
            return Ok(data.clone());
        }
        if page_id == 0 || page_id >= self.header.page_count {
            return Err(DatabaseError::corrupted_page(
                page_id,
                format!("no such page (high-water mark {})", self.header.page_count),
            ));
        }
        self.db.read_committed_page(page_id, self.snapshot)
    }
}

impl PageWrite for Transaction<'_> {
    fn write_page(&mut self, page_id: PageId, data: Vec<u8>) -> Result<(), DatabaseError> {
        if let Some(savepoint) = self.savepoint.as_mut() {
            savepoint
                .pages
                .entry(page_id)
                .or_insert_with(|| self.dirty.get(&page_id).cloned());
        }
        self.dirty.insert(page_id, data);
        Ok(())
    }

    fn allocate_page(&mut self) -> Result<PageId, DatabaseError> {
        let (page_id, header) = freelist::pop(&*self, &self.header, self.db.config().max_page_count)?;
        self.header = header;
        Ok(page_id)
    }

    fn free_page(&mut self, page_id: PageId) -> Result<(), DatabaseError> {
        let (bytes, header) = freelist::push(&self.header, page_id, self.page_capacity())?;
        self.write_page(page_id, bytes)?;
        self.header = header;
        Ok(())
    }
}
