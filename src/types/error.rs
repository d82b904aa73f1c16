use std::path::PathBuf;

use thiserror::Error;

use crate::types::PageId;

/// Coarse classification of a [`DatabaseError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Open,
    AuthenticationFailure,
    Corruption,
    OutOfSpace,
    Conflict,
    Io,
    Usage,
}

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to open database at {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Page authentication failed (page_id: {page_id})")]
    AuthenticationFailure { page_id: PageId },

    #[error("Corrupted page: page_id={page_id}, reason={reason}")]
    CorruptedPage { page_id: PageId, reason: String },

    #[error("Corrupted WAL at offset {offset}: {reason}")]
    CorruptedWal { offset: u64, reason: String },

    #[error("Corrupted database: {reason}")]
    CorruptedDatabase { reason: String },

    #[error("Invalid page type: {0}")]
    InvalidPageType(u8),

    #[error("Invalid page size: {expected} bytes, got {actual} bytes")]
    InvalidPageSize { expected: usize, actual: usize },

    #[error("Database is full (max pages: {max_pages})")]
    OutOfSpace { max_pages: u64 },

    #[error("Another write transaction is active")]
    Conflict,

    #[error("Record of {size} bytes exceeds the maximum of {max} bytes")]
    RecordTooLarge { size: usize, max: usize },

    #[error("Write attempted in a read-only transaction")]
    ReadOnlyTransaction,

    #[error("Transaction is no longer active")]
    TransactionClosed,

    #[error("Serialization/deserialization error: {details}")]
    SerializationError { details: String },
}

impl DatabaseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DatabaseError::Open { .. } | DatabaseError::InvalidConfig { .. } => ErrorKind::Open,
            DatabaseError::AuthenticationFailure { .. } => ErrorKind::AuthenticationFailure,
            DatabaseError::CorruptedPage { .. }
            | DatabaseError::CorruptedWal { .. }
            | DatabaseError::CorruptedDatabase { .. }
            | DatabaseError::InvalidPageType(_)
            | DatabaseError::InvalidPageSize { .. }
            | DatabaseError::SerializationError { .. } => ErrorKind::Corruption,
            DatabaseError::OutOfSpace { .. } => ErrorKind::OutOfSpace,
            DatabaseError::Conflict => ErrorKind::Conflict,
            DatabaseError::Io(_) => ErrorKind::Io,
            DatabaseError::RecordTooLarge { .. }
            | DatabaseError::ReadOnlyTransaction
            | DatabaseError::TransactionClosed => ErrorKind::Usage,
        }
    }

    pub(crate) fn corrupted_page(page_id: PageId, reason: impl Into<String>) -> Self {
        DatabaseError::CorruptedPage {
            page_id,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DatabaseError>;
