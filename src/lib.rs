pub mod cipher;
pub mod config;
pub mod database;
pub mod storage;
pub mod transaction;
pub mod types;
pub mod utils;

pub use config::{Config, WriterWait};
pub use database::{CheckpointOutcome, Database, DatabaseStats, IntegrityReport};
pub use transaction::{Transaction, TransactionMode, TransactionState};
pub use types::error::{DatabaseError, ErrorKind, Result};
