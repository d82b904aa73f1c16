pub mod manager;
#[allow(clippy::module_inception)]
pub mod transaction;

pub use manager::TransactionManager;
pub use transaction::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}
