use thiserror::Error;

/// An error raised by a [`Store`](crate::Store) or one of its [transactions](crate::Transaction).
#[derive(Debug, Error)]
pub enum StoreError {
    /// A query ran longer than its allotted time
    #[error("Query timed out after {0:?}")]
    Timeout(std::time::Duration),
    /// The transaction was already ended
    #[error("Transaction {0} is closed")]
    Closed(String),
    /// The operation is not supported by this backend
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    /// An IO error occurred in the backend
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Any other backend failure
    #[error("Store error: {0}")]
    Other(String),
}
