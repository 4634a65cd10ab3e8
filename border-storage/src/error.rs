//! Errors in the library.
use thiserror::Error;

/// Errors raised by storages.
///
/// Public operations return [`anyhow::Result`]; the kind of a failure can be
/// recovered with `err.downcast_ref::<StorageError>()`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The container type of a record is not supported by the operation.
    #[error("Type error: {0}")]
    Type(String),

    /// A cursor is out of capacity, skips ahead of the storage length, or
    /// does not match the length of the record.
    #[error("Range error: {0}")]
    Range(String),

    /// An index does not address a stored item.
    #[error("Index error: {0}")]
    Index(String),

    /// The storage has not been allocated yet.
    #[error("Runtime error: {0}")]
    Uninitialized(String),

    /// The storage was configured in a way that cannot work.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Mutation was attempted through a read-only composition of storages.
    #[error("Read-only storage: {0}")]
    ReadOnly(String),

    /// Internal state is inconsistent. This indicates a bug.
    #[error("Internal consistency error: {0}")]
    Consistency(String),

    /// The operation is not implemented for this storage layout.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}
