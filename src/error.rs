// Crate-wide error type.
//
// One enum covers every subsystem so that callers get a single `Result`
// alias. Variants carry enough context (transaction ids, page numbers)
// for the embedder to decide between retrying, aborting, and giving up.

use std::io;

use thiserror::Error;

use crate::common::{PageId, TxnId};

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DbError>;

/// Error type for all engine operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// Lookup miss. Common and not fatal.
    #[error("key not found")]
    KeyNotFound,

    /// A node page has no room for the requested cell. Internal: the
    /// B-tree recovers by splitting and never surfaces this variant.
    #[error("node full: cell of {needed} bytes does not fit in {available} free bytes")]
    NodeFull { needed: usize, available: usize },

    /// Operation on a transaction that already committed or aborted.
    #[error("transaction {0} is not active")]
    TxNotActive(TxnId),

    /// Another active transaction holds a write lock on the key.
    #[error("write conflict: transaction {txn_id} lost key to active transaction {holder}")]
    WriteConflict { txn_id: TxnId, holder: TxnId },

    /// A wait-for cycle was detected; the caller should abort the victim.
    #[error("deadlock detected: cycle {cycle:?}, victim {victim}")]
    Deadlock { cycle: Vec<TxnId>, victim: TxnId },

    /// Named savepoint does not exist in the transaction.
    #[error("savepoint '{name}' not found in transaction {txn_id}")]
    SavepointNotFound { txn_id: TxnId, name: String },

    /// A structural check failed while interpreting page bytes.
    #[error("corrupt page {page_no}: {reason}")]
    CorruptPage { page_no: PageId, reason: String },

    /// A file header, frame, or encoded value failed validation.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Block storage failure. The enclosing transaction cannot commit.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl DbError {
    /// Creates a corrupt-page error with context.
    pub fn corrupt_page(page_no: PageId, reason: impl Into<String>) -> Self {
        DbError::CorruptPage {
            page_no,
            reason: reason.into(),
        }
    }

    /// Creates an invalid-format error.
    pub fn invalid_format(reason: impl Into<String>) -> Self {
        DbError::InvalidFormat(reason.into())
    }

    /// Returns true if retrying the whole transaction may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DbError::WriteConflict { .. } | DbError::Deadlock { .. }
        )
    }

    /// Returns true if the error indicates on-disk damage.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            DbError::CorruptPage { .. } | DbError::InvalidFormat(_)
        )
    }

    /// Returns the transaction id associated with the error, if any.
    pub fn transaction_id(&self) -> Option<TxnId> {
        match self {
            DbError::TxNotActive(id) => Some(*id),
            DbError::WriteConflict { txn_id, .. } => Some(*txn_id),
            DbError::Deadlock { victim, .. } => Some(*victim),
            DbError::SavepointNotFound { txn_id, .. } => Some(*txn_id),
            _ => None,
        }
    }
}
