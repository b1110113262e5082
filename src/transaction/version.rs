// Row versions and snapshot visibility.
//
// Every key carries a chain of versions in newest-first order. A writer
// only ever appends at the head; `data` and `created_by` are frozen at
// creation, and the single mutable field is the atomic `deleted_by`
// marker (0 = live). Whether a version is observable by a transaction
// is decided by `is_visible` against the transaction registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::common::{Timestamp, TxnId};

use super::manager::{TransactionManager, TxnStatus};

/// One immutable value version for a key.
pub struct RowVersion {
    data: Vec<u8>,
    created_by: TxnId,
    deleted_by: AtomicU64,
}

impl RowVersion {
    pub fn new(data: Vec<u8>, created_by: TxnId) -> Arc<Self> {
        Arc::new(Self {
            data,
            created_by,
            deleted_by: AtomicU64::new(0),
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn created_by(&self) -> TxnId {
        self.created_by
    }

    /// Deleting transaction, 0 while live.
    pub fn deleted_by(&self) -> TxnId {
        self.deleted_by.load(Ordering::Acquire)
    }

    pub fn set_deleted(&self, txn_id: TxnId) {
        self.deleted_by.store(txn_id, Ordering::Release);
    }

    /// Reverts a delete marker (savepoint rollback).
    pub fn clear_deleted(&self) {
        self.deleted_by.store(0, Ordering::Release);
    }
}

impl std::fmt::Debug for RowVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowVersion")
            .field("len", &self.data.len())
            .field("created_by", &self.created_by)
            .field("deleted_by", &self.deleted_by())
            .finish()
    }
}

/// Newest-first list of versions for one key. Append-at-head only.
#[derive(Default)]
pub struct VersionChain {
    /// Oldest first in storage; iteration reverses.
    versions: Vec<Arc<RowVersion>>,
}

impl VersionChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a new head version.
    pub fn push_head(&mut self, version: Arc<RowVersion>) {
        self.versions.push(version);
    }

    /// Walks the chain from the newest version to the oldest.
    pub fn iter_newest_first(&self) -> impl Iterator<Item = &Arc<RowVersion>> {
        self.versions.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Replaces the chain content after a garbage-collection sweep.
    /// `kept` arrives newest-first, matching the walk order.
    pub(crate) fn replace_newest_first(&mut self, mut kept: Vec<Arc<RowVersion>>) {
        kept.reverse();
        self.versions = kept;
    }
}

/// True when `created_by`/`deleted_by` of some version refers to a
/// transaction that committed strictly before `ts`. A missing record
/// means the transaction settled below every live snapshot long ago.
pub(crate) fn committed_before(mgr: &TransactionManager, id: TxnId, ts: Timestamp) -> bool {
    match mgr.status(id) {
        TxnStatus::Committed(commit_ts) => commit_ts < ts,
        TxnStatus::Unknown => true,
        TxnStatus::Active | TxnStatus::Aborted => false,
    }
}

/// Snapshot-isolation visibility predicate.
///
/// A version is visible to the reader when the reader created it and has
/// not deleted it itself, or when its creator committed before the
/// reader's snapshot and no deletion that the reader must honor
/// (committed before the snapshot, or performed by the reader) exists.
pub fn is_visible(
    version: &RowVersion,
    reader: TxnId,
    start_ts: Timestamp,
    mgr: &TransactionManager,
) -> bool {
    let deleted_by = version.deleted_by();
    if version.created_by() == reader {
        // Own writes bypass the timestamp check.
        return deleted_by != reader;
    }
    if !committed_before(mgr, version.created_by(), start_ts) {
        return false;
    }
    if deleted_by == 0 {
        return true;
    }
    if deleted_by == reader {
        return false;
    }
    !committed_before(mgr, deleted_by, start_ts)
}

/// Walks the chain newest-first and returns the first visible version.
pub fn find_visible<'a>(
    chain: &'a VersionChain,
    reader: TxnId,
    start_ts: Timestamp,
    mgr: &TransactionManager,
) -> Option<&'a Arc<RowVersion>> {
    chain
        .iter_newest_first()
        .find(|version| is_visible(version, reader, start_ts, mgr))
}
