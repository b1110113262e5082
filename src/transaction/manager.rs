// Transaction lifecycle management.
//
// One manager per store instance owns the timestamp and id counters;
// nothing here is process-global. A transaction is Active from `begin`
// until exactly one of `commit` or `rollback` moves it into a terminal
// state. Commit stamps `commit_ts` before flipping the state so any
// observer that sees Committed also sees the timestamp.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::common::{Timestamp, TxnId};
use crate::error::{DbError, Result};

const STATE_ACTIVE: u8 = 0;
const STATE_COMMITTED: u8 = 1;
const STATE_ABORTED: u8 = 2;

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

impl TxnState {
    /// Terminal states accept no further operations.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxnState::Committed | TxnState::Aborted)
    }
}

/// What the manager knows about a transaction id, for visibility checks.
/// `Unknown` means the record was cleaned up, which only happens to
/// transactions that finished below every active snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Active,
    Committed(Timestamp),
    Aborted,
    Unknown,
}

/// A named write-set boundary inside a transaction.
pub(crate) struct Savepoint {
    pub(crate) name: String,
    pub(crate) write_mark: usize,
}

pub(crate) struct TxnRecord {
    id: TxnId,
    start_ts: Timestamp,
    commit_ts: AtomicU64,
    state: AtomicU8,
    /// Keys written, in operation order (savepoints index into this).
    pub(crate) write_set: Mutex<Vec<Vec<u8>>>,
    pub(crate) savepoints: Mutex<Vec<Savepoint>>,
}

impl TxnRecord {
    fn state_enum(&self) -> TxnState {
        match self.state.load(Ordering::Acquire) {
            STATE_ACTIVE => TxnState::Active,
            STATE_COMMITTED => TxnState::Committed,
            _ => TxnState::Aborted,
        }
    }
}

/// Shared handle to one transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxnRecord>,
}

impl Transaction {
    pub fn id(&self) -> TxnId {
        self.inner.id
    }

    pub fn start_ts(&self) -> Timestamp {
        self.inner.start_ts
    }

    pub fn state(&self) -> TxnState {
        self.inner.state_enum()
    }

    pub fn is_active(&self) -> bool {
        self.state() == TxnState::Active
    }

    /// Commit timestamp, once committed.
    pub fn commit_ts(&self) -> Option<Timestamp> {
        match self.state() {
            TxnState::Committed => Some(self.inner.commit_ts.load(Ordering::Acquire)),
            _ => None,
        }
    }

    pub(crate) fn record(&self) -> &Arc<TxnRecord> {
        &self.inner
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("start_ts", &self.start_ts())
            .field("state", &self.state())
            .finish()
    }
}

/// Timestamp oracle and transaction registry for one store.
pub struct TransactionManager {
    /// Next timestamp. Start timestamps and commit timestamps draw from
    /// the same sequence, which is what makes snapshot comparison work.
    clock: AtomicU64,
    next_id: AtomicU64,
    txns: RwLock<HashMap<TxnId, Arc<TxnRecord>>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            clock: AtomicU64::new(1),
            next_id: AtomicU64::new(1),
            txns: RwLock::new(HashMap::new()),
        }
    }

    /// Starts a transaction with a fresh id and start timestamp.
    pub fn begin(&self) -> Transaction {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let start_ts = self.clock.fetch_add(1, Ordering::AcqRel);
        let record = Arc::new(TxnRecord {
            id,
            start_ts,
            commit_ts: AtomicU64::new(0),
            state: AtomicU8::new(STATE_ACTIVE),
            write_set: Mutex::new(Vec::new()),
            savepoints: Mutex::new(Vec::new()),
        });
        self.txns.write().insert(id, record.clone());
        log::trace!("txn {id} begins at ts {start_ts}");
        Transaction { inner: record }
    }

    /// Commits an Active transaction, stamping its commit timestamp.
    pub fn commit(&self, txn: &Transaction) -> Result<Timestamp> {
        // Transitions are serialized by the registry lock.
        let _registry = self.txns.write();
        let record = txn.record();
        if record.state_enum() != TxnState::Active {
            return Err(DbError::TxNotActive(record.id));
        }
        let commit_ts = self.clock.fetch_add(1, Ordering::AcqRel);
        record.commit_ts.store(commit_ts, Ordering::Release);
        record.state.store(STATE_COMMITTED, Ordering::Release);
        log::trace!("txn {} committed at ts {commit_ts}", record.id);
        Ok(commit_ts)
    }

    /// Aborts an Active transaction.
    pub fn rollback(&self, txn: &Transaction) -> Result<()> {
        let _registry = self.txns.write();
        let record = txn.record();
        if record.state_enum() != TxnState::Active {
            return Err(DbError::TxNotActive(record.id));
        }
        record.state.store(STATE_ABORTED, Ordering::Release);
        log::trace!("txn {} aborted", record.id);
        Ok(())
    }

    /// Lifecycle knowledge about an id, for the visibility predicate.
    pub fn status(&self, id: TxnId) -> TxnStatus {
        match self.txns.read().get(&id) {
            Some(record) => match record.state_enum() {
                TxnState::Active => TxnStatus::Active,
                TxnState::Committed => {
                    TxnStatus::Committed(record.commit_ts.load(Ordering::Acquire))
                }
                TxnState::Aborted => TxnStatus::Aborted,
            },
            None => TxnStatus::Unknown,
        }
    }

    pub fn is_active(&self, id: TxnId) -> bool {
        self.status(id) == TxnStatus::Active
    }

    /// Start timestamp of a registered transaction.
    pub fn start_ts(&self, id: TxnId) -> Option<Timestamp> {
        self.txns.read().get(&id).map(|record| record.start_ts)
    }

    pub fn active_count(&self) -> usize {
        self.txns
            .read()
            .values()
            .filter(|record| record.state_enum() == TxnState::Active)
            .count()
    }

    /// Smallest start timestamp among Active transactions, or u64::MAX
    /// when none are active. Everything below this horizon is settled.
    pub fn min_active_timestamp(&self) -> Timestamp {
        self.txns
            .read()
            .values()
            .filter(|record| record.state_enum() == TxnState::Active)
            .map(|record| record.start_ts)
            .min()
            .unwrap_or(u64::MAX)
    }

    /// Drops records of finished transactions whose commit timestamp is
    /// below `min_ts`. Returns how many were removed.
    pub fn cleanup_old_transactions(&self, min_ts: Timestamp) -> usize {
        let mut txns = self.txns.write();
        let before = txns.len();
        txns.retain(|_, record| {
            let state = record.state_enum();
            !(state.is_terminal() && record.commit_ts.load(Ordering::Acquire) < min_ts)
        });
        before - txns.len()
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("active_count", &self.active_count())
            .field("clock", &self.clock.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_assigns_increasing_timestamps() {
        let tm = TransactionManager::new();
        let t1 = tm.begin();
        let t2 = tm.begin();
        assert!(t1.id() < t2.id());
        assert!(t1.start_ts() < t2.start_ts());
        assert!(t1.is_active());
    }

    #[test]
    fn test_commit_stamps_after_start() {
        let tm = TransactionManager::new();
        let t1 = tm.begin();
        let commit_ts = tm.commit(&t1).unwrap();
        assert!(commit_ts > t1.start_ts());
        assert_eq!(t1.state(), TxnState::Committed);
        assert_eq!(t1.commit_ts(), Some(commit_ts));
        assert_eq!(tm.status(t1.id()), TxnStatus::Committed(commit_ts));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let tm = TransactionManager::new();
        let t1 = tm.begin();
        tm.commit(&t1).unwrap();
        assert!(matches!(
            tm.commit(&t1),
            Err(DbError::TxNotActive(id)) if id == t1.id()
        ));
        assert!(tm.rollback(&t1).is_err());

        let t2 = tm.begin();
        tm.rollback(&t2).unwrap();
        assert!(tm.commit(&t2).is_err());
        assert_eq!(tm.status(t2.id()), TxnStatus::Aborted);
    }

    #[test]
    fn test_min_active_timestamp() {
        let tm = TransactionManager::new();
        assert_eq!(tm.min_active_timestamp(), u64::MAX);

        let t1 = tm.begin();
        let t2 = tm.begin();
        assert_eq!(tm.min_active_timestamp(), t1.start_ts());

        tm.commit(&t1).unwrap();
        assert_eq!(tm.min_active_timestamp(), t2.start_ts());
        tm.commit(&t2).unwrap();
        assert_eq!(tm.min_active_timestamp(), u64::MAX);
    }

    #[test]
    fn test_cleanup_removes_settled_records() {
        let tm = TransactionManager::new();
        let t1 = tm.begin();
        tm.commit(&t1).unwrap();
        let t2 = tm.begin();

        let removed = tm.cleanup_old_transactions(tm.min_active_timestamp());
        assert_eq!(removed, 1);
        assert_eq!(tm.status(t1.id()), TxnStatus::Unknown);
        assert!(tm.is_active(t2.id()));
    }
}
