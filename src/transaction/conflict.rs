// Write-write conflict detection.
//
// First-writer-wins: the lock table maps each key to the transaction
// currently holding it for writing. A second active transaction touching
// the same key gets `WriteConflict` immediately instead of blocking.
// Entries are dropped when their holder finishes; a stale entry left by
// a finished holder is simply overwritten.

use dashmap::DashMap;

use crate::common::TxnId;
use crate::error::{DbError, Result};

use super::manager::{Transaction, TransactionManager};

/// Lock table for write sets.
#[derive(Default)]
pub struct ConflictDetector {
    /// key -> transaction holding the write intent.
    table: DashMap<Vec<u8>, TxnId>,
    /// transaction -> keys it registered, for O(write set) release.
    owned: DashMap<TxnId, Vec<Vec<u8>>>,
}

impl ConflictDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails with `WriteConflict` when any key in `keys` is held by a
    /// different transaction that is still active.
    pub fn check_conflict(
        &self,
        txn: &Transaction,
        keys: &[&[u8]],
        mgr: &TransactionManager,
    ) -> Result<()> {
        for key in keys {
            if let Some(entry) = self.table.get(*key) {
                let holder = *entry;
                if holder != txn.id() && mgr.is_active(holder) {
                    return Err(DbError::WriteConflict {
                        txn_id: txn.id(),
                        holder,
                    });
                }
            }
        }
        Ok(())
    }

    /// Records `txn` as the writer of every key in `keys`.
    pub fn register_writes(&self, txn: &Transaction, keys: &[&[u8]]) {
        for key in keys {
            self.register_write(txn.id(), key);
        }
    }

    pub fn register_write(&self, txn_id: TxnId, key: &[u8]) {
        let previous = self.table.insert(key.to_vec(), txn_id);
        if previous != Some(txn_id) {
            self.owned.entry(txn_id).or_default().push(key.to_vec());
        }
    }

    /// Releases one key (savepoint rollback path).
    pub fn release_key(&self, txn_id: TxnId, key: &[u8]) {
        self.table.remove_if(key, |_, holder| *holder == txn_id);
        if let Some(mut keys) = self.owned.get_mut(&txn_id) {
            keys.retain(|k| k != key);
        }
    }

    /// Clears every entry of a committed transaction.
    pub fn on_commit(&self, txn_id: TxnId) {
        self.release_all(txn_id);
    }

    /// Clears every entry of an aborted transaction.
    pub fn on_abort(&self, txn_id: TxnId) {
        self.release_all(txn_id);
    }

    fn release_all(&self, txn_id: TxnId) {
        if let Some((_, keys)) = self.owned.remove(&txn_id) {
            for key in keys {
                self.table.remove_if(&key, |_, holder| *holder == txn_id);
            }
        }
    }

    /// Keys currently locked (diagnostics).
    pub fn locked_keys(&self) -> usize {
        self.table.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_writer_conflicts() {
        let tm = TransactionManager::new();
        let detector = ConflictDetector::new();
        let t1 = tm.begin();
        let t2 = tm.begin();

        detector.check_conflict(&t1, &[b"k"], &tm).unwrap();
        detector.register_writes(&t1, &[b"k"]);

        let err = detector.check_conflict(&t2, &[b"k"], &tm).unwrap_err();
        assert!(matches!(
            err,
            DbError::WriteConflict { txn_id, holder } if txn_id == t2.id() && holder == t1.id()
        ));

        // Re-checking your own key is fine.
        detector.check_conflict(&t1, &[b"k"], &tm).unwrap();
    }

    #[test]
    fn test_release_on_finish() {
        let tm = TransactionManager::new();
        let detector = ConflictDetector::new();
        let t1 = tm.begin();
        detector.register_writes(&t1, &[b"a", b"b"]);
        assert_eq!(detector.locked_keys(), 2);

        tm.commit(&t1).unwrap();
        detector.on_commit(t1.id());
        assert_eq!(detector.locked_keys(), 0);

        let t2 = tm.begin();
        detector.check_conflict(&t2, &[b"a", b"b"], &tm).unwrap();
    }

    #[test]
    fn test_stale_holder_does_not_block() {
        let tm = TransactionManager::new();
        let detector = ConflictDetector::new();
        let t1 = tm.begin();
        detector.register_writes(&t1, &[b"k"]);
        // Holder finished but its entries were never released.
        tm.rollback(&t1).unwrap();

        let t2 = tm.begin();
        detector.check_conflict(&t2, &[b"k"], &tm).unwrap();
        detector.register_writes(&t2, &[b"k"]);
        assert_eq!(*detector.table.get(b"k".as_slice()).unwrap(), t2.id());
    }

    #[test]
    fn test_release_single_key() {
        let tm = TransactionManager::new();
        let detector = ConflictDetector::new();
        let t1 = tm.begin();
        detector.register_writes(&t1, &[b"a", b"b"]);

        detector.release_key(t1.id(), b"a");
        assert_eq!(detector.locked_keys(), 1);

        let t2 = tm.begin();
        detector.check_conflict(&t2, &[b"a"], &tm).unwrap();
        assert!(detector.check_conflict(&t2, &[b"b"], &tm).is_err());
    }
}
