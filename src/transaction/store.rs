// Versioned key-value store.
//
// Composes the CoW tree (key presence and ordered iteration), per-key
// version chains, the transaction manager, and the conflict detector
// into the snapshot-isolated store surface: begin / put / get / delete /
// range / commit / rollback, plus savepoints and periodic version GC.
//
// Lock order is fixed: chain map before any chain lock, never the
// reverse. The read path takes the map read lock, clones the chain
// handle, and does visibility checks under that chain's own lock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::common::{Timestamp, TxnId};
use crate::error::{DbError, Result};
use crate::index::CowTree;

use super::conflict::ConflictDetector;
use super::manager::{Savepoint, Transaction, TransactionManager, TxnStatus};
use super::version::{committed_before, find_visible, RowVersion, VersionChain};

/// Tuning for one store instance.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Run a GC sweep every this many write operations.
    pub gc_interval_writes: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            gc_interval_writes: 256,
        }
    }
}

#[derive(Default)]
struct Counters {
    puts: AtomicU64,
    gets: AtomicU64,
    deletes: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    conflicts: AtomicU64,
    gc_runs: AtomicU64,
    versions_pruned: AtomicU64,
}

/// Point-in-time statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub keys: usize,
    pub active_transactions: usize,
    pub puts: u64,
    pub gets: u64,
    pub deletes: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub conflicts: u64,
    pub gc_runs: u64,
    pub versions_pruned: u64,
}

type ChainRef = Arc<Mutex<VersionChain>>;

/// Snapshot-isolated transactional store.
pub struct VersionedStore {
    tree: CowTree<Vec<u8>, ()>,
    chains: RwLock<HashMap<Vec<u8>, ChainRef>>,
    txns: Arc<TransactionManager>,
    conflicts: ConflictDetector,
    writes: AtomicU64,
    gc_interval: u64,
    counters: Counters,
}

impl VersionedStore {
    pub fn new() -> Self {
        Self::with_options(StoreOptions::default())
    }

    pub fn with_options(opts: StoreOptions) -> Self {
        Self {
            tree: CowTree::new(),
            chains: RwLock::new(HashMap::new()),
            txns: Arc::new(TransactionManager::new()),
            conflicts: ConflictDetector::new(),
            writes: AtomicU64::new(0),
            gc_interval: opts.gc_interval_writes.max(1),
            counters: Counters::default(),
        }
    }

    /// The store's transaction manager (shared with deadlock detection).
    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.txns
    }

    /// Starts a new transaction.
    pub fn begin(&self) -> Transaction {
        self.txns.begin()
    }

    fn ensure_active(&self, txn: &Transaction) -> Result<()> {
        if txn.is_active() {
            Ok(())
        } else {
            Err(DbError::TxNotActive(txn.id()))
        }
    }

    fn chain_for(&self, key: &[u8]) -> Option<ChainRef> {
        self.chains.read().get(key).cloned()
    }

    fn chain_or_create(&self, key: &[u8]) -> ChainRef {
        if let Some(chain) = self.chain_for(key) {
            return chain;
        }
        let mut chains = self.chains.write();
        chains
            .entry(key.to_vec())
            .or_insert_with(|| Arc::new(Mutex::new(VersionChain::new())))
            .clone()
    }

    /// Writes `key = value` within `txn`. Fails fast with
    /// `WriteConflict` when another active transaction holds the key.
    pub fn put(&self, txn: &Transaction, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_active(txn)?;
        if let Err(err) = self.conflicts.check_conflict(txn, &[key], &self.txns) {
            self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        }
        self.conflicts.register_write(txn.id(), key);
        txn.record().write_set.lock().push(key.to_vec());

        let chain = self.chain_or_create(key);
        chain
            .lock()
            .push_head(RowVersion::new(value.to_vec(), txn.id()));
        // Marker insert so range scans surface the key; visibility is
        // still decided per version chain.
        self.tree.insert(key.to_vec(), ());

        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        self.maybe_gc();
        Ok(())
    }

    /// Reads the version of `key` visible to `txn`'s snapshot.
    pub fn get(&self, txn: &Transaction, key: &[u8]) -> Result<Vec<u8>> {
        self.ensure_active(txn)?;
        self.counters.gets.fetch_add(1, Ordering::Relaxed);

        let chain = self.chain_for(key).ok_or(DbError::KeyNotFound)?;
        let chain = chain.lock();
        match find_visible(&chain, txn.id(), txn.start_ts(), &self.txns) {
            Some(version) => Ok(version.data().to_vec()),
            None => Err(DbError::KeyNotFound),
        }
    }

    /// Marks the version of `key` visible to `txn` as deleted by `txn`.
    /// A key with no visible version is a no-op.
    pub fn delete(&self, txn: &Transaction, key: &[u8]) -> Result<()> {
        self.ensure_active(txn)?;
        if let Err(err) = self.conflicts.check_conflict(txn, &[key], &self.txns) {
            self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        }
        self.conflicts.register_write(txn.id(), key);
        txn.record().write_set.lock().push(key.to_vec());

        if let Some(chain) = self.chain_for(key) {
            let chain = chain.lock();
            if let Some(version) = find_visible(&chain, txn.id(), txn.start_ts(), &self.txns) {
                version.set_deleted(txn.id());
                self.counters.deletes.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.maybe_gc();
        Ok(())
    }

    /// Commits `txn`, making its writes visible to later snapshots.
    pub fn commit(&self, txn: &Transaction) -> Result<Timestamp> {
        let commit_ts = self.txns.commit(txn)?;
        self.conflicts.on_commit(txn.id());
        self.counters.commits.fetch_add(1, Ordering::Relaxed);
        Ok(commit_ts)
    }

    /// Aborts `txn`: its versions become invisible to everyone and its
    /// write locks are released.
    pub fn rollback(&self, txn: &Transaction) -> Result<()> {
        self.txns.rollback(txn)?;
        let write_set = txn.record().write_set.lock().clone();
        let mut seen = HashSet::new();
        for key in &write_set {
            if !seen.insert(key) {
                continue;
            }
            if let Some(chain) = self.chain_for(key) {
                let chain = chain.lock();
                for version in chain.iter_newest_first() {
                    // Self-deletion makes the version invisible even to
                    // a hypothetical resurrection of this id.
                    if version.created_by() == txn.id() {
                        version.set_deleted(txn.id());
                    }
                }
            }
        }
        self.conflicts.on_abort(txn.id());
        self.counters.rollbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Records a named savepoint at the current write-set boundary.
    pub fn savepoint(&self, txn: &Transaction, name: &str) -> Result<()> {
        self.ensure_active(txn)?;
        let record = txn.record();
        let write_mark = record.write_set.lock().len();
        record.savepoints.lock().push(Savepoint {
            name: name.to_string(),
            write_mark,
        });
        Ok(())
    }

    /// Undoes every write made after the named savepoint. The savepoint
    /// itself survives, so it can be rolled back to again.
    pub fn rollback_to_savepoint(&self, txn: &Transaction, name: &str) -> Result<()> {
        self.ensure_active(txn)?;
        let record = txn.record();

        let write_mark = {
            let mut savepoints = record.savepoints.lock();
            let Some(pos) = savepoints.iter().rposition(|sp| sp.name == name) else {
                return Err(DbError::SavepointNotFound {
                    txn_id: txn.id(),
                    name: name.to_string(),
                });
            };
            let mark = savepoints[pos].write_mark;
            savepoints.truncate(pos + 1);
            mark
        };

        let undone: Vec<Vec<u8>> = {
            let mut write_set = record.write_set.lock();
            write_set.split_off(write_mark)
        };

        // Newest writes are undone first: one write, one head version.
        for key in undone.iter().rev() {
            if let Some(chain) = self.chain_for(key) {
                let chain = chain.lock();
                self.undo_one_write(&chain, txn.id());
            }
        }

        // Keys no longer in the write set give up their locks.
        let remaining: HashSet<Vec<u8>> = record.write_set.lock().iter().cloned().collect();
        for key in undone {
            if !remaining.contains(&key) {
                self.conflicts.release_key(txn.id(), &key);
            }
        }
        Ok(())
    }

    /// Reverts the newest not-yet-undone effect `txn_id` had on a chain:
    /// either its newest live own version, or a delete marker it left on
    /// someone else's version.
    fn undo_one_write(&self, chain: &VersionChain, txn_id: TxnId) {
        for version in chain.iter_newest_first() {
            if version.created_by() == txn_id {
                if version.deleted_by() != txn_id {
                    version.set_deleted(txn_id);
                    return;
                }
            } else if version.deleted_by() == txn_id {
                version.clear_deleted();
                return;
            }
        }
    }

    /// Visits every key with a version visible to `txn`, ascending,
    /// within the optional bounds. The callback returns false to stop.
    pub fn range<F>(&self, txn: &Transaction, start: Option<&[u8]>, end: Option<&[u8]>, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        self.ensure_active(txn)?;
        let start = start.map(|s| s.to_vec());
        let end = end.map(|e| e.to_vec());

        self.tree.range(start.as_ref(), end.as_ref(), |key, _| {
            let Some(chain) = self.chain_for(key) else {
                return true;
            };
            let chain = chain.lock();
            match find_visible(&chain, txn.id(), txn.start_ts(), &self.txns) {
                Some(version) => f(key, version.data()),
                None => true,
            }
        });
        Ok(())
    }

    /// Read-only snapshot view: a dedicated transaction that is rolled
    /// back when the snapshot drops.
    pub fn snapshot(&self) -> StoreSnapshot<'_> {
        StoreSnapshot {
            txn: self.begin(),
            store: self,
        }
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            keys: self.tree.len(),
            active_transactions: self.txns.active_count(),
            puts: self.counters.puts.load(Ordering::Relaxed),
            gets: self.counters.gets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            commits: self.counters.commits.load(Ordering::Relaxed),
            rollbacks: self.counters.rollbacks.load(Ordering::Relaxed),
            conflicts: self.counters.conflicts.load(Ordering::Relaxed),
            gc_runs: self.counters.gc_runs.load(Ordering::Relaxed),
            versions_pruned: self.counters.versions_pruned.load(Ordering::Relaxed),
        }
    }

    fn maybe_gc(&self) {
        let writes = self.writes.fetch_add(1, Ordering::AcqRel) + 1;
        if writes % self.gc_interval == 0 {
            self.gc();
        }
    }

    /// Prunes version-chain tails no present or future snapshot can
    /// observe, drops keys whose chains empty out, and forgets settled
    /// transaction records. Returns pruned version count.
    pub fn gc(&self) -> usize {
        let min_ts = self.txns.min_active_timestamp();
        let snapshot: Vec<(Vec<u8>, ChainRef)> = self
            .chains
            .read()
            .iter()
            .map(|(key, chain)| (key.clone(), chain.clone()))
            .collect();

        let mut pruned = 0;
        let mut dead_keys = Vec::new();
        for (key, chain) in snapshot {
            let mut chain = chain.lock();
            pruned += self.prune_chain(&mut chain, min_ts);
            if chain.is_empty() {
                dead_keys.push(key);
            }
        }

        for key in dead_keys {
            let mut chains = self.chains.write();
            // A concurrent put may have revived the chain.
            let still_empty = chains
                .get(&key)
                .is_some_and(|chain| chain.lock().is_empty());
            if still_empty {
                chains.remove(&key);
                drop(chains);
                self.tree.delete(&key);
            }
        }

        self.txns.cleanup_old_transactions(min_ts);
        self.counters.gc_runs.fetch_add(1, Ordering::Relaxed);
        self.counters
            .versions_pruned
            .fetch_add(pruned as u64, Ordering::Relaxed);
        if pruned > 0 {
            log::debug!("store gc: pruned {pruned} versions below ts {min_ts}");
        }
        pruned
    }

    /// Keeps, newest first: every version whose fate is still undecided
    /// (creator active or committed at/after the horizon), then the one
    /// newest stable version when it is live. Aborted creators and
    /// everything older than the stable version is dropped.
    fn prune_chain(&self, chain: &mut VersionChain, min_ts: Timestamp) -> usize {
        let mut kept = Vec::with_capacity(chain.len());
        let mut dropped = 0;
        let mut found_stable = false;

        for version in chain.iter_newest_first() {
            if found_stable {
                dropped += 1;
                continue;
            }
            let creator = self.txns.status(version.created_by());
            let settled = match creator {
                TxnStatus::Aborted => {
                    dropped += 1;
                    continue;
                }
                TxnStatus::Committed(commit_ts) => commit_ts < min_ts,
                TxnStatus::Unknown => true,
                TxnStatus::Active => false,
            };
            if !settled {
                kept.push(version.clone());
                continue;
            }

            // Newest version every live snapshot agrees on.
            found_stable = true;
            let deleted_by = version.deleted_by();
            let delete_settled = deleted_by != 0 && committed_before(&self.txns, deleted_by, min_ts);
            if delete_settled {
                // Deleted before any live snapshot: invisible everywhere.
                dropped += 1;
            } else {
                kept.push(version.clone());
            }
        }

        if dropped > 0 {
            chain.replace_newest_first(kept);
        }
        dropped
    }
}

impl Default for VersionedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VersionedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedStore")
            .field("keys", &self.tree.len())
            .field("active_transactions", &self.txns.active_count())
            .finish()
    }
}

/// Read-only view at a fixed snapshot timestamp.
pub struct StoreSnapshot<'a> {
    store: &'a VersionedStore,
    txn: Transaction,
}

impl StoreSnapshot<'_> {
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.store.get(&self.txn, key)
    }

    pub fn range<F>(&self, start: Option<&[u8]>, end: Option<&[u8]>, f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        self.store.range(&self.txn, start, end, f)
    }

    pub fn start_ts(&self) -> Timestamp {
        self.txn.start_ts()
    }

    /// Ends the snapshot. Dropping it does the same.
    pub fn release(self) {}
}

impl Drop for StoreSnapshot<'_> {
    fn drop(&mut self) {
        let _ = self.store.txns.rollback(&self.txn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_commit_cycle() {
        let store = VersionedStore::new();
        let t1 = store.begin();
        store.put(&t1, b"k", b"v1").unwrap();
        assert_eq!(store.get(&t1, b"k").unwrap(), b"v1");
        store.commit(&t1).unwrap();

        let t2 = store.begin();
        assert_eq!(store.get(&t2, b"k").unwrap(), b"v1");
    }

    #[test]
    fn test_uncommitted_writes_invisible_to_others() {
        let store = VersionedStore::new();
        let writer = store.begin();
        store.put(&writer, b"k", b"v").unwrap();

        let reader = store.begin();
        assert!(matches!(
            store.get(&reader, b"k"),
            Err(DbError::KeyNotFound)
        ));
    }

    #[test]
    fn test_rollback_hides_writes() {
        let store = VersionedStore::new();
        let t1 = store.begin();
        store.put(&t1, b"k", b"v").unwrap();
        store.rollback(&t1).unwrap();

        let t2 = store.begin();
        assert!(matches!(store.get(&t2, b"k"), Err(DbError::KeyNotFound)));
        assert!(matches!(
            store.put(&t1, b"k", b"again"),
            Err(DbError::TxNotActive(_))
        ));
    }

    #[test]
    fn test_delete_then_commit() {
        let store = VersionedStore::new();
        let t1 = store.begin();
        store.put(&t1, b"k", b"v").unwrap();
        store.commit(&t1).unwrap();

        let t2 = store.begin();
        store.delete(&t2, b"k").unwrap();
        // Deleter stops seeing it; an older snapshot still does.
        assert!(store.get(&t2, b"k").is_err());
        let observer = store.begin();
        assert_eq!(store.get(&observer, b"k").unwrap(), b"v");
        store.commit(&t2).unwrap();

        let t3 = store.begin();
        assert!(store.get(&t3, b"k").is_err());
    }

    #[test]
    fn test_range_respects_visibility() {
        let store = VersionedStore::new();
        let setup = store.begin();
        for i in 0..10u32 {
            store
                .put(&setup, format!("k{i}").as_bytes(), format!("v{i}").as_bytes())
                .unwrap();
        }
        store.commit(&setup).unwrap();

        let writer = store.begin();
        store.put(&writer, b"k3", b"dirty").unwrap();
        store.delete(&writer, b"k5").unwrap();

        let reader = store.begin();
        let mut seen = Vec::new();
        store
            .range(&reader, Some(b"k2"), Some(b"k7"), |k, v| {
                seen.push((k.to_vec(), v.to_vec()));
                true
            })
            .unwrap();
        let keys: Vec<_> = seen.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(
            keys,
            vec![
                b"k2".to_vec(),
                b"k3".to_vec(),
                b"k4".to_vec(),
                b"k5".to_vec(),
                b"k6".to_vec(),
                b"k7".to_vec()
            ]
        );
        // The uncommitted overwrite stays invisible.
        assert_eq!(seen[1].1, b"v3");
    }

    #[test]
    fn test_savepoint_rollback() {
        let store = VersionedStore::new();
        let t1 = store.begin();
        store.put(&t1, b"a", b"1").unwrap();
        store.savepoint(&t1, "sp").unwrap();
        store.put(&t1, b"b", b"2").unwrap();
        store.put(&t1, b"a", b"overwritten").unwrap();

        store.rollback_to_savepoint(&t1, "sp").unwrap();
        assert_eq!(store.get(&t1, b"a").unwrap(), b"1");
        assert!(store.get(&t1, b"b").is_err());

        // The released lock can be taken by someone else.
        let t2 = store.begin();
        store.put(&t2, b"b", b"theirs").unwrap();

        assert!(matches!(
            store.rollback_to_savepoint(&t1, "nope"),
            Err(DbError::SavepointNotFound { .. })
        ));
        store.commit(&t1).unwrap();

        let t3 = store.begin();
        assert_eq!(store.get(&t3, b"a").unwrap(), b"1");
    }

    #[test]
    fn test_snapshot_view_is_stable() {
        let store = VersionedStore::new();
        let t1 = store.begin();
        store.put(&t1, b"k", b"v1").unwrap();
        store.commit(&t1).unwrap();

        let snap = store.snapshot();
        let t2 = store.begin();
        store.put(&t2, b"k", b"v2").unwrap();
        store.commit(&t2).unwrap();

        assert_eq!(snap.get(b"k").unwrap(), b"v1");
        snap.release();
        assert_eq!(store.stats().active_transactions, 0);
    }

    #[test]
    fn test_gc_prunes_dead_versions() {
        let store = VersionedStore::with_options(StoreOptions {
            gc_interval_writes: u64::MAX,
        });
        for round in 0..5u32 {
            let txn = store.begin();
            store
                .put(&txn, b"hot", format!("v{round}").as_bytes())
                .unwrap();
            store.commit(&txn).unwrap();
        }
        let chain_len = {
            let chain = store.chain_for(b"hot").unwrap();
            let len = chain.lock().len();
            len
        };
        assert_eq!(chain_len, 5);

        let pruned = store.gc();
        assert_eq!(pruned, 4);
        let txn = store.begin();
        assert_eq!(store.get(&txn, b"hot").unwrap(), b"v4");
    }

    #[test]
    fn test_gc_drops_fully_deleted_keys() {
        let store = VersionedStore::with_options(StoreOptions {
            gc_interval_writes: u64::MAX,
        });
        let t1 = store.begin();
        store.put(&t1, b"gone", b"v").unwrap();
        store.commit(&t1).unwrap();
        let t2 = store.begin();
        store.delete(&t2, b"gone").unwrap();
        store.commit(&t2).unwrap();

        store.gc();
        assert_eq!(store.stats().keys, 0);
        let t3 = store.begin();
        assert!(store.get(&t3, b"gone").is_err());
    }

    #[test]
    fn test_gc_respects_old_snapshots() {
        let store = VersionedStore::with_options(StoreOptions {
            gc_interval_writes: u64::MAX,
        });
        let t1 = store.begin();
        store.put(&t1, b"k", b"old").unwrap();
        store.commit(&t1).unwrap();

        let pinned = store.begin();
        let t2 = store.begin();
        store.put(&t2, b"k", b"new").unwrap();
        store.commit(&t2).unwrap();

        store.gc();
        // The old version survives: `pinned` still needs it.
        assert_eq!(store.get(&pinned, b"k").unwrap(), b"old");
    }
}
