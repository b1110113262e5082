// Deadlock detection over a wait-for graph.
//
// An edge waiter -> holder records that `waiter` blocks on a resource
// held by `holder`. Cycle detection runs a three-colour depth-first
// search: grey nodes are on the current path, black nodes are settled.
// `wait_for` adds edges tentatively: an edge that closes a cycle is
// removed again and reported as `Deadlock` with the youngest member of
// the cycle picked as the victim.
//
// Conflict handling in the store is fail-fast and never blocks, so this
// detector serves embedders that add their own waiting on top. The
// configured timeout bounds such waits when no cycle ever forms.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::common::TxnId;
use crate::error::{DbError, Result};

use super::manager::TransactionManager;

/// Counters kept across detection runs.
#[derive(Debug, Default, Clone)]
pub struct DeadlockStats {
    pub detection_runs: u64,
    pub deadlocks_found: u64,
    pub max_cycle_len: usize,
}

/// Wait-for-graph deadlock detector.
pub struct DeadlockDetector {
    manager: Arc<TransactionManager>,
    wait_for: RwLock<HashMap<TxnId, HashSet<TxnId>>>,
    wait_timeout: Duration,
    stats: Mutex<DeadlockStats>,
}

impl DeadlockDetector {
    pub fn new(manager: Arc<TransactionManager>) -> Self {
        Self::with_timeout(manager, Duration::from_secs(1))
    }

    pub fn with_timeout(manager: Arc<TransactionManager>, wait_timeout: Duration) -> Self {
        Self {
            manager,
            wait_for: RwLock::new(HashMap::new()),
            wait_timeout,
            stats: Mutex::new(DeadlockStats::default()),
        }
    }

    /// Upper bound a caller should wait on a lock before giving up even
    /// without a cycle.
    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    /// Declares that `waiter` blocks on `holder`. When the new edge
    /// closes a cycle it is removed again and `Deadlock` is returned
    /// with the victim to abort.
    pub fn wait_for(&self, waiter: TxnId, holder: TxnId) -> Result<()> {
        if waiter == holder {
            return Ok(());
        }
        let mut graph = self.wait_for.write();
        graph.entry(waiter).or_default().insert(holder);

        if let Some(cycle) = find_cycle_from(&graph, waiter) {
            if let Some(edges) = graph.get_mut(&waiter) {
                edges.remove(&holder);
                if edges.is_empty() {
                    graph.remove(&waiter);
                }
            }
            let victim = self.youngest(&cycle);
            let mut stats = self.stats.lock();
            stats.deadlocks_found += 1;
            stats.max_cycle_len = stats.max_cycle_len.max(cycle.len());
            log::debug!("deadlock: cycle {cycle:?}, victim {victim}");
            return Err(DbError::Deadlock { cycle, victim });
        }
        Ok(())
    }

    /// Drops every edge touching `txn_id` (granted, committed, aborted).
    pub fn remove_transaction(&self, txn_id: TxnId) {
        let mut graph = self.wait_for.write();
        graph.remove(&txn_id);
        graph.retain(|_, edges| {
            edges.remove(&txn_id);
            !edges.is_empty()
        });
    }

    /// Scans the whole graph for a cycle.
    pub fn detect_cycle(&self) -> Option<Vec<TxnId>> {
        self.stats.lock().detection_runs += 1;
        let graph = self.wait_for.read();
        let mut colors = HashMap::new();
        for &node in graph.keys() {
            if colors.contains_key(&node) {
                continue;
            }
            let mut path = Vec::new();
            if dfs(node, &graph, &mut colors, &mut path) {
                return Some(path);
            }
        }
        None
    }

    /// Finds a cycle and picks its youngest transaction (largest start
    /// timestamp) as the victim to abort.
    pub fn detect_and_select_victim(&self) -> Option<(Vec<TxnId>, TxnId)> {
        let cycle = self.detect_cycle()?;
        let victim = self.youngest(&cycle);
        let mut stats = self.stats.lock();
        stats.deadlocks_found += 1;
        stats.max_cycle_len = stats.max_cycle_len.max(cycle.len());
        Some((cycle, victim))
    }

    fn youngest(&self, cycle: &[TxnId]) -> TxnId {
        *cycle
            .iter()
            .max_by_key(|&&id| (self.manager.start_ts(id).unwrap_or(0), id))
            .expect("cycle is never empty")
    }

    pub fn stats(&self) -> DeadlockStats {
        self.stats.lock().clone()
    }

    pub fn edge_count(&self) -> usize {
        self.wait_for.read().values().map(HashSet::len).sum()
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    Grey,
    Black,
}

/// Three-colour DFS from `start`; fills `path` with the cycle if found.
fn find_cycle_from(graph: &HashMap<TxnId, HashSet<TxnId>>, start: TxnId) -> Option<Vec<TxnId>> {
    let mut colors = HashMap::new();
    let mut path = Vec::new();
    dfs(start, graph, &mut colors, &mut path).then_some(path)
}

fn dfs(
    node: TxnId,
    graph: &HashMap<TxnId, HashSet<TxnId>>,
    colors: &mut HashMap<TxnId, Color>,
    path: &mut Vec<TxnId>,
) -> bool {
    colors.insert(node, Color::Grey);
    path.push(node);

    if let Some(edges) = graph.get(&node) {
        for &next in edges {
            match colors.get(&next) {
                Some(Color::Grey) => {
                    // Trim the path down to the cycle members.
                    let entry = path.iter().position(|&n| n == next).unwrap_or(0);
                    path.drain(..entry);
                    return true;
                }
                Some(Color::Black) => {}
                None => {
                    if dfs(next, graph, colors, path) {
                        return true;
                    }
                }
            }
        }
    }

    colors.insert(node, Color::Black);
    path.pop();
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector_with_txns(n: usize) -> (Arc<TransactionManager>, DeadlockDetector, Vec<TxnId>) {
        let tm = Arc::new(TransactionManager::new());
        let ids: Vec<TxnId> = (0..n).map(|_| tm.begin().id()).collect();
        let detector = DeadlockDetector::new(tm.clone());
        (tm, detector, ids)
    }

    #[test]
    fn test_no_cycle_on_chain() {
        let (_tm, detector, ids) = detector_with_txns(3);
        detector.wait_for(ids[0], ids[1]).unwrap();
        detector.wait_for(ids[1], ids[2]).unwrap();
        assert!(detector.detect_cycle().is_none());
        assert_eq!(detector.edge_count(), 2);
    }

    #[test]
    fn test_closing_edge_reports_deadlock() {
        let (_tm, detector, ids) = detector_with_txns(3);
        detector.wait_for(ids[0], ids[1]).unwrap();
        detector.wait_for(ids[1], ids[2]).unwrap();

        let err = detector.wait_for(ids[2], ids[0]).unwrap_err();
        match err {
            DbError::Deadlock { cycle, victim } => {
                assert_eq!(cycle.len(), 3);
                for id in &ids {
                    assert!(cycle.contains(id));
                }
                // Youngest = latest begin = largest start timestamp.
                assert_eq!(victim, ids[2]);
            }
            other => panic!("expected deadlock, got {other}"),
        }
        // The closing edge was rolled back.
        assert_eq!(detector.edge_count(), 2);
        assert!(detector.detect_cycle().is_none());
    }

    #[test]
    fn test_two_party_cycle() {
        let (_tm, detector, ids) = detector_with_txns(2);
        detector.wait_for(ids[0], ids[1]).unwrap();
        let err = detector.wait_for(ids[1], ids[0]).unwrap_err();
        assert!(matches!(err, DbError::Deadlock { victim, .. } if victim == ids[1]));
    }

    #[test]
    fn test_remove_transaction_clears_edges() {
        let (_tm, detector, ids) = detector_with_txns(3);
        detector.wait_for(ids[0], ids[1]).unwrap();
        detector.wait_for(ids[2], ids[1]).unwrap();

        detector.remove_transaction(ids[1]);
        assert_eq!(detector.edge_count(), 0);
    }

    #[test]
    fn test_self_wait_ignored() {
        let (_tm, detector, ids) = detector_with_txns(1);
        detector.wait_for(ids[0], ids[0]).unwrap();
        assert_eq!(detector.edge_count(), 0);
    }

    #[test]
    fn test_stats_accumulate() {
        let (_tm, detector, ids) = detector_with_txns(2);
        detector.wait_for(ids[0], ids[1]).unwrap();
        let _ = detector.wait_for(ids[1], ids[0]);
        assert_eq!(detector.stats().deadlocks_found, 1);
        assert_eq!(detector.stats().max_cycle_len, 2);
    }
}
