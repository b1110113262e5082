// Copy-on-write B+ tree.
//
// Nodes are immutable once published. Readers never lock: they enter an
// epoch, load the root atomically, and descend through atomic child
// pointers; whatever version they land on stays allocated until they
// leave. A single writer (serialized by one mutex) clones every node on
// the root-to-leaf path, mutates the clones, publishes the new root with
// one atomic store, and retires the replaced nodes to the epoch manager.
//
// Leaves chain through atomic `next`/`prev` pointers for range scans.
// When a leaf is replaced its untouched neighbours are re-pointed with
// atomic stores; a reader already inside the old leaf keeps following
// the old pointers, which stay valid until reclamation.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::concurrent::{EpochGuard, EpochManager};

/// Keys per node before a split (and the fan-out minus one).
pub const DEFAULT_MAX_KEYS: usize = 64;

struct LeafNode<K, V> {
    keys: Vec<K>,
    values: Vec<V>,
    next: AtomicPtr<Node<K, V>>,
    prev: AtomicPtr<Node<K, V>>,
}

struct InteriorNode<K, V> {
    /// Separators: `children[i]` holds keys below `keys[i]`, the last
    /// child holds everything at or above the last separator.
    keys: Vec<K>,
    children: Vec<AtomicPtr<Node<K, V>>>,
}

enum Node<K, V> {
    Leaf(LeafNode<K, V>),
    Interior(InteriorNode<K, V>),
}

impl<K, V> Node<K, V> {
    fn new_leaf(keys: Vec<K>, values: Vec<V>) -> *mut Self {
        Box::into_raw(Box::new(Node::Leaf(LeafNode {
            keys,
            values,
            next: AtomicPtr::new(std::ptr::null_mut()),
            prev: AtomicPtr::new(std::ptr::null_mut()),
        })))
    }

    fn new_interior(keys: Vec<K>, children: Vec<AtomicPtr<Node<K, V>>>) -> *mut Self {
        Box::into_raw(Box::new(Node::Interior(InteriorNode { keys, children })))
    }

    fn leaf(&self) -> &LeafNode<K, V> {
        match self {
            Node::Leaf(leaf) => leaf,
            Node::Interior(_) => unreachable!("expected leaf"),
        }
    }
}

/// Outcome of a path-copying insert below some node.
struct Rewrite<K, V> {
    node: *mut Node<K, V>,
    split: Option<(K, *mut Node<K, V>)>,
    replaced: bool,
}

/// Outcome of a path-copying delete below some node.
enum Removal<K, V> {
    /// Key absent; nothing changed.
    NotFound,
    /// Subtree rewritten to this node.
    Replaced(*mut Node<K, V>),
    /// The subtree emptied out entirely and was dropped.
    Emptied,
}

/// Aggregate counters for one tree.
#[derive(Debug, Clone, Default)]
pub struct CowTreeStats {
    pub len: usize,
    pub height: usize,
    pub epoch: u64,
    pub retired_nodes: usize,
    pub active_readers: usize,
}

/// Lock-free-read ordered map with snapshot support.
pub struct CowTree<K, V> {
    root: AtomicPtr<Node<K, V>>,
    write_lock: Mutex<()>,
    epoch: EpochManager,
    max_keys: usize,
    len: AtomicUsize,
    height: AtomicUsize,
}

unsafe impl<K: Send + Sync, V: Send + Sync> Send for CowTree<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for CowTree<K, V> {}

impl<K, V> CowTree<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_max_keys(DEFAULT_MAX_KEYS)
    }

    pub fn with_max_keys(max_keys: usize) -> Self {
        assert!(max_keys >= 2, "cow tree needs at least two keys per node");
        Self {
            root: AtomicPtr::new(Node::new_leaf(Vec::new(), Vec::new())),
            write_lock: Mutex::new(()),
            epoch: EpochManager::new(),
            max_keys,
            len: AtomicUsize::new(0),
            height: AtomicUsize::new(1),
        }
    }

    /// Lock-free point lookup.
    pub fn get(&self, key: &K) -> Option<V> {
        let _guard = self.epoch.enter();
        let root = self.root.load(Ordering::Acquire);
        unsafe { lookup(root, key) }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts or replaces `key`. Serialized against other writers;
    /// readers keep going on the old version until the root swap.
    pub fn insert(&self, key: K, value: V) {
        let _write = self.write_lock.lock();
        let root = self.root.load(Ordering::Acquire);
        let mut retired = Vec::new();
        let rewrite = unsafe { self.insert_rec(root, &key, &value, &mut retired) };

        let new_root = match rewrite.split {
            None => rewrite.node,
            Some((sep, right)) => {
                self.height.fetch_add(1, Ordering::AcqRel);
                Node::new_interior(
                    vec![sep],
                    vec![AtomicPtr::new(rewrite.node), AtomicPtr::new(right)],
                )
            }
        };
        self.root.store(new_root, Ordering::Release);
        if !rewrite.replaced {
            self.len.fetch_add(1, Ordering::AcqRel);
        }

        self.epoch.retire_nodes(retired);
        self.epoch.advance();
        self.epoch.try_reclaim();
    }

    /// Removes `key`, returning whether it was present. No merging or
    /// redistribution happens, but a node that empties out is dropped
    /// from its parent, and a root interior left with zero keys is
    /// collapsed onto its only child.
    pub fn delete(&self, key: &K) -> bool {
        let _write = self.write_lock.lock();
        let root = self.root.load(Ordering::Acquire);
        let mut retired = Vec::new();
        let new_root = match unsafe { self.delete_rec(root, key, &mut retired) } {
            Removal::NotFound => return false,
            Removal::Replaced(node) => {
                let mut new_root = node;
                loop {
                    match unsafe { &*new_root } {
                        Node::Interior(int) if int.keys.is_empty() => {
                            let only = int.children[0].load(Ordering::Acquire);
                            retired.push(new_root);
                            new_root = only;
                            self.height.fetch_sub(1, Ordering::AcqRel);
                        }
                        _ => break,
                    }
                }
                new_root
            }
            Removal::Emptied => {
                // Last key gone: start over from one empty leaf.
                self.height.store(1, Ordering::Release);
                Node::new_leaf(Vec::new(), Vec::new())
            }
        };
        self.root.store(new_root, Ordering::Release);
        self.len.fetch_sub(1, Ordering::AcqRel);

        self.epoch.retire_nodes(retired);
        self.epoch.advance();
        self.epoch.try_reclaim();
        true
    }

    /// Visits keys in `[start, end]` (both bounds optional) in ascending
    /// order. The callback returns false to stop early.
    pub fn range<F>(&self, start: Option<&K>, end: Option<&K>, mut f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let _guard = self.epoch.enter();
        let root = self.root.load(Ordering::Acquire);
        unsafe { scan(root, start, end, &mut f) }
    }

    /// Visits every entry in ascending key order.
    pub fn for_each<F>(&self, f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.range(None, None, f)
    }

    /// Pins the current version of the tree. Reads through the snapshot
    /// keep observing it regardless of later writes, and none of its
    /// nodes are reclaimed until release.
    pub fn snapshot(&self) -> CowSnapshot<'_, K, V> {
        let guard = self.epoch.enter();
        let root = self.root.load(Ordering::Acquire);
        CowSnapshot {
            root,
            _guard: guard,
            _tree: std::marker::PhantomData,
        }
    }

    /// Drops the tree. Provided for symmetry with the storage handles;
    /// equivalent to letting it fall out of scope.
    pub fn close(self) {}

    pub fn stats(&self) -> CowTreeStats {
        CowTreeStats {
            len: self.len(),
            height: self.height.load(Ordering::Acquire),
            epoch: self.epoch.current_epoch(),
            retired_nodes: self.epoch.retired_count(),
            active_readers: self.epoch.active_readers(),
        }
    }

    /// Splices replacement leaves into the chain. `first`/`last` replace
    /// `old` (they are the same node unless `old` split). The untouched
    /// neighbours are re-pointed atomically; `old` keeps its own links
    /// so in-flight readers can still exit through it.
    unsafe fn splice_chain(&self, old: *mut Node<K, V>, first: *mut Node<K, V>, last: *mut Node<K, V>) {
        let old_leaf = (*old).leaf();
        let prev = old_leaf.prev.load(Ordering::Acquire);
        let next = old_leaf.next.load(Ordering::Acquire);

        (*first).leaf().prev.store(prev, Ordering::Release);
        (*last).leaf().next.store(next, Ordering::Release);
        if !prev.is_null() {
            (*prev).leaf().next.store(first, Ordering::Release);
        }
        if !next.is_null() {
            (*next).leaf().prev.store(last, Ordering::Release);
        }
    }

    unsafe fn insert_rec(
        &self,
        node: *mut Node<K, V>,
        key: &K,
        value: &V,
        retired: &mut Vec<*mut Node<K, V>>,
    ) -> Rewrite<K, V> {
        match &*node {
            Node::Leaf(leaf) => {
                let mut keys = leaf.keys.clone();
                let mut values = leaf.values.clone();
                let replaced = match keys.binary_search(key) {
                    Ok(i) => {
                        values[i] = value.clone();
                        true
                    }
                    Err(i) => {
                        keys.insert(i, key.clone());
                        values.insert(i, value.clone());
                        false
                    }
                };

                if keys.len() <= self.max_keys {
                    let clone = Node::new_leaf(keys, values);
                    self.splice_chain(node, clone, clone);
                    retired.push(node);
                    Rewrite {
                        node: clone,
                        split: None,
                        replaced,
                    }
                } else {
                    let mid = keys.len() / 2;
                    let right_keys = keys.split_off(mid);
                    let right_values = values.split_off(mid);
                    let sep = right_keys[0].clone();

                    let left = Node::new_leaf(keys, values);
                    let right = Node::new_leaf(right_keys, right_values);
                    (*left).leaf().next.store(right, Ordering::Release);
                    (*right).leaf().prev.store(left, Ordering::Release);
                    self.splice_chain(node, left, right);
                    retired.push(node);
                    Rewrite {
                        node: left,
                        split: Some((sep, right)),
                        replaced,
                    }
                }
            }
            Node::Interior(int) => {
                let idx = int.keys.partition_point(|k| k <= key);
                let child = int.children[idx].load(Ordering::Acquire);
                let below = self.insert_rec(child, key, value, retired);

                let mut keys = int.keys.clone();
                let mut children = clone_children(&int.children);
                children[idx] = AtomicPtr::new(below.node);
                if let Some((sep, right)) = below.split {
                    keys.insert(idx, sep);
                    children.insert(idx + 1, AtomicPtr::new(right));
                }

                retired.push(node);
                if keys.len() <= self.max_keys {
                    Rewrite {
                        node: Node::new_interior(keys, children),
                        split: None,
                        replaced: below.replaced,
                    }
                } else {
                    let mid = keys.len() / 2;
                    let right_keys = keys.split_off(mid + 1);
                    let sep = keys.pop().expect("median key");
                    let right_children = children.split_off(mid + 1);

                    let left = Node::new_interior(keys, children);
                    let right = Node::new_interior(right_keys, right_children);
                    Rewrite {
                        node: left,
                        split: Some((sep, right)),
                        replaced: below.replaced,
                    }
                }
            }
        }
    }

    unsafe fn delete_rec(
        &self,
        node: *mut Node<K, V>,
        key: &K,
        retired: &mut Vec<*mut Node<K, V>>,
    ) -> Removal<K, V> {
        match &*node {
            Node::Leaf(leaf) => {
                let Ok(i) = leaf.keys.binary_search(key) else {
                    return Removal::NotFound;
                };
                if leaf.keys.len() == 1 {
                    // The leaf empties out: unlink it from the chain
                    // instead of publishing an empty clone. Its own
                    // links stay intact for in-flight readers.
                    let prev = leaf.prev.load(Ordering::Acquire);
                    let next = leaf.next.load(Ordering::Acquire);
                    if !prev.is_null() {
                        (*prev).leaf().next.store(next, Ordering::Release);
                    }
                    if !next.is_null() {
                        (*next).leaf().prev.store(prev, Ordering::Release);
                    }
                    retired.push(node);
                    return Removal::Emptied;
                }
                let mut keys = leaf.keys.clone();
                let mut values = leaf.values.clone();
                keys.remove(i);
                values.remove(i);

                let clone = Node::new_leaf(keys, values);
                self.splice_chain(node, clone, clone);
                retired.push(node);
                Removal::Replaced(clone)
            }
            Node::Interior(int) => {
                let idx = int.keys.partition_point(|k| k <= key);
                let child = int.children[idx].load(Ordering::Acquire);
                match self.delete_rec(child, key, retired) {
                    Removal::NotFound => Removal::NotFound,
                    Removal::Replaced(new_child) => {
                        let keys = int.keys.clone();
                        let children = clone_children(&int.children);
                        children[idx].store(new_child, Ordering::Relaxed);
                        retired.push(node);
                        Removal::Replaced(Node::new_interior(keys, children))
                    }
                    Removal::Emptied => {
                        if int.children.len() == 1 {
                            // Last child gone: this node empties too.
                            retired.push(node);
                            return Removal::Emptied;
                        }
                        let mut keys = int.keys.clone();
                        let mut children = clone_children(&int.children);
                        children.remove(idx);
                        keys.remove(idx.min(keys.len() - 1));
                        retired.push(node);
                        Removal::Replaced(Node::new_interior(keys, children))
                    }
                }
            }
        }
    }
}

impl<K, V> Default for CowTree<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Drop for CowTree<K, V> {
    fn drop(&mut self) {
        // Exclusive access: free the current version. Retired nodes are
        // disjoint from it and freed by the epoch manager's drop.
        unsafe { free_subtree(*self.root.get_mut()) };
    }
}

/// Read-only view pinned to one published version.
pub struct CowSnapshot<'a, K, V> {
    root: *mut Node<K, V>,
    _guard: EpochGuard,
    _tree: std::marker::PhantomData<&'a CowTree<K, V>>,
}

impl<K, V> CowSnapshot<'_, K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    pub fn get(&self, key: &K) -> Option<V> {
        unsafe { lookup(self.root, key) }
    }

    pub fn range<F>(&self, start: Option<&K>, end: Option<&K>, mut f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        unsafe { scan(self.root, start, end, &mut f) }
    }

    /// Leaves the pinned epoch. Dropping the snapshot does the same.
    pub fn release(self) {}
}

fn clone_children<K, V>(children: &[AtomicPtr<Node<K, V>>]) -> Vec<AtomicPtr<Node<K, V>>> {
    children
        .iter()
        .map(|child| AtomicPtr::new(child.load(Ordering::Acquire)))
        .collect()
}

unsafe fn lookup<K: Ord, V: Clone>(mut node: *mut Node<K, V>, key: &K) -> Option<V> {
    loop {
        match &*node {
            Node::Interior(int) => {
                let i = int.keys.partition_point(|k| k <= key);
                node = int.children[i].load(Ordering::Acquire);
            }
            Node::Leaf(leaf) => {
                return leaf
                    .keys
                    .binary_search(key)
                    .ok()
                    .map(|i| leaf.values[i].clone());
            }
        }
    }
}

unsafe fn scan<K: Ord, V, F>(root: *mut Node<K, V>, start: Option<&K>, end: Option<&K>, f: &mut F)
where
    F: FnMut(&K, &V) -> bool,
{
    // Descend to the leaf that would hold the start bound.
    let mut node = root;
    let mut leaf = loop {
        match &*node {
            Node::Interior(int) => {
                let i = match start {
                    Some(key) => int.keys.partition_point(|k| k <= key),
                    None => 0,
                };
                node = int.children[i].load(Ordering::Acquire);
            }
            Node::Leaf(_) => break node,
        }
    };

    let mut skip_below = start;
    loop {
        let leaf_ref = (*leaf).leaf();
        let begin = match skip_below {
            Some(key) => leaf_ref.keys.partition_point(|k| k < key),
            None => 0,
        };
        for i in begin..leaf_ref.keys.len() {
            let key = &leaf_ref.keys[i];
            if let Some(end) = end {
                if key > end {
                    return;
                }
            }
            if !f(key, &leaf_ref.values[i]) {
                return;
            }
        }
        skip_below = None;
        leaf = leaf_ref.next.load(Ordering::Acquire);
        if leaf.is_null() {
            return;
        }
    }
}

unsafe fn free_subtree<K, V>(node: *mut Node<K, V>) {
    if node.is_null() {
        return;
    }
    if let Node::Interior(int) = &*node {
        for child in &int.children {
            free_subtree(child.load(Ordering::Relaxed));
        }
    }
    drop(Box::from_raw(node));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_tree() -> CowTree<String, u64> {
        CowTree::with_max_keys(4)
    }

    #[test]
    fn test_insert_get_replace() {
        let tree = small_tree();
        tree.insert("a".into(), 1);
        tree.insert("b".into(), 2);
        assert_eq!(tree.get(&"a".into()), Some(1));
        assert_eq!(tree.len(), 2);

        tree.insert("a".into(), 10);
        assert_eq!(tree.get(&"a".into()), Some(10));
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.get(&"zzz".into()), None);
    }

    #[test]
    fn test_splits_keep_order() {
        let tree = small_tree();
        for i in 0..200u64 {
            tree.insert(format!("key-{i:03}"), i);
        }
        assert_eq!(tree.len(), 200);
        assert!(tree.stats().height > 1);

        let mut seen = Vec::new();
        tree.for_each(|k, v| {
            seen.push((k.clone(), *v));
            true
        });
        assert_eq!(seen.len(), 200);
        assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
        for (k, v) in &seen {
            assert_eq!(*k, format!("key-{v:03}"));
        }
    }

    #[test]
    fn test_delete_and_root_collapse() {
        let tree = small_tree();
        for i in 0..50u64 {
            tree.insert(format!("k{i:02}"), i);
        }
        for i in 0..49u64 {
            assert!(tree.delete(&format!("k{i:02}")));
        }
        assert!(!tree.delete(&"k00".to_string()));
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.get(&"k49".into()), Some(49));
        assert_eq!(tree.stats().height, 1);
    }

    #[test]
    fn test_range_bounds_and_early_stop() {
        let tree = small_tree();
        for i in 0..30u64 {
            tree.insert(format!("k{i:02}"), i);
        }

        let mut collected = Vec::new();
        tree.range(
            Some(&"k05".to_string()),
            Some(&"k10".to_string()),
            |k, _| {
                collected.push(k.clone());
                true
            },
        );
        assert_eq!(collected.first().map(String::as_str), Some("k05"));
        assert_eq!(collected.last().map(String::as_str), Some("k10"));
        assert_eq!(collected.len(), 6);

        let mut count = 0;
        tree.range(None, None, |_, _| {
            count += 1;
            count < 3
        });
        assert_eq!(count, 3);
    }

    #[test]
    fn test_snapshot_pins_version() {
        let tree = small_tree();
        tree.insert("k".into(), 1);

        let snap = tree.snapshot();
        tree.insert("k".into(), 2);
        tree.insert("other".into(), 3);

        assert_eq!(snap.get(&"k".into()), Some(1));
        assert_eq!(snap.get(&"other".into()), None);
        assert_eq!(tree.get(&"k".into()), Some(2));
        snap.release();
    }

    #[test]
    fn test_stats_track_reclamation() {
        let tree = small_tree();
        for i in 0..20u64 {
            tree.insert(format!("k{i}"), i);
        }
        // With no readers, each write reclaims the previous path.
        let stats = tree.stats();
        assert_eq!(stats.len, 20);
        assert!(stats.epoch > 20);
        assert_eq!(stats.active_readers, 0);
    }
}
