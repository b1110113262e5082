// Ordered traversal over a B-tree.
//
// The cursor keeps an ancestor stack of (page, child slot) pairs instead
// of page references, so it can cross leaf boundaries in both directions
// while holding at most one page reference at any moment. Keys and
// values are copied out; callers may keep them beyond the cursor.

use std::sync::Arc;

use crate::common::PageId;
use crate::error::Result;
use crate::pager::Pager;

use super::node::Node;

/// Stateful iterator over one tree.
pub struct Cursor {
    pager: Arc<Pager>,
    root: PageId,
    /// Interior ancestors: (page, child slot taken). Slot `cell_count`
    /// denotes the right_child pointer.
    stack: Vec<(PageId, usize)>,
    leaf: PageId,
    slot: usize,
    key: Vec<u8>,
    value: Vec<u8>,
    valid: bool,
}

impl Cursor {
    pub(crate) fn new(pager: Arc<Pager>, root: PageId) -> Self {
        Self {
            pager,
            root,
            stack: Vec::new(),
            leaf: root,
            slot: 0,
            key: Vec::new(),
            value: Vec::new(),
            valid: false,
        }
    }

    /// True while the cursor points at an entry.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Current key, owned by the cursor.
    pub fn key(&self) -> Option<&[u8]> {
        self.valid.then_some(self.key.as_slice())
    }

    /// Current value, owned by the cursor.
    pub fn value(&self) -> Option<&[u8]> {
        self.valid.then_some(self.value.as_slice())
    }

    /// Positions on the smallest key in the tree.
    pub fn first(&mut self) -> Result<()> {
        self.stack.clear();
        self.descend_leftmost(self.root)?;
        if self.leaf_len()? > 0 {
            self.slot = 0;
            self.load()
        } else {
            self.advance_leaf()
        }
    }

    /// Positions on the largest key in the tree.
    pub fn last(&mut self) -> Result<()> {
        self.stack.clear();
        self.descend_rightmost(self.root)?;
        let len = self.leaf_len()?;
        if len > 0 {
            self.slot = len - 1;
            self.load()
        } else {
            self.retreat_leaf()
        }
    }

    /// Positions on the first key greater than or equal to `key`;
    /// invalid when every key is smaller.
    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.stack.clear();
        let mut page_no = self.root;
        loop {
            let step = self.with_node(page_no, |node| {
                if node.is_leaf() {
                    Ok(None)
                } else {
                    let (found, pos) = node.search(key)?;
                    let j = if found { pos + 1 } else { pos };
                    let child = if j < node.cell_count() {
                        node.child(j)?
                    } else {
                        node.right_child()
                    };
                    Ok(Some((j, child)))
                }
            })?;
            match step {
                Some((slot, child)) => {
                    self.stack.push((page_no, slot));
                    page_no = child;
                }
                None => break,
            }
        }
        self.leaf = page_no;
        let (pos, len) = self.with_node(page_no, |node| {
            let (_, pos) = node.search(key)?;
            Ok((pos, node.cell_count()))
        })?;
        if pos < len {
            self.slot = pos;
            self.load()
        } else {
            self.advance_leaf()
        }
    }

    /// Moves to the next entry in key order.
    pub fn next(&mut self) -> Result<()> {
        if !self.valid {
            return Ok(());
        }
        if self.slot + 1 < self.leaf_len()? {
            self.slot += 1;
            self.load()
        } else {
            self.advance_leaf()
        }
    }

    /// Moves to the previous entry in key order.
    pub fn prev(&mut self) -> Result<()> {
        if !self.valid {
            return Ok(());
        }
        if self.slot > 0 {
            self.slot -= 1;
            self.load()
        } else {
            self.retreat_leaf()
        }
    }

    /// Releases the cursor.
    pub fn close(self) {}

    fn with_node<R>(&self, page_no: PageId, f: impl FnOnce(&Node<'_>) -> Result<R>) -> Result<R> {
        let page = self.pager.get(page_no)?;
        let result = (|| {
            let guard = page.read();
            let node = Node::new(guard.data(), page_no)?;
            f(&node)
        })();
        self.pager.release(&page);
        result
    }

    fn leaf_len(&self) -> Result<usize> {
        self.with_node(self.leaf, |node| Ok(node.cell_count()))
    }

    fn child_at(&self, page_no: PageId, slot: usize) -> Result<PageId> {
        self.with_node(page_no, |node| {
            if slot < node.cell_count() {
                node.child(slot)
            } else {
                Ok(node.right_child())
            }
        })
    }

    /// Walks to the leftmost leaf under `page_no`, recording the path.
    fn descend_leftmost(&mut self, mut page_no: PageId) -> Result<()> {
        loop {
            let child = self.with_node(page_no, |node| {
                if node.is_leaf() {
                    Ok(None)
                } else if node.cell_count() > 0 {
                    Ok(Some(node.child(0)?))
                } else {
                    Ok(Some(node.right_child()))
                }
            })?;
            match child {
                Some(child) => {
                    self.stack.push((page_no, 0));
                    page_no = child;
                }
                None => {
                    self.leaf = page_no;
                    return Ok(());
                }
            }
        }
    }

    /// Walks to the rightmost leaf under `page_no`, recording the path.
    fn descend_rightmost(&mut self, mut page_no: PageId) -> Result<()> {
        loop {
            let step = self.with_node(page_no, |node| {
                if node.is_leaf() {
                    Ok(None)
                } else {
                    Ok(Some((node.cell_count(), node.right_child())))
                }
            })?;
            match step {
                Some((count, child)) => {
                    self.stack.push((page_no, count));
                    page_no = child;
                }
                None => {
                    self.leaf = page_no;
                    return Ok(());
                }
            }
        }
    }

    /// Climbs until an ancestor has a sibling to the right, then takes
    /// the leftmost leaf below it. Skips empty leaves left behind by
    /// lazy deletes.
    fn advance_leaf(&mut self) -> Result<()> {
        while let Some((page_no, slot)) = self.stack.pop() {
            let count = self.with_node(page_no, |node| Ok(node.cell_count()))?;
            if slot < count {
                let next = slot + 1;
                self.stack.push((page_no, next));
                let child = self.child_at(page_no, next)?;
                self.descend_leftmost(child)?;
                if self.leaf_len()? > 0 {
                    self.slot = 0;
                    return self.load();
                }
            }
        }
        self.valid = false;
        Ok(())
    }

    /// Mirror of `advance_leaf` toward smaller keys.
    fn retreat_leaf(&mut self) -> Result<()> {
        while let Some((page_no, slot)) = self.stack.pop() {
            if slot > 0 {
                let prev = slot - 1;
                self.stack.push((page_no, prev));
                let child = self.child_at(page_no, prev)?;
                self.descend_rightmost(child)?;
                let len = self.leaf_len()?;
                if len > 0 {
                    self.slot = len - 1;
                    return self.load();
                }
            }
        }
        self.valid = false;
        Ok(())
    }

    fn load(&mut self) -> Result<()> {
        let slot = self.slot;
        let (key, value) = self.with_node(self.leaf, |node| {
            let (key, value) = node.cell(slot)?;
            Ok((key.to_vec(), value.to_vec()))
        })?;
        self.key = key;
        self.value = value;
        self.valid = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::BTree;
    use crate::pager::PagerOptions;
    use crate::storage::MemBlocks;

    fn populated_tree(n: usize) -> (Arc<Pager>, BTree) {
        let pager = Arc::new(
            Pager::open(
                Arc::new(MemBlocks::new()),
                None,
                PagerOptions {
                    page_size: 256,
                    cache_capacity: 64,
                },
            )
            .unwrap(),
        );
        let tx = pager.begin_write();
        let mut tree = BTree::create(pager.clone()).unwrap();
        for i in 0..n {
            let key = format!("k{i:04}");
            let value = format!("v{i:04}");
            tree.insert(key.as_bytes(), value.as_bytes()).unwrap();
        }
        tx.commit().unwrap();
        (pager, tree)
    }

    #[test]
    fn test_full_scan_in_order() {
        let (_pager, tree) = populated_tree(50);
        let mut cursor = tree.cursor();
        cursor.first().unwrap();

        let mut seen = Vec::new();
        while cursor.valid() {
            seen.push(cursor.key().unwrap().to_vec());
            cursor.next().unwrap();
        }
        assert_eq!(seen.len(), 50);
        let mut sorted = seen.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(seen, sorted);
    }

    #[test]
    fn test_reverse_scan() {
        let (_pager, tree) = populated_tree(40);
        let mut cursor = tree.cursor();
        cursor.last().unwrap();

        let mut count = 0;
        let mut prev: Option<Vec<u8>> = None;
        while cursor.valid() {
            let key = cursor.key().unwrap().to_vec();
            if let Some(prev) = &prev {
                assert!(key < *prev);
            }
            prev = Some(key);
            count += 1;
            cursor.prev().unwrap();
        }
        assert_eq!(count, 40);
    }

    #[test]
    fn test_seek_lands_on_ceiling() {
        let (_pager, tree) = populated_tree(30);
        let mut cursor = tree.cursor();

        cursor.seek(b"k0010").unwrap();
        assert_eq!(cursor.key().unwrap(), b"k0010");

        // Between two keys: lands on the next one.
        cursor.seek(b"k0010x").unwrap();
        assert_eq!(cursor.key().unwrap(), b"k0011");

        // Past the end: invalid.
        cursor.seek(b"z").unwrap();
        assert!(!cursor.valid());
    }

    #[test]
    fn test_empty_tree_cursor() {
        let pager = Arc::new(
            Pager::open(
                Arc::new(MemBlocks::new()),
                None,
                PagerOptions {
                    page_size: 256,
                    cache_capacity: 8,
                },
            )
            .unwrap(),
        );
        let tx = pager.begin_write();
        let tree = BTree::create(pager.clone()).unwrap();
        tx.commit().unwrap();
        let mut cursor = tree.cursor();
        cursor.first().unwrap();
        assert!(!cursor.valid());
        cursor.last().unwrap();
        assert!(!cursor.valid());
    }
}
