// Disk-resident ordered index.
//
// A B-tree over pager pages: leaves hold the key-value cells, interior
// nodes hold separator keys whose values are child page numbers. Inserts
// descend recursively; a full node splits and promotes its median key,
// and the split propagates upward until a node absorbs it or a new root
// grows the tree by one level. Deletes are lazy: the cell is removed and
// underflow is tolerated, so the tree stays ordered and searchable
// without rebalancing.

pub mod cursor;
pub mod node;

pub use cursor::Cursor;
pub use node::{Node, NodeMut, NODE_HEADER_SIZE};

use std::sync::Arc;

use crate::common::PageId;
use crate::error::{DbError, Result};
use crate::pager::{Pager, PageRef};

/// Which slot of the parent pointed at the child being descended into.
enum Descent {
    /// Child came from cell `i`.
    Cell(usize),
    /// Child came from the right_child slot.
    RightChild,
}

/// Handle to one B-tree rooted at a page.
pub struct BTree {
    pager: Arc<Pager>,
    root: PageId,
}

impl BTree {
    /// Allocates a single empty leaf and returns a tree rooted there.
    /// Must run inside a pager write transaction.
    pub fn create(pager: Arc<Pager>) -> Result<Self> {
        let page = pager.allocate()?;
        {
            let mut guard = page.write();
            NodeMut::init_leaf(guard.data_mut());
            guard.mark_dirty();
        }
        let root = page.page_no();
        pager.release(&page);
        log::debug!("btree created at root page {root}");
        Ok(Self { pager, root })
    }

    /// Constructs a handle for an existing tree. No I/O happens here.
    pub fn open(pager: Arc<Pager>, root: PageId) -> Self {
        Self { pager, root }
    }

    /// Current root page. Changes when the root splits.
    pub fn root_page(&self) -> PageId {
        self.root
    }

    /// Looks up `key`, returning an owned copy of its value.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let mut page_no = self.root;
        loop {
            let page = self.pager.get(page_no)?;
            let step = (|| {
                let guard = page.read();
                let node = Node::new(guard.data(), page_no)?;
                if node.is_leaf() {
                    let (found, pos) = node.search(key)?;
                    if found {
                        Ok(Some(node.cell(pos)?.1.to_vec()))
                    } else {
                        Err(DbError::KeyNotFound)
                    }
                } else {
                    let (_, child) = descend_index(&node, key)?;
                    page_no = child;
                    Ok(None)
                }
            })();
            self.pager.release(&page);
            if let Some(value) = step? {
                return Ok(value);
            }
        }
    }

    /// Inserts or replaces `key`. Must run inside a pager write
    /// transaction.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let max_cell = (self.pager.page_size() - NODE_HEADER_SIZE) / 4;
        if node::cell_size(key, value) + 2 > max_cell {
            return Err(DbError::invalid_format(format!(
                "record of {} bytes exceeds the per-page limit of {max_cell}",
                node::cell_size(key, value)
            )));
        }

        if let Some((median, right)) = self.insert_at(self.root, key, value)? {
            // The root itself split: grow the tree by one level.
            let page = self.pager.allocate()?;
            {
                let mut guard = page.write();
                NodeMut::init_interior(guard.data_mut());
                let mut node = NodeMut::new(guard.data_mut(), page.page_no())?;
                node.insert_cell(0, &median, &self.root.to_le_bytes())?;
                node.set_right_child(right);
                guard.mark_dirty();
            }
            let new_root = page.page_no();
            self.pager.release(&page);
            log::debug!("btree root split: {} -> {}", self.root, new_root);
            self.root = new_root;
        }
        Ok(())
    }

    /// Removes `key` from its leaf. No rebalancing happens.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        let mut page_no = self.root;
        loop {
            let page = self.pager.get(page_no)?;
            let outcome = (|| {
                let mut guard = page.write();
                let node = Node::new(guard.data(), page_no)?;
                if node.is_leaf() {
                    let (found, pos) = node.search(key)?;
                    if !found {
                        return Err(DbError::KeyNotFound);
                    }
                    let mut node = NodeMut::new(guard.data_mut(), page_no)?;
                    node.delete_cell(pos)?;
                    guard.mark_dirty();
                    Ok(None)
                } else {
                    let (_, child) = descend_index(&node, key)?;
                    Ok(Some(child))
                }
            })();
            self.pager.release(&page);
            match outcome? {
                Some(child) => page_no = child,
                None => return Ok(()),
            }
        }
    }

    /// Opens a traversal cursor over the tree.
    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.pager.clone(), self.root)
    }

    /// Length of the path from the root to the first leaf.
    pub fn depth(&self) -> Result<usize> {
        let mut depth = 1;
        let mut page_no = self.root;
        loop {
            let page = self.pager.get(page_no)?;
            let next = {
                let guard = page.read();
                let node = Node::new(guard.data(), page_no)?;
                if node.is_leaf() {
                    None
                } else if node.cell_count() > 0 {
                    Some(node.child(0)?)
                } else {
                    Some(node.right_child())
                }
            };
            self.pager.release(&page);
            match next {
                Some(child) => {
                    depth += 1;
                    page_no = child;
                }
                None => return Ok(depth),
            }
        }
    }

    /// Depth-first collection of every page reachable from the root.
    pub fn collect_pages(&self) -> Result<Vec<PageId>> {
        let mut pages = Vec::new();
        let mut stack = vec![self.root];
        while let Some(page_no) = stack.pop() {
            pages.push(page_no);
            let page = self.pager.get(page_no)?;
            {
                let guard = page.read();
                let node = Node::new(guard.data(), page_no)?;
                if !node.is_leaf() {
                    for i in 0..node.cell_count() {
                        stack.push(node.child(i)?);
                    }
                    stack.push(node.right_child());
                }
            }
            self.pager.release(&page);
        }
        Ok(pages)
    }

    /// Recursive insert. Returns the promoted key and new right sibling
    /// when this subtree's root split.
    fn insert_at(&self, page_no: PageId, key: &[u8], value: &[u8]) -> Result<Option<(Vec<u8>, PageId)>> {
        let page = self.pager.get(page_no)?;
        let result = self.insert_in_page(&page, key, value);
        self.pager.release(&page);
        result
    }

    fn insert_in_page(
        &self,
        page: &PageRef,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<(Vec<u8>, PageId)>> {
        let page_no = page.page_no();

        // Descent decision under a read guard so pure traversal does not
        // touch the dirty flag.
        let descent = {
            let guard = page.read();
            let node = Node::new(guard.data(), page_no)?;
            if node.is_leaf() {
                None
            } else {
                let (slot, child) = descend_index(&node, key)?;
                Some((slot, child))
            }
        };

        let Some((via, child)) = descent else {
            return self.insert_in_leaf(page, key, value);
        };

        let Some((median, new_right)) = self.insert_at(child, key, value)? else {
            return Ok(None);
        };

        // The child split: retarget the slot that pointed at it to the
        // new right sibling, then insert the separator cell that keeps
        // the old child reachable for keys below the median.
        let mut guard = page.write();
        let mut node = NodeMut::new(guard.data_mut(), page_no)?;
        match via {
            Descent::Cell(i) => node.update_cell_value(i, &new_right.to_le_bytes())?,
            Descent::RightChild => node.set_right_child(new_right),
        }

        let (_, pos) = node.as_node().search(&median)?;
        let split = match node.insert_cell(pos, &median, &child.to_le_bytes()) {
            Ok(()) => None,
            Err(DbError::NodeFull { .. }) => {
                let right_page = self.pager.allocate()?;
                let sibling = {
                    let mut right_guard = right_page.write();
                    let promoted =
                        node.split_into(right_guard.data_mut(), right_page.page_no())?;
                    if median.as_slice() < promoted.as_slice() {
                        let (_, p) = node.as_node().search(&median)?;
                        node.insert_cell(p, &median, &child.to_le_bytes())?;
                    } else {
                        let mut right =
                            NodeMut::new(right_guard.data_mut(), right_page.page_no())?;
                        let (_, p) = right.as_node().search(&median)?;
                        right.insert_cell(p, &median, &child.to_le_bytes())?;
                    }
                    right_guard.mark_dirty();
                    Some((promoted, right_page.page_no()))
                };
                self.pager.release(&right_page);
                sibling
            }
            Err(other) => return Err(other),
        };
        guard.mark_dirty();
        Ok(split)
    }

    fn insert_in_leaf(
        &self,
        page: &PageRef,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<(Vec<u8>, PageId)>> {
        let page_no = page.page_no();
        let mut guard = page.write();
        let mut node = NodeMut::new(guard.data_mut(), page_no)?;

        // Update semantics: an existing cell is removed first.
        let (found, pos) = node.as_node().search(key)?;
        if found {
            node.delete_cell(pos)?;
        }

        let split = match node.insert_cell(pos, key, value) {
            Ok(()) => None,
            Err(DbError::NodeFull { .. }) => {
                let right_page = self.pager.allocate()?;
                let sibling = {
                    let mut right_guard = right_page.write();
                    let promoted =
                        node.split_into(right_guard.data_mut(), right_page.page_no())?;
                    if key < promoted.as_slice() {
                        let (_, p) = node.as_node().search(key)?;
                        node.insert_cell(p, key, value)?;
                    } else {
                        let mut right =
                            NodeMut::new(right_guard.data_mut(), right_page.page_no())?;
                        let (_, p) = right.as_node().search(key)?;
                        right.insert_cell(p, key, value)?;
                    }
                    right_guard.mark_dirty();
                    Some((promoted, right_page.page_no()))
                };
                self.pager.release(&right_page);
                sibling
            }
            Err(other) => return Err(other),
        };
        guard.mark_dirty();
        Ok(split)
    }
}

/// Picks the child to descend into: the first cell whose key is greater
/// than `key`, or the right child when no such cell exists.
fn descend_index(node: &Node<'_>, key: &[u8]) -> Result<(Descent, PageId)> {
    let (found, pos) = node.search(key)?;
    let j = if found { pos + 1 } else { pos };
    if j < node.cell_count() {
        Ok((Descent::Cell(j), node.child(j)?))
    } else {
        Ok((Descent::RightChild, node.right_child()))
    }
}
