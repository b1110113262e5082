// Tree backend dispatch.
//
// The layer above picks between the two index implementations: the
// disk-resident paged B-tree and the in-memory copy-on-write tree. A
// closed two-variant enum keeps the choice static; there is no plugin
// surface behind it.

use crate::btree::BTree;
use crate::error::{DbError, Result};
use crate::index::CowTree;

/// One of the two tree backends, behind a shared point-op surface.
pub enum TreeHandle {
    /// Durable, pager-backed B-tree. Writes must run inside the owning
    /// pager's write transaction.
    Paged(BTree),
    /// Volatile CoW B+ tree with lock-free reads.
    Memory(CowTree<Vec<u8>, Vec<u8>>),
}

impl TreeHandle {
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        match self {
            TreeHandle::Paged(tree) => tree.get(key),
            TreeHandle::Memory(tree) => {
                tree.get(&key.to_vec()).ok_or(DbError::KeyNotFound)
            }
        }
    }

    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        match self {
            TreeHandle::Paged(tree) => tree.insert(key, value),
            TreeHandle::Memory(tree) => {
                tree.insert(key.to_vec(), value.to_vec());
                Ok(())
            }
        }
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        match self {
            TreeHandle::Paged(tree) => tree.delete(key),
            TreeHandle::Memory(tree) => {
                if tree.delete(&key.to_vec()) {
                    Ok(())
                } else {
                    Err(DbError::KeyNotFound)
                }
            }
        }
    }

    /// Visits entries in ascending key order until the callback returns
    /// false.
    pub fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        match self {
            TreeHandle::Paged(tree) => {
                let mut cursor = tree.cursor();
                cursor.first()?;
                while cursor.valid() {
                    let key = cursor.key().expect("valid cursor has a key");
                    let value = cursor.value().expect("valid cursor has a value");
                    if !f(key, value) {
                        break;
                    }
                    cursor.next()?;
                }
                Ok(())
            }
            TreeHandle::Memory(tree) => {
                tree.for_each(|k, v| f(k, v));
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::{Pager, PagerOptions};
    use crate::storage::MemBlocks;
    use std::sync::Arc;

    #[test]
    fn test_memory_backend() {
        let mut tree = TreeHandle::Memory(CowTree::new());
        tree.insert(b"a", b"1").unwrap();
        tree.insert(b"b", b"2").unwrap();
        assert_eq!(tree.get(b"a").unwrap(), b"1");

        let mut keys = Vec::new();
        tree.for_each(|k, _| {
            keys.push(k.to_vec());
            true
        })
        .unwrap();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);

        tree.delete(b"a").unwrap();
        assert!(tree.get(b"a").is_err());
        assert!(tree.delete(b"a").is_err());
    }

    #[test]
    fn test_paged_backend() {
        let pager = Arc::new(
            Pager::open(
                Arc::new(MemBlocks::new()),
                None,
                PagerOptions {
                    page_size: 256,
                    cache_capacity: 32,
                },
            )
            .unwrap(),
        );
        let _tx = pager.begin_write();
        let mut tree = TreeHandle::Paged(BTree::create(pager.clone()).unwrap());
        for i in 0..20 {
            let key = format!("k{i:02}");
            tree.insert(key.as_bytes(), b"v").unwrap();
        }
        assert_eq!(tree.get(b"k07").unwrap(), b"v");

        let mut count = 0;
        tree.for_each(|_, _| {
            count += 1;
            true
        })
        .unwrap();
        assert_eq!(count, 20);
    }
}
