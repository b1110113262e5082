// End-to-end coverage of the paged B-tree: split propagation on small
// pages, cursor traversal across leaves, and durability through the WAL
// and checkpoint into the base file.

use std::sync::Arc;

use anchordb::{BTree, BlockFile, DbError, MemBlocks, Pager, PagerOptions};

fn open_pager(
    data: &Arc<MemBlocks>,
    wal: Option<&Arc<MemBlocks>>,
    page_size: usize,
) -> Arc<Pager> {
    Arc::new(
        Pager::open(
            data.clone(),
            wal.map(|w| w.clone() as Arc<dyn BlockFile>),
            PagerOptions {
                page_size,
                cache_capacity: 64,
            },
        )
        .unwrap(),
    )
}

#[test]
fn split_to_interior_on_small_pages() {
    // 50 five-byte keys on 256-byte pages force leaf splits and at
    // least one interior level.
    let data = Arc::new(MemBlocks::new());
    let pager = open_pager(&data, None, 256);

    let tx = pager.begin_write();
    let mut tree = BTree::create(pager.clone()).unwrap();
    for i in 0..50 {
        let key = format!("k{i:04}");
        let value = format!("v{i:04}");
        tree.insert(key.as_bytes(), value.as_bytes()).unwrap();
    }
    tx.commit().unwrap();

    assert!(tree.depth().unwrap() >= 2, "tree should have split");

    let mut cursor = tree.cursor();
    cursor.first().unwrap();
    let mut enumerated = Vec::new();
    while cursor.valid() {
        enumerated.push(cursor.key().unwrap().to_vec());
        cursor.next().unwrap();
    }
    assert_eq!(enumerated.len(), 50);
    let expected: Vec<Vec<u8>> = (0..50)
        .map(|i| format!("k{i:04}").into_bytes())
        .collect();
    assert_eq!(enumerated, expected);

    for i in 0..50 {
        let key = format!("k{i:04}");
        let value = format!("v{i:04}");
        assert_eq!(tree.get(key.as_bytes()).unwrap(), value.as_bytes());
    }
}

#[test]
fn update_semantics_keep_single_version() {
    let data = Arc::new(MemBlocks::new());
    let pager = open_pager(&data, None, 256);

    let tx = pager.begin_write();
    let mut tree = BTree::create(pager.clone()).unwrap();
    for round in 0..5 {
        for i in 0..30 {
            let key = format!("k{i:04}");
            let value = format!("v{i:04}-r{round}");
            tree.insert(key.as_bytes(), value.as_bytes()).unwrap();
        }
    }
    tx.commit().unwrap();

    // Still exactly 30 keys, each holding the latest value.
    let mut cursor = tree.cursor();
    cursor.first().unwrap();
    let mut count = 0;
    while cursor.valid() {
        assert!(cursor.value().unwrap().ends_with(b"-r4"));
        count += 1;
        cursor.next().unwrap();
    }
    assert_eq!(count, 30);
}

#[test]
fn survives_reopen_through_wal_and_checkpoint() {
    let data = Arc::new(MemBlocks::new());
    let wal = Arc::new(MemBlocks::new());

    let root = {
        let pager = open_pager(&data, Some(&wal), 256);
        let tx = pager.begin_write();
        let mut tree = BTree::create(pager.clone()).unwrap();
        for i in 0..40 {
            let key = format!("k{i:04}");
            tree.insert(key.as_bytes(), b"persisted").unwrap();
        }
        pager.set_root_page(tree.root_page());
        tx.commit().unwrap();
        pager.checkpoint().unwrap();
        tree.root_page()
    };

    // Reopen from the base file alone: the checkpoint moved everything.
    let pager = open_pager(&data, None, 256);
    assert_eq!(pager.root_page(), root);
    let tree = BTree::open(pager.clone(), pager.root_page());
    for i in 0..40 {
        let key = format!("k{i:04}");
        assert_eq!(tree.get(key.as_bytes()).unwrap(), b"persisted");
    }
}

#[test]
fn reopen_before_checkpoint_reads_from_wal() {
    let data = Arc::new(MemBlocks::new());
    let wal = Arc::new(MemBlocks::new());

    {
        let pager = open_pager(&data, Some(&wal), 256);
        let tx = pager.begin_write();
        let mut tree = BTree::create(pager.clone()).unwrap();
        tree.insert(b"only-in-wal", b"yes").unwrap();
        pager.set_root_page(tree.root_page());
        tx.commit().unwrap();
        // No checkpoint: the base file never saw these pages.
    }

    let pager = open_pager(&data, Some(&wal), 256);
    let tree = BTree::open(pager.clone(), pager.root_page());
    assert_eq!(tree.get(b"only-in-wal").unwrap(), b"yes");
}

#[test]
fn rollback_undoes_tree_growth() {
    let data = Arc::new(MemBlocks::new());
    let pager = open_pager(&data, None, 256);

    let root = {
        let tx = pager.begin_write();
        let mut tree = BTree::create(pager.clone()).unwrap();
        tree.insert(b"committed", b"1").unwrap();
        pager.set_root_page(tree.root_page());
        tx.commit().unwrap();
        tree.root_page()
    };
    let pages_before = pager.page_count();

    {
        let tx = pager.begin_write();
        let mut tree = BTree::open(pager.clone(), root);
        for i in 0..40 {
            let key = format!("discard-{i:03}");
            tree.insert(key.as_bytes(), b"x").unwrap();
        }
        tx.rollback();
    }

    assert_eq!(pager.page_count(), pages_before);
    let tree = BTree::open(pager.clone(), root);
    assert_eq!(tree.get(b"committed").unwrap(), b"1");
    assert!(matches!(
        tree.get(b"discard-000"),
        Err(DbError::KeyNotFound)
    ));
}
