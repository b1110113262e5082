// anchordb: embedded transactional key-value storage engine.
//
// Four subsystems stack into the engine:
//
// * A paged B-tree over the pager/block-storage layers gives durable
//   ordered key access, journaled through a write-ahead log whose commit
//   markers make page writes atomic across crashes.
// * An in-memory copy-on-write B+ tree gives lock-free concurrent reads
//   via atomic root swaps, with epoch-based reclamation of retired
//   nodes.
// * Per-key version chains plus a transaction manager implement
//   snapshot isolation with first-writer-wins conflict detection and
//   optional deadlock detection.
// * The versioned store composes the pieces into the transactional
//   key-value surface a query layer builds on.
//
// Higher layers serialize their tuples into opaque byte keys and values;
// this crate persists and orders them. It opens no files on its own:
// the embedder supplies `BlockFile` implementations.

pub mod btree;
pub mod common;
pub mod concurrent;
pub mod engine;
pub mod error;
pub mod index;
pub mod pager;
pub mod storage;
pub mod transaction;
pub mod varint;
pub mod wal;

pub use btree::{BTree, Cursor};
pub use common::{PageId, Timestamp, TxnId};
pub use concurrent::{EpochGuard, EpochManager};
pub use engine::TreeHandle;
pub use error::{DbError, Result};
pub use index::{CowSnapshot, CowTree, CowTreeStats};
pub use pager::{Page, PageHandle, PageRef, Pager, PagerOptions, PagerStats, WriteTransaction};
pub use storage::{BlockFile, FileBlocks, MemBlocks, PageStore};
pub use transaction::{
    ConflictDetector, DeadlockDetector, StoreOptions, StoreSnapshot, StoreStats, Transaction,
    TransactionManager, TxnState, TxnStatus, VersionedStore,
};
pub use wal::{Wal, WalStats};
