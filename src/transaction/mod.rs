// Transactions: MVCC version chains, snapshot-isolation lifecycle,
// write-write conflict detection, and optional deadlock detection,
// composed into the versioned store.

pub mod conflict;
pub mod deadlock;
pub mod manager;
pub mod store;
pub mod version;

pub use conflict::ConflictDetector;
pub use deadlock::{DeadlockDetector, DeadlockStats};
pub use manager::{Transaction, TransactionManager, TxnState, TxnStatus};
pub use store::{StoreOptions, StoreSnapshot, StoreStats, VersionedStore};
pub use version::{find_visible, is_visible, RowVersion, VersionChain};
