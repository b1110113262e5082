// Concurrency primitives shared by the lock-free structures.

pub mod epoch;

pub use epoch::{EpochGuard, EpochManager};
