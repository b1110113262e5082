// In-memory ordered indexes.

pub mod cow_tree;

pub use cow_tree::{CowSnapshot, CowTree, CowTreeStats, DEFAULT_MAX_KEYS};
