// Shared identifiers and limits used across the engine.

/// Page number within the main data file. Page 0 holds the file header.
pub type PageId = u32;

/// Transaction identifier. Never reused within one store instance.
pub type TxnId = u64;

/// Logical timestamp drawn from a store-local monotonic counter.
pub type Timestamp = u64;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 64;

/// Largest supported page size. Node offsets are u16, so pages must stay
/// well inside that range.
pub const MAX_PAGE_SIZE: usize = 32768;

/// Default page size when the embedder does not care.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Returns true if `n` is a usable page size.
pub fn valid_page_size(n: usize) -> bool {
    (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&n) && n.is_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_bounds() {
        assert!(valid_page_size(256));
        assert!(valid_page_size(4096));
        assert!(!valid_page_size(0));
        assert!(!valid_page_size(1000));
        assert!(!valid_page_size(MAX_PAGE_SIZE * 2));
    }
}
