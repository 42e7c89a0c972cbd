//! Deduplication of memory compare events.
//!
//! A `memcmp` against a constant buffer directly yields the bytes to put at the compared offset, no
//! solver involved. Each `(address, context, offset, order)` site is only worth this once.

use hashbrown::HashSet;

/// Key of a memory compare site
pub type MemcmpKey = (u64, u64, u64, u32);

/// Process wide set of already handled memory compare sites.
#[derive(Debug, Clone, Default)]
pub struct MemcmpDedup {
    seen: HashSet<MemcmpKey>,
}

impl MemcmpDedup {
    /// Nothing seen yet
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` on the first sighting of this site, `false` on every later one.
    pub fn is_novel(&mut self, addr: u64, ctx: u64, offset: u64, order: u32) -> bool {
        self.seen.insert((addr, ctx, offset, order))
    }

    /// Number of distinct sites seen
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// `true` if no site was seen yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use crate::filters::memcmp::MemcmpDedup;

    #[test]
    fn test_memcmp_dedup() {
        let mut dedup = MemcmpDedup::new();
        assert!(dedup.is_empty());
        assert!(dedup.is_novel(0x401000, 9, 4, 0));
        assert!(!dedup.is_novel(0x401000, 9, 4, 0));
        // another order at the same site is another compare
        assert!(dedup.is_novel(0x401000, 9, 4, 1));
        assert!(dedup.is_novel(0x401000, 9, 8, 0));
        assert_eq!(dedup.len(), 3);
    }
}
