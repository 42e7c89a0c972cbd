//! Path prefix novelty: a rolling digest over the branch decisions of a trace.
//!
//! Each symbolic branch forks the digest. The continuation that was taken gets marked in the
//! persistent [`PrefixSet`], the untaken one is only worth solving if no trace explored it yet.

use hashbrown::HashMap;

use xxhash_rust::{xxh32::xxh32, xxh64::Xxh64};

use crate::{filters::is_power_of_two_or_zero, union_table::Label};

/// Default size of the persistent prefix bitmap, in bytes
pub const PREFIX_MAP_BYTES: usize = 1 << 27;

/// Process wide bitset of explored path prefix digests.
#[derive(Debug, Clone)]
pub struct PrefixSet {
    bits: Vec<u8>,
}

impl Default for PrefixSet {
    fn default() -> Self {
        Self::new(PREFIX_MAP_BYTES)
    }
}

impl PrefixSet {
    /// A set backed by `bytes` bytes of bitmap
    #[must_use]
    pub fn new(bytes: usize) -> Self {
        Self {
            bits: vec![0; bytes.max(1)],
        }
    }

    fn slot(&self, digest: u64) -> (usize, u8) {
        let bit = digest % (self.bits.len() as u64 * 8);
        ((bit / 8) as usize, 1 << (bit % 8))
    }

    /// `true` if no trace explored this digest yet.
    #[must_use]
    pub fn check(&self, digest: u64) -> bool {
        let (idx, mask) = self.slot(digest);
        self.bits[idx] & mask == 0
    }

    /// Mark a digest as explored.
    pub fn mark(&mut self, digest: u64) {
        let (idx, mask) = self.slot(digest);
        self.bits[idx] |= mask;
    }
}

/// The rolling digest of the current trace.
#[derive(Clone)]
pub struct PathPrefix {
    state: Xxh64,
    seeded: bool,
}

impl std::fmt::Debug for PathPrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathPrefix")
            .field("digest", &self.state.digest())
            .field("seeded", &self.seeded)
            .finish()
    }
}

impl Default for PathPrefix {
    fn default() -> Self {
        Self::new()
    }
}

impl PathPrefix {
    /// The empty prefix
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Xxh64::new(0),
            seeded: false,
        }
    }

    /// Back to the empty prefix.
    pub fn reset(&mut self) {
        self.state.reset(0);
        self.seeded = false;
    }

    /// `true` once [`Self::seed`] was called for this trace
    #[must_use]
    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    /// Roll in the trace id, so equal branch sequences of different seeds differ.
    pub fn seed(&mut self, tid: u32) {
        self.state.update(&tid.to_le_bytes());
        self.seeded = true;
    }

    /// Current digest
    #[must_use]
    pub fn digest(&self) -> u64 {
        self.state.digest()
    }

    /// Roll in a branch decision.
    ///
    /// For symbolic branches the taken continuation is marked in `explored` and the digest of the
    /// untaken continuation is returned. Concrete branches return the current (non-zero) digest.
    pub fn roll_in(
        &mut self,
        label: Label,
        addr: u64,
        direction: u64,
        explored: &mut PrefixSet,
    ) -> u64 {
        self.state.update(&addr.to_le_bytes());

        if label == 0 {
            self.state.update(&[1]);
            self.state.update(&direction.to_le_bytes());
            let digest = self.state.digest();
            if digest != 0 {
                return digest;
            }
            let mut fallback = Xxh64::new(0);
            fallback.update(&addr.to_le_bytes());
            fallback.update(&direction.to_le_bytes());
            return fallback.digest().max(1);
        }

        self.state.update(&[0]);
        let mut untaken = self.state.clone();
        untaken.update(&(1 - direction.min(1)).to_le_bytes());

        self.state.update(&direction.to_le_bytes());
        explored.mark(self.state.digest());
        untaken.digest()
    }
}

/// Per trace revisit counts of `(address, context, direction)` nodes.
///
/// A node is memorized, that is its extra constraints are collected, on every power of two visit.
#[derive(Debug, Clone)]
pub struct NodeVisits {
    counts: HashMap<u32, u16>,
    buckets: u32,
}

impl Default for NodeVisits {
    fn default() -> Self {
        Self::new(PREFIX_MAP_BYTES as u32)
    }
}

impl NodeVisits {
    /// Count visits in `buckets` buckets
    #[must_use]
    pub fn new(buckets: u32) -> Self {
        Self {
            counts: HashMap::new(),
            buckets: buckets.max(1),
        }
    }

    /// Forget all counts.
    pub fn reset(&mut self) {
        self.counts.clear();
    }

    /// Count a visit, returns if this node should be memorized.
    pub fn visit(&mut self, addr: u64, taken: bool, ctx: u64) -> bool {
        let mut data = [0; 17];
        data[..8].copy_from_slice(&addr.to_le_bytes());
        data[8..16].copy_from_slice(&ctx.to_le_bytes());
        data[16] = u8::from(taken);
        let idx = xxh32(&data, 0) % self.buckets;

        let count = self.counts.entry(idx).or_insert(0);
        *count = count.wrapping_add(1);
        is_power_of_two_or_zero(u32::from(*count))
    }
}

#[cfg(test)]
mod tests {
    use crate::filters::path_prefix::{NodeVisits, PathPrefix, PrefixSet};

    #[test]
    fn test_prefix_set() {
        let mut set = PrefixSet::new(64);
        assert!(set.check(0x1234_5678_9abc));
        set.mark(0x1234_5678_9abc);
        assert!(!set.check(0x1234_5678_9abc));
        // digests are folded into the bitmap
        assert!(!set.check(0x1234_5678_9abc + 64 * 8));
        assert!(set.check(0x1234_5678_9abc + 1));
    }

    #[test]
    fn test_shared_prefix_is_explored() {
        let mut set = PrefixSet::new(1 << 16);

        // first trace takes the branch at 0x20
        let mut prefix = PathPrefix::new();
        prefix.seed(7);
        prefix.roll_in(0, 0x10, 1, &mut set);
        let untaken = prefix.roll_in(5, 0x20, 1, &mut set);
        assert!(set.check(untaken));

        // second trace of the same seed takes the other direction
        let mut prefix = PathPrefix::new();
        prefix.seed(7);
        prefix.roll_in(0, 0x10, 1, &mut set);
        let untaken_again = prefix.roll_in(5, 0x20, 0, &mut set);
        assert!(!set.check(untaken_again));
        assert_ne!(untaken, untaken_again);
        // which was exactly the continuation the first one left open
        assert!(!set.check(untaken));
    }

    #[test]
    fn test_seed_changes_digest() {
        let mut set = PrefixSet::new(1 << 16);
        let mut a = PathPrefix::new();
        let mut b = PathPrefix::new();
        a.seed(1);
        b.seed(2);
        assert!(b.is_seeded());
        assert_ne!(a.roll_in(3, 0x10, 1, &mut set), b.roll_in(3, 0x10, 1, &mut set));
        a.reset();
        assert!(!a.is_seeded());
        assert_eq!(a.digest(), PathPrefix::new().digest());
    }

    #[test]
    fn test_node_visits() {
        let mut visits = NodeVisits::new(1 << 20);
        let memorized: Vec<bool> = (0..9).map(|_| visits.visit(0x10, true, 3)).collect();
        assert_eq!(
            memorized,
            [true, true, false, true, false, false, false, true, false]
        );
        visits.reset();
        assert!(visits.visit(0x10, true, 3));
    }
}
