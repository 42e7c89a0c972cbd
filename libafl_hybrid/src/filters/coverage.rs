//! qsym style coverage filters: basic block pruning, edge novelty and call context novelty.

use hashbrown::HashSet;
use xxhash_rust::xxh32::xxh32;

use crate::filters::is_power_of_two_or_zero;

/// Number of slots of the edge and pruning maps
pub const MAP_SIZE: usize = 1 << 16;

/// Visits of a branch site that map to the same pruning bucket
pub const BB_STRIDE: u16 = 8;

/// Strided exponential backoff over `(address, context)` sites.
///
/// Visits `0..8` of a site are interesting, `8..16` too, then `16..24`, then `32..40` and so on.
#[derive(Debug, Clone)]
pub struct BbPruning {
    bitmap: Vec<u16>,
}

impl Default for BbPruning {
    fn default() -> Self {
        Self::new()
    }
}

impl BbPruning {
    /// All sites unvisited
    #[must_use]
    pub fn new() -> Self {
        Self {
            bitmap: vec![0; MAP_SIZE],
        }
    }

    /// Count a visit, returns if the site is still interesting.
    pub fn visit(&mut self, addr: u64, ctx: u64) -> bool {
        let mut data = [0; 16];
        data[..8].copy_from_slice(&addr.to_le_bytes());
        data[8..].copy_from_slice(&ctx.to_le_bytes());
        let idx = xxh32(&data, 0) as usize % MAP_SIZE;

        let interesting = is_power_of_two_or_zero(u32::from(self.bitmap[idx] / BB_STRIDE));
        self.bitmap[idx] = self.bitmap[idx].wrapping_add(1);
        interesting
    }
}

fn hash_pc(addr: u64, taken: bool) -> u32 {
    let mut data = [0; 9];
    data[..8].copy_from_slice(&addr.to_le_bytes());
    data[8] = u8::from(taken);
    xxh32(&data, 0) % MAP_SIZE as u32
}

/// AFL style edge coverage plus call context co-occurrence.
///
/// `virgin` and the previous location are per trace, everything else is kept for the lifetime of
/// the process.
#[derive(Debug, Clone)]
pub struct EdgeCoverage {
    virgin: Vec<u8>,
    trace: Vec<u8>,
    context: Vec<u8>,
    seen_contexts: HashSet<u32>,
    prev_loc: u32,
}

impl Default for EdgeCoverage {
    fn default() -> Self {
        Self::new()
    }
}

impl EdgeCoverage {
    /// Empty maps
    #[must_use]
    pub fn new() -> Self {
        Self {
            virgin: vec![0; MAP_SIZE],
            trace: vec![0; MAP_SIZE],
            context: vec![0; MAP_SIZE],
            seen_contexts: HashSet::new(),
            prev_loc: 0,
        }
    }

    /// Forget the hit counts of the current trace.
    pub fn reset_trace(&mut self) {
        self.virgin.fill(0);
        self.prev_loc = 0;
    }

    fn index(&self, h: u32) -> usize {
        ((self.prev_loc >> 1) ^ h) as usize % MAP_SIZE
    }

    /// `true` the first time `h` follows any previously seen context.
    fn is_new_context(&mut self, h: u32, bits: u8) -> bool {
        if !is_power_of_two_or_zero(u32::from(bits)) {
            return false;
        }
        let mut interesting = false;
        for prev in &self.seen_contexts {
            let mut data = [0; 8];
            data[..4].copy_from_slice(&prev.to_le_bytes());
            data[4..].copy_from_slice(&h.to_le_bytes());
            let bit = xxh32(&data, 0) as usize % (MAP_SIZE * 8);
            let (idx, mask) = (bit / 8, 1 << (bit % 8));
            if self.context[idx] & mask == 0 {
                self.context[idx] |= mask;
                interesting = true;
            }
        }
        if bits == 0 {
            self.seen_contexts.insert(h);
        }
        interesting
    }

    /// Record the edge to this branch direction, returns if it brought new coverage.
    pub fn visit(&mut self, addr: u64, taken: bool) -> bool {
        let h = hash_pc(addr, taken);
        let idx = self.index(h);
        let new_context = self.is_new_context(h, self.virgin[idx]);

        self.virgin[idx] = self.virgin[idx].wrapping_add(1);
        let interesting = if (self.virgin[idx] | self.trace[idx]) == self.trace[idx] {
            new_context
        } else {
            self.trace[idx] |= self.virgin[idx];
            // the other direction exists structurally, no need to chase it
            let inv = self.index(hash_pc(addr, !taken));
            let hits = self.virgin[inv].wrapping_add(1);
            self.trace[inv] |= hits;
            true
        };
        self.prev_loc = h;
        interesting
    }
}

/// Basic block pruning followed by edge and context novelty.
#[derive(Debug, Clone, Default)]
pub struct CoverageFilter {
    pruning: BbPruning,
    edges: EdgeCoverage,
}

impl CoverageFilter {
    /// Fresh filter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the per trace state.
    pub fn reset_trace(&mut self) {
        self.edges.reset_trace();
    }

    /// Decide if a branch is worth solving. Pruned branches are treated as concrete.
    pub fn is_interesting(&mut self, addr: u64, taken: bool, ctx: u64) -> bool {
        if !self.pruning.visit(addr, ctx) {
            log::trace!("Branch at {addr:#x} pruned by the visit bitmap");
            return false;
        }
        self.edges.visit(addr, taken)
    }
}
