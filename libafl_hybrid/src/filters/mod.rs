//! Filters deciding which symbolic branches are worth solving.
//!
//! The [`BranchFilter`] holds everything that lives as long as the process, the
//! [`TraceFilterState`] everything that is reset with every trace.

pub mod coverage;
pub use coverage::CoverageFilter;

pub mod memcmp;
pub use memcmp::MemcmpDedup;

pub mod path_prefix;
pub use path_prefix::{NodeVisits, PathPrefix, PrefixSet};

use xxhash_rust::xxh32::xxh32;

use crate::{config::FilterMode, union_table::Label};

#[inline]
pub(crate) fn is_power_of_two_or_zero(x: u32) -> bool {
    x & x.wrapping_sub(1) == 0
}

/// Hash of the calling context of a branch, as reported in decision records.
///
/// Only the low 32 bits of the context take part.
#[must_use]
pub fn call_context_hash(ctx: u64) -> u32 {
    xxh32(&(ctx as u32).to_le_bytes(), 0)
}

/// What to do with a single branch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BranchVerdict {
    /// Solve the negated branch
    pub try_solve: bool,
    /// Let the scheduler prefer this branch
    pub promote: bool,
    /// Collect the extra constraints of earlier branches on the same bytes
    pub memorize: bool,
    /// Digest of the untaken continuation, `0` if nothing is to be solved
    pub prefix_hash: u64,
}

/// Filter state of the current trace.
#[derive(Debug, Clone)]
pub struct TraceFilterState {
    prefix: PathPrefix,
    visits: NodeVisits,
}

impl Default for TraceFilterState {
    fn default() -> Self {
        Self {
            prefix: PathPrefix::new(),
            visits: NodeVisits::default(),
        }
    }
}

impl TraceFilterState {
    /// Fresh state, counting node visits in `buckets` buckets
    #[must_use]
    pub fn new(buckets: u32) -> Self {
        Self {
            prefix: PathPrefix::new(),
            visits: NodeVisits::new(buckets),
        }
    }

    /// Back to the start of a trace.
    pub fn reset(&mut self) {
        self.prefix.reset();
        self.visits.reset();
    }

    /// Roll the trace id into the path prefix, once per trace.
    pub fn seed(&mut self, tid: u32) {
        if !self.prefix.is_seeded() {
            self.prefix.seed(tid);
        }
    }

    /// The path prefix so far
    #[must_use]
    pub fn prefix(&self) -> &PathPrefix {
        &self.prefix
    }
}

/// The process wide filters.
#[derive(Debug, Clone)]
pub struct BranchFilter {
    mode: FilterMode,
    coverage: CoverageFilter,
    explored: PrefixSet,
    memcmp: MemcmpDedup,
}

impl BranchFilter {
    /// Filters for `mode`, with a persistent prefix bitmap of `prefix_map_bytes` bytes
    #[must_use]
    pub fn new(mode: FilterMode, prefix_map_bytes: usize) -> Self {
        Self {
            mode,
            coverage: CoverageFilter::new(),
            explored: PrefixSet::new(prefix_map_bytes),
            memcmp: MemcmpDedup::new(),
        }
    }

    /// The active filter mode
    #[must_use]
    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    /// The explored path prefixes
    #[must_use]
    pub fn explored(&self) -> &PrefixSet {
        &self.explored
    }

    /// The explored path prefixes, mutable
    pub fn explored_mut(&mut self) -> &mut PrefixSet {
        &mut self.explored
    }

    /// `true` the first time a memory compare site shows up
    pub fn is_novel_memcmp(&mut self, addr: u64, ctx: u64, offset: u64, order: u32) -> bool {
        self.memcmp.is_novel(addr, ctx, offset, order)
    }

    /// Reset the per trace parts of the coverage maps.
    pub fn reset_trace(&mut self) {
        self.coverage.reset_trace();
    }

    /// Run the filters of the current mode over one conditional branch.
    pub fn evaluate(
        &mut self,
        trace: &mut TraceFilterState,
        label: Label,
        addr: u64,
        taken: bool,
        ctx: u64,
    ) -> BranchVerdict {
        let mut verdict = BranchVerdict::default();
        match self.mode {
            FilterMode::Coverage => {
                if label != 0 {
                    verdict.try_solve = self.coverage.is_interesting(addr, taken, ctx);
                    verdict.promote = verdict.try_solve;
                }
            }
            FilterMode::PathPrefix => {
                let untaken =
                    trace
                        .prefix
                        .roll_in(label, addr, u64::from(taken), &mut self.explored);
                if label != 0 && self.explored.check(untaken) {
                    verdict.try_solve = true;
                    verdict.prefix_hash = untaken;
                }
                verdict.promote = self.coverage.is_interesting(addr, taken, ctx);
                verdict.memorize = trace.visits.visit(addr, taken, ctx);
            }
        }
        log::trace!("Branch {label} at {addr:#x} (taken: {taken}): {verdict:?}");
        verdict
    }
}
