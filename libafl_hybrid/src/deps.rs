//! Tracks which input bytes influence which branches, to build nested constraint sets.
//!
//! Every input offset touched by a branch gets a [`BranchDep`] record that remembers the offsets
//! transitively coupled with it and the `(label, direction)` decisions taken while it was part of
//! a branch condition. A later branch over the same bytes must respect those earlier decisions
//! to stay on the same path, so they are handed out as [`ExtraConstraints`].

use hashbrown::HashSet;

use crate::{
    union_table::{Label, Operation, UnionTable, CONST_OFFSET, MAX_EXPR_DEPTH},
    Error,
};

/// A set of input byte offsets
pub type DepSet = HashSet<u32>;

/// A branch decision: the label of the condition and the concrete direction
pub type LabelTuple = (Label, u32);

/// Initial number of offset slots, matches typical seed sizes.
pub const DEFAULT_DEP_SLOTS: usize = 100_000;

/// Collect the input byte offsets a label depends on.
pub fn input_deps(table: &UnionTable, label: Label) -> Result<DepSet, Error> {
    let mut deps = DepSet::new();
    collect_input_deps(table, label, &mut deps, 0)?;
    Ok(deps)
}

fn collect_input_deps(
    table: &UnionTable,
    label: Label,
    deps: &mut DepSet,
    level: u32,
) -> Result<(), Error> {
    let info = table.resolve(label)?;
    if info.depth > MAX_EXPR_DEPTH || level > MAX_EXPR_DEPTH {
        return Err(Error::expression_too_deep(label));
    }

    match info.operation()? {
        Operation::Input => {
            deps.insert(info.input_offset()?);
        }
        Operation::Load => {
            deps.extend(table.load_range(label, info)?);
        }
        Operation::ZExt | Operation::SExt | Operation::Trunc | Operation::Extract => {
            collect_input_deps(table, info.l1, deps, level + 1)?;
        }
        Operation::Not | Operation::Neg => {
            collect_input_deps(table, info.l2, deps, level + 1)?;
        }
        _ => {
            if info.l1 >= CONST_OFFSET {
                collect_input_deps(table, info.l1, deps, level + 1)?;
            }
            if info.l2 >= CONST_OFFSET {
                collect_input_deps(table, info.l2, deps, level + 1)?;
            }
        }
    }
    Ok(())
}

/// The dependency record of one input offset.
#[derive(Debug, Default, Clone)]
pub struct BranchDep {
    input_deps: DepSet,
    label_tuples: Vec<LabelTuple>,
    seen_tuples: HashSet<LabelTuple>,
}

impl BranchDep {
    /// Offsets coupled with this one
    #[must_use]
    pub fn input_deps(&self) -> &DepSet {
        &self.input_deps
    }

    /// Branch decisions recorded against this offset, in insertion order
    #[must_use]
    pub fn label_tuples(&self) -> &[LabelTuple] {
        &self.label_tuples
    }

    fn insert_tuple(&mut self, tuple: LabelTuple) {
        if self.seen_tuples.insert(tuple) {
            self.label_tuples.push(tuple);
        }
    }
}

/// Auxiliary `(label, direction)` constraints for a nested solve.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtraConstraints {
    tuples: Vec<LabelTuple>,
}

impl ExtraConstraints {
    /// No constraints
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a constraint
    pub fn push(&mut self, label: Label, direction: u32) {
        self.tuples.push((label, direction));
    }

    /// `true` if there are no constraints
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    /// Number of constraints
    #[must_use]
    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    /// Iterate the constraints
    pub fn iter(&self) -> impl Iterator<Item = &LabelTuple> {
        self.tuples.iter()
    }

    /// Encode as `label,direction.` tokens, the form used in decision records.
    #[must_use]
    pub fn encode(&self) -> String {
        self.tuples
            .iter()
            .map(|(label, dir)| format!("{label},{dir}."))
            .collect()
    }

    /// Encode as `label.direction#` tokens, the form the scheduler sends back in requests.
    #[must_use]
    pub fn encode_request(&self) -> String {
        self.tuples
            .iter()
            .map(|(label, dir)| format!("{label}.{dir}#"))
            .collect()
    }

    /// Parse the `label.direction#...` tokens of a solve request.
    ///
    /// Empty tokens and tokens without a `.` are skipped.
    pub fn parse_request(extra: &str) -> Result<Self, Error> {
        let mut res = Self::new();
        for token in extra.split('#').map(str::trim) {
            let Some((label, dir)) = token.split_once('.') else {
                continue;
            };
            res.push(label.parse()?, dir.parse()?);
        }
        Ok(res)
    }
}

impl FromIterator<LabelTuple> for ExtraConstraints {
    fn from_iter<T: IntoIterator<Item = LabelTuple>>(iter: T) -> Self {
        Self {
            tuples: iter.into_iter().collect(),
        }
    }
}

/// Per offset [`BranchDep`] records of a session.
#[derive(Debug, Default)]
pub struct BranchDeps {
    records: Vec<Option<BranchDep>>,
    pruned: u64,
}

impl BranchDeps {
    /// Empty tracker with [`DEFAULT_DEP_SLOTS`] preallocated slots
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_DEP_SLOTS)
    }

    /// Empty tracker with the given number of preallocated slots
    #[must_use]
    pub fn with_capacity(slots: usize) -> Self {
        Self {
            records: Vec::with_capacity(slots),
            pruned: 0,
        }
    }

    /// The record of an offset, if any branch touched it
    #[must_use]
    pub fn get(&self, offset: u32) -> Option<&BranchDep> {
        self.records.get(offset as usize).and_then(Option::as_ref)
    }

    /// Number of branches whose extra constraints were not memorized
    #[must_use]
    pub fn pruned(&self) -> u64 {
        self.pruned
    }

    /// Number of offsets with a record
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.iter().filter(|r| r.is_some()).count()
    }

    /// `true` if no offset has a record
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.iter().all(Option::is_none)
    }

    fn get_or_insert(&mut self, offset: u32) -> Result<&mut BranchDep, Error> {
        let idx = offset as usize;
        if idx >= self.records.len() {
            self.records.try_reserve(idx + 1 - self.records.len())?;
            self.records.resize_with(idx + 1, || None);
        }
        Ok(self.records[idx].get_or_insert_with(BranchDep::default))
    }

    /// Expand a dependency set to its transitive closure over the recorded offsets.
    #[must_use]
    pub fn closure(&self, mut deps: DepSet) -> DepSet {
        let mut worklist: Vec<u32> = deps.iter().copied().collect();
        while let Some(off) = worklist.pop() {
            if let Some(dep) = self.get(off) {
                for &i in &dep.input_deps {
                    if deps.insert(i) {
                        worklist.push(i);
                    }
                }
            }
        }
        deps
    }

    /// Compute the extra constraints of a branch and record it against its input bytes.
    ///
    /// The constraints are collected before the branch itself is recorded, so a branch never
    /// constrains itself. If `memorize` is unset nothing is collected, but the branch is still
    /// recorded.
    pub fn try_extra_constraints(
        &mut self,
        table: &UnionTable,
        label: Label,
        direction: u32,
        memorize: bool,
    ) -> Result<ExtraConstraints, Error> {
        let inputs = self.closure(input_deps(table, label)?);
        if inputs.is_empty() {
            return Ok(ExtraConstraints::new());
        }
        let mut offsets: Vec<u32> = inputs.iter().copied().collect();
        offsets.sort_unstable();

        let mut res = ExtraConstraints::new();
        if memorize {
            let mut added = HashSet::new();
            for off in &offsets {
                if let Some(dep) = self.get(*off) {
                    for tuple in &dep.label_tuples {
                        if added.insert(*tuple) {
                            res.tuples.push(*tuple);
                        }
                    }
                }
            }
        } else {
            self.pruned += 1;
        }

        for off in offsets {
            match self.get_or_insert(off) {
                Ok(dep) => {
                    dep.input_deps.extend(inputs.iter().copied());
                    dep.insert_tuple((label, direction));
                }
                Err(err) => log::warn!("Skipping dependency record of offset {off}: {err}"),
            }
        }
        Ok(res)
    }

    /// Like [`Self::try_extra_constraints`], but errors only yield empty constraints.
    pub fn extra_constraints(
        &mut self,
        table: &UnionTable,
        label: Label,
        direction: u32,
        memorize: bool,
    ) -> ExtraConstraints {
        self.try_extra_constraints(table, label, direction, memorize)
            .unwrap_or_else(|err| {
                if err.is_branch_local() {
                    log::debug!("No extra constraints for label {label}: {err}");
                } else {
                    log::warn!("No extra constraints for label {label}: {err}");
                }
                ExtraConstraints::new()
            })
    }

    /// Drop all records, keeping the allocation.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}
