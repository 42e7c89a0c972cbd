//! The nested solver.
//!
//! A branch is first flipped on its own (the optimistic query). If that is satisfiable, the
//! recorded decisions of earlier branches on the same input bytes are added on top (the nested
//! query). A nested model keeps the path up to the branch intact, an optimistic model is still
//! better than nothing.

use std::{
    panic::{self, AssertUnwindSafe},
    time::Duration,
};

use hashbrown::HashMap;
use z3::{
    ast::{Ast, Bool},
    Config, Context, Model, SatResult, Solver,
};

use crate::{
    deps::{DepSet, ExtraConstraints},
    filters::PrefixSet,
    serializer::Serializer,
    solution::Solution,
    union_table::{Label, UnionTable},
    Error,
};

/// A `z3` config with the given per query timeout
#[must_use]
pub fn z3_config(timeout: Duration) -> Config {
    let mut cfg = Config::new();
    cfg.set_timeout_msec(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
    cfg
}

/// A branch to flip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipTarget {
    /// Label of the branch condition
    pub label: Label,
    /// Direction the trace took
    pub direction: u32,
    /// Trace the branch belongs to
    pub tid: u32,
    /// Digest of the untaken path prefix, marked once its outcome is known
    pub prefix_hash: u64,
}

/// Result of a nested solve
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolveOutcome {
    /// The branch cannot be flipped
    Unsat,
    /// The branch flips with all extra constraints kept
    Nested(Solution),
    /// The branch only flips on its own
    Optimistic(Solution),
}

impl SolveOutcome {
    /// The solution, if any
    #[must_use]
    pub fn solution(&self) -> Option<&Solution> {
        match self {
            Self::Unsat => None,
            Self::Nested(solution) | Self::Optimistic(solution) => Some(solution),
        }
    }
}

/// Solver for negated branches under extra constraints.
pub struct NestedSolver<'ctx> {
    ctx: &'ctx Context,
    solver: Solver<'ctx>,
}

impl std::fmt::Debug for NestedSolver<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NestedSolver").finish_non_exhaustive()
    }
}

impl<'ctx> NestedSolver<'ctx> {
    /// A bitvector solver in `ctx`
    #[must_use]
    pub fn new(ctx: &'ctx Context) -> Self {
        let solver = Solver::new_for_logic(ctx, "QF_BV").unwrap_or_else(|| Solver::new(ctx));
        Self { ctx, solver }
    }

    /// Flip `target`, keeping `extra` if possible.
    ///
    /// Unsatisfiable and nested satisfiable outcomes mark the prefix of `target` as explored.
    /// Errors, including panics of the bindings, mean the branch is unsolvable.
    pub fn solve(
        &mut self,
        serializer: &mut Serializer<'ctx>,
        table: &mut UnionTable,
        target: &FlipTarget,
        extra: &ExtraConstraints,
        explored: &mut PrefixSet,
    ) -> Result<SolveOutcome, Error> {
        let res = panic::catch_unwind(AssertUnwindSafe(|| {
            self.try_solve(serializer, table, target, extra)
        }))
        .unwrap_or_else(|_| Err(Error::solver("z3 panicked")));

        match &res {
            Ok(SolveOutcome::Unsat | SolveOutcome::Nested(_)) => explored.mark(target.prefix_hash),
            Ok(SolveOutcome::Optimistic(_)) => {}
            Err(err) => log::warn!("Could not solve label {}: {err}", target.label),
        }
        res
    }

    fn try_solve(
        &mut self,
        serializer: &mut Serializer<'ctx>,
        table: &mut UnionTable,
        target: &FlipTarget,
        extra: &ExtraConstraints,
    ) -> Result<SolveOutcome, Error> {
        let (cond, mut deps) = serializer.serialize_condition(table, target.label)?;
        let taken = Bool::from_bool(self.ctx, target.direction != 0);

        self.solver.reset();
        self.solver.assert(&cond._eq(&taken).not());
        match self.solver.check() {
            SatResult::Sat => {}
            SatResult::Unsat => {
                log::debug!("Label {} cannot be flipped", target.label);
                return Ok(SolveOutcome::Unsat);
            }
            SatResult::Unknown => {
                return Err(Error::solver(format!(
                    "optimistic query for label {} timed out",
                    target.label
                )))
            }
        }
        let optimistic = self
            .solver
            .get_model()
            .ok_or_else(|| Error::solver("sat without a model"))?;
        let optimistic = self.extract(serializer, &optimistic, &deps, target);

        if extra.is_empty() {
            return Ok(SolveOutcome::Nested(optimistic));
        }

        self.solver.push();
        for (label, direction) in extra.iter() {
            let (cond, extra_deps) = serializer.serialize_condition(table, *label)?;
            self.solver
                .assert(&cond._eq(&Bool::from_bool(self.ctx, *direction != 0)));
            deps.extend(extra_deps);
        }

        if self.solver.check() == SatResult::Sat {
            let model = self
                .solver
                .get_model()
                .ok_or_else(|| Error::solver("sat without a model"))?;
            log::debug!(
                "Label {} flipped under {} extra constraints",
                target.label,
                extra.len()
            );
            Ok(SolveOutcome::Nested(self.extract(serializer, &model, &deps, target)))
        } else {
            self.solver.pop(1);
            log::debug!("Nested query for label {} failed, going optimistic", target.label);
            Ok(SolveOutcome::Optimistic(optimistic))
        }
    }

    fn extract(
        &self,
        serializer: &Serializer<'ctx>,
        model: &Model<'ctx>,
        deps: &DepSet,
        target: &FlipTarget,
    ) -> Solution {
        let mut bytes = HashMap::with_capacity(deps.len());
        for offset in deps {
            // offsets the model does not care about stay as they are
            if let Some(value) = model
                .eval(&serializer.input_byte(*offset), false)
                .and_then(|value| value.as_u64())
            {
                bytes.insert(*offset, value as u8);
            }
        }
        Solution {
            bytes,
            tid: target.tid,
            ..Solution::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use z3::Context;

    use crate::{
        deps::ExtraConstraints,
        filters::PrefixSet,
        serializer::Serializer,
        solver::{z3_config, FlipTarget, NestedSolver, SolveOutcome},
        union_table::{LabelInfo, Operation, Predicate, UnionTable},
        Error,
    };

    /// 1, 2: in0, in1; 3: in0 == 'A'; 4: in0 + in1; 5: (in0 + in1) == 0x80;
    /// 6: in1 == 0x10; 7: in0 != in0
    fn table() -> UnionTable {
        let mut table = UnionTable::new();
        table.set(1, LabelInfo::input(0)).unwrap();
        table.set(2, LabelInfo::input(1)).unwrap();
        table
            .set(3, LabelInfo::icmp(Predicate::Eq, 8, 1, 0, 0, 0x41))
            .unwrap();
        table
            .set(4, LabelInfo::new(Operation::Add, 8, 1, 2, 0, 0))
            .unwrap();
        table
            .set(5, LabelInfo::icmp(Predicate::Eq, 8, 4, 0, 0, 0x80))
            .unwrap();
        table
            .set(6, LabelInfo::icmp(Predicate::Eq, 8, 2, 0, 0, 0x10))
            .unwrap();
        table
            .set(7, LabelInfo::icmp(Predicate::Ne, 8, 1, 1, 0, 0))
            .unwrap();
        table
    }

    fn target(label: u32, direction: u32, prefix_hash: u64) -> FlipTarget {
        FlipTarget {
            label,
            direction,
            tid: 1,
            prefix_hash,
        }
    }

    #[test]
    fn test_nested_sat() {
        let ctx = Context::new(&z3_config(Duration::from_secs(5)));
        let mut table = table();
        let mut serializer = Serializer::new(&ctx);
        let mut solver = NestedSolver::new(&ctx);
        let mut explored = PrefixSet::new(1 << 10);

        // flip (in0 + in1) == 0x80 to true, while in0 stays 'A'
        let extra = ExtraConstraints::from_iter([(3, 1)]);
        let outcome = solver
            .solve(&mut serializer, &mut table, &target(5, 0, 77), &extra, &mut explored)
            .unwrap();
        let SolveOutcome::Nested(solution) = outcome else {
            panic!("expected a nested solution, got {outcome:?}");
        };
        assert_eq!(solution.bytes[&0], 0x41);
        assert_eq!(solution.bytes[&1], 0x3f);
        assert_eq!(solution.tid, 1);
        assert!(!explored.check(77));
    }

    #[test]
    fn test_optimistic_fallback() {
        let ctx = Context::new(&z3_config(Duration::from_secs(5)));
        let mut table = table();
        let mut serializer = Serializer::new(&ctx);
        let mut solver = NestedSolver::new(&ctx);
        let mut explored = PrefixSet::new(1 << 10);

        // in1 == 0x10 and in0 == 'A' cannot make the sum 0x80
        let extra = ExtraConstraints::from_iter([(3, 1), (6, 1)]);
        let outcome = solver
            .solve(&mut serializer, &mut table, &target(5, 0, 78), &extra, &mut explored)
            .unwrap();
        let SolveOutcome::Optimistic(solution) = outcome else {
            panic!("expected an optimistic solution, got {outcome:?}");
        };
        let sum = solution.bytes[&0].wrapping_add(solution.bytes[&1]);
        assert_eq!(sum, 0x80);
        // the optimistic model is the model of the flipped branch alone
        assert_eq!(solution.bytes.len(), 2);
        assert!(explored.check(78));
    }

    #[test]
    fn test_unsat_marks_prefix() {
        let ctx = Context::new(&z3_config(Duration::from_secs(5)));
        let mut table = table();
        let mut serializer = Serializer::new(&ctx);
        let mut solver = NestedSolver::new(&ctx);
        let mut explored = PrefixSet::new(1 << 10);

        let outcome = solver
            .solve(
                &mut serializer,
                &mut table,
                &target(7, 0, 79),
                &ExtraConstraints::new(),
                &mut explored,
            )
            .unwrap();
        assert_eq!(outcome, SolveOutcome::Unsat);
        assert!(outcome.solution().is_none());
        assert!(!explored.check(79));
    }

    #[test]
    fn test_errors_are_unsolvable() {
        let ctx = Context::new(&z3_config(Duration::from_secs(5)));
        let mut table = table();
        let mut serializer = Serializer::new(&ctx);
        let mut solver = NestedSolver::new(&ctx);
        let mut explored = PrefixSet::new(1 << 10);

        let res = solver.solve(
            &mut serializer,
            &mut table,
            &target(42, 0, 80),
            &ExtraConstraints::new(),
            &mut explored,
        );
        assert!(matches!(res, Err(Error::InvalidLabel(42, _))));
        assert!(explored.check(80));

        // a broken extra constraint breaks the whole request
        let res = solver.solve(
            &mut serializer,
            &mut table,
            &target(3, 0, 81),
            &ExtraConstraints::from_iter([(0, 1)]),
            &mut explored,
        );
        assert!(matches!(res, Err(Error::InvalidLabel(0, _))));
    }
}
