//! Translation of union table labels into `z3` expressions.
//!
//! Input bytes become 8 bit constants named by their offset (`Symbol::Int(offset)`), so a model
//! maps straight back to input offsets. Results are memoized per label for the lifetime of the
//! [`Serializer`], which is a single session.

use core::fmt::{self, Debug, Formatter};

use hashbrown::HashMap;
use z3::{
    ast::{Ast, Bool, Dynamic, BV},
    Context, Symbol,
};

use crate::{
    deps::DepSet,
    union_table::{Label, LabelInfo, Operation, Predicate, UnionTable, CONST_OFFSET, MAX_EXPR_DEPTH},
    Error,
};

/// Memoizing translator from labels to `z3` expressions and their input dependencies.
pub struct Serializer<'ctx> {
    ctx: &'ctx Context,
    cache: HashMap<Label, (Dynamic<'ctx>, DepSet)>,
}

impl Debug for Serializer<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Serializer")
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl<'ctx> Serializer<'ctx> {
    /// A serializer with an empty cache
    #[must_use]
    pub fn new(ctx: &'ctx Context) -> Self {
        Self {
            ctx,
            cache: HashMap::new(),
        }
    }

    /// The `z3` context expressions are built in
    #[must_use]
    pub fn context(&self) -> &'ctx Context {
        self.ctx
    }

    /// Number of memoized labels
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Forget all memoized expressions.
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// The symbolic input byte at `offset`
    #[must_use]
    pub fn input_byte(&self, offset: u32) -> BV<'ctx> {
        BV::new_const(self.ctx, Symbol::Int(offset), 8)
    }

    /// Translate a label, also returning the input offsets it depends on.
    ///
    /// `tree_size` and `depth` of the visited nodes are filled in as a side effect.
    pub fn serialize(
        &mut self,
        table: &mut UnionTable,
        label: Label,
    ) -> Result<(Dynamic<'ctx>, DepSet), Error> {
        let mut deps = DepSet::new();
        let expr = self.translate(table, label, &mut deps, 0)?;
        Ok((expr, deps))
    }

    /// Like [`Self::serialize`], but coerce bitvectors to a condition with `!= 0`.
    pub fn serialize_condition(
        &mut self,
        table: &mut UnionTable,
        label: Label,
    ) -> Result<(Bool<'ctx>, DepSet), Error> {
        let (expr, deps) = self.serialize(table, label)?;
        Ok((self.to_condition(&expr)?, deps))
    }

    /// Coerce an expression to a boolean.
    pub fn to_condition(&self, expr: &Dynamic<'ctx>) -> Result<Bool<'ctx>, Error> {
        if let Some(cond) = expr.as_bool() {
            Ok(cond)
        } else if let Some(bv) = expr.as_bv() {
            Ok(bv._eq(&BV::from_u64(self.ctx, 0, bv.get_size())).not())
        } else {
            Err(Error::solver(format!("expected a condition, got {expr}")))
        }
    }

    fn to_bv(&self, expr: &Dynamic<'ctx>) -> Result<BV<'ctx>, Error> {
        if let Some(bv) = expr.as_bv() {
            Ok(bv)
        } else if let Some(cond) = expr.as_bool() {
            Ok(cond.ite(&BV::from_u64(self.ctx, 1, 1), &BV::from_u64(self.ctx, 0, 1)))
        } else {
            Err(Error::solver(format!("expected a bitvector, got {expr}")))
        }
    }

    fn constant(&self, value: u64, size: u16, width: u16) -> Result<Dynamic<'ctx>, Error> {
        if size == 1 {
            Ok(Bool::from_bool(self.ctx, value == 1).into())
        } else if width == 0 {
            Err(Error::solver("zero width constant"))
        } else {
            Ok(BV::from_u64(self.ctx, value, u32::from(width)).into())
        }
    }

    fn translate(
        &mut self,
        table: &mut UnionTable,
        label: Label,
        deps: &mut DepSet,
        level: u32,
    ) -> Result<Dynamic<'ctx>, Error> {
        let info = *table.resolve(label)?;
        if info.depth > MAX_EXPR_DEPTH || level > MAX_EXPR_DEPTH {
            return Err(Error::expression_too_deep(label));
        }
        if let Some((expr, cached)) = self.cache.get(&label) {
            deps.extend(cached.iter().copied());
            return Ok(expr.clone());
        }

        let op = info.operation()?;
        if op == Operation::Input {
            // leaves are cheap, not worth a cache slot
            let offset = info.input_offset()?;
            deps.insert(offset);
            update_shape(table, label, 1, 1)?;
            return Ok(self.input_byte(offset).into());
        }

        let mut local = DepSet::new();
        let (expr, tree_size, depth): (Dynamic<'ctx>, u32, u32) = match op {
            Operation::Load => {
                let offsets = table.load_range(label, &info)?;
                let out = offsets
                    .clone()
                    .skip(1)
                    .fold(self.input_byte(offsets.start), |low, offset| {
                        self.input_byte(offset).concat(&low)
                    });
                local.extend(offsets);
                (out.into(), 1, 1)
            }
            Operation::ZExt | Operation::SExt => {
                let base = self.translate(table, info.l1, &mut local, level + 1)?;
                let base = self.to_bv(&base)?;
                let grow = u32::from(info.size)
                    .checked_sub(base.get_size())
                    .ok_or_else(|| Error::solver(format!("label {label} extends to a smaller width")))?;
                let expr = if op == Operation::ZExt {
                    base.zero_ext(grow)
                } else {
                    base.sign_ext(grow)
                };
                let (tree_size, depth) = shape_of(table, info.l1)?;
                (expr.into(), tree_size, depth + 1)
            }
            Operation::Trunc | Operation::Extract => {
                let base = self.translate(table, info.l1, &mut local, level + 1)?;
                let base = self.to_bv(&base)?;
                let low = if op == Operation::Trunc {
                    0
                } else {
                    u32::try_from(info.op2)?
                };
                let high = low
                    .checked_add(u32::from(info.size))
                    .and_then(|end| end.checked_sub(1))
                    .filter(|high| *high < base.get_size())
                    .ok_or_else(|| Error::solver(format!("label {label} extracts out of bounds")))?;
                let (tree_size, depth) = shape_of(table, info.l1)?;
                (base.extract(high, low).into(), tree_size, depth + 1)
            }
            Operation::Not => {
                let base = self.translate(table, info.l2, &mut local, level + 1)?;
                let expr: Dynamic<'ctx> = match base.as_bool() {
                    Some(cond) => cond.not().into(),
                    None => self.to_bv(&base)?.bvnot().into(),
                };
                let (tree_size, depth) = shape_of(table, info.l2)?;
                (expr, tree_size, depth + 1)
            }
            Operation::Neg => {
                let base = self.translate(table, info.l2, &mut local, level + 1)?;
                let (tree_size, depth) = shape_of(table, info.l2)?;
                (self.to_bv(&base)?.bvneg().into(), tree_size, depth + 1)
            }
            _ => {
                let mut width = info.size;
                if op == Operation::Concat && info.l1 == 0 {
                    width = concat_width(table, &info, info.l2)?;
                }
                let lhs = if info.l1 >= CONST_OFFSET {
                    self.translate(table, info.l1, &mut local, level + 1)?
                } else {
                    self.constant(info.op1, info.size, width)?
                };
                if op == Operation::Concat && info.l2 == 0 {
                    width = concat_width(table, &info, info.l1)?;
                }
                let rhs = if info.l2 >= CONST_OFFSET {
                    self.translate(table, info.l2, &mut local, level + 1)?
                } else {
                    self.constant(info.op2, info.size, width)?
                };
                let (size1, depth1) = shape_of(table, info.l1)?;
                let (size2, depth2) = shape_of(table, info.l2)?;
                (
                    self.binary(label, op, &info, &lhs, &rhs)?,
                    size1.saturating_add(size2),
                    depth1.max(depth2) + 1,
                )
            }
        };

        update_shape(table, label, tree_size, depth)?;
        deps.extend(local.iter().copied());
        self.cache.insert(label, (expr.clone(), local));
        Ok(expr)
    }

    fn binary(
        &self,
        label: Label,
        op: Operation,
        info: &LabelInfo,
        lhs: &Dynamic<'ctx>,
        rhs: &Dynamic<'ctx>,
    ) -> Result<Dynamic<'ctx>, Error> {
        // width 1 operands are conditions, not single bit vectors
        if let (Some(a), Some(b)) = (lhs.as_bool(), rhs.as_bool()) {
            let logical = match op {
                Operation::And => Some(Bool::and(self.ctx, &[&a, &b])),
                Operation::Or => Some(Bool::or(self.ctx, &[&a, &b])),
                Operation::Xor => Some(a.xor(&b)),
                Operation::ICmp => match info.predicate()? {
                    Predicate::Eq => Some(a._eq(&b)),
                    Predicate::Ne => Some(a._eq(&b).not()),
                    _ => None,
                },
                _ => None,
            };
            if let Some(logical) = logical {
                return Ok(logical.into());
            }
        }

        let a = self.to_bv(lhs)?;
        let b = self.to_bv(rhs)?;
        if op != Operation::Concat && a.get_size() != b.get_size() {
            return Err(Error::solver(format!(
                "label {label}: operand widths {} and {} differ",
                a.get_size(),
                b.get_size()
            )));
        }
        Ok(match op {
            Operation::And => a.bvand(&b).into(),
            Operation::Or => a.bvor(&b).into(),
            Operation::Xor => a.bvxor(&b).into(),
            Operation::Shl => a.bvshl(&b).into(),
            Operation::LShr => a.bvlshr(&b).into(),
            Operation::AShr => a.bvashr(&b).into(),
            Operation::Add => a.bvadd(&b).into(),
            Operation::Sub => a.bvsub(&b).into(),
            Operation::Mul => a.bvmul(&b).into(),
            Operation::UDiv => a.bvudiv(&b).into(),
            Operation::SDiv => a.bvsdiv(&b).into(),
            Operation::URem => a.bvurem(&b).into(),
            Operation::SRem => a.bvsrem(&b).into(),
            Operation::ICmp => match info.predicate()? {
                Predicate::Eq => a._eq(&b),
                Predicate::Ne => a._eq(&b).not(),
                Predicate::Ugt => a.bvugt(&b),
                Predicate::Uge => a.bvuge(&b),
                Predicate::Ult => a.bvult(&b),
                Predicate::Ule => a.bvule(&b),
                Predicate::Sgt => a.bvsgt(&b),
                Predicate::Sge => a.bvsge(&b),
                Predicate::Slt => a.bvslt(&b),
                Predicate::Sle => a.bvsle(&b),
            }
            .into(),
            // little endian: the second operand holds the high bits
            Operation::Concat => b.concat(&a).into(),
            _ => {
                return Err(Error::solver(format!(
                    "label {label}: unsupported binary operation {op:?}"
                )))
            }
        })
    }
}

/// Width of the constant side of a concat, given the symbolic side.
fn concat_width(table: &UnionTable, info: &LabelInfo, symbolic: Label) -> Result<u16, Error> {
    let other = table.resolve(symbolic)?.size;
    info.size
        .checked_sub(other)
        .ok_or_else(|| Error::solver("concat narrower than its operand"))
}

fn shape_of(table: &UnionTable, label: Label) -> Result<(u32, u32), Error> {
    if label < CONST_OFFSET {
        return Ok((0, 0));
    }
    let info = table.resolve(label)?;
    Ok((info.tree_size, info.depth))
}

fn update_shape(
    table: &mut UnionTable,
    label: Label,
    tree_size: u32,
    depth: u32,
) -> Result<(), Error> {
    let info = table.resolve_mut(label)?;
    info.tree_size = tree_size;
    if info.depth == 0 {
        info.depth = depth;
    }
    Ok(())
}
