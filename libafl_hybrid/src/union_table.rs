//! The union table: a label indexed array of expression nodes produced by the taint engine.
//!
//! Every symbolic value of a trace is a [`Label`]. Non-zero labels point into the [`UnionTable`],
//! whose [`LabelInfo`] nodes form a DAG over input bytes. The table is snapshotted to disk after
//! each trace as a flat array of fixed size records, see [`LABEL_INFO_SIZE`].

use core::ops::Range;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::Error;

/// A label of a symbolic value. `0` is the concrete value.
pub type Label = u32;

/// The first label that references a node of the table. Anything below is concrete.
pub const CONST_OFFSET: Label = 1;

/// Label of values that are still being initialized by the taint engine. Never dereferenced.
pub const INITIALIZING_LABEL: Label = u32::MAX;

/// Expressions deeper than this are degenerate and will not be serialized.
pub const MAX_EXPR_DEPTH: u32 = 500;

/// Size of a single [`LabelInfo`] record in a snapshot (41 packed bytes, 8 byte aligned).
pub const LABEL_INFO_SIZE: usize = 48;

/// Operation of an expression node, using the LLVM instruction numbering of the taint engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Operation {
    /// An input byte, `op1` holds its offset
    Input = 0,
    /// Bitwise or logical not of `l2`
    Not = 1,
    /// Arithmetic negation of `l2`
    Neg = 2,
    Add = 13,
    Sub = 15,
    Mul = 17,
    UDiv = 19,
    SDiv = 20,
    URem = 22,
    SRem = 23,
    Shl = 25,
    LShr = 26,
    AShr = 27,
    And = 28,
    Or = 29,
    Xor = 30,
    /// `l2` consecutive input bytes starting at the input leaf `l1`
    Load = 32,
    Trunc = 38,
    ZExt = 39,
    SExt = 40,
    /// Integer comparison, the [`Predicate`] lives in the high byte of the op
    ICmp = 53,
    /// Bit extraction starting at bit `op2`
    Extract = 71,
    Concat = 72,
}

/// Predicates of [`Operation::ICmp`] nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Predicate {
    Eq = 32,
    Ne = 33,
    Ugt = 34,
    Uge = 35,
    Ult = 36,
    Ule = 37,
    Sgt = 38,
    Sge = 39,
    Slt = 40,
    Sle = 41,
}

/// A single expression node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LabelInfo {
    /// First child label
    pub l1: Label,
    /// Second child label
    pub l2: Label,
    /// First immediate operand, used if `l1` is concrete
    pub op1: u64,
    /// Second immediate operand, used if `l2` is concrete
    pub op2: u64,
    /// [`Operation`] in the low byte, [`Predicate`] in the high byte
    pub op: u16,
    /// Bit width of the result
    pub size: u16,
    /// Taint engine flags, opaque to us
    pub flags: u8,
    /// Number of leaves below this node, lazily computed
    pub tree_size: u32,
    /// Taint engine hash, opaque to us
    pub hash: u32,
    /// Depth of this node, lazily computed
    pub depth: u32,
}

fn le_bytes<const N: usize>(record: &[u8; LABEL_INFO_SIZE], at: usize) -> [u8; N] {
    let mut bytes = [0; N];
    bytes.copy_from_slice(&record[at..at + N]);
    bytes
}

impl LabelInfo {
    /// An input byte leaf
    #[must_use]
    pub fn input(offset: u64) -> Self {
        Self {
            op: u8::from(Operation::Input).into(),
            op1: offset,
            size: 8,
            ..Self::default()
        }
    }

    /// A node with the given children and immediates
    #[must_use]
    pub fn new(op: Operation, size: u16, l1: Label, l2: Label, op1: u64, op2: u64) -> Self {
        Self {
            l1,
            l2,
            op1,
            op2,
            op: u8::from(op).into(),
            size,
            ..Self::default()
        }
    }

    /// A comparison node, `size` is the width of the compared operands
    #[must_use]
    pub fn icmp(
        predicate: Predicate,
        size: u16,
        l1: Label,
        l2: Label,
        op1: u64,
        op2: u64,
    ) -> Self {
        let mut info = Self::new(Operation::ICmp, size, l1, l2, op1, op2);
        info.op |= u16::from(u8::from(predicate)) << 8;
        info
    }

    /// The operation of this node
    pub fn operation(&self) -> Result<Operation, Error> {
        Operation::try_from((self.op & 0xff) as u8)
            .map_err(|_| Error::solver(format!("unsupported operation {}", self.op & 0xff)))
    }

    /// The predicate of a comparison node
    pub fn predicate(&self) -> Result<Predicate, Error> {
        Predicate::try_from((self.op >> 8) as u8)
            .map_err(|_| Error::solver(format!("unsupported predicate {}", self.op >> 8)))
    }

    /// The input offset of an [`Operation::Input`] leaf
    pub fn input_offset(&self) -> Result<u32, Error> {
        u32::try_from(self.op1)
            .map_err(|_| Error::serialize(format!("input offset {:#x} out of range", self.op1)))
    }

    /// Encode this node as a snapshot record
    #[must_use]
    pub fn to_record(&self) -> [u8; LABEL_INFO_SIZE] {
        let mut record = [0; LABEL_INFO_SIZE];
        record[0..4].copy_from_slice(&self.l1.to_le_bytes());
        record[4..8].copy_from_slice(&self.l2.to_le_bytes());
        record[8..16].copy_from_slice(&self.op1.to_le_bytes());
        record[16..24].copy_from_slice(&self.op2.to_le_bytes());
        record[24..26].copy_from_slice(&self.op.to_le_bytes());
        record[26..28].copy_from_slice(&self.size.to_le_bytes());
        record[28] = self.flags;
        record[29..33].copy_from_slice(&self.tree_size.to_le_bytes());
        record[33..37].copy_from_slice(&self.hash.to_le_bytes());
        record[37..41].copy_from_slice(&self.depth.to_le_bytes());
        record
    }

    /// Decode a node from a snapshot record
    #[must_use]
    pub fn from_record(record: &[u8; LABEL_INFO_SIZE]) -> Self {
        Self {
            l1: u32::from_le_bytes(le_bytes(record, 0)),
            l2: u32::from_le_bytes(le_bytes(record, 4)),
            op1: u64::from_le_bytes(le_bytes(record, 8)),
            op2: u64::from_le_bytes(le_bytes(record, 16)),
            op: u16::from_le_bytes(le_bytes(record, 24)),
            size: u16::from_le_bytes(le_bytes(record, 26)),
            flags: record[28],
            tree_size: u32::from_le_bytes(le_bytes(record, 29)),
            hash: u32::from_le_bytes(le_bytes(record, 33)),
            depth: u32::from_le_bytes(le_bytes(record, 37)),
        }
    }
}

/// Returns `true` if this label can reference a node of the table
#[must_use]
pub fn is_symbolic(label: Label) -> bool {
    label >= CONST_OFFSET && label != INITIALIZING_LABEL
}

/// The expression table of one trace.
#[derive(Debug, Clone, Default)]
pub struct UnionTable {
    infos: Vec<LabelInfo>,
}

impl UnionTable {
    /// An empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from a snapshot
    pub fn from_records(bytes: &[u8]) -> Result<Self, Error> {
        let mut table = Self::new();
        table.load(bytes)?;
        Ok(table)
    }

    /// Number of slots, the largest label is `len() - 1`
    #[must_use]
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// `true` if no label was ever set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Look up the node of a symbolic label.
    pub fn resolve(&self, label: Label) -> Result<&LabelInfo, Error> {
        if !is_symbolic(label) {
            return Err(Error::invalid_label(label));
        }
        self.infos
            .get(label as usize)
            .ok_or_else(|| Error::invalid_label(label))
    }

    /// Look up the node of a symbolic label, mutably.
    pub fn resolve_mut(&mut self, label: Label) -> Result<&mut LabelInfo, Error> {
        if !is_symbolic(label) {
            return Err(Error::invalid_label(label));
        }
        self.infos
            .get_mut(label as usize)
            .ok_or_else(|| Error::invalid_label(label))
    }

    /// Store a node, growing the table as needed.
    pub fn set(&mut self, label: Label, info: LabelInfo) -> Result<(), Error> {
        if !is_symbolic(label) {
            return Err(Error::invalid_label(label));
        }
        let idx = label as usize;
        if idx >= self.infos.len() {
            self.infos.try_reserve(idx + 1 - self.infos.len())?;
            self.infos.resize(idx + 1, LabelInfo::default());
        }
        self.infos[idx] = info;
        Ok(())
    }

    /// Replace the contents with a snapshot, returning the largest label it contains.
    pub fn load(&mut self, bytes: &[u8]) -> Result<Label, Error> {
        if bytes.is_empty() || bytes.len() % LABEL_INFO_SIZE != 0 {
            return Err(Error::serialize(format!(
                "snapshot of {} bytes is not a multiple of the record size {LABEL_INFO_SIZE}",
                bytes.len()
            )));
        }
        let count = bytes.len() / LABEL_INFO_SIZE;
        self.infos.clear();
        self.infos.try_reserve(count)?;
        for chunk in bytes.chunks_exact(LABEL_INFO_SIZE) {
            let record: &[u8; LABEL_INFO_SIZE] = chunk
                .try_into()
                .map_err(|_| Error::serialize("truncated record"))?;
            self.infos.push(LabelInfo::from_record(record));
        }
        Ok(Label::try_from(count - 1)?)
    }

    /// Snapshot labels `0..=max_label`, stopping at the last stored label.
    ///
    /// Labels that were never set are zero records, so nothing past the end is written. An empty
    /// table still yields the record of label 0.
    pub fn dump(&self, max_label: Label) -> Result<Vec<u8>, Error> {
        let count = (max_label as usize)
            .saturating_add(1)
            .min(self.infos.len().max(1));
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(count * LABEL_INFO_SIZE)?;
        for idx in 0..count {
            let info = self.infos.get(idx).copied().unwrap_or_default();
            bytes.extend_from_slice(&info.to_record());
        }
        Ok(bytes)
    }

    /// The input offsets read by the [`Operation::Load`] node `info` of `label`.
    ///
    /// `l1` is the leaf of the first byte, `l2` the number of bytes, which must match `size`.
    pub fn load_range(&self, label: Label, info: &LabelInfo) -> Result<Range<u32>, Error> {
        let len = info.l2;
        if len == 0 || len.checked_mul(8) != Some(u32::from(info.size)) {
            return Err(Error::serialize(format!(
                "label {label} loads {len} bytes into {} bits",
                info.size
            )));
        }
        let start = self.resolve(info.l1)?.input_offset()?;
        let end = start
            .checked_add(len)
            .ok_or_else(|| Error::invalid_label(label))?;
        Ok(start..end)
    }

    /// Zero all nodes up to and including `up_to`.
    pub fn clear(&mut self, up_to: Label) {
        let end = (up_to as usize).saturating_add(1).min(self.infos.len());
        for info in &mut self.infos[..end] {
            *info = LabelInfo::default();
        }
    }
}
