//! The line protocols spoken with the instrumentation and with the scheduler.
//!
//! * [`BranchEvent`]s come in from the traced execution, one per line.
//! * [`DecisionRecord`]s and [`ControlToken`]s go out to the scheduler.
//! * [`SolveRequest`]s come back from the scheduler.

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{deps::ExtraConstraints, union_table::Label, Error};

/// Trace id the instrumentation sends before it knows the input
pub const UNKNOWN_TID: u32 = u32::MAX;

/// Kind of a [`BranchEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum EventKind {
    /// A conditional branch
    Conditional = 0,
    /// A symbolic pointer offset
    Gep = 1,
    /// A memory compare against concrete bytes, followed by a payload line
    Memcmp = 2,
}

fn trim_line(line: &str) -> &str {
    line.trim_end_matches(|c: char| c == ',' || c.is_ascii_whitespace())
}

fn field<T>(fields: &[&str], idx: usize, name: &str) -> Result<T, Error>
where
    T: FromStr,
{
    let raw = fields
        .get(idx)
        .ok_or_else(|| Error::serialize(format!("Missing field {name} (#{idx})")))?;
    raw.trim()
        .parse()
        .map_err(|_| Error::serialize(format!("Bad value for {name}: {raw:?}")))
}

/// A single event of a traced execution:
/// `qid,label,direction,addr,ctx,order,cons_type,tid,max_label`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchEvent {
    /// Queue the input was taken from
    pub qid: u32,
    /// Label of the branch condition, `0` for concrete ones.
    /// For memory compares, the number of payload bytes.
    pub label: Label,
    /// Taken direction. For memory compares, the input offset of the compared bytes.
    pub direction: u32,
    /// Branch address
    pub addr: u64,
    /// Calling context
    pub ctx: u64,
    /// Number of previous visits of this site in the trace
    pub order: u32,
    /// Raw event kind, see [`EventKind`]
    pub cons_type: u32,
    /// Id of the traced input, or [`UNKNOWN_TID`]
    pub tid: u32,
    /// Largest label of the union table, `0` if not reported
    pub max_label: Label,
}

impl BranchEvent {
    /// The kind of this event, `None` for kinds this engine does not know
    #[must_use]
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::try_from(self.cons_type).ok()
    }

    /// `true` if this branch depends on the input
    #[must_use]
    pub fn is_symbolic(&self) -> bool {
        self.label != 0
    }
}

impl FromStr for BranchEvent {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = trim_line(line).split(',').collect();
        Ok(Self {
            qid: field(&fields, 0, "qid")?,
            label: field(&fields, 1, "label")?,
            direction: field(&fields, 2, "direction")?,
            addr: field(&fields, 3, "addr")?,
            ctx: field(&fields, 4, "ctx")?,
            order: field(&fields, 5, "order")?,
            cons_type: field(&fields, 6, "cons_type")?,
            tid: field(&fields, 7, "tid")?,
            max_label: if fields.len() > 8 {
                field(&fields, 8, "max_label")?
            } else {
                0
            },
        })
    }
}

/// Parse the payload line following a memory compare event, `size` comma separated bytes.
pub fn parse_memcmp_payload(line: &str, size: u32) -> Result<Vec<u8>, Error> {
    let bytes = trim_line(line)
        .split(',')
        .map(|token| {
            token
                .trim()
                .parse::<u8>()
                .map_err(|_| Error::serialize(format!("Bad memcmp byte {token:?}")))
        })
        .collect::<Result<Vec<u8>, Error>>()?;
    let size = usize::try_from(size)?;
    if bytes.len() < size {
        return Err(Error::serialize(format!(
            "Memcmp payload has {} bytes, expected {size}",
            bytes.len()
        )));
    }
    Ok(bytes[..size].to_vec())
}

/// What the scheduler learns about a branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionPayload {
    /// Only the visit counts
    None,
    /// A branch the scheduler may ask to be solved
    Solve {
        /// Prefer this branch
        promote: bool,
        /// Queue of the traced input
        qid: u32,
        /// Digest of the untaken path prefix, `0` if unknown
        prefix_hash: u64,
        /// Depth of the branch condition
        depth: u32,
        /// Earlier branches on the same bytes
        extra: ExtraConstraints,
    },
}

/// A record on the decision pipe:
/// `addr-ctxHash-direction-label-tid-qid@<payload>@@`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionRecord {
    /// Branch address
    pub addr: u64,
    /// Hash of the calling context
    pub ctx_hash: u32,
    /// Taken direction
    pub direction: u32,
    /// Label of the branch condition
    pub label: Label,
    /// Trace id
    pub tid: u32,
    /// Queue id
    pub qid: u32,
    /// What to do with it
    pub payload: DecisionPayload,
}

impl Display for DecisionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}-{}-{}@",
            self.addr, self.ctx_hash, self.direction, self.label, self.tid, self.qid
        )?;
        match &self.payload {
            DecisionPayload::None => write!(f, "none@@"),
            DecisionPayload::Solve {
                promote,
                qid,
                prefix_hash,
                depth,
                extra,
            } => write!(
                f,
                "{}-{qid}-{prefix_hash}-{depth}#{}@@",
                u8::from(*promote),
                extra.encode()
            ),
        }
    }
}

/// A request of the scheduler to flip a branch of an earlier trace:
/// `qid,treeId,nodeLabel,direction,curLabelLoc,pathPrefixHash,extra`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolveRequest {
    /// Queue of the traced input
    pub qid: u32,
    /// Trace id, names the snapshot
    pub tree_id: u32,
    /// Label of the branch condition
    pub label: Label,
    /// Direction the trace took
    pub direction: u32,
    /// Position of the branch in the scheduler's tree
    pub cur_label_loc: u32,
    /// Digest of the untaken path prefix
    pub prefix_hash: u64,
    /// Branches to keep as they were
    pub extra: ExtraConstraints,
}

impl FromStr for SolveRequest {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = trim_line(line).splitn(7, ',').collect();
        let extra = match fields.get(6) {
            Some(extra) => ExtraConstraints::parse_request(extra.trim())?,
            None => ExtraConstraints::new(),
        };
        Ok(Self {
            qid: field(&fields, 0, "qid")?,
            tree_id: field(&fields, 1, "tree_id")?,
            label: field(&fields, 2, "label")?,
            direction: field(&fields, 3, "direction")?,
            cur_label_loc: field(&fields, 4, "cur_label_loc")?,
            prefix_hash: field(&fields, 5, "prefix_hash")?,
            extra,
        })
    }
}

impl Display for SolveRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{},{}",
            self.qid,
            self.tree_id,
            self.label,
            self.direction,
            self.cur_label_loc,
            self.prefix_hash,
            self.extra.encode_request()
        )
    }
}

/// End markers on the decision pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlToken {
    /// All decisions of a trace were sent
    End,
    /// A new seed was written
    EndNew,
    /// The requested prefix was already explored, or its snapshot is gone
    EndDup,
    /// The request could not be solved
    EndUnsat,
}

impl ControlToken {
    /// The token as sent, without the line break
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::End => "END@@",
            Self::EndNew => "ENDNEW@@",
            Self::EndDup => "ENDDUP@@",
            Self::EndUnsat => "ENDUNSAT@@",
        }
    }
}

impl Display for ControlToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_end() {
            "END@@" => Ok(Self::End),
            "ENDNEW@@" => Ok(Self::EndNew),
            "ENDDUP@@" => Ok(Self::EndDup),
            "ENDUNSAT@@" => Ok(Self::EndUnsat),
            other => Err(Error::serialize(format!("Not a control token: {other:?}"))),
        }
    }
}
