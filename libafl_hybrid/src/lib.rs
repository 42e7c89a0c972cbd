/*!
The constraint solving and branch filtering core of a hybrid (concolic) fuzzer backend.

A taint tracking execution engine streams branch events and an expression table (the union table)
into this crate. The [`session::HybridEngine`] decides, using coverage and path novelty filters,
which branches are worth flipping, reports its decisions to an external scheduler, and later answers
the scheduler's solve requests by rebuilding `z3` queries from snapshotted union tables.

## Layout
* [`union_table`]: the label indexed expression nodes and their binary snapshot format.
* [`serializer`]: memoized translation of labels into `z3` expressions.
* [`deps`]: per byte branch dependencies used for nested (auxiliary) constraints.
* [`filters`]: bitmap, context and path prefix novelty filters.
* [`solver`]: the nested solver with its optimistic fallback.
* [`session`]: the per trace protocol engine tying everything together.
*/
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(
    clippy::unreadable_literal,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]
#![cfg_attr(not(test), warn(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
))]
#![cfg_attr(test, deny(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_must_use,
))]

use std::{
    collections::TryReserveError,
    fmt::{self, Display},
    io,
    num::{ParseIntError, TryFromIntError},
};

pub mod channel;
pub mod config;
pub mod deps;
pub mod filters;
pub mod fs;
pub mod protocol;
pub mod serializer;
pub mod session;
pub mod solution;
pub mod solver;
pub mod stats;
pub mod tree;
pub mod union_table;

pub use config::{FilterMode, HybridConfig};
pub use session::HybridEngine;
pub use solution::{Solution, SolutionQueue};
pub use stats::HybridStats;
pub use union_table::{Label, LabelInfo, UnionTable};

#[cfg(feature = "errors_backtrace")]
/// Error Backtrace type when `errors_backtrace` feature is enabled (== [`backtrace::Backtrace`])
pub type ErrorBacktrace = backtrace::Backtrace;

#[cfg(not(feature = "errors_backtrace"))]
#[derive(Debug, Default)]
/// Empty struct to use when `errors_backtrace` is disabled
pub struct ErrorBacktrace {}
#[cfg(not(feature = "errors_backtrace"))]
impl ErrorBacktrace {
    /// Nop
    #[must_use]
    pub fn new() -> Self {
        Self {}
    }
}

#[cfg(feature = "errors_backtrace")]
fn display_error_backtrace(f: &mut fmt::Formatter, err: &ErrorBacktrace) -> fmt::Result {
    write!(f, "\nBacktrace: {err:?}")
}
#[cfg(not(feature = "errors_backtrace"))]
#[allow(clippy::unnecessary_wraps)]
fn display_error_backtrace(_f: &mut fmt::Formatter, _err: &ErrorBacktrace) -> fmt::Result {
    fmt::Result::Ok(())
}

/// Main error struct for `libafl_hybrid`.
///
/// None of these are fatal for the engine: branch level errors make a branch unsolvable,
/// channel errors lead to a reconnect.
#[derive(Debug)]
pub enum Error {
    /// The label is below the constant offset or the uninitialized sentinel
    InvalidLabel(Label, ErrorBacktrace),
    /// The expression behind this label exceeds the maximum depth
    ExpressionTooDeep(Label, ErrorBacktrace),
    /// The solver failed, timed out, or could not translate an expression
    Solver(String, ErrorBacktrace),
    /// A trace tree snapshot is missing or does not match the record size
    StaleSnapshot(String, ErrorBacktrace),
    /// The peer of a channel went away
    Disconnected(String, ErrorBacktrace),
    /// An allocation could not be satisfied
    OutOfMemory(String, ErrorBacktrace),
    /// Serialization error, malformed lines or records
    Serialize(String, ErrorBacktrace),
    /// File related error
    File(io::Error, ErrorBacktrace),
    /// You're holding it wrong
    IllegalState(String, ErrorBacktrace),
    /// The argument passed to this method or function is not valid
    IllegalArgument(String, ErrorBacktrace),
    /// Something else happened
    Unknown(String, ErrorBacktrace),
}

impl Error {
    /// The label is below the constant offset or the uninitialized sentinel
    #[must_use]
    pub fn invalid_label(label: Label) -> Self {
        Error::InvalidLabel(label, ErrorBacktrace::new())
    }
    /// The expression behind this label exceeds the maximum depth
    #[must_use]
    pub fn expression_too_deep(label: Label) -> Self {
        Error::ExpressionTooDeep(label, ErrorBacktrace::new())
    }
    /// The solver failed, timed out, or could not translate an expression
    #[must_use]
    pub fn solver<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Solver(arg.into(), ErrorBacktrace::new())
    }
    /// A trace tree snapshot is missing or does not match the record size
    #[must_use]
    pub fn stale_snapshot<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::StaleSnapshot(arg.into(), ErrorBacktrace::new())
    }
    /// The peer of a channel went away
    #[must_use]
    pub fn disconnected<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Disconnected(arg.into(), ErrorBacktrace::new())
    }
    /// An allocation could not be satisfied
    #[must_use]
    pub fn out_of_memory<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::OutOfMemory(arg.into(), ErrorBacktrace::new())
    }
    /// Serialization error
    #[must_use]
    pub fn serialize<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Serialize(arg.into(), ErrorBacktrace::new())
    }
    /// File related error
    #[must_use]
    pub fn file(arg: io::Error) -> Self {
        Error::File(arg, ErrorBacktrace::new())
    }
    /// You're holding it wrong
    #[must_use]
    pub fn illegal_state<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalState(arg.into(), ErrorBacktrace::new())
    }
    /// The argument passed to this method or function is not valid
    #[must_use]
    pub fn illegal_argument<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalArgument(arg.into(), ErrorBacktrace::new())
    }
    /// Something else happened
    #[must_use]
    pub fn unknown<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Unknown(arg.into(), ErrorBacktrace::new())
    }

    /// Errors that only concern a single branch, after which the session simply continues.
    #[must_use]
    pub fn is_branch_local(&self) -> bool {
        matches!(
            self,
            Self::InvalidLabel(..)
                | Self::ExpressionTooDeep(..)
                | Self::Solver(..)
                | Self::OutOfMemory(..)
        )
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidLabel(label, b) => {
                write!(f, "Invalid label: {label}")?;
                display_error_backtrace(f, b)
            }
            Self::ExpressionTooDeep(label, b) => {
                write!(f, "Expression of label {label} is too deep")?;
                display_error_backtrace(f, b)
            }
            Self::Solver(s, b) => {
                write!(f, "Solver error: {0}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::StaleSnapshot(s, b) => {
                write!(f, "Stale or missing snapshot: {0}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::Disconnected(s, b) => {
                write!(f, "Channel disconnected: {0}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::OutOfMemory(s, b) => {
                write!(f, "Out of memory: {0}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::Serialize(s, b) => {
                write!(f, "Error in Serialization: `{0}`", &s)?;
                display_error_backtrace(f, b)
            }
            Self::File(err, b) => {
                write!(f, "File IO failed: {:?}", &err)?;
                display_error_backtrace(f, b)
            }
            Self::IllegalState(s, b) => {
                write!(f, "Illegal state: {0}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::IllegalArgument(s, b) => {
                write!(f, "Illegal argument: {0}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::Unknown(s, b) => {
                write!(f, "Unknown error: {0}", &s)?;
                display_error_backtrace(f, b)
            }
        }
    }
}

impl std::error::Error for Error {}

/// Create an Error from io Error
impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::file(err)
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Self::unknown(format!("Unix error: {err:?}"))
    }
}

/// Stringify the json serializer error
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialize(format!("{err:?}"))
    }
}

impl From<ParseIntError> for Error {
    fn from(err: ParseIntError) -> Self {
        Self::serialize(format!("Failed to parse Int: {err:?}"))
    }
}

impl From<TryFromIntError> for Error {
    fn from(err: TryFromIntError) -> Self {
        Self::illegal_state(format!("Expected conversion failed: {err:?}"))
    }
}

impl From<TryReserveError> for Error {
    fn from(err: TryReserveError) -> Self {
        Self::out_of_memory(format!("{err:?}"))
    }
}

#[cfg(test)]
mod tests {
    use crate::Error;

    #[test]
    fn test_branch_local_errors() {
        assert!(Error::invalid_label(0).is_branch_local());
        assert!(Error::expression_too_deep(7).is_branch_local());
        assert!(Error::solver("timeout").is_branch_local());
        assert!(!Error::stale_snapshot("tree0/id:000001").is_branch_local());
        assert!(!Error::disconnected("/tmp/myfifo").is_branch_local());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Error::invalid_label(3)), "Invalid label: 3");
        let err: Error = "x1".parse::<u32>().unwrap_err().into();
        assert!(matches!(err, Error::Serialize(..)));
    }
}
