//! Error types for every fallible operation in the crate.
//!
//! One [`thiserror`]-derived enum per failure domain, mirroring the
//! teacher's `ScanError` in `yara-x/src/scanner/mod.rs`: construction-time
//! failures get their own narrow enum, and anything that can surface out of
//! a running scan is folded into [`ScanError`].

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while growing or (de)serializing an [`crate::arena::Arena`].
#[derive(Error, Debug)]
pub enum ArenaError {
    #[error("arena chunk capacity exceeded ({requested} bytes requested, chunk size is {chunk_size})")]
    RecordTooLarge { requested: usize, chunk_size: usize },
    #[error("corrupt arena stream: {0}")]
    Corrupt(String),
    #[error("I/O error while reading/writing arena stream: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while building, saving or loading a [`crate::ruleset::Ruleset`].
#[derive(Error, Debug)]
pub enum RulesetError {
    #[error("identifier `{0}` is not declared in this ruleset")]
    UndeclaredIdentifier(String),
    #[error("rule references unknown rule id {0:?}")]
    UnknownRule(crate::ids::RuleId),
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error("ruleset stream format version {found} is not supported by this runtime (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("corrupt ruleset stream: {0}")]
    CorruptFile(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("a ruleset can't be saved while {0} scan(s) are in progress")]
    ScansInProgress(usize),
    #[error("too many scan threads: at most {0} concurrent scans are allowed on a single ruleset")]
    TooManyScanThreads(usize),
}

/// Raised by `define_*_variable` when the identifier or type doesn't match.
#[derive(Error, Debug)]
pub enum VariableError {
    #[error("external variable `{0}` is not declared in this ruleset")]
    Undeclared(String),
    #[error("external variable `{variable}` has type `{expected_type}`, value has type `{actual_type}`")]
    InvalidType { variable: String, expected_type: &'static str, actual_type: &'static str },
}

/// Error returned by `Scanner::scan_file`/`scan_fd`.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("can not open `{path}`: {source}")]
    OpenError { path: PathBuf, source: std::io::Error },
    #[error("can not map `{path}`: {source}")]
    MapError { path: PathBuf, source: fmmap::error::Error },
    #[error("too many scan threads: at most {max} concurrent scans are allowed on a single ruleset")]
    TooManyScanThreads { max: usize },
    #[error("scan timed out")]
    Timeout,
    #[error("callback returned an error")]
    CallbackError,
    #[error("fault while reading a memory block")]
    MapFailure,
    #[error("fault while evaluating rule conditions")]
    VmFault,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Variable(#[from] VariableError),
    #[error(transparent)]
    Ruleset(#[from] RulesetError),
}
