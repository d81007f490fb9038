//! Aho-Corasick scan core: a multi-pattern byte-matching engine built
//! around a shared, frozen [`ruleset::Ruleset`] and a condition bytecode
//! evaluator, without the rule-source compiler, regex engine, or module
//! system that would normally sit in front of it.
//!
//! A [`ruleset::RulesetBuilder`] assembles a [`ruleset::Ruleset`] directly
//! (standing in for a text-rule compiler, which is out of this crate's
//! scope); a [`scanner::Scanner`] then scans in-memory buffers, files, or
//! caller-supplied block lists against it and reports through a
//! [`scanner::ScanCallback`].
//!
//! ```no_run
//! use scan_core::ruleset::{RuleDecl, RuleFlags, RulesetBuilder, StringDecl};
//! use scan_core::scanner::{NoCallback, Scanner};
//! use scan_core::vm::Op;
//! use scan_core::ids::PatternId;
//!
//! let mut builder = RulesetBuilder::new();
//! builder
//!     .add_rule(RuleDecl {
//!         ident: "suspicious".into(),
//!         namespace: "default".into(),
//!         flags: RuleFlags::empty(),
//!         strings: vec![StringDecl::ascii("$a", b"evil")],
//!         condition: vec![Op::PushPatternMatched(PatternId(0)), Op::Return],
//!     })
//!     .unwrap();
//! let ruleset = builder.build();
//!
//! let scanner = Scanner::new(&ruleset);
//! let results = scanner.scan_memory(b"this is evil data", &mut NoCallback).unwrap();
//! assert_eq!(results.matching_rules().count(), 1);
//! ```

pub mod arena;
pub mod automaton;
pub mod block;
pub mod error;
pub mod ids;
pub mod ruleset;
pub mod scanner;
pub mod variables;
pub mod verify;
pub mod vm;

pub use error::{ArenaError, RulesetError, ScanError, VariableError};
pub use ruleset::Ruleset;
pub use scanner::{CallbackAction, CallbackMsg, ScanCallback, ScanResults, Scanner};
