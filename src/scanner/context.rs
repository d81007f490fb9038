//! The scan context (C4): everything transient that a single scan needs
//! and the frozen [`crate::ruleset::Ruleset`] must not own.
//!
//! `spec.md` §9 explicitly sanctions moving what the original engine keeps
//! as per-thread-slot arrays *on the ruleset* into per-scan side tables
//! instead — "a ruleset with no scan in progress carries no per-thread
//! state at all" is easier to reason about, and safe Rust has no
//! convenient way to index a shared, frozen structure by a slot a
//! concurrent scan might be releasing underneath you. `ScanContext` is
//! that side table: match state, rule verdicts, and the timeout deadline,
//! all scoped to one scan and dropped when it ends.

use crate::ids::{PatternId, RuleId, StringId};
use crate::ruleset::Ruleset;
use crate::scanner::matches::{ConfirmOutcome, Match, MatchTable};
use crate::verify::{PatternVerifier, VerifyArgs};
use crate::vm::{Value as VmValue, VmHost};
use bitvec::vec::BitVec;
use std::time::Instant;

pub struct ScanContext<'r> {
    pub(crate) ruleset: &'r Ruleset,
    pub(crate) matches: MatchTable,
    /// `rule_results[i]` is set once rule `i`'s condition has been
    /// evaluated, so a later rule's condition can reference an earlier
    /// one by id (`spec.md` §3's rule-to-rule `RuleRef`). Rules are always
    /// evaluated in declaration order, so this is also the natural
    /// "already decided" bitmap — referencing a rule that hasn't been
    /// evaluated yet reads as not-matched, mirroring the restriction most
    /// rule languages place on forward references.
    ///
    /// A packed `BitVec` rather than `Vec<bool>`, the same representation
    /// the teacher uses for its own matching-rules bitmap
    /// (`yara-x::scanner::NonMatchingRules`'s `bitvec::slice::IterZeros`
    /// over a `BitSlice<_, Lsb0>`) — one bit per rule instead of one byte.
    pub(crate) rule_results: BitVec,
    pub(crate) deadline: Option<Instant>,
}

impl<'r> ScanContext<'r> {
    pub fn new(ruleset: &'r Ruleset, deadline: Option<Instant>) -> Self {
        ScanContext {
            ruleset,
            matches: MatchTable::new(ruleset.strings().len()),
            rule_results: BitVec::repeat(false, ruleset.rules().len()),
            deadline,
        }
    }

    /// Confirms one raw automaton hit and, if accepted, records it and
    /// reports the string's 0->1 transition plus whether it just crossed
    /// the per-string match cap (`spec.md` §9's `TOO_MANY_MATCHES` open
    /// question; see `DESIGN.md`).
    pub fn confirm_match(
        &mut self,
        string: StringId,
        args: &VerifyArgs,
        verifier: &dyn PatternVerifier,
    ) -> ConfirmOutcome {
        match crate::verify::verify(args, verifier) {
            Some(outcome) => {
                self.matches.push_unconfirmed(string, Match { offset: outcome.start, length: outcome.length });
                self.matches.confirm_last(string)
            }
            None => ConfirmOutcome { first_match: false, newly_overflowed: false },
        }
    }

    pub fn set_rule_result(&mut self, rule: RuleId, result: bool) {
        self.rule_results.set(rule.index(), result);
    }

    pub fn matches(&self, string: StringId) -> &[Match] {
        self.matches.matches(string)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

impl VmHost for ScanContext<'_> {
    fn pattern_matched(&self, pattern_id: PatternId) -> bool {
        let string = self.ruleset.pattern_owner(pattern_id);
        self.matches.is_matched(string)
    }

    fn external_value(&self, ident: crate::ids::IdentId) -> VmValue {
        self.ruleset.external_vm_value(ident)
    }

    fn rule_matched(&self, rule_id: RuleId) -> bool {
        self.rule_results[rule_id.index()]
    }
}
