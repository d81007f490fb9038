//! Per-scan match bookkeeping (C3).
//!
//! Every Aho-Corasick hit starts life *unconfirmed* — it's only the
//! position where some leaf's bytes end — and gets promoted to *confirmed*
//! once [`crate::verify`] has checked anchors, FULLWORD boundaries and (for
//! HEX/REGEXP strings) whatever the leaf atom alone didn't cover. A
//! per-string FIFO pair, rather than one flat match list, mirrors
//! `spec.md` §3's "matching-strings" table: condition evaluation mostly
//! needs a fast "has this string ever matched" query (the 0->1 transition),
//! independent of enumerating every occurrence, and strings are addressed
//! by a dense `StringId`, so a `Vec` indexed by it is the natural shape —
//! the same per-entity-table-indexed-by-dense-id pattern used throughout
//! `crate::ruleset`.

use crate::ids::StringId;

/// Per-string cap on retained confirmed matches (`spec.md` §9's open
/// question: "too many matches for this string" is resolved here as
/// non-fatal — see `DESIGN.md`). Once a string crosses this count, further
/// occurrences still make the string "matched" for condition evaluation
/// but stop being recorded, bounding memory on pathological inputs (e.g. a
/// one-byte pattern against a block that is all that byte).
pub const MAX_MATCHES_PER_STRING: usize = 10_000;

/// One matched occurrence of a string, in the scanned data's own address
/// space (already adjusted for the owning block's base offset).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Match {
    pub offset: u64,
    pub length: u32,
}

#[derive(Default)]
struct MatchList {
    unconfirmed: Vec<Match>,
    confirmed: Vec<Match>,
    overflowed: bool,
}

/// All per-string match state for one scan. Lives on [`super::context::ScanContext`]
/// and is dropped at the end of the scan — nothing here outlives it, unlike
/// the ruleset's own tables.
pub struct MatchTable {
    lists: Vec<MatchList>,
}

impl MatchTable {
    pub fn new(string_count: usize) -> Self {
        MatchTable { lists: (0..string_count).map(|_| MatchList::default()).collect() }
    }

    /// Records a raw automaton hit, pending verification.
    pub fn push_unconfirmed(&mut self, string: StringId, m: Match) {
        self.lists[string.index()].unconfirmed.push(m);
    }

    /// Promotes the most recently pushed unconfirmed match for `string` to
    /// confirmed, subject to [`MAX_MATCHES_PER_STRING`]. `first_match` is
    /// `true` iff this is the string's first confirmed match in the scan
    /// (the matching-strings 0->1 transition that `spec.md` §3 calls out
    /// as worth tracking separately); `newly_overflowed` is `true` exactly
    /// once, the confirmation that pushes the string over the cap.
    pub fn confirm_last(&mut self, string: StringId) -> ConfirmOutcome {
        let list = &mut self.lists[string.index()];
        let m = list.unconfirmed.pop().expect("confirm_last with no pending match");
        let first_match = list.confirmed.is_empty();
        if list.confirmed.len() >= MAX_MATCHES_PER_STRING {
            let newly_overflowed = !list.overflowed;
            list.overflowed = true;
            return ConfirmOutcome { first_match, newly_overflowed };
        }
        list.confirmed.push(m);
        ConfirmOutcome { first_match, newly_overflowed: false }
    }

    /// Discards the most recently pushed unconfirmed match: verification
    /// failed (wrong anchor, broken word boundary, masked bytes didn't
    /// line up, ...).
    pub fn reject_last(&mut self, string: StringId) {
        self.lists[string.index()].unconfirmed.pop();
    }

    pub fn is_matched(&self, string: StringId) -> bool {
        !self.lists[string.index()].confirmed.is_empty()
    }

    pub fn matches(&self, string: StringId) -> &[Match] {
        &self.lists[string.index()].confirmed
    }

    pub fn any_matched(&self) -> bool {
        self.lists.iter().any(|l| !l.confirmed.is_empty())
    }
}

/// What happened when a pending match was promoted to confirmed.
pub struct ConfirmOutcome {
    pub first_match: bool,
    pub newly_overflowed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_confirm_reports_the_transition() {
        let mut table = MatchTable::new(2);
        let sid = StringId(0);
        table.push_unconfirmed(sid, Match { offset: 10, length: 3 });
        assert!(table.confirm_last(sid).first_match);
        table.push_unconfirmed(sid, Match { offset: 20, length: 3 });
        assert!(!table.confirm_last(sid).first_match);
        assert_eq!(table.matches(sid).len(), 2);
    }

    #[test]
    fn rejected_match_is_not_recorded() {
        let mut table = MatchTable::new(1);
        let sid = StringId(0);
        table.push_unconfirmed(sid, Match { offset: 0, length: 3 });
        table.reject_last(sid);
        assert!(!table.is_matched(sid));
        assert!(table.matches(sid).is_empty());
    }

    #[test]
    fn unrelated_strings_stay_independent() {
        let mut table = MatchTable::new(2);
        table.push_unconfirmed(StringId(0), Match { offset: 0, length: 1 });
        table.confirm_last(StringId(0));
        assert!(table.is_matched(StringId(0)));
        assert!(!table.is_matched(StringId(1)));
    }

    #[test]
    fn exceeding_the_cap_keeps_the_string_matched_but_stops_recording() {
        let mut table = MatchTable::new(1);
        let sid = StringId(0);
        for i in 0..MAX_MATCHES_PER_STRING {
            table.push_unconfirmed(sid, Match { offset: i as u64, length: 1 });
            let outcome = table.confirm_last(sid);
            assert!(!outcome.newly_overflowed);
        }
        table.push_unconfirmed(sid, Match { offset: 999_999, length: 1 });
        let outcome = table.confirm_last(sid);
        assert!(outcome.newly_overflowed);
        assert!(table.is_matched(sid));
        assert_eq!(table.matches(sid).len(), MAX_MATCHES_PER_STRING);

        // a second overflowing match does not re-fire the notification
        table.push_unconfirmed(sid, Match { offset: 1_000_000, length: 1 });
        assert!(!table.confirm_last(sid).newly_overflowed);
    }
}
