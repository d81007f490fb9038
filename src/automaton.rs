//! The Aho-Corasick execution engine (C2).
//!
//! `spec.md` §4.2 describes the tables as two packed 64-bit arrays (a goto
//! table conflating next-state and a collision-detection byte in one word,
//! plus a failure link stashed in the low state's own slot). §9's design
//! notes explicitly sanction replacing that with "two arrays... without
//! changing observable behavior, provided the automaton matches the same
//! languages with the same backtrack offsets" — which is what this module
//! does: a `fail: Vec<StateId>` table plus per-state sparse transitions,
//! the same shape used by the `NFA`/`State` pair in
//! `like-aho-corasick-but-different/src/nfa.rs`, adapted from Unicode words
//! to raw bytes and from single matches to the multi-pattern match lists
//! `spec.md` requires.

use crate::ids::PatternId;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::VecDeque;

pub type StateId = u32;

/// Root state, reserved index 0 exactly as `spec.md` §4.2 requires.
pub const ROOT: StateId = 0;

/// One pattern terminating at a given automaton state.
///
/// `backtrack` is how many bytes before the current input position the
/// pattern begins, per the glossary definition; for a pattern of length
/// `L` ending at position `i` (exclusive), `backtrack == L` and the
/// candidate start offset is `i - backtrack`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcMatch {
    pub pattern_id: PatternId,
    pub backtrack: u32,
}

/// Read-only lookup tables built once by [`AutomatonBuilder`] and never
/// mutated after that — the invariant `spec.md` §3 places on the ruleset's
/// automaton.
#[derive(Serialize, Deserialize)]
pub struct Automaton {
    /// `fail[s]` is the failure link for state `s`.
    fail: Vec<StateId>,
    /// `transitions[s]` is a sorted-by-byte list of `(byte, next_state)`.
    /// Small and usually sparse (a handful of distinct children per state),
    /// so `SmallVec` avoids a heap allocation for the common case.
    transitions: Vec<SmallVec<[(u8, StateId); 4]>>,
    /// `matches[s]` are the patterns recognized when entering state `s`.
    matches: Vec<SmallVec<[AcMatch; 2]>>,
}

impl Automaton {
    pub fn state_count(&self) -> usize {
        self.fail.len()
    }

    /// Advances the automaton by one input byte per the probe protocol in
    /// `spec.md` §4.2: follow the goto transition if present, otherwise
    /// fall back along failure links until one is found or `ROOT` is
    /// reached (whose failure link is itself, by construction).
    #[inline]
    pub fn step(&self, mut state: StateId, byte: u8) -> StateId {
        loop {
            if let Some(next) = self.transition(state, byte) {
                return next;
            }
            if state == ROOT {
                return ROOT;
            }
            state = self.fail[state as usize];
        }
    }

    #[inline]
    fn transition(&self, state: StateId, byte: u8) -> Option<StateId> {
        self.transitions[state as usize]
            .binary_search_by_key(&byte, |&(b, _)| b)
            .ok()
            .map(|idx| self.transitions[state as usize][idx].1)
    }

    /// Patterns that terminate at `state`, to be emitted *before* consuming
    /// the byte that would transition away from it (spec.md §4.2: "Matches
    /// are reported before the transition is consumed for a given
    /// position").
    #[inline]
    pub fn matches_at(&self, state: StateId) -> &[AcMatch] {
        &self.matches[state as usize]
    }
}

/// Builds an [`Automaton`] from a flat list of `(pattern_bytes, pattern_id)`
/// pairs. Standing in for the out-of-scope rule compiler: something has to
/// produce the tables, and `spec.md` only specifies their *shape*, not how
/// they're built.
pub struct AutomatonBuilder {
    states: Vec<BuildState>,
}

struct BuildState {
    trans: Vec<(u8, StateId)>,
    fail: StateId,
    matches: Vec<AcMatch>,
}

impl AutomatonBuilder {
    pub fn new() -> Self {
        AutomatonBuilder { states: vec![BuildState { trans: vec![], fail: ROOT, matches: vec![] }] }
    }

    fn next_state(&self, from: StateId, byte: u8) -> Option<StateId> {
        self.states[from as usize]
            .trans
            .iter()
            .find(|&&(b, _)| b == byte)
            .map(|&(_, s)| s)
    }

    fn add_state(&mut self) -> StateId {
        self.states.push(BuildState { trans: vec![], fail: ROOT, matches: vec![] });
        (self.states.len() - 1) as StateId
    }

    /// Adds one pattern's bytes to the trie, recording `pattern_id` as the
    /// match reached at its terminal state.
    pub fn add_pattern(&mut self, bytes: &[u8], pattern_id: PatternId) {
        let mut state = ROOT;
        for &b in bytes {
            state = match self.next_state(state, b) {
                Some(next) => next,
                None => {
                    let next = self.add_state();
                    self.states[state as usize].trans.push((b, next));
                    next
                }
            };
        }
        self.states[state as usize]
            .matches
            .push(AcMatch { pattern_id, backtrack: bytes.len() as u32 });
    }

    /// Computes failure links with the standard breadth-first construction
    /// (grounded on `fill_failure_transitions_standard` in
    /// `like-aho-corasick-but-different/src/nfa.rs`), then freezes the
    /// tables into their read-only representation.
    pub fn build(mut self) -> Automaton {
        let mut queue = VecDeque::new();
        for &(_, child) in self.states[ROOT as usize].trans.clone().iter() {
            self.states[child as usize].fail = ROOT;
            queue.push_back(child);
        }

        while let Some(state) = queue.pop_front() {
            let trans = self.states[state as usize].trans.clone();
            for (byte, child) in trans {
                queue.push_back(child);

                let mut fail = self.states[state as usize].fail;
                loop {
                    if fail == ROOT {
                        match self.next_state(ROOT, byte) {
                            Some(s) if s != child => {
                                fail = s;
                            }
                            _ => {
                                fail = ROOT;
                            }
                        }
                        break;
                    }
                    if let Some(s) = self.next_state(fail, byte) {
                        fail = s;
                        break;
                    }
                    fail = self.states[fail as usize].fail;
                }
                self.states[child as usize].fail = fail;

                let inherited = self.states[fail as usize].matches.clone();
                self.states[child as usize].matches.extend(inherited);
            }
        }

        let mut fail = Vec::with_capacity(self.states.len());
        let mut transitions = Vec::with_capacity(self.states.len());
        let mut matches = Vec::with_capacity(self.states.len());

        for mut s in self.states {
            s.trans.sort_unstable_by_key(|&(b, _)| b);
            fail.push(s.fail);
            transitions.push(SmallVec::from_vec(s.trans));
            matches.push(SmallVec::from_vec(s.matches));
        }

        Automaton { fail, transitions, matches }
    }
}

impl Default for AutomatonBuilder {
    fn default() -> Self {
        Self::new()
    }
}
