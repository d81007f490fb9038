//! The block scanner (C5): walks both of the ruleset's automata over every
//! block, one byte at a time, confirming each raw hit as it's found.
//!
//! `spec.md` §4.4's pseudocode reports matches "before the transition is
//! consumed for a given position" — this module follows that exactly: at
//! input position `i`, `matches_at(state)` is read (and confirmed) *before*
//! stepping on `data[i]`, and the same check runs once more after the last
//! byte of the last block to catch matches ending exactly at the scanned
//! region's edge.
//!
//! Timeout handling matches `spec.md` §5: "checks elapsed wall-clock time
//! every 4096 input bytes", counted across the whole scan rather than
//! per-block so a sequence of small blocks can't dodge the check.

use crate::automaton::{Automaton, StateId};
use crate::error::ScanError;
use crate::ids::StringId;
use crate::block::MemoryBlock;
use crate::ruleset::Ruleset;
use crate::scanner::context::ScanContext;
use crate::verify::{PatternVerifier, VerifyArgs};
use std::time::Instant;

const TIMEOUT_CHECK_INTERVAL: u32 = 4096;

/// Scans every block, confirming hits into `ctx`. Returns the strings
/// that crossed [`crate::scanner::matches::MAX_MATCHES_PER_STRING`] during
/// this call, in the order they overflowed, so the orchestrator can report
/// `TooManyMatches` for each exactly once (`spec.md` §9's open question).
pub fn scan_blocks(
    ctx: &mut ScanContext,
    blocks: &[MemoryBlock],
    verifier: &dyn PatternVerifier,
) -> Result<Vec<StringId>, ScanError> {
    let ruleset = ctx.ruleset;
    let mut cs_state: StateId = crate::automaton::ROOT;
    let mut ci_state: StateId = crate::automaton::ROOT;
    let mut since_check: u32 = 0;
    let mut overflowed = Vec::new();

    for block in blocks {
        for (i, &byte) in block.data.iter().enumerate() {
            let pos = block.base + i as u64;

            emit_matches(ctx, ruleset, ruleset.automaton(), cs_state, pos, block, verifier, &mut overflowed);
            emit_matches(ctx, ruleset, ruleset.automaton_nocase(), ci_state, pos, block, verifier, &mut overflowed);

            cs_state = ruleset.automaton().step(cs_state, byte);
            ci_state = ruleset.automaton_nocase().step(ci_state, byte.to_ascii_lowercase());

            since_check += 1;
            if since_check >= TIMEOUT_CHECK_INTERVAL {
                since_check = 0;
                if let Some(deadline) = ctx.deadline() {
                    if Instant::now() >= deadline {
                        return Err(ScanError::Timeout);
                    }
                }
            }
        }
    }

    if let Some(last) = blocks.last() {
        let end = last.end();
        emit_matches(ctx, ruleset, ruleset.automaton(), cs_state, end, last, verifier, &mut overflowed);
        emit_matches(ctx, ruleset, ruleset.automaton_nocase(), ci_state, end, last, verifier, &mut overflowed);
    }

    Ok(overflowed)
}

#[allow(clippy::too_many_arguments)]
fn emit_matches(
    ctx: &mut ScanContext,
    ruleset: &Ruleset,
    automaton: &Automaton,
    state: StateId,
    leaf_end: u64,
    block: &MemoryBlock,
    verifier: &dyn PatternVerifier,
    overflowed: &mut Vec<StringId>,
) {
    for m in automaton.matches_at(state) {
        let string_id: StringId = ruleset.pattern_owner(m.pattern_id);
        let string = ruleset.string(string_id);
        let args = VerifyArgs {
            block: block.data,
            block_base: block.base,
            leaf_end,
            leaf_len: m.backtrack as u64,
            string,
            pattern_bytes: ruleset.pattern_bytes(string_id),
        };
        let outcome = ctx.confirm_match(string_id, &args, verifier);
        if outcome.newly_overflowed {
            overflowed.push(string_id);
        }
    }
}
