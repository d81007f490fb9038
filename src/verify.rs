//! The sub-matcher (`spec.md` §1's "regex/hex sub-matcher" collaborator,
//! out of scope as a *regex engine* but very much in scope as the place
//! every raw Aho-Corasick hit gets turned into a confirmed [`crate::scanner::matches::Match`]).
//!
//! A literal ASCII/WIDE/NOCASE string is already fully confirmed by which
//! of the ruleset's two automata found it (see the field comment on
//! `RulesetData::automaton_nocase`); what's left to check is universal
//! across string kinds — anchors and FULLWORD boundaries — plus one kind
//! needs more: a HEX string's automaton leaf is only its longest
//! *concrete* atom, so the surrounding wildcard-masked bytes still need a
//! direct compare here. REGEXP strings need a real regex engine, which
//! `spec.md` §1 explicitly places out of scope; [`PatternVerifier`] is the
//! seam an embedder plugs one into.

use crate::ruleset::{Anchor, StringFlags, StringInfo};

/// Confirms (or rejects) a REGEXP-flagged string against the bytes at a
/// candidate offset. The crate ships no regex engine of its own — the
/// default [`NullVerifier`] rejects every REGEXP string, matching `spec.md`
/// §1's stance that the sub-matcher is a pluggable collaborator, not core
/// scope.
pub trait PatternVerifier {
    /// `data` is the block containing the candidate start; `offset` is the
    /// candidate's position within `data`. Returns the confirmed match
    /// length on success.
    fn verify_regexp(&self, declared_pattern: &[u8], data: &[u8], offset: usize) -> Option<usize>;
}

/// Always rejects REGEXP strings. Used when an embedder hasn't wired in a
/// real regex engine.
pub struct NullVerifier;

impl PatternVerifier for NullVerifier {
    fn verify_regexp(&self, _declared_pattern: &[u8], _data: &[u8], _offset: usize) -> Option<usize> {
        None
    }
}

/// What the block scanner gives [`verify`] to confirm one raw automaton
/// hit.
pub struct VerifyArgs<'a> {
    /// The block containing the hit.
    pub block: &'a [u8],
    /// That block's base offset in the scanned object's address space.
    pub block_base: u64,
    /// Global offset just past the automaton leaf's last matched byte.
    pub leaf_end: u64,
    /// Length of the bytes the automaton actually matched (the leaf's
    /// `backtrack`) — for HEX strings this is just the atom, not the full
    /// masked pattern.
    pub leaf_len: u64,
    pub string: &'a StringInfo,
    pub pattern_bytes: &'a [u8],
}

/// A confirmed match's true extent, which for HEX strings differs from
/// what the automaton itself matched (the atom only).
pub struct VerifyOutcome {
    pub start: u64,
    pub length: u32,
}

/// Confirms one raw automaton hit, checking anchors, FULLWORD boundaries,
/// and (for HEX strings) the wildcard-masked bytes the atom alone didn't
/// cover. `spec.md` §4.4: "a match is confirmed once every constraint the
/// declaration places on it is satisfied; anything else is discarded
/// silently, it never reaches the callback."
pub fn verify(args: &VerifyArgs, verifier: &dyn PatternVerifier) -> Option<VerifyOutcome> {
    let atom_start = args.leaf_end.checked_sub(args.leaf_len)?;
    let candidate_start = atom_start.checked_sub(args.string.atom_offset as u64)?;

    if args.string.flags.contains(StringFlags::REGEXP) {
        let rel = candidate_start.checked_sub(args.block_base)?;
        let rel = usize::try_from(rel).ok()?;
        let length = verifier.verify_regexp(args.pattern_bytes, args.block, rel)?;
        if !check_anchor(&args.string.anchor, candidate_start) {
            return None;
        }
        if !check_fullword(args.string.flags, args.block, args.block_base, candidate_start, length as u64) {
            return None;
        }
        return Some(VerifyOutcome { start: candidate_start, length: length as u32 });
    }

    let candidate_len = if args.string.flags.contains(StringFlags::HEX) {
        args.string.hex_mask.as_ref().map(|m| m.len() as u64).unwrap_or(args.leaf_len)
    } else {
        args.leaf_len
    };
    let candidate_end = candidate_start + candidate_len;

    if !check_anchor(&args.string.anchor, candidate_start) {
        return None;
    }

    let rel_start = candidate_start.checked_sub(args.block_base)?;
    let rel_end = candidate_end.checked_sub(args.block_base)?;
    let (rel_start, rel_end) = (usize::try_from(rel_start).ok()?, usize::try_from(rel_end).ok()?);
    if rel_end > args.block.len() {
        // The candidate window runs off the end of the block we have bytes
        // for. Scanning via discontiguous/unoverlapped blocks can't
        // recover a match whose window straddles the boundary; callers
        // needing that should overlap adjacent blocks by at least the
        // longest pattern's length.
        return None;
    }
    let window = &args.block[rel_start..rel_end];

    if args.string.flags.contains(StringFlags::HEX) {
        let mask = args.string.hex_mask.as_ref()?;
        for (b, m) in window.iter().zip(mask.iter()) {
            if let Some(expected) = m {
                if b != expected {
                    return None;
                }
            }
        }
    }

    if !check_fullword(args.string.flags, args.block, args.block_base, candidate_start, candidate_len) {
        return None;
    }

    Some(VerifyOutcome { start: candidate_start, length: candidate_len as u32 })
}

fn check_anchor(anchor: &Anchor, candidate_start: u64) -> bool {
    match anchor {
        Anchor::None => true,
        Anchor::At(offset) => candidate_start == *offset,
        Anchor::In(start, end) => candidate_start >= *start && candidate_start < *end,
    }
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// `spec.md` §3's FULLWORD modifier: the byte immediately before and after
/// the match, if present *within the block we have*, must not be a word
/// byte. A boundary that falls outside the block we were given is treated
/// as satisfied — consistent with how a match at the very start/end of the
/// scanned object has no neighbor to violate the constraint.
fn check_fullword(flags: StringFlags, block: &[u8], block_base: u64, start: u64, length: u64) -> bool {
    if !flags.contains(StringFlags::FULLWORD) {
        return true;
    }
    let before_ok = match start.checked_sub(1).and_then(|p| p.checked_sub(block_base)) {
        Some(rel) => match usize::try_from(rel) {
            Ok(i) => block.get(i).map(|&b| !is_word_byte(b)).unwrap_or(true),
            Err(_) => true,
        },
        None => true,
    };
    let after = start + length;
    let after_ok = match after.checked_sub(block_base) {
        Some(rel) => match usize::try_from(rel) {
            Ok(i) => block.get(i).map(|&b| !is_word_byte(b)).unwrap_or(true),
            Err(_) => true,
        },
        None => true,
    };
    before_ok && after_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::ids::RuleId;

    fn string_info(flags: StringFlags, anchor: Anchor, hex_mask: Option<Vec<Option<u8>>>, atom_offset: u32) -> StringInfo {
        let mut arena = Arena::new();
        let ident = arena.allocate_bytes(b"$a").unwrap();
        let pattern = arena.allocate_bytes(b"x").unwrap();
        StringInfo {
            ident,
            owner_rule: RuleId(0),
            flags,
            anchor,
            pattern,
            hex_mask,
            leaves: vec![],
            atom_offset,
        }
    }

    #[test]
    fn plain_literal_confirms_without_rechecking_bytes() {
        let s = string_info(StringFlags::ASCII, Anchor::None, None, 0);
        let args = VerifyArgs { block: b"xxfooxx", block_base: 0, leaf_end: 5, leaf_len: 3, string: &s, pattern_bytes: b"foo" };
        let outcome = verify(&args, &NullVerifier).unwrap();
        assert_eq!(outcome.start, 2);
        assert_eq!(outcome.length, 3);
    }

    #[test]
    fn at_anchor_rejects_wrong_offset() {
        let s = string_info(StringFlags::ASCII, Anchor::At(10), None, 0);
        let args = VerifyArgs { block: b"xxfooxx", block_base: 0, leaf_end: 5, leaf_len: 3, string: &s, pattern_bytes: b"foo" };
        assert!(verify(&args, &NullVerifier).is_none());
    }

    #[test]
    fn fullword_rejects_when_adjacent_to_word_byte() {
        let s = string_info(StringFlags::ASCII | StringFlags::FULLWORD, Anchor::None, None, 0);
        // "xfooy" -> "foo" flanked by word bytes on both sides.
        let args = VerifyArgs { block: b"xfooy", block_base: 0, leaf_end: 4, leaf_len: 3, string: &s, pattern_bytes: b"foo" };
        assert!(verify(&args, &NullVerifier).is_none());
    }

    #[test]
    fn fullword_accepts_at_buffer_edges() {
        let s = string_info(StringFlags::ASCII | StringFlags::FULLWORD, Anchor::None, None, 0);
        let args = VerifyArgs { block: b"foo", block_base: 0, leaf_end: 3, leaf_len: 3, string: &s, pattern_bytes: b"foo" };
        assert!(verify(&args, &NullVerifier).is_some());
    }

    #[test]
    fn hex_mask_confirms_wildcard_bytes() {
        let mask = vec![Some(0xAA), None, Some(0xBB)];
        // atom is the single concrete byte at offset 0 (0xAA); offset 2's
        // 0xBB is a separate run of equal length, tie broken to the first.
        let s = string_info(StringFlags::HEX, Anchor::None, Some(mask), 0);
        let block = [0xAAu8, 0x00, 0xBB];
        let args = VerifyArgs { block: &block, block_base: 0, leaf_end: 1, leaf_len: 1, string: &s, pattern_bytes: &[] };
        let outcome = verify(&args, &NullVerifier).unwrap();
        assert_eq!(outcome.start, 0);
        assert_eq!(outcome.length, 3);
    }

    #[test]
    fn hex_mask_rejects_mismatched_concrete_byte() {
        let mask = vec![Some(0xAA), None, Some(0xBB)];
        let s = string_info(StringFlags::HEX, Anchor::None, Some(mask), 0);
        let block = [0xAAu8, 0x00, 0xCC];
        let args = VerifyArgs { block: &block, block_base: 0, leaf_end: 1, leaf_len: 1, string: &s, pattern_bytes: &[] };
        assert!(verify(&args, &NullVerifier).is_none());
    }

    #[test]
    fn window_running_off_the_block_is_rejected() {
        let mask = vec![Some(0xAA), None, Some(0xBB)];
        let s = string_info(StringFlags::HEX, Anchor::None, Some(mask), 0);
        let block = [0xAAu8, 0x00];
        let args = VerifyArgs { block: &block, block_base: 0, leaf_end: 1, leaf_len: 1, string: &s, pattern_bytes: &[] };
        assert!(verify(&args, &NullVerifier).is_none());
    }
}
