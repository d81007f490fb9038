//! End-to-end scenarios exercising the public API together: building a
//! ruleset, scanning it, and checking the callback/results contract the
//! way an embedder actually would, rather than poking at one module's
//! internals.

use pretty_assertions::assert_eq;
use scan_core::error::ScanError;
use scan_core::ids::PatternId;
use scan_core::ruleset::{Anchor, RuleDecl, RuleFlags, RulesetBuilder, StringDecl, StringFlags};
use scan_core::scanner::{CallbackAction, CallbackMsg, NoCallback, Scanner};
use scan_core::vm::Op;

/// Enables `log` output under `RUST_LOG` for whichever test needs it, the
/// way the teacher workspace's own tests do. Safe to call more than once
/// per process (subsequent calls are no-ops).
fn init_logging() {
    let _ = env_logger::try_init();
}

fn single_pattern_ruleset(ident: &str, pattern: &[u8]) -> scan_core::Ruleset {
    let mut b = RulesetBuilder::new();
    b.add_rule(RuleDecl {
        ident: ident.to_string(),
        namespace: "default".into(),
        flags: RuleFlags::empty(),
        strings: vec![StringDecl::ascii("$a", pattern)],
        condition: vec![Op::PushPatternMatched(PatternId(0)), Op::Return],
    })
    .unwrap();
    b.build()
}

#[test]
fn single_literal_match_is_reported() {
    let ruleset = single_pattern_ruleset("rule", b"evil");
    let scanner = Scanner::new(&ruleset);
    let results = scanner.scan_memory(b"this file contains evil bytes", &mut NoCallback).unwrap();
    assert_eq!(results.matching_rules().count(), 1);
}

#[test]
fn no_match_reports_nothing() {
    let ruleset = single_pattern_ruleset("rule", b"evil");
    let scanner = Scanner::new(&ruleset);
    let results = scanner.scan_memory(b"perfectly fine data", &mut NoCallback).unwrap();
    assert_eq!(results.matching_rules().count(), 0);
}

/// The textbook Aho-Corasick scenario: overlapping dictionary entries
/// sharing suffixes, which only resolve correctly with failure links.
#[test]
fn overlapping_literals_all_fire_independently() {
    let mut b = RulesetBuilder::new();
    for (i, (ident, word)) in [("r_he", "he"), ("r_she", "she"), ("r_his", "his"), ("r_hers", "hers")]
        .into_iter()
        .enumerate()
    {
        b.add_rule(RuleDecl {
            ident: ident.into(),
            namespace: "default".into(),
            flags: RuleFlags::empty(),
            strings: vec![StringDecl::ascii("$a", word.as_bytes())],
            condition: vec![Op::PushPatternMatched(PatternId(i as u32)), Op::Return],
        })
        .unwrap();
    }
    let ruleset = b.build();
    let scanner = Scanner::new(&ruleset);
    let results = scanner.scan_memory(b"ushers", &mut NoCallback).unwrap();

    let mut matched: Vec<&str> = results.matching_rules().map(|r| ruleset.ident(r.ident)).collect();
    matched.sort_unstable();
    assert_eq!(matched, vec!["r_hers", "r_she"]);
}

/// `with_timeout_secs(0)` means "no timeout", so this only covers the
/// baseline (timeout disabled) path. The actual timeout trip is covered by
/// `scanner::block_scanner`'s own unit test (`timeout_is_honored_mid_scan`)
/// against a pre-expired deadline, since driving a real wall-clock timeout
/// from this crate's public API would make the test either flaky or slow.
#[test]
fn no_timeout_baseline_completes() {
    let ruleset = single_pattern_ruleset("rule", b"evil");
    let scanner = Scanner::new(&ruleset).with_timeout_secs(0);
    let data = vec![b'x'; 8192];
    let result = scanner.scan_memory(&data, &mut NoCallback);
    assert!(result.is_ok());
}

#[test]
fn callback_sees_every_non_private_rule_exactly_once() {
    let mut b = RulesetBuilder::new();
    b.add_rule(RuleDecl {
        ident: "visible".into(),
        namespace: "default".into(),
        flags: RuleFlags::empty(),
        strings: vec![StringDecl::ascii("$a", b"foo")],
        condition: vec![Op::PushPatternMatched(PatternId(0)), Op::Return],
    })
    .unwrap();
    b.add_rule(RuleDecl {
        ident: "hidden".into(),
        namespace: "default".into(),
        flags: RuleFlags::PRIVATE,
        strings: vec![StringDecl::ascii("$b", b"bar")],
        condition: vec![Op::PushPatternMatched(PatternId(1)), Op::Return],
    })
    .unwrap();
    let ruleset = b.build();
    let scanner = Scanner::new(&ruleset);

    let mut seen = Vec::new();
    let mut cb = |msg: CallbackMsg| {
        match msg {
            CallbackMsg::RuleMatching(r) => seen.push(r.flags),
            CallbackMsg::RuleNotMatching(r) => seen.push(r.flags),
            _ => {}
        }
        CallbackAction::Continue
    };
    scanner.scan_memory(b"foobar", &mut cb).unwrap();

    // Only the visible rule's verdict reaches the callback, private or not.
    assert_eq!(seen.len(), 1);
    assert!(!seen[0].contains(scan_core::ruleset::RuleFlags::PRIVATE));
}

#[test]
fn reloaded_ruleset_scans_identically_to_the_original() {
    init_logging();
    let ruleset = single_pattern_ruleset("rule", b"evil");
    let mut buf = Vec::new();
    ruleset.save(&mut buf).unwrap();
    let reloaded = scan_core::Ruleset::load(&mut &buf[..]).unwrap();

    let data = b"this contains evil bytes";
    let before = Scanner::new(&ruleset).scan_memory(data, &mut NoCallback).unwrap();
    let after = Scanner::new(&reloaded).scan_memory(data, &mut NoCallback).unwrap();

    assert_eq!(before.matching_rules().count(), after.matching_rules().count());
    assert_eq!(
        before.matching_rules().map(|r| reloaded.ident(r.ident).to_string()).collect::<Vec<_>>(),
        after.matching_rules().map(|r| reloaded.ident(r.ident).to_string()).collect::<Vec<_>>(),
    );
}

#[test]
fn scan_blocks_with_one_block_matches_scan_memory() {
    use scan_core::block::MemoryBlock;

    let ruleset = single_pattern_ruleset("rule", b"evil");
    let scanner = Scanner::new(&ruleset);
    let data = b"this contains evil bytes";

    let via_memory = scanner.scan_memory(data, &mut NoCallback).unwrap();
    let via_blocks =
        scanner.scan_blocks(&[MemoryBlock::new(data, 0)], &mut NoCallback).unwrap();

    assert_eq!(via_memory.matching_rules().count(), via_blocks.matching_rules().count());
}

#[test]
fn overlapping_blocks_still_find_a_match_spanning_the_boundary() {
    use scan_core::block::MemoryBlock;

    let ruleset = single_pattern_ruleset("rule", b"evil");
    let scanner = Scanner::new(&ruleset);
    // "evil" spans the boundary between the two blocks; since the second
    // block repeats the last 3 bytes of the first, the full window is
    // available within a single block and the match is found.
    let blocks = [MemoryBlock::new(b"xxxxev", 0), MemoryBlock::new(b"xxevilxx", 4)];
    let results = scanner.scan_blocks(&blocks, &mut NoCallback).unwrap();
    assert_eq!(results.matching_rules().count(), 1);
}

#[test]
fn empty_block_list_matches_nothing() {
    let ruleset = single_pattern_ruleset("rule", b"evil");
    let scanner = Scanner::new(&ruleset);
    let results = scanner.scan_blocks(&[], &mut NoCallback).unwrap();
    assert_eq!(results.matching_rules().count(), 0);
}

#[test]
fn exceeding_max_scan_threads_is_rejected() {
    init_logging();
    let ruleset = single_pattern_ruleset("rule", b"evil");
    let scanner = Scanner::new(&ruleset);
    let mut guards = Vec::new();
    for _ in 0..scan_core::ruleset::MAX_THREADS {
        guards.push(ruleset.acquire_slot().unwrap());
    }
    let err = scanner.scan_memory(b"evil", &mut NoCallback);
    assert!(matches!(err, Err(ScanError::TooManyScanThreads { max }) if max == scan_core::ruleset::MAX_THREADS));
}

#[test]
fn at_anchor_rejects_a_match_at_the_wrong_offset() {
    let mut b = RulesetBuilder::new();
    b.add_rule(RuleDecl {
        ident: "anchored".into(),
        namespace: "default".into(),
        flags: RuleFlags::empty(),
        strings: vec![StringDecl::ascii("$a", b"foo").with_anchor(Anchor::At(0))],
        condition: vec![Op::PushPatternMatched(PatternId(0)), Op::Return],
    })
    .unwrap();
    let ruleset = b.build();
    let scanner = Scanner::new(&ruleset);

    assert_eq!(scanner.scan_memory(b"foo", &mut NoCallback).unwrap().matching_rules().count(), 1);
    assert_eq!(scanner.scan_memory(b"xfoo", &mut NoCallback).unwrap().matching_rules().count(), 0);
}

#[test]
fn fullword_modifier_rejects_substring_matches() {
    let mut b = RulesetBuilder::new();
    b.add_rule(RuleDecl {
        ident: "word".into(),
        namespace: "default".into(),
        flags: RuleFlags::empty(),
        strings: vec![StringDecl::ascii("$a", b"cat").with_flags(StringFlags::ASCII | StringFlags::FULLWORD)],
        condition: vec![Op::PushPatternMatched(PatternId(0)), Op::Return],
    })
    .unwrap();
    let ruleset = b.build();
    let scanner = Scanner::new(&ruleset);

    assert_eq!(scanner.scan_memory(b"a cat sat", &mut NoCallback).unwrap().matching_rules().count(), 1);
    assert_eq!(scanner.scan_memory(b"concatenate", &mut NoCallback).unwrap().matching_rules().count(), 0);
}

/// `spec.md` §8 scenario 5 / §7: "ABORT is not an error: it returns
/// SUCCESS", distinct from a callback that returns ERROR.
#[test]
fn abort_on_first_rule_yields_success_with_exactly_one_callback() {
    let mut b = RulesetBuilder::new();
    for i in 0..5 {
        b.add_rule(RuleDecl {
            ident: format!("r{i}"),
            namespace: "default".into(),
            flags: RuleFlags::empty(),
            strings: vec![],
            condition: vec![Op::PushBool(true), Op::Return],
        })
        .unwrap();
    }
    let ruleset = b.build();
    let scanner = Scanner::new(&ruleset);

    let mut calls = 0;
    let mut cb = |_msg: CallbackMsg| {
        calls += 1;
        CallbackAction::Abort
    };
    let result = scanner.scan_memory(b"", &mut cb);
    assert!(result.is_ok());
    assert_eq!(calls, 1);
}

#[test]
fn callback_error_action_fails_the_scan() {
    let ruleset = single_pattern_ruleset("rule", b"evil");
    let scanner = Scanner::new(&ruleset);
    let mut cb = |_msg: CallbackMsg| CallbackAction::Error;
    let result = scanner.scan_memory(b"this is evil", &mut cb);
    assert!(matches!(result, Err(ScanError::CallbackError)));
}

/// `spec.md` §9's open question on "too many matches" is resolved as a
/// non-fatal callback: the string still counts as matched.
#[test]
fn too_many_matches_downgrades_to_a_callback_instead_of_failing_the_scan() {
    let mut b = RulesetBuilder::new();
    b.add_rule(RuleDecl {
        ident: "many".into(),
        namespace: "default".into(),
        flags: RuleFlags::empty(),
        strings: vec![StringDecl::ascii("$a", b"a")],
        condition: vec![Op::PushPatternMatched(PatternId(0)), Op::Return],
    })
    .unwrap();
    let ruleset = b.build();
    let scanner = Scanner::new(&ruleset);

    let data = vec![b'a'; 20_000];
    let mut saw_too_many = false;
    let mut cb = |msg: CallbackMsg| {
        if let CallbackMsg::TooManyMatches(..) = msg {
            saw_too_many = true;
        }
        CallbackAction::Continue
    };
    let results = scanner.scan_memory(&data, &mut cb).unwrap();
    assert!(saw_too_many);
    assert_eq!(results.matching_rules().count(), 1);
}

#[test]
fn declared_imports_are_announced_through_the_callback() {
    let mut b = RulesetBuilder::new();
    b.declare_import("pe");
    b.add_rule(RuleDecl {
        ident: "r".into(),
        namespace: "default".into(),
        flags: RuleFlags::empty(),
        strings: vec![],
        condition: vec![Op::PushBool(true), Op::Return],
    })
    .unwrap();
    let ruleset = b.build();
    let scanner = Scanner::new(&ruleset);

    let mut imported = Vec::new();
    let mut cb = |msg: CallbackMsg| {
        match msg {
            CallbackMsg::ImportModule(name) => imported.push(format!("import:{name}")),
            CallbackMsg::ModuleImported(name) => imported.push(format!("imported:{name}")),
            _ => {}
        }
        CallbackAction::Continue
    };
    scanner.scan_memory(b"", &mut cb).unwrap();
    assert_eq!(imported, vec!["import:pe", "imported:pe"]);
}
