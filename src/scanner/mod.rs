//! The scan orchestrator (C8): acquires a thread slot, builds a
//! [`context::ScanContext`], walks the blocks, evaluates every rule's
//! condition in declaration order, and reports through a callback —
//! `spec.md` §4.7's nine-step scan protocol.
//!
//! Fault containment follows `spec.md` §5's intent ("a corrupt block or a
//! VM bug must not bring down the host process") without needing the
//! original's signal/SEH trampoline: every byte this crate reads comes
//! through a safe `&[u8]`, so the only faults reachable are Rust panics
//! (an indexing bug, an `unwrap` on `None`), and [`std::panic::catch_unwind`]
//! at the block-scan and condition-evaluation boundaries turns those into
//! an ordinary `Err` instead of an aborting crash — the same containment
//! goal, reached by a safe-Rust-native mechanism (`spec.md` §9 sanctions
//! this substitution explicitly).

pub mod block_scanner;
pub mod context;
pub mod matches;

use crate::block::{single_block, MemoryBlock};
use crate::error::ScanError;
use crate::ids::{RuleId, StringId};
use crate::ruleset::{RuleInfo, Ruleset};
use crate::verify::{NullVerifier, PatternVerifier};
use crate::vm::{self, VmError, VmHost};
use bitvec::vec::BitVec;
use context::ScanContext;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// What a [`ScanCallback`] is told as a scan progresses (`spec.md` §6's
/// callback message kinds, narrowed to what this crate's scope produces).
pub enum CallbackMsg<'r> {
    RuleMatching(&'r RuleInfo),
    RuleNotMatching(&'r RuleInfo),
    /// A module named in the ruleset's `import` list is about to be made
    /// available to conditions. The module system itself is out of this
    /// crate's scope (`spec.md` §1); this message only models the
    /// callback-protocol seam so an embedder providing real modules can
    /// hook in without this crate needing to know what a module *is*.
    ImportModule(&'r str),
    ModuleImported(&'r str),
    /// A string crossed [`matches::MAX_MATCHES_PER_STRING`] confirmed
    /// matches; further occurrences of it are not retained for this scan,
    /// though the string still counts as matched. Resolves `spec.md` §9's
    /// open question in favor of a non-fatal callback over aborting.
    TooManyMatches(&'r RuleInfo, StringId),
    ScanFinished,
}

/// Whether the scan should keep going after a callback invocation
/// (`spec.md` §4.7 step 7 / §6's three callback actions).
pub enum CallbackAction {
    /// Keep iterating over the remaining rules.
    Continue,
    /// Stop reporting immediately. Per `spec.md` §7, "`ABORT` is not an
    /// error: it returns `SUCCESS`" — the scan still completes normally,
    /// it just stops short of `SCAN_FINISHED` and any rules after the
    /// aborting one.
    Abort,
    /// Stop reporting and fail the scan with `ScanError::CallbackError`.
    Error,
}

/// `spec.md` §4.7 step 7's reporting collaborator. Implemented for any
/// `FnMut(CallbackMsg) -> CallbackAction`, so a closure works as a
/// callback without a wrapper type.
pub trait ScanCallback {
    fn on_message(&mut self, msg: CallbackMsg) -> CallbackAction;
}

impl<F: FnMut(CallbackMsg) -> CallbackAction> ScanCallback for F {
    fn on_message(&mut self, msg: CallbackMsg) -> CallbackAction {
        self(msg)
    }
}

/// A no-op callback for callers who only want [`ScanResults`].
pub struct NoCallback;

impl ScanCallback for NoCallback {
    fn on_message(&mut self, _msg: CallbackMsg) -> CallbackAction {
        CallbackAction::Continue
    }
}

/// Out-of-scope collaborator (`spec.md` §1): enumerating a live process's
/// readable memory regions is platform-specific and not something this
/// crate implements. `scan_process` takes one of these instead of a pid
/// directly.
pub trait ProcessMemorySource {
    /// Returns the regions to scan as `(base_address, bytes)` pairs.
    fn read_regions(&self, pid: u32) -> Result<Vec<(u64, Vec<u8>)>, ScanError>;
}

/// One scan's verdicts: which rules matched, in declaration order.
/// `spec.md` §4.7 step 7: "PRIVATE rules are evaluated ... but never reach
/// the callback or the public results" — the iterators here apply that
/// filter; [`ScanResults::is_matching`] does not, since an embedder asking
/// about a specific rule by id already knows what it is.
pub struct ScanResults<'r> {
    ruleset: &'r Ruleset,
    /// Packed one-bit-per-rule verdict, the same representation the
    /// teacher uses for its own matching/non-matching rule iterators
    /// (`yara-x::scanner::{MatchingRules, NonMatchingRules}` over a
    /// `BitSlice<_, Lsb0>`), here built fresh per scan rather than read out
    /// of WASM linear memory.
    matched: BitVec,
}

impl<'r> ScanResults<'r> {
    pub fn matching_rules(&self) -> impl Iterator<Item = &'r RuleInfo> + '_ {
        let ruleset = self.ruleset;
        self.matched.iter_ones().filter_map(move |i| {
            let r = &ruleset.rules()[i];
            (!r.is_private()).then_some(r)
        })
    }

    pub fn non_matching_rules(&self) -> impl Iterator<Item = &'r RuleInfo> + '_ {
        let ruleset = self.ruleset;
        self.matched.iter_zeros().filter_map(move |i| {
            let r = &ruleset.rules()[i];
            (!r.is_private()).then_some(r)
        })
    }

    pub fn is_matching(&self, rule: RuleId) -> bool {
        self.matched[rule.index()]
    }
}

/// Drives scans against one frozen [`Ruleset`]. Cheap to construct; the
/// expensive, reusable part of a scan is the ruleset, not the scanner.
pub struct Scanner<'r> {
    ruleset: &'r Ruleset,
    timeout_secs: u64,
    verifier: Box<dyn PatternVerifier + 'r>,
}

impl<'r> Scanner<'r> {
    pub fn new(ruleset: &'r Ruleset) -> Self {
        Scanner { ruleset, timeout_secs: 0, verifier: Box::new(NullVerifier) }
    }

    /// Sets the wall-clock budget (`spec.md` §5); 0 (the default) means no
    /// timeout.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Plugs in a REGEXP sub-matcher. Without one, REGEXP strings never
    /// confirm (see [`crate::verify::NullVerifier`]).
    pub fn with_verifier(mut self, verifier: impl PatternVerifier + 'r) -> Self {
        self.verifier = Box::new(verifier);
        self
    }

    pub fn scan_memory(
        &self,
        data: &[u8],
        callback: &mut dyn ScanCallback,
    ) -> Result<ScanResults<'r>, ScanError> {
        self.scan_blocks(&single_block(data), callback)
    }

    pub fn scan_blocks(
        &self,
        blocks: &[MemoryBlock],
        callback: &mut dyn ScanCallback,
    ) -> Result<ScanResults<'r>, ScanError> {
        let _slot = self.ruleset.acquire_slot().map_err(|e| match e {
            crate::error::RulesetError::TooManyScanThreads(max) => ScanError::TooManyScanThreads { max },
            other => ScanError::Ruleset(other),
        })?;

        let deadline = vm::deadline_from_timeout(self.timeout_secs);
        let mut ctx = ScanContext::new(self.ruleset, deadline);

        // `spec.md` §4.7 step 3: "initialize modules" — this crate has no
        // module system of its own (`spec.md` §1), so the only thing it
        // can do at this seam is surface the declared import names through
        // the callback protocol; an embedder with real modules is expected
        // to react to `ImportModule` and answer with `ModuleImported`.
        for module in self.ruleset.imports() {
            callback.on_message(CallbackMsg::ImportModule(module));
            callback.on_message(CallbackMsg::ModuleImported(module));
        }

        let block_scan = panic::catch_unwind(AssertUnwindSafe(|| {
            block_scanner::scan_blocks(&mut ctx, blocks, self.verifier.as_ref())
        }));
        let overflowed = match block_scan {
            Ok(Ok(overflowed)) => overflowed,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(ScanError::MapFailure),
        };
        for string_id in overflowed {
            let rule = self.ruleset.rule(self.ruleset.string(string_id).owner_rule);
            match callback.on_message(CallbackMsg::TooManyMatches(rule, string_id)) {
                CallbackAction::Continue => {}
                CallbackAction::Abort => {
                    return Ok(ScanResults {
                        ruleset: self.ruleset,
                        matched: BitVec::repeat(false, self.ruleset.rules().len()),
                    })
                }
                CallbackAction::Error => return Err(ScanError::CallbackError),
            }
        }

        // Pass 1: evaluate every rule's own condition, in declaration order
        // so a `RuleRef` can see an earlier rule's verdict (`spec.md` §3).
        // GLOBAL suppression (below) hasn't been applied yet here, so a
        // rule referencing an earlier global rule sees its raw condition,
        // not whether that global's namespace ultimately qualifies —
        // forward-looking suppression isn't resolvable in a single
        // declaration-order pass, and this crate doesn't attempt it.
        for (i, rule) in self.ruleset.rules().iter().enumerate() {
            let rule_id = RuleId::from(i);
            let program = self.ruleset.program();
            let pc = rule.condition_pc;
            let eval = panic::catch_unwind(AssertUnwindSafe(|| vm::evaluate(program, pc, &ctx, ctx.deadline())));

            let matched = match eval {
                Ok(Ok(v)) => v,
                Ok(Err(VmError::Timeout)) => return Err(ScanError::Timeout),
                Ok(Err(_)) => return Err(ScanError::VmFault),
                Err(_) => return Err(ScanError::VmFault),
            };
            ctx.set_rule_result(rule_id, matched);
        }

        // Pass 2: `spec.md` §3's GLOBAL flag — a global rule whose own
        // condition is false suppresses every rule (global or not) in its
        // namespace, regardless of that rule's own condition.
        let mut namespace_ok = vec![true; self.ruleset.namespaces().len()];
        for (i, rule) in self.ruleset.rules().iter().enumerate() {
            if rule.is_global() && !ctx.rule_matched(RuleId::from(i)) {
                namespace_ok[rule.namespace.index()] = false;
            }
        }

        // Pass 3: report through the callback and assemble final results,
        // applying that suppression. PRIVATE rules are evaluated and still
        // count towards `ScanResults::is_matching`, but never reach the
        // callback or the public iterators (`spec.md` §4.7 step 7).
        let mut final_matched = BitVec::repeat(false, self.ruleset.rules().len());
        for (i, rule) in self.ruleset.rules().iter().enumerate() {
            let matched = ctx.rule_matched(RuleId::from(i)) && namespace_ok[rule.namespace.index()];
            final_matched.set(i, matched);

            if !rule.is_private() {
                let msg =
                    if matched { CallbackMsg::RuleMatching(rule) } else { CallbackMsg::RuleNotMatching(rule) };
                match callback.on_message(msg) {
                    CallbackAction::Continue => {}
                    // `spec.md` §4.7 step 7 / §7: ABORT stops reporting but
                    // is not an error — return the results gathered so far
                    // without emitting SCAN_FINISHED.
                    CallbackAction::Abort => return Ok(ScanResults { ruleset: self.ruleset, matched: final_matched }),
                    CallbackAction::Error => return Err(ScanError::CallbackError),
                }
            }
        }

        callback.on_message(CallbackMsg::ScanFinished);

        Ok(ScanResults { ruleset: self.ruleset, matched: final_matched })
    }

    /// Scans a file, reading it fully for anything under ~500MB and
    /// memory-mapping anything larger — the same threshold and rationale
    /// the teacher engine uses for its own `scan_file`.
    pub fn scan_file(
        &self,
        path: impl AsRef<Path>,
        callback: &mut dyn ScanCallback,
    ) -> Result<ScanResults<'r>, ScanError> {
        let path = path.as_ref();
        let mut file = std::fs::File::open(path)
            .map_err(|source| ScanError::OpenError { path: path.to_path_buf(), source })?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);

        let mut buffered;
        let mapped;
        let data: &[u8] = if size < 500_000_000 {
            buffered = Vec::with_capacity(size as usize);
            std::io::Read::read_to_end(&mut file, &mut buffered)
                .map_err(|source| ScanError::OpenError { path: path.to_path_buf(), source })?;
            &buffered
        } else {
            mapped = fmmap::MmapFile::open(path)
                .map_err(|source| ScanError::MapError { path: path.to_path_buf(), source })?;
            fmmap::MmapFileExt::as_slice(&mapped)
        };

        self.scan_memory(data, callback)
    }

    /// Scans an already-open file descriptor. Reads the descriptor's full
    /// contents into memory rather than mapping it, since a descriptor may
    /// not back a regular file; does not take ownership of `fd` — the
    /// caller is still responsible for closing it.
    #[cfg(unix)]
    pub fn scan_fd(
        &self,
        fd: std::os::unix::io::RawFd,
        callback: &mut dyn ScanCallback,
    ) -> Result<ScanResults<'r>, ScanError> {
        use std::os::unix::io::FromRawFd;
        if fd < 0 {
            return Err(ScanError::InvalidArgument(format!(
                "file descriptor must be non-negative, got {fd}"
            )));
        }
        let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
        let mut buf = Vec::new();
        let result = std::io::Read::read_to_end(&mut file, &mut buf)
            .map_err(|source| ScanError::OpenError { path: PathBuf::new(), source });
        std::mem::forget(file);
        result?;
        self.scan_memory(&buf, callback)
    }

    /// Scans a running process's memory via a pluggable [`ProcessMemorySource`]
    /// — enumerating a process's mappable regions is platform-specific and
    /// out of this crate's scope (`spec.md` §1).
    pub fn scan_process(
        &self,
        pid: u32,
        source: &dyn ProcessMemorySource,
        callback: &mut dyn ScanCallback,
    ) -> Result<ScanResults<'r>, ScanError> {
        let regions = source.read_regions(pid)?;
        let blocks: Vec<MemoryBlock> = regions.iter().map(|(base, data)| MemoryBlock::new(data, *base)).collect();
        self.scan_blocks(&blocks, callback)
    }
}
