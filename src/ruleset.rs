//! The compiled-ruleset container (C7): the frozen bundle a caller hands to
//! the scanner, plus its save/load contract (`spec.md` §3, §4.6, §6).
//!
//! `Ruleset` is immutable-after-build in its automaton and rule/namespace/
//! string records, exactly as `spec.md` requires ("never mutated except
//! for per-thread-slot transient flags and per-string transient match
//! lists"). Per §3's adopted redesign, this crate keeps *no* per-slot
//! transient arrays on the ruleset at all — those live in
//! [`crate::scanner::context::ScanContext`] instead — so `Ruleset` needs no
//! interior mutability beyond the thread-slot bitmask itself, and is
//! trivially `Sync`.

use crate::arena::{Arena, ArenaSlice};
use crate::automaton::{Automaton, AutomatonBuilder};
use crate::error::{ArenaError, RulesetError};
use crate::ids::{IdentId, NamespaceId, PatternId, RuleId, StringId};
use crate::variables::{Value as VariableValue, Variables};
use crate::vm::{Op, Program};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::Mutex;

/// `spec.md` §4.7, step 1: "find the lowest zero bit in `tidx_mask`; if >=
/// `MAX_THREADS`, fail". 64 concurrent scans per ruleset is generous for a
/// crate whose own hot loop is CPU-bound rather than I/O-bound.
pub const MAX_THREADS: usize = 64;

bitflags::bitflags! {
    /// `spec.md` §3: "a flags word (PRIVATE, GLOBAL)".
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RuleFlags: u8 {
        const PRIVATE = 0b01;
        const GLOBAL  = 0b10;
    }
}

bitflags::bitflags! {
    /// `spec.md` §3: "flags (ASCII/WIDE/NOCASE/REGEXP/HEX/FULL-WORD/AT/IN
    /// anchors, etc.)".
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct StringFlags: u16 {
        const ASCII    = 0b0000_0001;
        const WIDE     = 0b0000_0010;
        const NOCASE   = 0b0000_0100;
        const REGEXP   = 0b0000_1000;
        const HEX      = 0b0001_0000;
        const FULLWORD = 0b0010_0000;
        const ANCHORED = 0b0100_0000;
    }
}

/// Anchor constraint on where a string's match may start.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Anchor {
    None,
    /// Must match with its first byte exactly at this offset.
    At(u64),
    /// Must match with its first byte within `[start, end)`.
    In(u64, u64),
}

/// One declared `$identifier = pattern` inside a rule (`spec.md`'s "String"
/// entity, renamed to avoid shadowing `std::string::String`).
#[derive(Clone, Serialize, Deserialize)]
pub struct StringInfo {
    pub ident: ArenaSlice,
    pub owner_rule: RuleId,
    pub flags: StringFlags,
    pub anchor: Anchor,
    /// Raw pattern bytes as declared (before case/width expansion).
    pub pattern: ArenaSlice,
    /// `Some` for HEX strings containing wildcard nibbles: one entry per
    /// byte of `pattern`, `None` meaning "any byte".
    pub hex_mask: Option<Vec<Option<u8>>>,
    /// The AC automaton pattern ids produced for this string. More than one
    /// when WIDE expansion needs both a wide and an ascii leaf (each gets
    /// its own leaf, both pointing back here); exactly one otherwise.
    pub leaves: Vec<PatternId>,
    /// For HEX strings, the byte offset of the leaf atom within `pattern` —
    /// the automaton only ever indexes the longest run of non-wildcard
    /// bytes, so the full masked window starts `atom_offset` bytes before
    /// wherever that atom was found. Always 0 for non-HEX strings.
    pub atom_offset: u32,
}

/// A rule: identifier, namespace, strings, condition, flags
/// (`spec.md` §3).
#[derive(Clone, Serialize, Deserialize)]
pub struct RuleInfo {
    pub ident: ArenaSlice,
    pub namespace: NamespaceId,
    pub strings: Vec<StringId>,
    pub condition_pc: u32,
    pub flags: RuleFlags,
}

impl RuleInfo {
    pub fn is_private(&self) -> bool {
        self.flags.contains(RuleFlags::PRIVATE)
    }
    pub fn is_global(&self) -> bool {
        self.flags.contains(RuleFlags::GLOBAL)
    }
}

/// A namespace: identifier plus the rules in it (`spec.md` §3).
#[derive(Clone, Serialize, Deserialize)]
pub struct NamespaceInfo {
    pub ident: ArenaSlice,
}

/// On-disk header written before the serialized snapshot, giving
/// `spec.md` §4.6/§6's "header ... carrying the code start, rule-list
/// head, externals-list head, and table bases (each stored as an
/// arena-relative offset)" a literal, checkable presence in the stream,
/// and letting `load` reject a format mismatch before attempting the
/// (possibly large, possibly malformed) body deserialize.
#[derive(Serialize, Deserialize)]
struct RulesetHeader {
    format_version: u32,
    code_start: u32,
    rules_list_head: u32,
    externals_list_head: u32,
    automaton_state_count: u32,
}

const FORMAT_VERSION: u32 = 1;

/// Everything that gets serialized. Split out from `Ruleset` because the
/// live object also carries the non-serializable thread-slot mutex.
#[derive(Serialize, Deserialize)]
struct RulesetData {
    arena: Arena,
    automaton: Automaton,
    /// A second trie, built over lowercased bytes, holding only the leaves
    /// of NOCASE strings. A single case-sensitive trie can never recognize
    /// a differently-cased occurrence no matter what the block scanner
    /// confirms afterwards, so case-insensitivity has to be a property of
    /// which automaton indexes the pattern, not of post-hoc verification.
    /// The block scanner walks this one in parallel, lowercasing each
    /// input byte before feeding it in (`spec.md` §9 sanctions adapting the
    /// automaton's shape as long as the matched language is unchanged).
    automaton_nocase: Automaton,
    namespaces: Vec<NamespaceInfo>,
    rules: Vec<RuleInfo>,
    strings: Vec<StringInfo>,
    /// `pattern_owner[pattern_id]` is the string that leaf belongs to,
    /// regardless of which of the two automata above produced the match.
    pattern_owner: Vec<StringId>,
    program: Program,
    externals: Variables,
    /// Names of built-in modules referenced by `import` statements
    /// (`spec.md` §6, `IMPORT_MODULE`/`MODULE_IMPORTED` messages). Module
    /// *resolution* is an out-of-scope collaborator; this crate only keeps
    /// the list of names a scan needs to ask about.
    imports: Vec<String>,
}

/// The frozen, shareable ruleset. `spec.md` §3's "Ruleset (frozen)".
pub struct Ruleset {
    data: RulesetData,
    slot_mask: Mutex<u64>,
}

// Safety/ergonomics note: `Ruleset` is `Sync` because its only interior
// mutability is the thread-slot `Mutex`; every other field is read-only
// after construction, matching spec.md §5's "A single Ruleset is shared by
// all scan threads... read-only in its automaton and rule/string records."

impl Ruleset {
    pub fn namespaces(&self) -> &[NamespaceInfo] {
        &self.data.namespaces
    }

    pub fn rules(&self) -> &[RuleInfo] {
        &self.data.rules
    }

    pub fn rule(&self, id: RuleId) -> &RuleInfo {
        &self.data.rules[id.index()]
    }

    pub fn namespace(&self, id: NamespaceId) -> &NamespaceInfo {
        &self.data.namespaces[id.index()]
    }

    pub fn string(&self, id: StringId) -> &StringInfo {
        &self.data.strings[id.index()]
    }

    pub fn strings(&self) -> &[StringInfo] {
        &self.data.strings
    }

    pub fn automaton(&self) -> &Automaton {
        &self.data.automaton
    }

    pub fn automaton_nocase(&self) -> &Automaton {
        &self.data.automaton_nocase
    }

    /// The string that produced a given leaf pattern id, in either
    /// automaton.
    pub fn pattern_owner(&self, id: PatternId) -> StringId {
        self.data.pattern_owner[id.index()]
    }

    pub fn program(&self) -> &Program {
        &self.data.program
    }

    pub fn num_patterns(&self) -> usize {
        self.data.strings.iter().map(|s| s.leaves.len()).sum()
    }

    pub fn imports(&self) -> &[String] {
        &self.data.imports
    }

    pub fn ident(&self, s: ArenaSlice) -> &str {
        self.data.arena.get_str(s)
    }

    pub fn rule_name(&self, id: RuleId) -> &str {
        self.ident(self.rule(id).ident)
    }

    pub fn namespace_name(&self, id: NamespaceId) -> &str {
        self.ident(self.namespace(id).ident)
    }

    pub fn string_ident(&self, id: StringId) -> &str {
        self.ident(self.string(id).ident)
    }

    pub fn pattern_bytes(&self, id: StringId) -> &[u8] {
        self.data.arena.get_bytes(self.string(id).pattern)
    }

    // ---- external variables ----

    pub fn external(&self, name: &str) -> Option<&crate::variables::ExternalVariable> {
        self.data.externals.get(name)
    }

    /// `spec.md` §4.7's `define_*_variable`. Unlike the original engine,
    /// which requires callers to manually ensure no scan is in progress,
    /// these take `&mut self` — the borrow checker enforces the "no
    /// concurrent scan" discipline for us, since a live `Scanner` holds a
    /// shared `&Ruleset` for the duration of its scan.
    pub fn define_integer_variable(&mut self, name: &str, value: i64) -> Result<(), crate::error::VariableError> {
        self.data.externals.define_integer(name, value)
    }
    pub fn define_boolean_variable(&mut self, name: &str, value: bool) -> Result<(), crate::error::VariableError> {
        self.data.externals.define_boolean(name, value)
    }
    pub fn define_float_variable(&mut self, name: &str, value: f64) -> Result<(), crate::error::VariableError> {
        self.data.externals.define_float(name, value)
    }
    pub fn define_string_variable(&mut self, name: &str, value: impl Into<String>) -> Result<(), crate::error::VariableError> {
        self.data.externals.define_string(name, value)
    }

    /// External variables are addressed in bytecode by declaration-order
    /// index (`IdentId`), since that's the only identifier numbering the
    /// builder (standing in for the out-of-scope compiler) has a reason to
    /// assign.
    pub(crate) fn external_vm_value(&self, ident: IdentId) -> crate::vm::Value {
        self.data
            .externals
            .0
            .get(ident.index())
            .map(|v| v.value.to_vm_value())
            .unwrap_or(crate::vm::Value::Undefined)
    }

    // ---- thread slots (spec.md §4.7 step 1, §5, §9) ----

    /// Acquires a scan slot: finds the lowest zero bit in the bitmask under
    /// the ruleset mutex, sets it, and returns a handle that releases it on
    /// drop. No array on the ruleset is indexed by the slot (per the
    /// adopted redesign in `spec.md` §9); it exists purely to bound and
    /// count concurrent scans as the spec's `TOO_MANY_SCAN_THREADS`
    /// behavior requires.
    pub fn acquire_slot(&self) -> Result<ScanSlotGuard<'_>, RulesetError> {
        let mut mask = self.slot_mask.lock().unwrap();
        let free = (0..MAX_THREADS).find(|i| mask & (1u64 << i) == 0);
        match free {
            Some(bit) => {
                *mask |= 1u64 << bit;
                log::trace!("acquired scan slot {bit}");
                Ok(ScanSlotGuard { ruleset: self, slot: bit })
            }
            None => {
                log::warn!("scan slot exhausted: {MAX_THREADS} concurrent scans already active");
                Err(RulesetError::TooManyScanThreads(MAX_THREADS))
            }
        }
    }

    pub fn active_scan_count(&self) -> usize {
        self.slot_mask.lock().unwrap().count_ones() as usize
    }

    /// `spec.md` §4.6: "save_stream asserts tidx_mask == 0."
    pub fn save<W: Write>(&self, w: &mut W) -> Result<(), RulesetError> {
        let active = self.active_scan_count();
        if active != 0 {
            return Err(RulesetError::ScansInProgress(active));
        }
        let header = RulesetHeader {
            format_version: FORMAT_VERSION,
            code_start: 0,
            rules_list_head: 0,
            externals_list_head: 0,
            automaton_state_count: self.data.automaton.state_count() as u32,
        };
        bincode::serialize_into(&mut *w, &header).map_err(|e| ArenaError::Corrupt(e.to_string()))?;
        bincode::serialize_into(&mut *w, &self.data).map_err(|e| ArenaError::Corrupt(e.to_string()))?;
        Ok(())
    }

    pub fn load<R: Read>(r: &mut R) -> Result<Self, RulesetError> {
        let header: RulesetHeader =
            bincode::deserialize_from(&mut *r).map_err(|e| ArenaError::Corrupt(e.to_string()))?;
        if header.format_version != FORMAT_VERSION {
            return Err(RulesetError::UnsupportedVersion {
                found: header.format_version,
                expected: FORMAT_VERSION,
            });
        }
        let data: RulesetData =
            bincode::deserialize_from(&mut *r).map_err(|e| ArenaError::Corrupt(e.to_string()))?;
        Ok(Ruleset { data, slot_mask: Mutex::new(0) })
    }
}

/// RAII guard releasing a thread slot on drop, guaranteeing the teardown
/// step "release the thread slot under the mutex" (`spec.md` §4.7 step 9)
/// runs on every exit path — including panics unwinding through it.
pub struct ScanSlotGuard<'r> {
    ruleset: &'r Ruleset,
    pub(crate) slot: usize,
}

impl Drop for ScanSlotGuard<'_> {
    fn drop(&mut self) {
        let mut mask = self.ruleset.slot_mask.lock().unwrap();
        *mask &= !(1u64 << self.slot);
        log::trace!("released scan slot {}", self.slot);
    }
}

// ---------------------------------------------------------------------
// Builder: stands in for the out-of-scope rule-source compiler so this
// crate's own tests (and any embedder without a text-rule compiler) can
// assemble a Ruleset programmatically. Owns the part of "compiled-ruleset
// container format" that is in scope: the format itself, not the source
// language compiling into it.
// ---------------------------------------------------------------------

/// A string declaration as given to the builder, before AC-leaf expansion.
pub struct StringDecl {
    pub ident: String,
    pub pattern: Vec<u8>,
    pub flags: StringFlags,
    pub anchor: Anchor,
    pub hex_mask: Option<Vec<Option<u8>>>,
}

impl StringDecl {
    pub fn ascii(ident: &str, pattern: &[u8]) -> Self {
        StringDecl {
            ident: ident.to_string(),
            pattern: pattern.to_vec(),
            flags: StringFlags::ASCII,
            anchor: Anchor::None,
            hex_mask: None,
        }
    }

    pub fn with_flags(mut self, flags: StringFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_anchor(mut self, anchor: Anchor) -> Self {
        self.anchor = anchor;
        self
    }
}

/// A rule declaration as given to the builder.
pub struct RuleDecl {
    pub ident: String,
    pub namespace: String,
    pub flags: RuleFlags,
    pub strings: Vec<StringDecl>,
    pub condition: Vec<Op>,
}

pub struct RulesetBuilder {
    arena: Arena,
    namespaces: Vec<NamespaceInfo>,
    namespace_names: Vec<String>,
    rules: Vec<RuleInfo>,
    strings: Vec<StringInfo>,
    program: Program,
    externals: Variables,
    imports: Vec<String>,
    ac: AutomatonBuilder,
    ac_nocase: AutomatonBuilder,
    pattern_owner: Vec<StringId>,
    next_pattern_id: u32,
}

impl RulesetBuilder {
    pub fn new() -> Self {
        RulesetBuilder {
            arena: Arena::new(),
            namespaces: Vec::new(),
            namespace_names: Vec::new(),
            rules: Vec::new(),
            strings: Vec::new(),
            program: Program::new(),
            externals: Variables::new(),
            imports: Vec::new(),
            ac: AutomatonBuilder::new(),
            ac_nocase: AutomatonBuilder::new(),
            pattern_owner: Vec::new(),
            next_pattern_id: 0,
        }
    }

    pub fn declare_external(&mut self, name: &str, initial: VariableValue) -> &mut Self {
        self.externals.declare(name, initial);
        self
    }

    pub fn declare_import(&mut self, module: &str) -> &mut Self {
        self.imports.push(module.to_string());
        self
    }

    fn namespace_id(&mut self, name: &str) -> Result<NamespaceId, ArenaError> {
        if let Some(pos) = self.namespace_names.iter().position(|n| n == name) {
            return Ok(NamespaceId::from(pos));
        }
        let ident = self.arena.allocate_bytes(name.as_bytes())?;
        self.namespaces.push(NamespaceInfo { ident });
        self.namespace_names.push(name.to_string());
        Ok(NamespaceId::from(self.namespaces.len() - 1))
    }

    /// Adds one rule and all its strings, expanding NOCASE/WIDE string
    /// declarations into one AC leaf pattern per case/width variant.
    pub fn add_rule(&mut self, decl: RuleDecl) -> Result<RuleId, ArenaError> {
        let namespace = self.namespace_id(&decl.namespace)?;
        let ident = self.arena.allocate_bytes(decl.ident.as_bytes())?;

        let rule_id = RuleId::from(self.rules.len());
        let mut string_ids = Vec::with_capacity(decl.strings.len());

        for s in decl.strings {
            let string_id = StringId::from(self.strings.len());
            let s_ident = self.arena.allocate_bytes(s.ident.as_bytes())?;
            let pattern_slice = self.arena.allocate_bytes(&s.pattern)?;

            let mut leaves = Vec::new();
            let mut atom_offset = 0u32;

            if s.flags.contains(StringFlags::HEX) {
                // Real hex-string compilers face the same problem: a trie
                // can only index concrete bytes, so whatever wildcard
                // nibbles the declaration has, scanning works by finding
                // the longest *concrete* run (the "atom") and confirming
                // the rest of the mask afterwards against the surrounding
                // bytes (see `crate::verify`).
                let mask = s
                    .hex_mask
                    .clone()
                    .unwrap_or_else(|| s.pattern.iter().map(|&b| Some(b)).collect());
                let (offset, atom) = longest_concrete_run(&mask);
                atom_offset = offset as u32;
                if !atom.is_empty() {
                    let pid = PatternId(self.next_pattern_id);
                    self.next_pattern_id += 1;
                    self.ac.add_pattern(&atom, pid);
                    self.pattern_owner.push(string_id);
                    leaves.push(pid);
                } else {
                    log::warn!(
                        "hex string `{}` has no concrete atom (all wildcards) and can never be found by the scanner",
                        s.ident
                    );
                }
            } else {
                let nocase = s.flags.contains(StringFlags::NOCASE);
                for variant in expand_variants(&s.pattern, s.flags) {
                    let pid = PatternId(self.next_pattern_id);
                    self.next_pattern_id += 1;
                    if nocase {
                        self.ac_nocase.add_pattern(&variant, pid);
                    } else {
                        self.ac.add_pattern(&variant, pid);
                    }
                    self.pattern_owner.push(string_id);
                    leaves.push(pid);
                }
            }

            self.strings.push(StringInfo {
                ident: s_ident,
                owner_rule: rule_id,
                flags: s.flags,
                anchor: s.anchor,
                pattern: pattern_slice,
                hex_mask: s.hex_mask,
                leaves,
                atom_offset,
            });
            string_ids.push(string_id);
        }

        let condition_pc = self.program.append(decl.condition);

        self.rules.push(RuleInfo {
            ident,
            namespace,
            strings: string_ids,
            condition_pc,
            flags: decl.flags,
        });

        Ok(rule_id)
    }

    pub fn build(self) -> Ruleset {
        Ruleset {
            data: RulesetData {
                arena: self.arena,
                automaton: self.ac.build(),
                automaton_nocase: self.ac_nocase.build(),
                namespaces: self.namespaces,
                rules: self.rules,
                strings: self.strings,
                pattern_owner: self.pattern_owner,
                program: self.program,
                externals: self.externals,
                imports: self.imports,
            },
            slot_mask: Mutex::new(0),
        }
    }
}

impl Default for RulesetBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Expands a declared pattern into the literal byte strings fed to an
/// automaton: WIDE (UTF-16LE spacing) and ASCII each get their own variant
/// when both are requested, and NOCASE lowercases every variant so it can
/// be handed to the builder's nocase automaton instead of the case-sensitive
/// trie — see the field comment on `RulesetData::automaton_nocase` for why
/// that has to happen here rather than at verify time.
fn expand_variants(pattern: &[u8], flags: StringFlags) -> Vec<Vec<u8>> {
    let mut variants = Vec::new();
    if flags.contains(StringFlags::WIDE) {
        let mut wide = Vec::with_capacity(pattern.len() * 2);
        for &b in pattern {
            wide.push(b);
            wide.push(0);
        }
        variants.push(wide);
    }
    if flags.contains(StringFlags::ASCII) || !flags.contains(StringFlags::WIDE) {
        variants.push(pattern.to_vec());
    }
    if flags.contains(StringFlags::NOCASE) {
        for v in &mut variants {
            v.make_ascii_lowercase();
        }
    }
    variants
}

/// Finds the longest run of concrete (non-wildcard) bytes in a hex mask,
/// returning its start offset and the bytes themselves. Ties keep the
/// earliest run.
fn longest_concrete_run(mask: &[Option<u8>]) -> (usize, Vec<u8>) {
    let (mut best_start, mut best_len) = (0, 0);
    let (mut cur_start, mut cur_len) = (0, 0);
    for (i, b) in mask.iter().enumerate() {
        if b.is_some() {
            if cur_len == 0 {
                cur_start = i;
            }
            cur_len += 1;
            if cur_len > best_len {
                best_len = cur_len;
                best_start = cur_start;
            }
        } else {
            cur_len = 0;
        }
    }
    let atom = mask[best_start..best_start + best_len].iter().map(|b| b.unwrap()).collect();
    (best_start, atom)
}
