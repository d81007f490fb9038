//! The condition evaluator (C6): a small stack-oriented bytecode VM.
//!
//! `spec.md` §4.5 delegates "detailed opcode semantics... to the VM
//! specification", but no such external VM spec exists in this corpus, so
//! this module defines the smallest instruction set that can express the
//! boolean combinators exercised by every scenario in `spec.md` §8 (string
//! existence, `and`/`or`/`not`, external-variable comparisons, and
//! rule-to-rule references for global/private rule composition).
//!
//! The dispatch loop is grounded on the explicit program-counter, decode-one
//! `match`-execute-one shape of `other_examples`' `…thompson/pikevm.rs`
//! (`PikeVM::try_match`), stripped of thread scheduling and epsilon
//! closures since a boolean condition program has neither — it just reads
//! match state and pushes/pops values.

use crate::ids::{PatternId, RuleId};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// One instruction of the condition bytecode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Pushes `true` iff the pattern has at least one confirmed match for
    /// the scan currently in progress.
    PushPatternMatched(PatternId),
    PushInt(i64),
    PushBool(bool),
    PushFloat(f64),
    /// Looks up an external variable by identifier and pushes its value.
    PushExternal(crate::ids::IdentId),
    And,
    Or,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Pushes `true` iff the referenced rule's `MATCH` flag is set for this
    /// scan — lets one rule's condition refer to another rule by name, the
    /// same way a YARA-style condition can test `other_rule`.
    RuleRef(RuleId),
    /// Ends the current rule's program; the top of the stack is the
    /// condition's boolean result.
    Return,
}

/// Values flowing through the evaluator's operand stack.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Float(f64),
    Str(String),
    Undefined,
}

impl Value {
    fn as_bool(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Undefined => false,
        }
    }
}

/// Error raised while evaluating a condition program.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("condition program ended without a Return instruction")]
    MissingReturn,
    #[error("operand stack underflow while executing opcode #{0}")]
    StackUnderflow(usize),
    #[error("evaluation exceeded the scan timeout")]
    Timeout,
    #[error("type mismatch: can't compare {0:?} with {1:?}")]
    TypeMismatch(Value, Value),
}

/// Anything the VM needs to ask its host about while executing: whether a
/// pattern matched, an external variable's value, or another rule's
/// verdict. Implemented by [`crate::scanner::context::ScanContext`].
pub trait VmHost {
    fn pattern_matched(&self, pattern_id: PatternId) -> bool;
    fn external_value(&self, ident: crate::ids::IdentId) -> Value;
    fn rule_matched(&self, rule_id: RuleId) -> bool;
}

/// A condition program together with the offset each rule's program
/// begins at, as described by `spec.md` §3 ("condition bytecode address")
/// and §4.6 ("a pointer to the first bytecode instruction").
#[derive(Default, Serialize, Deserialize)]
pub struct Program {
    code: Vec<Op>,
}

impl Program {
    pub fn new() -> Self {
        Program { code: Vec::new() }
    }

    /// Appends `ops` and returns the offset (`condition_pc`) their first
    /// instruction landed at.
    pub fn append(&mut self, ops: impl IntoIterator<Item = Op>) -> u32 {
        let start = self.code.len() as u32;
        self.code.extend(ops);
        start
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}

/// Executes one rule's condition program starting at `pc`, given a host
/// that can answer match-state questions.
///
/// Honors the same wall-clock timeout budget as the block scanner
/// (`spec.md` §4.5, §5): `deadline` is checked every instruction, which is
/// acceptable because condition programs are tiny compared to the
/// byte-at-a-time automaton walk.
pub fn evaluate(
    program: &Program,
    pc: u32,
    host: &dyn VmHost,
    deadline: Option<Instant>,
) -> Result<bool, VmError> {
    let mut stack: Vec<Value> = Vec::new();
    let mut ip = pc as usize;

    loop {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(VmError::Timeout);
            }
        }
        let op = program.code.get(ip).ok_or(VmError::MissingReturn)?;
        match op {
            Op::PushPatternMatched(p) => stack.push(Value::Bool(host.pattern_matched(*p))),
            Op::PushInt(v) => stack.push(Value::Int(*v)),
            Op::PushBool(v) => stack.push(Value::Bool(*v)),
            Op::PushFloat(v) => stack.push(Value::Float(*v)),
            Op::PushExternal(id) => stack.push(host.external_value(*id)),
            Op::RuleRef(r) => stack.push(Value::Bool(host.rule_matched(*r))),
            Op::Not => {
                let v = pop(&mut stack, ip)?;
                stack.push(Value::Bool(!v.as_bool()));
            }
            Op::And => {
                let b = pop(&mut stack, ip)?;
                let a = pop(&mut stack, ip)?;
                stack.push(Value::Bool(a.as_bool() && b.as_bool()));
            }
            Op::Or => {
                let b = pop(&mut stack, ip)?;
                let a = pop(&mut stack, ip)?;
                stack.push(Value::Bool(a.as_bool() || b.as_bool()));
            }
            Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                let b = pop(&mut stack, ip)?;
                let a = pop(&mut stack, ip)?;
                let ordering = compare(&a, &b)?;
                let result = match op {
                    Op::Eq => ordering == std::cmp::Ordering::Equal,
                    Op::Ne => ordering != std::cmp::Ordering::Equal,
                    Op::Lt => ordering == std::cmp::Ordering::Less,
                    Op::Le => ordering != std::cmp::Ordering::Greater,
                    Op::Gt => ordering == std::cmp::Ordering::Greater,
                    Op::Ge => ordering != std::cmp::Ordering::Less,
                    _ => unreachable!(),
                };
                stack.push(Value::Bool(result));
            }
            Op::Return => {
                let result = pop(&mut stack, ip)?;
                return Ok(result.as_bool());
            }
        }
        ip += 1;
    }
}

fn pop(stack: &mut Vec<Value>, ip: usize) -> Result<Value, VmError> {
    stack.pop().ok_or(VmError::StackUnderflow(ip))
}

fn compare(a: &Value, b: &Value) -> Result<std::cmp::Ordering, VmError> {
    use Value::*;
    match (a, b) {
        (Int(x), Int(y)) => Ok(x.cmp(y)),
        (Float(x), Float(y)) => x.partial_cmp(y).ok_or_else(|| VmError::TypeMismatch(a.clone(), b.clone())),
        (Int(x), Float(y)) => (*x as f64).partial_cmp(y).ok_or_else(|| VmError::TypeMismatch(a.clone(), b.clone())),
        (Float(x), Int(y)) => x.partial_cmp(&(*y as f64)).ok_or_else(|| VmError::TypeMismatch(a.clone(), b.clone())),
        (Bool(x), Bool(y)) => Ok(x.cmp(y)),
        (Str(x), Str(y)) => Ok(x.cmp(y)),
        _ => Err(VmError::TypeMismatch(a.clone(), b.clone())),
    }
}

/// `spec.md` §5: "The block scanner checks elapsed wall-clock time every
/// 4096 input bytes" and "The VM applies the same budget." This helper
/// turns a `timeout` in seconds (0 = no deadline) into an `Instant`.
pub fn deadline_from_timeout(timeout_secs: u64) -> Option<Instant> {
    if timeout_secs == 0 {
        None
    } else {
        Some(Instant::now() + Duration::from_secs(timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::IdentId;
    use std::collections::HashMap;

    struct FakeHost {
        matched_patterns: Vec<PatternId>,
        externals: HashMap<u32, Value>,
        matched_rules: Vec<RuleId>,
    }

    impl VmHost for FakeHost {
        fn pattern_matched(&self, pattern_id: PatternId) -> bool {
            self.matched_patterns.contains(&pattern_id)
        }
        fn external_value(&self, ident: IdentId) -> Value {
            self.externals.get(&ident.0).cloned().unwrap_or(Value::Undefined)
        }
        fn rule_matched(&self, rule_id: RuleId) -> bool {
            self.matched_rules.contains(&rule_id)
        }
    }

    #[test]
    fn single_pattern_condition() {
        let mut program = Program::new();
        let pc = program.append([Op::PushPatternMatched(PatternId(0)), Op::Return]);
        let host = FakeHost { matched_patterns: vec![PatternId(0)], externals: HashMap::new(), matched_rules: vec![] };
        assert!(evaluate(&program, pc, &host, None).unwrap());
    }

    #[test]
    fn and_or_not_combinators() {
        let mut program = Program::new();
        // not ($a) or ($b and $c)
        let pc = program.append([
            Op::PushPatternMatched(PatternId(0)),
            Op::Not,
            Op::PushPatternMatched(PatternId(1)),
            Op::PushPatternMatched(PatternId(2)),
            Op::And,
            Op::Or,
            Op::Return,
        ]);
        let host = FakeHost {
            matched_patterns: vec![PatternId(0)],
            externals: HashMap::new(),
            matched_rules: vec![],
        };
        // $a matched -> not($a) = false; $b,$c unmatched -> and = false; or = false
        assert!(!evaluate(&program, pc, &host, None).unwrap());
    }

    #[test]
    fn rule_reference() {
        let mut program = Program::new();
        let pc = program.append([Op::RuleRef(RuleId(3)), Op::Return]);
        let host = FakeHost { matched_patterns: vec![], externals: HashMap::new(), matched_rules: vec![RuleId(3)] };
        assert!(evaluate(&program, pc, &host, None).unwrap());
    }

    #[test]
    fn external_variable_comparison() {
        let mut program = Program::new();
        let pc = program.append([
            Op::PushExternal(IdentId(0)),
            Op::PushInt(10),
            Op::Gt,
            Op::Return,
        ]);
        let mut externals = HashMap::new();
        externals.insert(0, Value::Int(42));
        let host = FakeHost { matched_patterns: vec![], externals, matched_rules: vec![] };
        assert!(evaluate(&program, pc, &host, None).unwrap());
    }

    #[test]
    fn missing_return_is_an_error() {
        let program = Program::new();
        let host = FakeHost { matched_patterns: vec![], externals: HashMap::new(), matched_rules: vec![] };
        assert!(matches!(evaluate(&program, 0, &host, None), Err(VmError::MissingReturn)));
    }

    #[test]
    fn stack_underflow_is_an_error() {
        let mut program = Program::new();
        let pc = program.append([Op::And, Op::Return]);
        let host = FakeHost { matched_patterns: vec![], externals: HashMap::new(), matched_rules: vec![] };
        assert!(matches!(evaluate(&program, pc, &host, None), Err(VmError::StackUnderflow(_))));
    }

    #[test]
    fn timeout_is_honored() {
        let mut program = Program::new();
        let pc = program.append([Op::PushBool(true), Op::Return]);
        let host = FakeHost { matched_patterns: vec![], externals: HashMap::new(), matched_rules: vec![] };
        let past_deadline = Some(Instant::now() - Duration::from_secs(1));
        assert!(matches!(evaluate(&program, pc, &host, past_deadline), Err(VmError::Timeout)));
    }
}
