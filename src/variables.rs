//! External variables: named values injected from outside the ruleset and
//! readable by conditions (`spec.md` §3, §4.7, §9).
//!
//! The original engine stores these as a sentinel-terminated linked list
//! with borrowed-or-owned string values; a linear scan over them is
//! explicitly called out in `spec.md` §9 as "acceptable because the count
//! is small". This crate keeps the linear scan (there's rarely more than a
//! handful of external variables) but drops the borrowed/owned string
//! distinction: Rust ownership makes "borrowed for the ruleset's lifetime"
//! awkward to express safely across `define_string_variable` calls that
//! must replace the old value, so string values are always owned.

use crate::error::VariableError;
use crate::vm::Value as VmValue;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Integer(i64),
    Boolean(bool),
    Float(f64),
    String(String),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Integer(_) => "integer",
            Value::Boolean(_) => "boolean",
            Value::Float(_) => "float",
            Value::String(_) => "string",
        }
    }

    pub(crate) fn to_vm_value(&self) -> VmValue {
        match self {
            Value::Integer(v) => VmValue::Int(*v),
            Value::Boolean(v) => VmValue::Bool(*v),
            Value::Float(v) => VmValue::Float(*v),
            Value::String(v) => VmValue::Str(v.clone()),
        }
    }
}

/// One entry in the ruleset's external-variable list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExternalVariable {
    pub name: String,
    pub value: Value,
}

/// The sentinel-terminated list of `spec.md` §3, represented as a plain
/// `Vec` — the "sentinel" in a `Vec<T>` is just its end, so no explicit
/// terminator record is needed.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Variables(pub Vec<ExternalVariable>);

impl Variables {
    pub fn new() -> Self {
        Variables(Vec::new())
    }

    pub fn declare(&mut self, name: impl Into<String>, initial: Value) {
        self.0.push(ExternalVariable { name: name.into(), value: initial });
    }

    pub fn get(&self, name: &str) -> Option<&ExternalVariable> {
        self.0.iter().find(|v| v.name == name)
    }

    fn find_mut(&mut self, name: &str) -> Result<&mut ExternalVariable, VariableError> {
        self.0
            .iter_mut()
            .find(|v| v.name == name)
            .ok_or_else(|| VariableError::Undeclared(name.to_string()))
    }

    fn set_typed(&mut self, name: &str, value: Value) -> Result<(), VariableError> {
        let slot = self.find_mut(name)?;
        if std::mem::discriminant(&slot.value) != std::mem::discriminant(&value) {
            return Err(VariableError::InvalidType {
                variable: name.to_string(),
                expected_type: slot.value.type_name(),
                actual_type: value.type_name(),
            });
        }
        // Assigning replaces (and drops) whatever the previous value owned,
        // which for `Value::String` is the "free the previous owned
        // string" step `spec.md` §4.7 calls out explicitly.
        slot.value = value;
        Ok(())
    }

    pub fn define_integer(&mut self, name: &str, value: i64) -> Result<(), VariableError> {
        self.set_typed(name, Value::Integer(value))
    }

    pub fn define_boolean(&mut self, name: &str, value: bool) -> Result<(), VariableError> {
        self.set_typed(name, Value::Boolean(value))
    }

    pub fn define_float(&mut self, name: &str, value: f64) -> Result<(), VariableError> {
        self.set_typed(name, Value::Float(value))
    }

    pub fn define_string(&mut self, name: &str, value: impl Into<String>) -> Result<(), VariableError> {
        self.set_typed(name, Value::String(value.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn define_updates_existing_variable() {
        let mut vars = Variables::new();
        vars.declare("counter", Value::Integer(0));
        vars.define_integer("counter", 42).unwrap();
        assert_eq!(vars.get("counter").unwrap().value, Value::Integer(42));
    }

    #[test]
    fn define_unknown_identifier_fails() {
        let mut vars = Variables::new();
        let err = vars.define_integer("nope", 1);
        assert!(matches!(err, Err(VariableError::Undeclared(_))));
    }

    #[test]
    fn define_wrong_type_fails() {
        let mut vars = Variables::new();
        vars.declare("flag", Value::Boolean(false));
        let err = vars.define_integer("flag", 1);
        assert!(matches!(err, Err(VariableError::InvalidType { .. })));
    }

    #[test]
    fn redefining_string_drops_previous_value() {
        let mut vars = Variables::new();
        vars.declare("name", Value::String("old".into()));
        vars.define_string("name", "new").unwrap();
        assert_eq!(vars.get("name").unwrap().value, Value::String("new".into()));
    }
}
