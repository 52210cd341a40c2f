//! Declared operator attributes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Result, TilingError};

/// A named, typed scalar or list attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    IntList(Vec<i64>),
}

impl AttrValue {
    fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::IntList(_) => "int list",
        }
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(v: Vec<i64>) -> Self {
        Self::IntList(v)
    }
}

/// Attribute map of one operator node. Absent attributes take the
/// caller-supplied default; present attributes of the wrong kind are errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttrMap {
    values: BTreeMap<String, AttrValue>,
}

impl AttrMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<AttrValue>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<AttrValue>) {
        self.values.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.values.get(name)
    }

    pub fn int_or(&self, op: &str, name: &str, default: i64) -> Result<i64> {
        match self.values.get(name) {
            None => Ok(default),
            Some(AttrValue::Int(v)) => Ok(*v),
            Some(other) => Err(wrong_kind(op, name, "int", other)),
        }
    }

    /// Booleans also accept 0/1 integers, which is how some graphs encode them.
    pub fn bool_or(&self, op: &str, name: &str, default: bool) -> Result<bool> {
        match self.values.get(name) {
            None => Ok(default),
            Some(AttrValue::Bool(v)) => Ok(*v),
            Some(AttrValue::Int(0)) => Ok(false),
            Some(AttrValue::Int(1)) => Ok(true),
            Some(other) => Err(wrong_kind(op, name, "bool", other)),
        }
    }

    pub fn float_or(&self, op: &str, name: &str, default: f64) -> Result<f64> {
        match self.values.get(name) {
            None => Ok(default),
            Some(AttrValue::Float(v)) => Ok(*v),
            Some(AttrValue::Int(v)) => Ok(*v as f64),
            Some(other) => Err(wrong_kind(op, name, "float", other)),
        }
    }

    pub fn str_or<'a>(&'a self, op: &str, name: &str, default: &'a str) -> Result<&'a str> {
        match self.values.get(name) {
            None => Ok(default),
            Some(AttrValue::Str(v)) => Ok(v.as_str()),
            Some(other) => Err(wrong_kind(op, name, "string", other)),
        }
    }
}

fn wrong_kind(op: &str, name: &str, expected: &str, found: &AttrValue) -> TilingError {
    TilingError::attribute(op, name, format!("expected {expected}, found {}", found.kind()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_absent() {
        let attrs = AttrMap::new();
        assert_eq!(attrs.int_or("op", "dim", -1).unwrap(), -1);
        assert!(!attrs.bool_or("op", "activate_left", false).unwrap());
        assert_eq!(attrs.str_or("op", "approximate", "none").unwrap(), "none");
    }

    #[test]
    fn integer_bools() {
        let attrs = AttrMap::new().with("flag", 1i64);
        assert!(attrs.bool_or("op", "flag", false).unwrap());
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let attrs = AttrMap::new().with("dim", "last");
        let err = attrs.int_or("ge_glu_grad_v2", "dim", -1).unwrap_err();
        assert!(err.to_string().contains("expected int, found string"));
    }
}
