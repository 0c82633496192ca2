//! Thrown-value constructors
//!
//! Runtime failures travel up the fiber call stack as plain values; a `try`
//! form can intercept and bind them. These helpers build the conventional
//! string payloads for each failure kind.

use crate::value::Value;
use std::fmt::Display;

pub fn arity_error(name: &str, want: impl Display, got: usize) -> Value {
    Value::string(format!(
        "arity-error: {name} requires {want} args, given {got}"
    ))
}

pub fn type_error(msg: impl Display) -> Value {
    Value::string(format!("type-error: {msg}"))
}

pub fn unbound_error(name: &str) -> Value {
    Value::string(format!("unbound-error: symbol '{name}' is not bound"))
}

pub fn index_error(index: i64, len: usize) -> Value {
    Value::string(format!(
        "index-error: index {index} out of range for length {len}"
    ))
}

pub fn arithmetic_error(msg: impl Display) -> Value {
    Value::string(format!("arithmetic-error: {msg}"))
}

pub fn syntax_error(msg: impl Display) -> Value {
    Value::string(format!("syntax-error: {msg}"))
}
