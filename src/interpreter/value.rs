//=====================================================
// File: interpreter/value.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Runtime values of the script interpreter
// Objective: Value representation, host object seam, display and JSON export
//=====================================================

use super::RuntimeError;
use crate::ast::{Expr, Stmt};
use serde::{Serialize, Serializer};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Object supplied by the embedding application.
///
/// Scripts reach host objects only through bindings. Every method call and
/// property read on one is checked against the whitelist under the name
/// returned by [`HostObject::type_name`].
pub trait HostObject: fmt::Debug + Send + Sync {
    fn type_name(&self) -> &str;

    fn get_property(&self, name: &str) -> Result<Value, RuntimeError> {
        Err(RuntimeError::TypeError(format!(
            "{} has no property '{}'",
            self.type_name(),
            name
        )))
    }

    fn call_method(&self, name: &str, args: Vec<Value>) -> Result<Value, RuntimeError>;
}

/// Body of a script-defined function.
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionBody {
    Block(Vec<Stmt>),
    Expr(Expr),
}

/// Script-defined function or lambda with its captured variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptFunction {
    pub name: String,
    pub params: Vec<String>,
    pub body: FunctionBody,
    pub closure: HashMap<String, Value>,
}

/// Runtime value types
#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Function(Arc<ScriptFunction>),
    Host(Arc<dyn HostObject>),
    Null,
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;

        match (self, other) {
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Int(a), Float(b)) | (Float(b), Int(a)) => (*a as f64) == *b,
            (Bool(a), Bool(b)) => a == b,
            (String(a), String(b)) => a == b,
            (Array(a), Array(b)) => a == b,
            (Map(a), Map(b)) => a == b,
            (Function(a), Function(b)) => Arc::ptr_eq(a, b) || a == b,
            (Host(a), Host(b)) => Arc::ptr_eq(a, b),
            (Null, Null) => true,
            _ => false,
        }
    }
}

impl Value {
    pub fn host(object: impl HostObject + 'static) -> Self {
        Value::Host(Arc::new(object))
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Null => false,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
            Value::Function(_) | Value::Host(_) => true,
        }
    }

    /// Owner type name used for whitelist lookups.
    pub fn type_name(&self) -> &str {
        match self {
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::Bool(_) => "Bool",
            Value::String(_) => "String",
            Value::Array(_) => "Array",
            Value::Map(_) => "Map",
            Value::Function(_) => "Function",
            Value::Host(object) => object.type_name(),
            Value::Null => "Null",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Parse a command-line style literal: numbers and booleans keep their
    /// type, everything else becomes a string.
    pub fn from_literal(text: &str) -> Self {
        if let Ok(n) = text.parse::<i64>() {
            return Value::Int(n);
        }
        if let Ok(f) = text.parse::<f64>() {
            return Value::Float(f);
        }
        match text {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            "null" => Value::Null,
            other => Value::String(other.to_string()),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Int(n) => JsonValue::from(*n),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Array(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => JsonValue::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
            Value::Function(_) | Value::Host(_) => JsonValue::String(self.to_string()),
            Value::Null => JsonValue::Null,
        }
    }

    /// Script value for a JSON document, e.g. a host-supplied binding.
    pub fn from_json(json: JsonValue) -> Self {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => Value::String(s),
            JsonValue::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            JsonValue::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(key, value)| (key, Value::from_json(value)))
                    .collect(),
            ),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::Array(value)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", x),
            Value::Bool(b) => write!(f, "{}", b),
            Value::String(s) => write!(f, "{}", s),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                write!(f, "}}")
            }
            Value::Function(function) => write!(f, "<function {}>", function.name),
            Value::Host(object) => write!(f, "<{}>", object.type_name()),
            Value::Null => write!(f, "null"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_parsing_keeps_types() {
        assert_eq!(Value::from_literal("42"), Value::Int(42));
        assert_eq!(Value::from_literal("1.5"), Value::Float(1.5));
        assert_eq!(Value::from_literal("true"), Value::Bool(true));
        assert_eq!(Value::from_literal("rock"), Value::from("rock"));
    }

    #[test]
    fn display_and_json() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), Value::Array(vec![Value::Int(1), Value::Null]));
        let value = Value::Map(map);
        assert_eq!(value.to_string(), "{a: [1, null]}");
        assert_eq!(value.to_json(), serde_json::json!({ "a": [1, null] }));
    }

    #[test]
    fn numeric_equality_crosses_int_and_float() {
        assert_eq!(Value::Int(2), Value::Float(2.0));
        assert_ne!(Value::Int(2), Value::from("2"));
    }
}

//=====================================================
// End of file
//=====================================================
