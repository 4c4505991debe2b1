//=====================================================
// File: interpreter/intrinsics.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Built-in members of the intrinsic value types
// Objective: Methods and properties of String/Array/Map/Int/Float and the
//            `Global` functions, all subject to the whitelist when sandboxed
//=====================================================

use super::{RuntimeError, Value};

/// Largest array `range` will materialise.
pub const MAX_RANGE_LEN: i64 = 1_000_000;

const GLOBAL_FUNCTIONS: &[&str] = &["len", "str", "int", "float", "range", "typeOf"];

pub fn is_global_function(name: &str) -> bool {
    GLOBAL_FUNCTIONS.contains(&name)
}

/// Methods that update their receiver; the interpreter writes the receiver back.
pub fn is_mutating(type_name: &str, method: &str) -> bool {
    matches!((type_name, method), ("Array", "push") | ("Map", "put"))
}

fn expect_args(name: &str, args: &[Value], count: usize) -> Result<(), RuntimeError> {
    if args.len() != count {
        return Err(RuntimeError::ArgumentError(format!(
            "'{}' expects {} arguments, got {}",
            name,
            count,
            args.len()
        )));
    }
    Ok(())
}

fn string_arg<'a>(name: &str, value: &'a Value) -> Result<&'a str, RuntimeError> {
    value.as_str().ok_or_else(|| {
        RuntimeError::TypeError(format!(
            "'{}' expects a String argument, got {}",
            name,
            value.type_name()
        ))
    })
}

fn int_arg(name: &str, value: &Value) -> Result<i64, RuntimeError> {
    value.as_int().ok_or_else(|| {
        RuntimeError::TypeError(format!(
            "'{}' expects an Int argument, got {}",
            name,
            value.type_name()
        ))
    })
}

fn no_member(receiver: &Value, name: &str) -> RuntimeError {
    RuntimeError::TypeError(format!(
        "{} has no method '{}'",
        receiver.type_name(),
        name
    ))
}

/// Call a built-in method. Mutating methods update `receiver` in place.
pub fn call_method(
    receiver: &mut Value,
    name: &str,
    args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    match receiver {
        Value::String(s) => string_method(s, name, &args),
        Value::Array(items) => array_method(items, name, args),
        Value::Map(map) => map_method(map, name, args),
        Value::Int(n) => {
            let n = *n;
            expect_args(name, &args, 0)?;
            match name {
                "abs" => n.checked_abs().map(Value::Int).ok_or(RuntimeError::Overflow),
                "toString" => Ok(Value::String(n.to_string())),
                "toFloat" => Ok(Value::Float(n as f64)),
                _ => Err(no_member(&Value::Int(n), name)),
            }
        }
        Value::Float(x) => {
            let x = *x;
            expect_args(name, &args, 0)?;
            match name {
                "abs" => Ok(Value::Float(x.abs())),
                "toString" => Ok(Value::String(x.to_string())),
                _ => Err(no_member(&Value::Float(x), name)),
            }
        }
        Value::Host(object) => object.call_method(name, args),
        other => Err(no_member(other, name)),
    }
}

fn string_method(s: &str, name: &str, args: &[Value]) -> Result<Value, RuntimeError> {
    match name {
        "length" => {
            expect_args(name, args, 0)?;
            Ok(Value::Int(s.chars().count() as i64))
        }
        "upper" => {
            expect_args(name, args, 0)?;
            Ok(Value::String(s.to_uppercase()))
        }
        "lower" => {
            expect_args(name, args, 0)?;
            Ok(Value::String(s.to_lowercase()))
        }
        "trim" => {
            expect_args(name, args, 0)?;
            Ok(Value::String(s.trim().to_string()))
        }
        "contains" => {
            expect_args(name, args, 1)?;
            Ok(Value::Bool(s.contains(string_arg(name, &args[0])?)))
        }
        "startsWith" => {
            expect_args(name, args, 1)?;
            Ok(Value::Bool(s.starts_with(string_arg(name, &args[0])?)))
        }
        "endsWith" => {
            expect_args(name, args, 1)?;
            Ok(Value::Bool(s.ends_with(string_arg(name, &args[0])?)))
        }
        "split" => {
            expect_args(name, args, 1)?;
            let separator = string_arg(name, &args[0])?;
            if separator.is_empty() {
                return Ok(Value::Array(
                    s.chars().map(|c| Value::String(c.to_string())).collect(),
                ));
            }
            Ok(Value::Array(
                s.split(separator)
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            ))
        }
        "replace" => {
            expect_args(name, args, 2)?;
            let from = string_arg(name, &args[0])?;
            let to = string_arg(name, &args[1])?;
            if from.is_empty() {
                return Err(RuntimeError::ArgumentError(
                    "'replace' needs a non-empty pattern".to_string(),
                ));
            }
            Ok(Value::String(s.replace(from, to)))
        }
        "toInt" => {
            expect_args(name, args, 0)?;
            s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                RuntimeError::TypeError(format!("cannot convert '{}' to Int", s))
            })
        }
        _ => Err(RuntimeError::TypeError(format!(
            "String has no method '{}'",
            name
        ))),
    }
}

fn array_method(
    items: &mut Vec<Value>,
    name: &str,
    mut args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    match name {
        "size" => {
            expect_args(name, &args, 0)?;
            Ok(Value::Int(items.len() as i64))
        }
        "isEmpty" => {
            expect_args(name, &args, 0)?;
            Ok(Value::Bool(items.is_empty()))
        }
        "get" => {
            expect_args(name, &args, 1)?;
            let index = int_arg(name, &args[0])?;
            index_array(items, index).cloned()
        }
        "push" => {
            expect_args(name, &args, 1)?;
            items.push(args.remove(0));
            Ok(Value::Null)
        }
        "contains" => {
            expect_args(name, &args, 1)?;
            Ok(Value::Bool(items.contains(&args[0])))
        }
        "join" => {
            expect_args(name, &args, 1)?;
            let separator = string_arg(name, &args[0])?;
            let parts: Vec<String> = items.iter().map(Value::to_string).collect();
            Ok(Value::String(parts.join(separator)))
        }
        _ => Err(RuntimeError::TypeError(format!(
            "Array has no method '{}'",
            name
        ))),
    }
}

fn map_method(
    map: &mut std::collections::BTreeMap<String, Value>,
    name: &str,
    mut args: Vec<Value>,
) -> Result<Value, RuntimeError> {
    match name {
        "get" => {
            expect_args(name, &args, 1)?;
            let key = string_arg(name, &args[0])?;
            Ok(map.get(key).cloned().unwrap_or(Value::Null))
        }
        "put" => {
            expect_args(name, &args, 2)?;
            let value = args.remove(1);
            let key = string_arg(name, &args[0])?.to_string();
            Ok(map.insert(key, value).unwrap_or(Value::Null))
        }
        "containsKey" => {
            expect_args(name, &args, 1)?;
            let key = string_arg(name, &args[0])?;
            Ok(Value::Bool(map.contains_key(key)))
        }
        "keys" => {
            expect_args(name, &args, 0)?;
            Ok(Value::Array(
                map.keys().map(|key| Value::String(key.clone())).collect(),
            ))
        }
        "size" => {
            expect_args(name, &args, 0)?;
            Ok(Value::Int(map.len() as i64))
        }
        _ => Err(RuntimeError::TypeError(format!(
            "Map has no method '{}'",
            name
        ))),
    }
}

pub fn index_array(items: &[Value], index: i64) -> Result<&Value, RuntimeError> {
    usize::try_from(index)
        .ok()
        .and_then(|i| items.get(i))
        .ok_or_else(|| {
            RuntimeError::IndexError(format!(
                "index {} out of bounds for length {}",
                index,
                items.len()
            ))
        })
}

/// Read a built-in property. Map property reads are key lookups.
pub fn get_property(receiver: &Value, name: &str) -> Result<Value, RuntimeError> {
    match (receiver, name) {
        (Value::Array(items), "length") => Ok(Value::Int(items.len() as i64)),
        (Value::Map(map), key) => Ok(map.get(key).cloned().unwrap_or(Value::Null)),
        (Value::Host(object), name) => object.get_property(name),
        (other, name) => Err(RuntimeError::TypeError(format!(
            "{} has no property '{}'",
            other.type_name(),
            name
        ))),
    }
}

/// Call one of the `Global` functions.
pub fn call_global(name: &str, args: Vec<Value>) -> Result<Value, RuntimeError> {
    match name {
        "len" => {
            expect_args(name, &args, 1)?;
            match &args[0] {
                Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
                Value::Array(items) => Ok(Value::Int(items.len() as i64)),
                Value::Map(map) => Ok(Value::Int(map.len() as i64)),
                other => Err(RuntimeError::TypeError(format!(
                    "len() not supported for {}",
                    other.type_name()
                ))),
            }
        }
        "str" => {
            expect_args(name, &args, 1)?;
            Ok(Value::String(args[0].to_string()))
        }
        "int" => {
            expect_args(name, &args, 1)?;
            match &args[0] {
                Value::Int(n) => Ok(Value::Int(*n)),
                Value::Float(x) if x.is_finite() => Ok(Value::Int(x.trunc() as i64)),
                Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                Value::String(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                    RuntimeError::TypeError(format!("cannot convert '{}' to Int", s))
                }),
                other => Err(RuntimeError::TypeError(format!(
                    "cannot convert {} to Int",
                    other.type_name()
                ))),
            }
        }
        "float" => {
            expect_args(name, &args, 1)?;
            match &args[0] {
                Value::Int(n) => Ok(Value::Float(*n as f64)),
                Value::Float(x) => Ok(Value::Float(*x)),
                Value::String(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                    RuntimeError::TypeError(format!("cannot convert '{}' to Float", s))
                }),
                other => Err(RuntimeError::TypeError(format!(
                    "cannot convert {} to Float",
                    other.type_name()
                ))),
            }
        }
        "range" => {
            let (start, end) = match args.as_slice() {
                [end] => (0, int_arg(name, end)?),
                [start, end] => (int_arg(name, start)?, int_arg(name, end)?),
                _ => {
                    return Err(RuntimeError::ArgumentError(format!(
                        "'range' expects 1 or 2 arguments, got {}",
                        args.len()
                    )));
                }
            };
            if end.saturating_sub(start) > MAX_RANGE_LEN {
                return Err(RuntimeError::ArgumentError(format!(
                    "range larger than {} elements",
                    MAX_RANGE_LEN
                )));
            }
            Ok(Value::Array((start..end).map(Value::Int).collect()))
        }
        "typeOf" => {
            expect_args(name, &args, 1)?;
            Ok(Value::String(args[0].type_name().to_string()))
        }
        _ => Err(RuntimeError::VariableNotFound(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_updates_receiver() {
        let mut value = Value::Array(vec![Value::Int(1)]);
        let result = call_method(&mut value, "push", vec![Value::Int(2)]).expect("push");
        assert_eq!(value, Value::Array(vec![Value::Int(1), Value::Int(2)]));
        assert_eq!(result, Value::Null);
        assert!(is_mutating("Array", "push"));
        assert!(!is_mutating("Array", "size"));
    }

    #[test]
    fn string_methods() {
        let mut value = Value::from(" Hey ");
        assert_eq!(
            call_method(&mut value, "trim", vec![]).expect("trim"),
            Value::from("Hey")
        );
        let mut value = Value::from("a,b");
        assert_eq!(
            call_method(&mut value, "split", vec![Value::from(",")]).expect("split"),
            Value::Array(vec![Value::from("a"), Value::from("b")])
        );
        assert!(call_method(&mut value, "explode", vec![]).is_err());
    }

    #[test]
    fn map_property_is_key_lookup() {
        let mut map = std::collections::BTreeMap::new();
        map.insert("name".to_string(), Value::from("x"));
        let value = Value::Map(map);
        assert_eq!(get_property(&value, "name").expect("get"), Value::from("x"));
        assert_eq!(get_property(&value, "missing").expect("get"), Value::Null);
    }

    #[test]
    fn globals() {
        assert!(is_global_function("range"));
        assert!(!is_global_function("exec"));
        assert_eq!(
            call_global("range", vec![Value::Int(2), Value::Int(4)]).expect("range"),
            Value::Array(vec![Value::Int(2), Value::Int(3)])
        );
        assert!(call_global("range", vec![Value::Int(i64::MAX)]).is_err());
        assert_eq!(
            call_global("typeOf", vec![Value::Null]).expect("typeOf"),
            Value::from("Null")
        );
        assert_eq!(
            call_global("int", vec![Value::from(" 12 ")]).expect("int"),
            Value::Int(12)
        );
    }
}

//=====================================================
// End of file
//=====================================================
