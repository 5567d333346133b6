//! Operator semantics shared by the machine and the builtins.

use std::rc::Rc;

use crate::bytecode::{CompareOp, Opcode};
use crate::runtime::exception::{ExcType, ExceptionKind, ExceptionValue};
use crate::runtime::runtime_error::{division_by_zero, index_error, type_error, value_error, RuntimeError};
use crate::runtime::value::{SliceValue, Value};

fn overflow() -> RuntimeError {
    RuntimeError::raise(ExceptionKind::ArithmeticError, "integer overflow")
}

fn unsupported(symbol: &str, a: &Value, b: &Value) -> RuntimeError {
    type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        symbol,
        a.type_name(),
        b.type_name()
    ))
}

/// Maps an in-place opcode to its plain binary counterpart.
pub fn plain_binary(op: Opcode) -> Opcode {
    match op {
        Opcode::InplaceAdd => Opcode::BinaryAdd,
        Opcode::InplaceSubtract => Opcode::BinarySubtract,
        Opcode::InplaceMultiply => Opcode::BinaryMultiply,
        Opcode::InplaceMatrixMultiply => Opcode::BinaryMatrixMultiply,
        Opcode::InplaceTrueDivide => Opcode::BinaryTrueDivide,
        Opcode::InplaceFloorDivide => Opcode::BinaryFloorDivide,
        Opcode::InplaceModulo => Opcode::BinaryModulo,
        Opcode::InplacePower => Opcode::BinaryPower,
        Opcode::InplaceLshift => Opcode::BinaryLshift,
        Opcode::InplaceRshift => Opcode::BinaryRshift,
        Opcode::InplaceAnd => Opcode::BinaryAnd,
        Opcode::InplaceXor => Opcode::BinaryXor,
        Opcode::InplaceOr => Opcode::BinaryOr,
        other => other,
    }
}

fn symbol(op: Opcode) -> &'static str {
    match op {
        Opcode::BinaryAdd => "+",
        Opcode::BinarySubtract => "-",
        Opcode::BinaryMultiply => "*",
        Opcode::BinaryMatrixMultiply => "@",
        Opcode::BinaryTrueDivide => "/",
        Opcode::BinaryFloorDivide => "//",
        Opcode::BinaryModulo => "%",
        Opcode::BinaryPower => "** or pow()",
        Opcode::BinaryLshift => "<<",
        Opcode::BinaryRshift => ">>",
        Opcode::BinaryAnd => "&",
        Opcode::BinaryXor => "^",
        Opcode::BinaryOr => "|",
        _ => "?",
    }
}

pub fn binary(op: Opcode, a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    let op = plain_binary(op);
    if let (Some(x), Some(y)) = (int_operand(a), int_operand(b)) {
        return int_binary(op, x, y, a, b);
    }
    if let (Some(x), Some(y)) = (a.as_float(), b.as_float()) {
        return float_binary(op, x, y, a, b);
    }
    match (op, a, b) {
        (Opcode::BinaryAdd, Value::Str(x), Value::Str(y)) => Ok(Value::str(format!("{}{}", x, y))),
        (Opcode::BinaryAdd, Value::Bytes(x), Value::Bytes(y)) => Ok(Value::Bytes([&x[..], &y[..]].concat().into())),
        (Opcode::BinaryAdd, Value::Tuple(x), Value::Tuple(y)) => Ok(Value::tuple(x.iter().chain(y.iter()).cloned().collect())),
        (Opcode::BinaryAdd, Value::List(x), Value::List(y)) => {
            let mut items = x.borrow().clone();
            items.extend(y.borrow().iter().cloned());
            Ok(Value::list(items))
        }
        (Opcode::BinaryMultiply, seq, count) | (Opcode::BinaryMultiply, count, seq) if int_operand(count).is_some() => {
            repeat(seq, int_operand(count).unwrap_or(0)).ok_or_else(|| unsupported("*", a, b))
        }
        _ => Err(unsupported(symbol(op), a, b)),
    }
}

/// Ints and bools take the integer path; bool only survives bit operations.
fn int_operand(v: &Value) -> Option<i64> {
    match v {
        Value::Int(_) | Value::Bool(_) => v.as_int(),
        _ => None,
    }
}

fn int_binary(op: Opcode, x: i64, y: i64, a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    let both_bool = matches!((a, b), (Value::Bool(_), Value::Bool(_)));
    let value = match op {
        Opcode::BinaryAdd => x.checked_add(y).ok_or_else(overflow)?,
        Opcode::BinarySubtract => x.checked_sub(y).ok_or_else(overflow)?,
        Opcode::BinaryMultiply => x.checked_mul(y).ok_or_else(overflow)?,
        Opcode::BinaryTrueDivide => {
            if y == 0 {
                return Err(division_by_zero());
            }
            return Ok(Value::Float(x as f64 / y as f64));
        }
        Opcode::BinaryFloorDivide => {
            if y == 0 {
                return Err(division_by_zero());
            }
            let q = x.checked_div(y).ok_or_else(overflow)?;
            if x % y != 0 && ((x < 0) != (y < 0)) { q - 1 } else { q }
        }
        Opcode::BinaryModulo => {
            if y == 0 {
                return Err(RuntimeError::raise(ExceptionKind::ZeroDivisionError, "integer modulo by zero"));
            }
            let r = x.checked_rem(y).ok_or_else(overflow)?;
            if r != 0 && ((r < 0) != (y < 0)) { r + y } else { r }
        }
        Opcode::BinaryPower => {
            if y < 0 {
                return Ok(Value::Float((x as f64).powf(y as f64)));
            }
            let exp = u32::try_from(y).map_err(|_| overflow())?;
            x.checked_pow(exp).ok_or_else(overflow)?
        }
        Opcode::BinaryLshift | Opcode::BinaryRshift => {
            if y < 0 {
                return Err(value_error("negative shift count"));
            }
            let shift = u32::try_from(y).unwrap_or(u32::MAX).min(63);
            if op == Opcode::BinaryLshift {
                let shifted = x.checked_shl(shift).ok_or_else(overflow)?;
                if shifted >> shift != x {
                    return Err(overflow());
                }
                shifted
            } else {
                x >> shift
            }
        }
        Opcode::BinaryAnd if both_bool => return Ok(Value::Bool(x & y != 0)),
        Opcode::BinaryOr if both_bool => return Ok(Value::Bool(x | y != 0)),
        Opcode::BinaryXor if both_bool => return Ok(Value::Bool(x ^ y != 0)),
        Opcode::BinaryAnd => x & y,
        Opcode::BinaryOr => x | y,
        Opcode::BinaryXor => x ^ y,
        _ => return Err(unsupported(symbol(op), a, b)),
    };
    Ok(Value::Int(value))
}

fn float_binary(op: Opcode, x: f64, y: f64, a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    let value = match op {
        Opcode::BinaryAdd => x + y,
        Opcode::BinarySubtract => x - y,
        Opcode::BinaryMultiply => x * y,
        Opcode::BinaryTrueDivide | Opcode::BinaryFloorDivide | Opcode::BinaryModulo if y == 0.0 => {
            return Err(division_by_zero());
        }
        Opcode::BinaryTrueDivide => x / y,
        Opcode::BinaryFloorDivide => (x / y).floor(),
        Opcode::BinaryModulo => x - y * (x / y).floor(),
        Opcode::BinaryPower => x.powf(y),
        _ => return Err(unsupported(symbol(op), a, b)),
    };
    Ok(Value::Float(value))
}

fn repeat(seq: &Value, count: i64) -> Option<Value> {
    let count = count.max(0) as usize;
    match seq {
        Value::Str(s) => Some(Value::str(s.repeat(count))),
        Value::Bytes(b) => Some(Value::Bytes(b.repeat(count).into())),
        Value::List(items) => {
            let items = items.borrow();
            Some(Value::list((0..count).flat_map(|_| items.iter().cloned()).collect()))
        }
        Value::Tuple(items) => Some(Value::tuple((0..count).flat_map(|_| items.iter().cloned()).collect())),
        _ => None,
    }
}

pub fn unary(op: Opcode, v: &Value) -> Result<Value, RuntimeError> {
    match (op, v) {
        (Opcode::UnaryNot, _) => Ok(Value::Bool(!v.truthy())),
        (Opcode::UnaryPositive, Value::Float(_)) => Ok(v.clone()),
        (Opcode::UnaryNegative, Value::Float(f)) => Ok(Value::Float(-f)),
        (_, Value::Int(_) | Value::Bool(_)) => {
            let i = v.as_int().unwrap_or(0);
            match op {
                Opcode::UnaryPositive => Ok(Value::Int(i)),
                Opcode::UnaryNegative => i.checked_neg().map(Value::Int).ok_or_else(overflow),
                _ => Ok(Value::Int(!i)),
            }
        }
        _ => {
            let symbol = match op {
                Opcode::UnaryPositive => "unary +",
                Opcode::UnaryNegative => "unary -",
                _ => "unary ~",
            };
            Err(type_error(format!("bad operand type for {}: '{}'", symbol, v.type_name())))
        }
    }
}

pub fn compare(op: CompareOp, a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    let ordered = |accept: fn(std::cmp::Ordering) -> bool| {
        a.compare(b).map(|o| Value::Bool(accept(o))).ok_or_else(|| {
            type_error(format!(
                "'{}' not supported between instances of '{}' and '{}'",
                op.symbol(),
                a.type_name(),
                b.type_name()
            ))
        })
    };
    match op {
        CompareOp::Lt => ordered(|o| o.is_lt()),
        CompareOp::Le => ordered(|o| o.is_le()),
        CompareOp::Gt => ordered(|o| o.is_gt()),
        CompareOp::Ge => ordered(|o| o.is_ge()),
        CompareOp::Eq => Ok(Value::Bool(a.equals(b))),
        CompareOp::Ne => Ok(Value::Bool(!a.equals(b))),
        CompareOp::In => contains(b, a).map(Value::Bool),
        CompareOp::NotIn => contains(b, a).map(|found| Value::Bool(!found)),
        CompareOp::Is => Ok(Value::Bool(a.is(b))),
        CompareOp::IsNot => Ok(Value::Bool(!a.is(b))),
        CompareOp::ExceptionMatch => exception_match(a, b).map(Value::Bool),
    }
}

/// Whether the raised type `raised` is matched by an `except` clause.
pub fn exception_match(raised: &Value, pattern: &Value) -> Result<bool, RuntimeError> {
    let Value::ExcType(raised) = raised else {
        return Ok(false);
    };
    match pattern {
        Value::ExcType(t) => Ok(raised.is_subtype(t)),
        Value::Tuple(items) => {
            for item in items.iter() {
                if exception_match(&Value::ExcType(raised.clone()), item)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(type_error(
            "catching classes that do not inherit from BaseException is not allowed",
        )),
    }
}

pub fn contains(container: &Value, item: &Value) -> Result<bool, RuntimeError> {
    match container {
        Value::Str(s) => match item {
            Value::Str(needle) => Ok(s.contains(&**needle)),
            _ => Err(type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                item.type_name()
            ))),
        },
        Value::List(items) | Value::Set(items) => Ok(items.borrow().iter().any(|v| v.equals(item))),
        Value::Tuple(items) => Ok(items.iter().any(|v| v.equals(item))),
        Value::Dict(dict) => Ok(dict.borrow().contains(item)),
        _ => Err(type_error(format!(
            "argument of type '{}' is not iterable",
            container.type_name()
        ))),
    }
}

/// Materializes everything `value` yields when iterated.
pub fn iterate(value: &Value) -> Result<Vec<Value>, RuntimeError> {
    match value {
        Value::List(items) | Value::Set(items) => Ok(items.borrow().clone()),
        Value::Tuple(items) => Ok(items.as_ref().clone()),
        Value::Str(s) => Ok(s.chars().map(|c| Value::str(c.to_string())).collect()),
        Value::Bytes(b) => Ok(b.iter().map(|byte| Value::Int(*byte as i64)).collect()),
        Value::Dict(dict) => Ok(dict.borrow().keys().cloned().collect()),
        Value::Iter(state) => Ok(state.borrow_mut().by_ref().collect()),
        _ => Err(type_error(format!("'{}' object is not iterable", value.type_name()))),
    }
}

fn normalize_index(index: i64, len: usize, what: &str) -> Result<usize, RuntimeError> {
    let len = len as i64;
    let adjusted = if index < 0 { index + len } else { index };
    if (0..len).contains(&adjusted) {
        Ok(adjusted as usize)
    } else {
        Err(index_error(what))
    }
}

fn slice_bound(v: &Value) -> Result<Option<i64>, RuntimeError> {
    match v {
        Value::None => Ok(None),
        other => other
            .as_int()
            .map(Some)
            .ok_or_else(|| type_error("slice indices must be integers or None")),
    }
}

/// Positions selected by `slice` over a sequence of `len` items.
pub fn slice_indices(slice: &SliceValue, len: usize) -> Result<Vec<usize>, RuntimeError> {
    let len = len as i64;
    let step = slice_bound(&slice.step)?.unwrap_or(1);
    if step == 0 {
        return Err(value_error("slice step cannot be zero"));
    }
    let clamp = |bound: Option<i64>, default: i64, low: i64, high: i64| match bound {
        None => default,
        Some(i) if i < 0 => (i + len).max(low),
        Some(i) => i.min(high),
    };
    let mut out = Vec::new();
    if step > 0 {
        let start = clamp(slice_bound(&slice.start)?, 0, 0, len);
        let stop = clamp(slice_bound(&slice.stop)?, len, 0, len);
        let mut next = Some(start);
        while let Some(i) = next.filter(|&i| i < stop) {
            out.push(i as usize);
            next = i.checked_add(step);
        }
    } else {
        let start = clamp(slice_bound(&slice.start)?, len - 1, -1, len - 1);
        let stop = clamp(slice_bound(&slice.stop)?, -1, -1, len - 1);
        let mut next = Some(start);
        while let Some(i) = next.filter(|&i| i > stop) {
            out.push(i as usize);
            next = i.checked_add(step);
        }
    }
    Ok(out)
}

pub fn get_item(container: &Value, key: &Value) -> Result<Value, RuntimeError> {
    match (container, key) {
        (Value::Dict(dict), _) => dict.borrow().get(key).cloned().ok_or_else(|| {
            RuntimeError::Exception(ExceptionValue::new(ExcType::builtin(ExceptionKind::KeyError), vec![key.clone()]))
        }),
        (Value::List(items), Value::Slice(s)) => {
            let items = items.borrow();
            Ok(Value::list(slice_indices(s, items.len())?.into_iter().map(|i| items[i].clone()).collect()))
        }
        (Value::Tuple(items), Value::Slice(s)) => Ok(Value::tuple(
            slice_indices(s, items.len())?.into_iter().map(|i| items[i].clone()).collect(),
        )),
        (Value::Str(text), Value::Slice(s)) => {
            let chars: Vec<char> = text.chars().collect();
            Ok(Value::str(slice_indices(s, chars.len())?.into_iter().map(|i| chars[i]).collect::<String>()))
        }
        (Value::List(items), _) => {
            let items = items.borrow();
            let i = normalize_index(seq_index(key)?, items.len(), "list")?;
            Ok(items[i].clone())
        }
        (Value::Tuple(items), _) => {
            let i = normalize_index(seq_index(key)?, items.len(), "tuple")?;
            Ok(items[i].clone())
        }
        (Value::Str(text), _) => {
            let chars: Vec<char> = text.chars().collect();
            let i = normalize_index(seq_index(key)?, chars.len(), "string")?;
            Ok(Value::str(chars[i].to_string()))
        }
        (Value::Bytes(bytes), _) => {
            let i = normalize_index(seq_index(key)?, bytes.len(), "bytes")?;
            Ok(Value::Int(bytes[i] as i64))
        }
        _ => Err(type_error(format!("'{}' object is not subscriptable", container.type_name()))),
    }
}

fn seq_index(key: &Value) -> Result<i64, RuntimeError> {
    match key {
        Value::Int(_) | Value::Bool(_) => Ok(key.as_int().unwrap_or(0)),
        _ => Err(type_error(format!("indices must be integers, not {}", key.type_name()))),
    }
}

pub fn set_item(container: &Value, key: Value, value: Value) -> Result<(), RuntimeError> {
    match container {
        Value::Dict(dict) => {
            key.check_hashable()?;
            dict.borrow_mut().insert(key, value);
            Ok(())
        }
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let i = normalize_index(seq_index(&key)?, items.len(), "list assignment")?;
            items[i] = value;
            Ok(())
        }
        _ => Err(type_error(format!(
            "'{}' object does not support item assignment",
            container.type_name()
        ))),
    }
}

pub fn del_item(container: &Value, key: &Value) -> Result<(), RuntimeError> {
    match container {
        Value::Dict(dict) => dict.borrow_mut().remove(key).map(|_| ()).ok_or_else(|| {
            RuntimeError::raise(ExceptionKind::KeyError, key.repr())
        }),
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let i = normalize_index(seq_index(key)?, items.len(), "list assignment")?;
            items.remove(i);
            Ok(())
        }
        _ => Err(type_error(format!(
            "'{}' object doesn't support item deletion",
            container.type_name()
        ))),
    }
}

pub fn make_slice(start: Value, stop: Value, step: Value) -> Value {
    Value::Slice(Rc::new(SliceValue { start, stop, step }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(values: &[i64]) -> Value {
        Value::list(values.iter().map(|i| Value::Int(*i)).collect())
    }

    #[test]
    fn test_floor_semantics() {
        let r = binary(Opcode::BinaryFloorDivide, &Value::Int(-7), &Value::Int(2)).unwrap();
        assert_eq!(r.as_int(), Some(-4));
        let r = binary(Opcode::BinaryModulo, &Value::Int(-7), &Value::Int(2)).unwrap();
        assert_eq!(r.as_int(), Some(1));
        let r = binary(Opcode::InplaceTrueDivide, &Value::Int(7), &Value::Int(2)).unwrap();
        assert_eq!(r.as_float(), Some(3.5));
        let err = binary(Opcode::BinaryModulo, &Value::Int(1), &Value::Int(0)).unwrap_err();
        assert!(err.exception().is_some_and(|e| e.is_kind(ExceptionKind::ArithmeticError)));
    }

    #[test]
    fn test_sequence_operators() {
        let r = binary(Opcode::BinaryMultiply, &Value::Int(2), &Value::str("ab")).unwrap();
        assert_eq!(r.to_string(), "abab");
        let r = binary(Opcode::BinaryAdd, &ints(&[1]), &ints(&[2])).unwrap();
        assert_eq!(r.repr(), "[1, 2]");
        assert!(binary(Opcode::BinaryAdd, &Value::str("a"), &Value::Int(1)).is_err());
        assert!(matches!(binary(Opcode::BinaryAnd, &Value::Bool(true), &Value::Bool(false)), Ok(Value::Bool(false))));
    }

    #[test]
    fn test_slices_follow_python_bounds() {
        let list = ints(&[0, 1, 2, 3, 4]);
        let s = make_slice(Value::Int(-2), Value::None, Value::None);
        assert_eq!(get_item(&list, &s).unwrap().repr(), "[3, 4]");
        let s = make_slice(Value::None, Value::None, Value::Int(-2));
        assert_eq!(get_item(&list, &s).unwrap().repr(), "[4, 2, 0]");
        let s = make_slice(Value::Int(1), Value::Int(100), Value::None);
        assert_eq!(get_item(&Value::str("hello"), &s).unwrap().to_string(), "ello");
        assert_eq!(get_item(&list, &Value::Int(-1)).unwrap().as_int(), Some(4));
        assert!(get_item(&list, &Value::Int(5)).is_err());
    }

    #[test]
    fn test_huge_slice_steps() {
        let list = ints(&[1, 2, 3]);
        let s = make_slice(Value::Int(1), Value::None, Value::Int(i64::MAX));
        assert_eq!(get_item(&list, &s).unwrap().repr(), "[2]");
        let s = make_slice(Value::None, Value::None, Value::Int(i64::MIN));
        assert_eq!(get_item(&list, &s).unwrap().repr(), "[3]");
    }

    #[test]
    fn test_exception_match_accepts_tuples() {
        let raised = Value::ExcType(ExcType::builtin(ExceptionKind::KeyError));
        let lookup = Value::ExcType(ExcType::builtin(ExceptionKind::LookupError));
        let value = Value::ExcType(ExcType::builtin(ExceptionKind::ValueError));
        assert!(exception_match(&raised, &lookup).unwrap());
        assert!(!exception_match(&raised, &value).unwrap());
        assert!(exception_match(&raised, &Value::tuple(vec![value, lookup])).unwrap());
        assert!(exception_match(&raised, &Value::Int(1)).is_err());
    }
}
