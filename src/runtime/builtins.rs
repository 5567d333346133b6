//! Builtin functions, exception types and methods of builtin values.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use crate::bytecode::Opcode;
use crate::runtime::exception::{ExcType, ExceptionKind};
use crate::runtime::machine::Machine;
use crate::runtime::ops::{binary, iterate};
use crate::runtime::runtime_error::{attribute_error, index_error, type_error, value_error, RuntimeError};
use crate::runtime::value::{BoundMethod, Dict, DictRef, Kwargs, Shared, Value};

type Builtin = fn(&mut Machine, Vec<Value>, Kwargs) -> Result<Value, RuntimeError>;

const FUNCTIONS: &[(&str, Builtin)] = &[
    ("abs", builtin_abs),
    ("bool", builtin_bool),
    ("dict", builtin_dict),
    ("enumerate", builtin_enumerate),
    ("float", builtin_float),
    ("int", builtin_int),
    ("isinstance", builtin_isinstance),
    ("len", builtin_len),
    ("list", builtin_list),
    ("max", builtin_max),
    ("min", builtin_min),
    ("print", builtin_print),
    ("range", builtin_range),
    ("repr", builtin_repr),
    ("set", builtin_set),
    ("sorted", builtin_sorted),
    ("str", builtin_str),
    ("sum", builtin_sum),
    ("tuple", builtin_tuple),
];

/// The `__builtins__` mapping installed into fresh globals.
pub fn builtins() -> Dict {
    let mut dict = Dict::new();
    for (name, func) in FUNCTIONS {
        let func = *func;
        dict.set_str(name, Value::native(*name, func));
    }
    for kind in ExceptionKind::ALL {
        dict.set_str(kind.name(), Value::ExcType(ExcType::builtin(*kind)));
    }
    dict.set_str("None", Value::None);
    dict.set_str("True", Value::Bool(true));
    dict.set_str("False", Value::Bool(false));
    dict
}

fn arity(name: &str, args: &[Value], kwargs: &Kwargs, min: usize, max: usize) -> Result<(), RuntimeError> {
    if !kwargs.is_empty() {
        return Err(type_error(format!("{}() takes no keyword arguments", name)));
    }
    if args.len() < min || args.len() > max {
        let expected = if min == max { min.to_string() } else { format!("{} to {}", min, max) };
        return Err(type_error(format!(
            "{}() takes {} arguments ({} given)",
            name,
            expected,
            args.len()
        )));
    }
    Ok(())
}

fn first(args: Vec<Value>) -> Value {
    args.into_iter().next().unwrap_or(Value::None)
}

fn builtin_len(_: &mut Machine, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, RuntimeError> {
    arity("len", &args, &kwargs, 1, 1)?;
    let n = match &args[0] {
        Value::Str(s) => s.chars().count(),
        Value::Bytes(b) => b.len(),
        Value::Tuple(items) => items.len(),
        Value::List(items) | Value::Set(items) => items.borrow().len(),
        Value::Dict(dict) => dict.borrow().len(),
        other => return Err(type_error(format!("object of type '{}' has no len()", other.type_name()))),
    };
    Ok(Value::Int(n as i64))
}

fn builtin_str(_: &mut Machine, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, RuntimeError> {
    arity("str", &args, &kwargs, 0, 1)?;
    Ok(args.first().map_or_else(|| Value::str(""), |v| Value::str(v.to_string())))
}

fn builtin_repr(_: &mut Machine, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, RuntimeError> {
    arity("repr", &args, &kwargs, 1, 1)?;
    Ok(Value::str(args[0].repr()))
}

fn builtin_bool(_: &mut Machine, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, RuntimeError> {
    arity("bool", &args, &kwargs, 0, 1)?;
    Ok(Value::Bool(args.first().is_some_and(Value::truthy)))
}

fn builtin_int(_: &mut Machine, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, RuntimeError> {
    arity("int", &args, &kwargs, 0, 1)?;
    match first(args) {
        Value::None => Ok(Value::Int(0)),
        Value::Float(f) if f.is_finite() => Ok(Value::Int(f.trunc() as i64)),
        Value::Str(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| value_error(format!("invalid literal for int() with base 10: {}", Value::Str(s.clone()).repr()))),
        v @ (Value::Int(_) | Value::Bool(_)) => Ok(Value::Int(v.as_int().unwrap_or(0))),
        v => Err(type_error(format!("int() argument must be a string or a number, not '{}'", v.type_name()))),
    }
}

fn builtin_float(_: &mut Machine, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, RuntimeError> {
    arity("float", &args, &kwargs, 0, 1)?;
    match first(args) {
        Value::None => Ok(Value::Float(0.0)),
        Value::Str(s) => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| value_error(format!("could not convert string to float: {}", Value::Str(s.clone()).repr()))),
        v => v
            .as_float()
            .map(Value::Float)
            .ok_or_else(|| type_error(format!("float() argument must be a string or a number, not '{}'", v.type_name()))),
    }
}

fn builtin_tuple(_: &mut Machine, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, RuntimeError> {
    arity("tuple", &args, &kwargs, 0, 1)?;
    match args.first() {
        Some(v) => Ok(Value::tuple(iterate(v)?)),
        None => Ok(Value::tuple(Vec::new())),
    }
}

fn builtin_list(_: &mut Machine, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, RuntimeError> {
    arity("list", &args, &kwargs, 0, 1)?;
    match args.first() {
        Some(v) => Ok(Value::list(iterate(v)?)),
        None => Ok(Value::list(Vec::new())),
    }
}

fn builtin_set(_: &mut Machine, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, RuntimeError> {
    arity("set", &args, &kwargs, 0, 1)?;
    let mut items: Vec<Value> = Vec::new();
    if let Some(v) = args.first() {
        for item in iterate(v)? {
            item.check_hashable()?;
            if !items.iter().any(|x| x.equals(&item)) {
                items.push(item);
            }
        }
    }
    Ok(Value::Set(Rc::new(RefCell::new(items))))
}

fn builtin_dict(_: &mut Machine, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, RuntimeError> {
    if args.len() > 1 {
        return Err(type_error(format!("dict expected at most 1 argument, got {}", args.len())));
    }
    let mut dict = Dict::new();
    if let Some(source) = args.first() {
        update_dict(&mut dict, source)?;
    }
    for (k, v) in kwargs {
        dict.set_str(&k, v);
    }
    Ok(Value::dict(dict))
}

fn update_dict(dict: &mut Dict, source: &Value) -> Result<(), RuntimeError> {
    if let Value::Dict(other) = source {
        for (k, v) in other.borrow().iter() {
            dict.insert(k.clone(), v.clone());
        }
        return Ok(());
    }
    for pair in iterate(source)? {
        let items = iterate(&pair)?;
        let [k, v] = <[Value; 2]>::try_from(items)
            .map_err(|_| value_error("dictionary update sequence element has wrong length"))?;
        k.check_hashable()?;
        dict.insert(k, v);
    }
    Ok(())
}

/// Materialized eagerly; generated code only ever iterates it.
fn builtin_range(_: &mut Machine, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, RuntimeError> {
    arity("range", &args, &kwargs, 1, 3)?;
    let ints: Vec<i64> = args
        .iter()
        .map(|v| {
            v.as_int()
                .ok_or_else(|| type_error(format!("'{}' object cannot be interpreted as an integer", v.type_name())))
        })
        .collect::<Result<_, _>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => (0, 0, 1),
    };
    if step == 0 {
        return Err(value_error("range() arg 3 must not be zero"));
    }
    let mut items = Vec::new();
    let mut next = Some(start);
    while let Some(i) = next.filter(|&i| (step > 0 && i < stop) || (step < 0 && i > stop)) {
        items.push(Value::Int(i));
        next = i.checked_add(step);
    }
    Ok(Value::list(items))
}

fn builtin_enumerate(_: &mut Machine, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, RuntimeError> {
    arity("enumerate", &args, &kwargs, 1, 2)?;
    let start = args.get(1).and_then(Value::as_int).unwrap_or(0);
    let items = iterate(&args[0])?
        .into_iter()
        .enumerate()
        .map(|(i, v)| Value::tuple(vec![Value::Int(start + i as i64), v]))
        .collect();
    Ok(Value::list(items))
}

fn builtin_abs(_: &mut Machine, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, RuntimeError> {
    arity("abs", &args, &kwargs, 1, 1)?;
    match &args[0] {
        Value::Float(f) => Ok(Value::Float(f.abs())),
        v => v
            .as_int()
            .and_then(i64::checked_abs)
            .map(Value::Int)
            .ok_or_else(|| type_error(format!("bad operand type for abs(): '{}'", v.type_name()))),
    }
}

fn builtin_sum(_: &mut Machine, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, RuntimeError> {
    arity("sum", &args, &kwargs, 1, 2)?;
    let mut total = args.get(1).cloned().unwrap_or(Value::Int(0));
    for item in iterate(&args[0])? {
        total = binary(Opcode::BinaryAdd, &total, &item)?;
    }
    Ok(total)
}

fn ordering(a: &Value, b: &Value) -> Result<Ordering, RuntimeError> {
    a.compare(b).ok_or_else(|| {
        type_error(format!(
            "'<' not supported between instances of '{}' and '{}'",
            a.type_name(),
            b.type_name()
        ))
    })
}

fn extreme(name: &str, args: Vec<Value>, kwargs: Kwargs, wanted: Ordering) -> Result<Value, RuntimeError> {
    if !kwargs.is_empty() {
        return Err(type_error(format!("{}() takes no keyword arguments", name)));
    }
    let items = match args.len() {
        0 => return Err(type_error(format!("{} expected at least 1 argument, got 0", name))),
        1 => iterate(&args[0])?,
        _ => args,
    };
    let mut best: Option<Value> = None;
    for item in items {
        best = match best {
            Some(current) if ordering(&item, &current)? != wanted => Some(current),
            _ => Some(item),
        };
    }
    best.ok_or_else(|| value_error(format!("{}() arg is an empty sequence", name)))
}

fn builtin_min(_: &mut Machine, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, RuntimeError> {
    extreme("min", args, kwargs, Ordering::Less)
}

fn builtin_max(_: &mut Machine, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, RuntimeError> {
    extreme("max", args, kwargs, Ordering::Greater)
}

fn sort_values(items: &mut [Value], reverse: bool) -> Result<(), RuntimeError> {
    let mut failure = None;
    items.sort_by(|a, b| match ordering(a, b) {
        Ok(o) => o,
        Err(e) => {
            failure.get_or_insert(e);
            Ordering::Equal
        }
    });
    if let Some(e) = failure {
        return Err(e);
    }
    if reverse {
        items.reverse();
    }
    Ok(())
}

fn reverse_flag(kwargs: &Kwargs) -> Result<bool, RuntimeError> {
    let mut reverse = false;
    for (name, value) in kwargs {
        match name.as_str() {
            "reverse" => reverse = value.truthy(),
            other => return Err(type_error(format!("'{}' is an invalid keyword argument for sort()", other))),
        }
    }
    Ok(reverse)
}

fn builtin_sorted(_: &mut Machine, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, RuntimeError> {
    if args.len() != 1 {
        return Err(type_error(format!("sorted expected 1 argument, got {}", args.len())));
    }
    let mut items = iterate(&args[0])?;
    sort_values(&mut items, reverse_flag(&kwargs)?)?;
    Ok(Value::list(items))
}

fn builtin_print(_: &mut Machine, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, RuntimeError> {
    let mut sep = " ".to_string();
    let mut end = "\n".to_string();
    for (name, value) in &kwargs {
        match name.as_str() {
            "sep" => sep = value.to_string(),
            "end" => end = value.to_string(),
            other => return Err(type_error(format!("'{}' is an invalid keyword argument for print()", other))),
        }
    }
    let parts: Vec<String> = args.iter().map(Value::to_string).collect();
    print!("{}{}", parts.join(&sep), end);
    Ok(Value::None)
}

fn builtin_isinstance(_: &mut Machine, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, RuntimeError> {
    arity("isinstance", &args, &kwargs, 2, 2)?;
    is_instance(&args[0], &args[1]).map(Value::Bool)
}

fn is_instance(value: &Value, class: &Value) -> Result<bool, RuntimeError> {
    match class {
        Value::Tuple(classes) => {
            for class in classes.iter() {
                if is_instance(value, class)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::ExcType(t) => Ok(matches!(value, Value::Exception(exc) if exc.kind.is_subtype(t))),
        Value::Native(native) if FUNCTIONS.iter().any(|(name, _)| *name == native.name) => {
            let type_name = value.type_name();
            Ok(type_name == native.name || (native.name == "int" && type_name == "bool"))
        }
        other => Err(type_error(format!(
            "isinstance() arg 2 must be a type or tuple of types, not '{}'",
            other.type_name()
        ))),
    }
}

// ---- methods of builtin values --------------------------------------------

const LIST_METHODS: &[&str] = &[
    "append", "clear", "copy", "count", "extend", "index", "insert", "pop", "remove", "reverse", "sort",
];
const DICT_METHODS: &[&str] = &["clear", "copy", "get", "items", "keys", "pop", "setdefault", "update", "values"];
const STR_METHODS: &[&str] = &[
    "endswith", "join", "lower", "replace", "split", "startswith", "strip", "upper",
];
const SET_METHODS: &[&str] = &["add", "discard"];

/// Attribute lookup on a builtin value.
pub fn builtin_attr(receiver: &Value, name: &str) -> Result<Value, RuntimeError> {
    let methods: &[&str] = match receiver {
        Value::List(_) => LIST_METHODS,
        Value::Dict(_) => DICT_METHODS,
        Value::Str(_) => STR_METHODS,
        Value::Set(_) => SET_METHODS,
        Value::Exception(exc) if name == "args" => return Ok(Value::tuple(exc.args.clone())),
        Value::Function(func) if name == "__name__" => {
            let short = func.qualname.rsplit('.').next().unwrap_or(&func.qualname);
            return Ok(Value::str(short));
        }
        Value::Code(code) if name == "co_name" => return Ok(Value::str(code.name.as_str())),
        Value::ExcType(t) if name == "__name__" => return Ok(Value::str(t.name.as_str())),
        _ => &[],
    };
    if methods.contains(&name) {
        return Ok(Value::Method(Rc::new(BoundMethod {
            receiver: receiver.clone(),
            name: name.to_string(),
        })));
    }
    Err(attribute_error(&receiver.type_name(), name))
}

pub fn call_method(method: &BoundMethod, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, RuntimeError> {
    let name = method.name.as_str();
    if !kwargs.is_empty() && !(name == "sort" && matches!(method.receiver, Value::List(_))) {
        return Err(type_error(format!("{}() takes no keyword arguments", name)));
    }
    match &method.receiver {
        Value::List(items) => list_method(items, name, args, &kwargs),
        Value::Dict(dict) => dict_method(dict, name, args),
        Value::Str(s) => str_method(s, name, args),
        Value::Set(items) => {
            let item = args.into_iter().next().ok_or_else(|| type_error(format!("{}() takes exactly one argument", name)))?;
            item.check_hashable()?;
            let mut items = items.borrow_mut();
            let position = items.iter().position(|x| x.equals(&item));
            match (name, position) {
                ("add", None) => items.push(item),
                ("discard", Some(i)) => {
                    items.remove(i);
                }
                _ => {}
            }
            Ok(Value::None)
        }
        other => Err(attribute_error(&other.type_name(), name)),
    }
}

fn one(name: &str, args: Vec<Value>) -> Result<Value, RuntimeError> {
    let [arg] = <[Value; 1]>::try_from(args)
        .map_err(|args| type_error(format!("{}() takes exactly one argument ({} given)", name, args.len())))?;
    Ok(arg)
}

fn list_method(
    items: &Shared<Vec<Value>>,
    name: &str,
    args: Vec<Value>,
    kwargs: &Kwargs,
) -> Result<Value, RuntimeError> {
    match name {
        "append" => {
            let item = one(name, args)?;
            items.borrow_mut().push(item);
            Ok(Value::None)
        }
        "extend" => {
            let more = iterate(&one(name, args)?)?;
            items.borrow_mut().extend(more);
            Ok(Value::None)
        }
        "insert" => {
            let [index, item] = <[Value; 2]>::try_from(args).map_err(|_| type_error("insert expected 2 arguments"))?;
            let mut items = items.borrow_mut();
            let len = items.len() as i64;
            let index = index.as_int().ok_or_else(|| type_error("list indices must be integers"))?;
            let at = if index < 0 { (index + len).max(0) } else { index.min(len) };
            items.insert(at as usize, item);
            Ok(Value::None)
        }
        "pop" => {
            let mut items = items.borrow_mut();
            if items.is_empty() {
                return Err(index_error("pop from empty list"));
            }
            let len = items.len() as i64;
            let index = match args.first() {
                Some(v) => v.as_int().ok_or_else(|| type_error("list indices must be integers"))?,
                None => -1,
            };
            let at = if index < 0 { index + len } else { index };
            if !(0..len).contains(&at) {
                return Err(index_error("pop"));
            }
            Ok(items.remove(at as usize))
        }
        "remove" | "index" | "count" => {
            let needle = one(name, args)?;
            let mut items = items.borrow_mut();
            let position = items.iter().position(|x| x.equals(&needle));
            match name {
                "count" => Ok(Value::Int(items.iter().filter(|x| x.equals(&needle)).count() as i64)),
                _ => {
                    let at = position.ok_or_else(|| value_error(format!("list.{}(x): x not in list", name)))?;
                    if name == "remove" {
                        items.remove(at);
                        Ok(Value::None)
                    } else {
                        Ok(Value::Int(at as i64))
                    }
                }
            }
        }
        "clear" => {
            items.borrow_mut().clear();
            Ok(Value::None)
        }
        "copy" => Ok(Value::list(items.borrow().clone())),
        "reverse" => {
            items.borrow_mut().reverse();
            Ok(Value::None)
        }
        "sort" => {
            let reverse = reverse_flag(kwargs)?;
            let mut sorted = items.borrow().clone();
            sort_values(&mut sorted, reverse)?;
            *items.borrow_mut() = sorted;
            Ok(Value::None)
        }
        _ => Err(attribute_error("list", name)),
    }
}

fn dict_method(dict: &DictRef, name: &str, args: Vec<Value>) -> Result<Value, RuntimeError> {
    match name {
        "keys" => Ok(Value::list(dict.borrow().keys().cloned().collect())),
        "values" => Ok(Value::list(dict.borrow().values().cloned().collect())),
        "items" => Ok(Value::list(
            dict.borrow()
                .iter()
                .map(|(k, v)| Value::tuple(vec![k.clone(), v.clone()]))
                .collect(),
        )),
        "get" | "pop" | "setdefault" => {
            let mut args = args.into_iter();
            let key = args.next().ok_or_else(|| type_error(format!("{} expected at least 1 argument", name)))?;
            let default = args.next();
            match name {
                "get" => Ok(dict.borrow().get(&key).cloned().or(default).unwrap_or(Value::None)),
                "pop" => match (dict.borrow_mut().remove(&key), default) {
                    (Some(v), _) | (None, Some(v)) => Ok(v),
                    (None, None) => Err(RuntimeError::raise(ExceptionKind::KeyError, key.repr())),
                },
                _ => {
                    key.check_hashable()?;
                    let existing = dict.borrow().get(&key).cloned();
                    Ok(existing.unwrap_or_else(|| {
                        let value = default.unwrap_or(Value::None);
                        dict.borrow_mut().insert(key, value.clone());
                        value
                    }))
                }
            }
        }
        "update" => {
            let source = one(name, args)?;
            let mut merged = dict.borrow().clone();
            update_dict(&mut merged, &source)?;
            *dict.borrow_mut() = merged;
            Ok(Value::None)
        }
        "copy" => Ok(Value::dict(dict.borrow().clone())),
        "clear" => {
            *dict.borrow_mut() = Dict::new();
            Ok(Value::None)
        }
        _ => Err(attribute_error("dict", name)),
    }
}

fn str_method(s: &str, name: &str, args: Vec<Value>) -> Result<Value, RuntimeError> {
    let text_arg = |args: &[Value], i: usize| -> Result<String, RuntimeError> {
        match args.get(i) {
            Some(Value::Str(t)) => Ok(t.to_string()),
            Some(other) => Err(type_error(format!("must be str, not {}", other.type_name()))),
            None => Err(type_error(format!("{}() missing argument", name))),
        }
    };
    match name {
        "upper" => Ok(Value::str(s.to_uppercase())),
        "lower" => Ok(Value::str(s.to_lowercase())),
        "strip" => Ok(Value::str(s.trim())),
        "startswith" => Ok(Value::Bool(s.starts_with(text_arg(&args, 0)?.as_str()))),
        "endswith" => Ok(Value::Bool(s.ends_with(text_arg(&args, 0)?.as_str()))),
        "replace" => Ok(Value::str(s.replace(text_arg(&args, 0)?.as_str(), text_arg(&args, 1)?.as_str()))),
        "split" => {
            let parts: Vec<Value> = match args.first() {
                None | Some(Value::None) => s.split_whitespace().map(Value::str).collect(),
                Some(_) => {
                    let sep = text_arg(&args, 0)?;
                    if sep.is_empty() {
                        return Err(value_error("empty separator"));
                    }
                    s.split(sep.as_str()).map(Value::str).collect()
                }
            };
            Ok(Value::list(parts))
        }
        "join" => {
            let items = iterate(&one(name, args)?)?;
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Str(t) => parts.push(t.to_string()),
                    other => {
                        return Err(type_error(format!(
                            "sequence item: expected str instance, {} found",
                            other.type_name()
                        )));
                    }
                }
            }
            Ok(Value::str(parts.join(s)))
        }
        _ => Err(attribute_error("str", name)),
    }
}
