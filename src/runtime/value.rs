use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

use crate::bytecode::{CodeUnit, Literal};
use crate::runtime::exception::{ExcType, ExceptionValue};
use crate::runtime::machine::Machine;
use crate::runtime::runtime_error::{attribute_error, type_error, RuntimeError};

pub type Shared<T> = Rc<RefCell<T>>;
pub type DictRef = Shared<Dict>;
/// A closure cell; `None` until the owning unit stores into it.
pub type Cell = Shared<Option<Value>>;
pub type Kwargs = Vec<(String, Value)>;
pub type NativeFn = dyn Fn(&mut Machine, Vec<Value>, Kwargs) -> Result<Value, RuntimeError>;

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Bytes(Rc<[u8]>),
    Tuple(Rc<Vec<Value>>),
    List(Shared<Vec<Value>>),
    Dict(DictRef),
    Set(Shared<Vec<Value>>),
    Slice(Rc<SliceValue>),
    Function(Rc<Function>),
    Native(Rc<NativeFunction>),
    Method(Rc<BoundMethod>),
    Code(Rc<CodeUnit>),
    ExcType(Rc<ExcType>),
    Exception(Rc<ExceptionValue>),
    Iter(Shared<IterState>),
    Cell(Cell),
    Object(Rc<dyn HostObject>),
}

/// Anything the embedding runtime hands to generated code: construct
/// nodes, helper tables, declarative objects in the parent chain.
pub trait HostObject: fmt::Debug {
    fn type_name(&self) -> &str;

    fn get_attr(&self, name: &str) -> Option<Value>;

    fn set_attr(&self, name: &str, _value: Value) -> Result<(), RuntimeError> {
        Err(attribute_error(self.type_name(), name))
    }

    fn del_attr(&self, name: &str) -> Result<(), RuntimeError> {
        Err(attribute_error(self.type_name(), name))
    }

    /// Next object up the declarative parent chain.
    fn parent(&self) -> Option<Rc<dyn HostObject>> {
        None
    }

    fn call(&self, _machine: &mut Machine, _args: Vec<Value>, _kwargs: Kwargs) -> Result<Value, RuntimeError> {
        Err(type_error(format!("'{}' object is not callable", self.type_name())))
    }
}

#[derive(Debug)]
pub struct Function {
    pub code: Rc<CodeUnit>,
    pub qualname: String,
    pub globals: DictRef,
    /// Defaults for the trailing positional parameters.
    pub defaults: Vec<Value>,
    pub kwdefaults: Vec<(String, Value)>,
    pub closure: Vec<Cell>,
}

pub struct NativeFunction {
    pub name: String,
    pub func: Box<NativeFn>,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<built-in function {}>", self.name)
    }
}

/// A builtin method looked up on a builtin value, e.g. `items.append`.
#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub name: String,
}

#[derive(Debug)]
pub struct SliceValue {
    pub start: Value,
    pub stop: Value,
    pub step: Value,
}

/// Iteration state over a snapshot of the iterated container.
#[derive(Debug, Default)]
pub struct IterState {
    pub items: Vec<Value>,
    pub pos: usize,
}

impl Iterator for IterState {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        let item = self.items.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }
}

/// Insertion-ordered mapping with equality-based keys.
#[derive(Debug, Clone, Default)]
pub struct Dict {
    entries: Vec<(Value, Value)>,
}

impl Dict {
    pub fn new() -> Dict {
        Dict::default()
    }

    pub fn shared(self) -> DictRef {
        Rc::new(RefCell::new(self))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, key: &Value) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k.equals(key))
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.position(key).map(|i| &self.entries[i].1)
    }

    pub fn get_str(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| matches!(k, Value::Str(s) if &**s == key))
            .map(|(_, v)| v)
    }

    pub fn contains(&self, key: &Value) -> bool {
        self.position(key).is_some()
    }

    pub fn insert(&mut self, key: Value, value: Value) {
        match self.position(&key) {
            Some(i) => self.entries[i].1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn set_str(&mut self, key: &str, value: Value) {
        self.insert(Value::str(key), value);
    }

    pub fn remove(&mut self, key: &Value) -> Option<Value> {
        self.position(key).map(|i| self.entries.remove(i).1)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter()
    }
}

impl FromIterator<(Value, Value)> for Dict {
    fn from_iter<I: IntoIterator<Item = (Value, Value)>>(iter: I) -> Dict {
        let mut dict = Dict::new();
        for (k, v) in iter {
            dict.insert(k, v);
        }
        dict
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }
}

impl Value {
    pub fn str(text: impl Into<Rc<str>>) -> Value {
        Value::Str(text.into())
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Rc::new(items))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn dict(dict: Dict) -> Value {
        Value::Dict(dict.shared())
    }

    pub fn object(object: impl HostObject + 'static) -> Value {
        Value::Object(Rc::new(object))
    }

    pub fn native(
        name: impl Into<String>,
        func: impl Fn(&mut Machine, Vec<Value>, Kwargs) -> Result<Value, RuntimeError> + 'static,
    ) -> Value {
        Value::Native(Rc::new(NativeFunction {
            name: name.into(),
            func: Box::new(func),
        }))
    }

    pub fn from_literal(literal: &Literal) -> Value {
        match literal {
            Literal::None => Value::None,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Int(i) => Value::Int(*i),
            Literal::Float(f) => Value::Float(*f),
            Literal::Str(s) => Value::str(s.as_str()),
            Literal::Bytes(b) => Value::Bytes(b.as_slice().into()),
            Literal::Tuple(items) => Value::tuple(items.iter().map(Value::from_literal).collect()),
        }
    }

    pub fn type_name(&self) -> String {
        match self {
            Value::None => "NoneType".into(),
            Value::Bool(_) => "bool".into(),
            Value::Int(_) => "int".into(),
            Value::Float(_) => "float".into(),
            Value::Str(_) => "str".into(),
            Value::Bytes(_) => "bytes".into(),
            Value::Tuple(_) => "tuple".into(),
            Value::List(_) => "list".into(),
            Value::Dict(_) => "dict".into(),
            Value::Set(_) => "set".into(),
            Value::Slice(_) => "slice".into(),
            Value::Function(_) => "function".into(),
            Value::Native(_) => "builtin_function_or_method".into(),
            Value::Method(_) => "method".into(),
            Value::Code(_) => "code".into(),
            Value::ExcType(_) => "type".into(),
            Value::Exception(exc) => exc.kind.name.clone(),
            Value::Iter(_) => "iterator".into(),
            Value::Cell(_) => "cell".into(),
            Value::Object(obj) => obj.type_name().to_string(),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::List(items) | Value::Set(items) => !items.borrow().is_empty(),
            Value::Dict(dict) => !dict.borrow().is_empty(),
            _ => true,
        }
    }

    fn number(&self) -> Option<Number> {
        match self {
            Value::Bool(b) => Some(Number::Int(*b as i64)),
            Value::Int(i) => Some(Number::Int(*i)),
            Value::Float(f) => Some(Number::Float(*f)),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(*b as i64),
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        self.number().map(Number::as_f64)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Identity comparison (`is`).
    pub fn is(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b),
            (Value::Bytes(a), Value::Bytes(b)) => Rc::ptr_eq(a, b),
            (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b),
            (Value::List(a), Value::List(b)) | (Value::Set(a), Value::Set(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::Slice(a), Value::Slice(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(a, b),
            (Value::Method(a), Value::Method(b)) => Rc::ptr_eq(a, b),
            (Value::Code(a), Value::Code(b)) => Rc::ptr_eq(a, b),
            (Value::ExcType(a), Value::ExcType(b)) => Rc::ptr_eq(a, b) || a.name == b.name,
            (Value::Exception(a), Value::Exception(b)) => Rc::ptr_eq(a, b),
            (Value::Iter(a), Value::Iter(b)) => Rc::ptr_eq(a, b),
            (Value::Cell(a), Value::Cell(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Value equality (`==`); containers compare element-wise.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => seq_equals(a, b),
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b) || seq_equals(&a.borrow(), &b.borrow()),
            (Value::Set(a), Value::Set(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().all(|x| b.iter().any(|y| x.equals(y)))
            }
            (Value::Dict(a), Value::Dict(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| v.equals(w)))
            }
            _ => match (self.number(), other.number()) {
                (Some(Number::Int(a)), Some(Number::Int(b))) => a == b,
                (Some(a), Some(b)) => a.as_f64() == b.as_f64(),
                _ => self.is(other),
            },
        }
    }

    /// Ordering for `<` and friends; `None` when the operands don't order.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (Value::Tuple(a), Value::Tuple(b)) => seq_compare(a, b),
            (Value::List(a), Value::List(b)) => seq_compare(&a.borrow(), &b.borrow()),
            _ => match (self.number()?, other.number()?) {
                (Number::Int(a), Number::Int(b)) => Some(a.cmp(&b)),
                (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
            },
        }
    }

    /// Rejects mutable containers used as dict keys or set members.
    pub fn check_hashable(&self) -> Result<(), RuntimeError> {
        match self {
            Value::List(_) | Value::Dict(_) | Value::Set(_) => {
                Err(type_error(format!("unhashable type: '{}'", self.type_name())))
            }
            Value::Tuple(items) => items.iter().try_for_each(Value::check_hashable),
            _ => Ok(()),
        }
    }

    pub fn repr(&self) -> String {
        match self {
            Value::None => "None".into(),
            Value::Bool(true) => "True".into(),
            Value::Bool(false) => "False".into(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(s) => quote(s),
            Value::Bytes(b) => format!("b{}", quote(&String::from_utf8_lossy(b))),
            Value::Tuple(items) if items.len() == 1 => format!("({},)", items[0].repr()),
            Value::Tuple(items) => format!("({})", join_repr(items.iter())),
            Value::List(items) => format!("[{}]", join_repr(items.borrow().iter())),
            Value::Set(items) if items.borrow().is_empty() => "set()".into(),
            Value::Set(items) => format!("{{{}}}", join_repr(items.borrow().iter())),
            Value::Dict(dict) => {
                let dict = dict.borrow();
                let parts: Vec<String> = dict.iter().map(|(k, v)| format!("{}: {}", k.repr(), v.repr())).collect();
                format!("{{{}}}", parts.join(", "))
            }
            Value::Slice(s) => format!("slice({}, {}, {})", s.start.repr(), s.stop.repr(), s.step.repr()),
            Value::Function(func) => format!("<function {}>", func.qualname),
            Value::Native(native) => format!("<built-in function {}>", native.name),
            Value::Method(method) => format!("<built-in method {} of {} object>", method.name, method.receiver.type_name()),
            Value::Code(code) => format!("<code object {}, file {:?}, line {}>", code.name, code.filename, code.first_line),
            Value::ExcType(t) => format!("<class '{}'>", t.name),
            Value::Exception(exc) => format!("{}({})", exc.kind.name, join_repr(exc.args.iter())),
            Value::Iter(_) => "<iterator>".into(),
            Value::Cell(_) => "<cell>".into(),
            Value::Object(obj) => format!("<{} object>", obj.type_name()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{}", s),
            Value::Exception(exc) => write!(f, "{}", exc.message()),
            other => write!(f, "{}", other.repr()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Value {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::str(s)
    }
}

fn seq_equals(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.equals(y))
}

fn seq_compare(a: &[Value], b: &[Value]) -> Option<Ordering> {
    for (x, y) in a.iter().zip(b) {
        if !x.equals(y) {
            return x.compare(y);
        }
    }
    Some(a.len().cmp(&b.len()))
}

fn join_repr<'a>(items: impl Iterator<Item = &'a Value>) -> String {
    items.map(Value::repr).collect::<Vec<_>>().join(", ")
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".into()
    } else if f.is_infinite() {
        if f > 0.0 { "inf".into() } else { "-inf".into() }
    } else {
        format!("{:?}", f)
    }
}

fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for c in text.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_equality_crosses_types() {
        assert!(Value::Int(1).equals(&Value::Float(1.0)));
        assert!(Value::Bool(true).equals(&Value::Int(1)));
        assert!(!Value::Int(1).equals(&Value::str("1")));
        assert_eq!(Value::Int(2).compare(&Value::Float(2.5)), Some(Ordering::Less));
        assert_eq!(Value::str("a").compare(&Value::Int(1)), None);
    }

    #[test]
    fn test_dict_keeps_insertion_order() {
        let mut dict = Dict::new();
        dict.insert(Value::str("b"), Value::Int(1));
        dict.insert(Value::str("a"), Value::Int(2));
        dict.insert(Value::str("b"), Value::Int(3));
        let keys: Vec<String> = dict.keys().map(Value::to_string).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert!(dict.get_str("b").is_some_and(|v| v.equals(&Value::Int(3))));
        assert!(dict.get(&Value::Int(1)).is_none());
    }

    #[test]
    fn test_repr_matches_source_syntax() {
        let value = Value::tuple(vec![
            Value::str("it's"),
            Value::list(vec![Value::None, Value::Bool(true)]),
            Value::Float(2.0),
        ]);
        assert_eq!(value.repr(), "('it\\'s', [None, True], 2.0)");
        assert_eq!(Value::tuple(vec![Value::Int(1)]).repr(), "(1,)");
        assert_eq!(Value::str("x").to_string(), "x");
    }

    #[test]
    fn test_unhashable_keys() {
        assert!(Value::list(vec![]).check_hashable().is_err());
        assert!(Value::tuple(vec![Value::Int(1), Value::str("a")]).check_hashable().is_ok());
    }
}
