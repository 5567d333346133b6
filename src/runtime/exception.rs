//! Exception types and raised exception instances.
//!
//! Types form a single-inheritance chain matched by name, so a host may
//! build its own types on top of the builtin hierarchy.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::runtime::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    BaseException,
    Exception,
    TypeError,
    ValueError,
    NameError,
    UnboundLocalError,
    AttributeError,
    LookupError,
    KeyError,
    IndexError,
    ArithmeticError,
    ZeroDivisionError,
    AssertionError,
    RuntimeError,
    StopIteration,
}

impl ExceptionKind {
    pub const ALL: &'static [ExceptionKind] = &[
        ExceptionKind::BaseException,
        ExceptionKind::Exception,
        ExceptionKind::TypeError,
        ExceptionKind::ValueError,
        ExceptionKind::NameError,
        ExceptionKind::UnboundLocalError,
        ExceptionKind::AttributeError,
        ExceptionKind::LookupError,
        ExceptionKind::KeyError,
        ExceptionKind::IndexError,
        ExceptionKind::ArithmeticError,
        ExceptionKind::ZeroDivisionError,
        ExceptionKind::AssertionError,
        ExceptionKind::RuntimeError,
        ExceptionKind::StopIteration,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::BaseException => "BaseException",
            Self::Exception => "Exception",
            Self::TypeError => "TypeError",
            Self::ValueError => "ValueError",
            Self::NameError => "NameError",
            Self::UnboundLocalError => "UnboundLocalError",
            Self::AttributeError => "AttributeError",
            Self::LookupError => "LookupError",
            Self::KeyError => "KeyError",
            Self::IndexError => "IndexError",
            Self::ArithmeticError => "ArithmeticError",
            Self::ZeroDivisionError => "ZeroDivisionError",
            Self::AssertionError => "AssertionError",
            Self::RuntimeError => "RuntimeError",
            Self::StopIteration => "StopIteration",
        }
    }

    pub fn parent(self) -> Option<ExceptionKind> {
        match self {
            Self::BaseException => None,
            Self::Exception => Some(Self::BaseException),
            Self::UnboundLocalError => Some(Self::NameError),
            Self::KeyError | Self::IndexError => Some(Self::LookupError),
            Self::ZeroDivisionError => Some(Self::ArithmeticError),
            _ => Some(Self::Exception),
        }
    }
}

/// An exception class.
#[derive(Debug)]
pub struct ExcType {
    pub name: String,
    pub parent: Option<Rc<ExcType>>,
}

impl ExcType {
    pub fn new(name: impl Into<String>, parent: Option<Rc<ExcType>>) -> Rc<ExcType> {
        Rc::new(ExcType {
            name: name.into(),
            parent,
        })
    }

    pub fn builtin(kind: ExceptionKind) -> Rc<ExcType> {
        ExcType::new(kind.name(), kind.parent().map(ExcType::builtin))
    }

    /// Whether `self` is `other` or derives from it.
    pub fn is_subtype(&self, other: &ExcType) -> bool {
        let mut current = Some(self);
        while let Some(t) = current {
            if t.name == other.name {
                return true;
            }
            current = t.parent.as_deref();
        }
        false
    }

    pub fn is_kind(&self, kind: ExceptionKind) -> bool {
        let mut current = Some(self);
        while let Some(t) = current {
            if t.name == kind.name() {
                return true;
            }
            current = t.parent.as_deref();
        }
        false
    }
}

/// One traceback entry, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub filename: String,
    pub line: u32,
    pub unit: String,
}

/// A raised (or raisable) exception instance.
#[derive(Debug)]
pub struct ExceptionValue {
    pub kind: Rc<ExcType>,
    pub args: Vec<Value>,
    pub cause: RefCell<Option<Value>>,
    /// Declaration position attached by a remapping region.
    pub origin: RefCell<Option<(String, u32)>>,
    pub traceback: RefCell<Vec<TraceEntry>>,
}

impl ExceptionValue {
    pub fn new(kind: Rc<ExcType>, args: Vec<Value>) -> Rc<ExceptionValue> {
        Rc::new(ExceptionValue {
            kind,
            args,
            cause: RefCell::new(None),
            origin: RefCell::new(None),
            traceback: RefCell::new(Vec::new()),
        })
    }

    pub fn with_message(kind: ExceptionKind, message: impl Into<String>) -> Rc<ExceptionValue> {
        let message: String = message.into();
        ExceptionValue::new(ExcType::builtin(kind), vec![Value::str(message)])
    }

    pub fn is_kind(&self, kind: ExceptionKind) -> bool {
        self.kind.is_kind(kind)
    }

    pub fn message(&self) -> String {
        match self.args.as_slice() {
            [] => String::new(),
            [single] => single.to_string(),
            many => Value::tuple(many.to_vec()).repr(),
        }
    }
}

impl fmt::Display for ExceptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = self.message();
        if message.is_empty() {
            write!(f, "{}", self.kind.name)?;
        } else {
            write!(f, "{}: {}", self.kind.name, message)?;
        }
        if let Some((filename, line)) = self.origin.borrow().as_ref() {
            write!(f, " ({}, line {})", filename, line)?;
        }
        Ok(())
    }
}
