use std::rc::Rc;

use thiserror::Error;

use crate::bytecode::{ConsistencyError, Opcode};
use crate::runtime::exception::{ExceptionKind, ExceptionValue};
use crate::runtime::scope::ResolutionError;

/// Failure while executing a code unit.
///
/// Only [`RuntimeError::Exception`] can be caught by generated handlers;
/// every other variant aborts the whole evaluation.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{0}")]
    Exception(Rc<ExceptionValue>),
    #[error("maximum call depth of {0} exceeded")]
    RecursionLimit(usize),
    #[error("execution step limit exceeded ({0})")]
    StepLimit(usize),
    #[error("{0} is not supported by this machine")]
    Unsupported(Opcode),
    #[error("invalid code: {0}")]
    InvalidCode(String),
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

impl RuntimeError {
    pub fn raise(kind: ExceptionKind, message: impl Into<String>) -> RuntimeError {
        RuntimeError::Exception(ExceptionValue::with_message(kind, message))
    }

    /// The exception carried by a catchable error.
    pub fn exception(&self) -> Option<&Rc<ExceptionValue>> {
        match self {
            RuntimeError::Exception(exc) => Some(exc),
            _ => None,
        }
    }
}

pub fn type_error(message: impl Into<String>) -> RuntimeError {
    RuntimeError::raise(ExceptionKind::TypeError, message)
}

pub fn value_error(message: impl Into<String>) -> RuntimeError {
    RuntimeError::raise(ExceptionKind::ValueError, message)
}

pub fn name_error(name: &str) -> RuntimeError {
    RuntimeError::raise(ExceptionKind::NameError, format!("name '{}' is not defined", name))
}

pub fn attribute_error(type_name: &str, attr: &str) -> RuntimeError {
    RuntimeError::raise(
        ExceptionKind::AttributeError,
        format!("'{}' object has no attribute '{}'", type_name, attr),
    )
}

pub fn index_error(what: &str) -> RuntimeError {
    RuntimeError::raise(ExceptionKind::IndexError, format!("{} index out of range", what))
}

pub fn division_by_zero() -> RuntimeError {
    RuntimeError::raise(ExceptionKind::ZeroDivisionError, "division by zero")
}
