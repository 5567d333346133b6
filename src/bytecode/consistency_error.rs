use crate::bytecode::Label;
use thiserror::Error;

/// Structural problems found while encoding, decoding or analyzing a
/// code unit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsistencyError {
    #[error("stack underflow at instruction {pos} ({op}): needs {needed} value(s), block level holds {available}")]
    Underflow {
        pos: usize,
        op: &'static str,
        needed: u32,
        available: u32,
    },

    #[error("inconsistent stack depth at {label}: reached with {expected} and with {found}")]
    InconsistentJoin { label: Label, expected: String, found: String },

    #[error("{op} at instruction {pos} does not match the innermost block ({found})")]
    MismatchedBlock {
        pos: usize,
        op: &'static str,
        found: &'static str,
    },

    #[error("label {0} is used but never placed")]
    UndefinedLabel(Label),

    #[error("label {0} is placed more than once")]
    DuplicateLabel(Label),

    #[error("{op} expects a {expected} operand, got {found}")]
    BadOperand {
        op: &'static str,
        expected: &'static str,
        found: String,
    },

    #[error("jump target of {op} is out of range")]
    JumpOutOfRange { op: &'static str },

    #[error("relative jump {op} to {label} must point forward")]
    BackwardRelativeJump { op: &'static str, label: Label },

    #[error("code unit '{0}' has free variables but is not nested in a function")]
    FreevarsOutsideFunction(String),

    #[error("control falls off the end of '{0}'")]
    FallsOffEnd(String),

    #[error("malformed code unit: {0}")]
    Malformed(String),
}
