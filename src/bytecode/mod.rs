pub mod consistency_error;
pub mod decode;
pub mod disasm;
pub mod encode;
pub mod ir;
pub mod op;
pub mod stack_check;
pub mod unit;

pub use consistency_error::ConsistencyError;
pub use decode::decode;
pub use encode::encode;
pub use ir::{Arg, Const, Instr, Item, Label, Literal, Stream};
pub use op::{
    CompareOp, OperandKind, Opcode, CALL_HAS_KWARGS, HAVE_ARGUMENT, MAKE_ANNOTATIONS, MAKE_CLOSURE, MAKE_DEFAULTS, MAKE_KWDEFAULTS,
};
pub use stack_check::{compute_max_stack, EXCEPTION_MARGIN};
pub use unit::{CodeFlags, CodeUnit, Constant};
