//! Toolchain for the kindle declarative UI language: lexer, parser,
//! compiler to a stack-machine code format, and a reference machine that
//! runs the compiled units against a host runtime.

pub mod ast;
pub mod bytecode;
pub mod compiler;
pub mod frontend;
pub mod grammar;
pub mod lexer;
pub mod logging;
pub mod parser;
pub mod parser_error;
pub mod runtime;
pub mod token;

pub use compiler::{CompileError, CompiledItem, CompiledModule, Compiler};
pub use grammar::Grammar;
pub use parser::parse_source;
pub use runtime::{Machine, RuntimeError, Value};
