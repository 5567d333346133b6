//! Code-generation helper API shared by every pass.
//!
//! A [`CodeGen`] owns the stream of one unit being built together with the
//! name mode that decides how free names are reached from it.

use crate::ast::Constant;
use crate::bytecode::{Arg, Const, Label, Literal, Opcode, Stream, MAKE_CLOSURE};
use crate::compiler::compile_error::CompileError;
use crate::compiler::helpers::{Helper, HELPERS_GLOBAL};
use crate::compiler::locals::{Access, NameMode, LOCALS_CELL};

/// Cell holding the node list shared by the construction and binding units.
pub const NODES_CELL: &str = "__nodes";
/// Cell holding the scope key the outer unit was called with.
pub const KEY_CELL: &str = "__key";
/// Cell holding the globals mapping the outer unit was called with.
pub const GLOBALS_CELL: &str = "__globals";

/// Fast slot the remapping handler parks the caught exception in.
const CAUGHT: &str = "__exc";

pub type CompileResult<T = ()> = Result<T, CompileError>;

#[derive(Debug, Clone)]
struct LoopCtx {
    head: Label,
    /// try bodies and handlers opened since the loop began
    blocks: u32,
    /// inside a finally body of this loop
    in_finally: bool,
}

pub struct CodeGen {
    pub stream: Stream,
    pub mode: NameMode,
    loops: Vec<LoopCtx>,
    line: usize,
}

impl CodeGen {
    pub fn new(name: impl Into<String>, filename: &str, first_line: usize, mode: NameMode) -> Self {
        let mut stream = Stream::new(name, filename, first_line as u32);
        stream.newlocals = mode.uses_fast_locals();
        Self {
            stream,
            mode,
            loops: Vec::new(),
            line: first_line,
        }
    }

    /// A generator for a unit nested in this one.
    pub fn nested(&self, name: impl Into<String>, first_line: usize, mode: NameMode) -> CodeGen {
        CodeGen::new(name, &self.stream.filename, first_line, mode)
    }

    pub fn filename(&self) -> &str {
        &self.stream.filename
    }

    pub fn error(&self, line: usize, message: impl Into<String>) -> CompileError {
        CompileError::invalid(&self.stream.filename, line, message)
    }

    // ---- raw emission ---------------------------------------------------

    pub fn set_line(&mut self, line: usize) {
        if line != self.line || self.stream.items.is_empty() {
            self.line = line;
            self.stream.line(line as u32);
        }
    }

    pub fn current_line(&self) -> usize {
        self.line
    }

    pub fn emit(&mut self, op: Opcode, arg: Arg) {
        self.stream.emit(op, arg);
    }

    pub fn op(&mut self, op: Opcode) {
        self.stream.op(op);
    }

    pub fn int(&mut self, op: Opcode, n: usize) {
        self.stream.emit(op, Arg::Int(n as u32));
    }

    pub fn label(&mut self) -> Label {
        self.stream.new_label()
    }

    pub fn mark(&mut self, label: Label) {
        self.stream.mark(label);
    }

    pub fn jump(&mut self, op: Opcode, label: Label) {
        self.stream.emit(op, Arg::Jump(label));
    }

    pub fn load_const(&mut self, literal: Literal) {
        self.stream.emit(Opcode::LoadConst, Arg::Const(Const::Value(literal)));
    }

    pub fn load_none(&mut self) {
        self.load_const(Literal::None);
    }

    pub fn load_str(&mut self, text: &str) {
        self.load_const(Literal::str(text));
    }

    pub fn load_int(&mut self, n: usize) {
        self.load_const(Literal::Int(n as i64));
    }

    pub fn load_code(&mut self, code: Stream) {
        self.stream.emit(Opcode::LoadConst, Arg::Const(Const::Code(Box::new(code))));
    }

    pub fn load_fast(&mut self, name: &str) {
        self.stream.emit(Opcode::LoadFast, Arg::Local(name.to_string()));
    }

    pub fn store_fast(&mut self, name: &str) {
        self.stream.emit(Opcode::StoreFast, Arg::Local(name.to_string()));
    }

    pub fn load_deref(&mut self, name: &str) {
        self.stream.emit(Opcode::LoadDeref, Arg::Free(name.to_string()));
    }

    pub fn store_deref(&mut self, name: &str) {
        self.stream.emit(Opcode::StoreDeref, Arg::Free(name.to_string()));
    }

    pub fn load_global(&mut self, name: &str) {
        self.stream.emit(Opcode::LoadGlobal, Arg::Name(name.to_string()));
    }

    pub fn load_attr(&mut self, name: &str) {
        self.stream.emit(Opcode::LoadAttr, Arg::Name(name.to_string()));
    }

    pub fn call(&mut self, argc: usize) {
        self.int(Opcode::CallFunction, argc);
    }

    pub fn return_none(&mut self) {
        self.load_none();
        self.op(Opcode::ReturnValue);
    }

    /// Whether the last emitted instruction never falls through.
    pub fn ends_in_terminal(&self) -> bool {
        self.stream
            .items
            .iter()
            .rev()
            .find_map(|item| match item {
                crate::bytecode::Item::Op(instr) => Some(instr.op.is_terminal()),
                crate::bytecode::Item::Label(_) => Some(false),
                crate::bytecode::Item::Line(_) => None,
            })
            .unwrap_or(false)
    }

    // ---- names ----------------------------------------------------------

    pub fn load_name(&mut self, name: &str) {
        match self.mode.load(name) {
            Access::Name => self.emit(Opcode::LoadName, Arg::Name(name.to_string())),
            Access::Fast => self.load_fast(name),
            Access::Global => self.load_global(name),
            Access::ScopeMap => {
                self.load_deref(LOCALS_CELL);
                self.load_str(name);
                self.op(Opcode::BinarySubscr);
            }
        }
    }

    pub fn store_name(&mut self, name: &str) {
        match self.mode.store(name) {
            Access::Fast => self.store_fast(name),
            _ => self.emit(Opcode::StoreName, Arg::Name(name.to_string())),
        }
    }

    pub fn delete_name(&mut self, name: &str, line: usize) -> CompileResult {
        match self.mode.load(name) {
            Access::Name => self.emit(Opcode::DeleteName, Arg::Name(name.to_string())),
            Access::Fast => self.emit(Opcode::DeleteFast, Arg::Local(name.to_string())),
            Access::Global => self.emit(Opcode::DeleteGlobal, Arg::Name(name.to_string())),
            Access::ScopeMap => return Err(self.error(line, format!("can't delete template name '{}'", name))),
        }
        Ok(())
    }

    // ---- helper table and node list --------------------------------------

    /// Pushes the helper callable; arguments follow, then [`CodeGen::call`].
    pub fn load_helper(&mut self, helper: Helper) {
        self.load_global(HELPERS_GLOBAL);
        self.load_attr(helper.name());
    }

    pub fn load_node(&mut self, index: usize) {
        self.load_deref(NODES_CELL);
        self.load_int(index);
        self.op(Opcode::BinarySubscr);
    }

    /// Stores the value on top of the stack at `__nodes[index]`.
    pub fn store_node(&mut self, index: usize) {
        self.load_deref(NODES_CELL);
        self.load_int(index);
        self.op(Opcode::StoreSubscr);
    }

    /// Pushes the template scope map, or `None` outside templates.
    pub fn load_template_scope(&mut self) {
        if self.has_template_scope() {
            self.load_deref(LOCALS_CELL);
        } else {
            self.load_none();
        }
    }

    pub fn has_template_scope(&self) -> bool {
        self.stream.freevars.iter().any(|n| n == LOCALS_CELL)
    }

    pub fn load_str_tuple(&mut self, items: &[String]) {
        self.load_const(Literal::Tuple(items.iter().map(|s| Literal::str(s.as_str())).collect()));
    }

    /// Emits `body` inside a diagnostic remapping region.
    ///
    /// Any exception escaping the region is passed to `remap_error` with the
    /// source position, and whatever that returns is raised in its place, so
    /// the reported origin is the declaration rather than a helper frame.
    /// The region must leave the stack as it found it.
    pub fn remapped(&mut self, line: usize, body: impl FnOnce(&mut CodeGen) -> CompileResult) -> CompileResult {
        let handler = self.label();
        let end = self.label();
        self.jump(Opcode::SetupExcept, handler);
        body(self)?;
        self.op(Opcode::PopBlock);
        self.jump(Opcode::JumpForward, end);

        self.mark(handler);
        self.op(Opcode::PopTop);
        self.store_fast(CAUGHT);
        self.op(Opcode::PopTop);
        self.load_helper(Helper::RemapError);
        self.load_fast(CAUGHT);
        let filename = self.stream.filename.clone();
        self.load_str(&filename);
        self.load_int(line);
        self.call(3);
        self.int(Opcode::RaiseVarargs, 1);
        self.mark(end);
        Ok(())
    }

    /// Builds a function object from `code` capturing its free variables
    /// from this unit. `flags` adds the `MAKE_FUNCTION` bits for any
    /// defaults the caller already pushed.
    pub fn make_function(&mut self, code: Stream, qualname: &str, flags: u32) {
        let mut flags = flags;
        if !code.freevars.is_empty() {
            for name in &code.freevars {
                self.emit(Opcode::LoadClosure, Arg::Free(name.clone()));
            }
            self.int(Opcode::BuildTuple, code.freevars.len());
            flags |= MAKE_CLOSURE;
        }
        self.load_code(code);
        self.load_str(qualname);
        self.emit(Opcode::MakeFunction, Arg::Int(flags));
    }

    /// Calls a sub-unit for its effects, then continues.
    pub fn call_subunit(&mut self, code: Stream, qualname: &str) {
        self.make_function(code, qualname, 0);
        self.call(0);
        self.op(Opcode::PopTop);
    }

    pub fn finish(self) -> Stream {
        self.stream
    }

    // ---- loop bookkeeping -------------------------------------------------

    pub fn push_loop(&mut self, head: Label) {
        self.loops.push(LoopCtx {
            head,
            blocks: 0,
            in_finally: false,
        });
    }

    pub fn pop_loop(&mut self) {
        self.loops.pop();
    }

    /// Marks entry into a try body or handler inside the innermost loop.
    pub fn enter_block(&mut self) {
        if let Some(ctx) = self.loops.last_mut() {
            ctx.blocks += 1;
        }
    }

    pub fn exit_block(&mut self) {
        if let Some(ctx) = self.loops.last_mut() {
            ctx.blocks = ctx.blocks.saturating_sub(1);
        }
    }

    /// Returns the previous flag so nested finally bodies restore it.
    pub fn enter_finally(&mut self) -> bool {
        match self.loops.last_mut() {
            Some(ctx) => std::mem::replace(&mut ctx.in_finally, true),
            None => false,
        }
    }

    pub fn exit_finally(&mut self, previous: bool) {
        if let Some(ctx) = self.loops.last_mut() {
            ctx.in_finally = previous;
        }
    }

    pub fn emit_break(&mut self, line: usize) -> CompileResult {
        if self.loops.is_empty() {
            return Err(self.error(line, "'break' outside loop"));
        }
        self.op(Opcode::BreakLoop);
        Ok(())
    }

    pub fn emit_continue(&mut self, line: usize) -> CompileResult {
        let Some(ctx) = self.loops.last().cloned() else {
            return Err(self.error(line, "'continue' not properly in loop"));
        };
        if ctx.in_finally {
            return Err(self.error(line, "'continue' not supported inside 'finally' clause"));
        }
        if ctx.blocks > 0 {
            self.jump(Opcode::ContinueLoop, ctx.head);
        } else {
            self.jump(Opcode::JumpAbsolute, ctx.head);
        }
        Ok(())
    }
}

pub fn literal(constant: &Constant) -> Literal {
    match constant {
        Constant::None => Literal::None,
        Constant::Bool(b) => Literal::Bool(*b),
        Constant::Int(n) => Literal::Int(*n),
        Constant::Float(x) => Literal::Float(*x),
        Constant::Str(s) => Literal::Str(s.clone()),
        Constant::Bytes(b) => Literal::Bytes(b.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{compute_max_stack, encode, Item};

    fn pass_gen() -> CodeGen {
        let mut code = CodeGen::new("construct", "main.kn", 1, NameMode::pass(vec!["n".into()]));
        code.stream.freevars = vec![NODES_CELL.to_string(), LOCALS_CELL.to_string()];
        code
    }

    #[test]
    fn test_remapped_region_is_balanced() {
        let mut code = pass_gen();
        code.remapped(3, |g| {
            g.load_helper(Helper::ValidateDeclarative);
            g.load_name("Window");
            g.call(1);
            g.store_fast("__base");
            Ok(())
        })
        .unwrap();
        code.return_none();
        let stream = code.finish();
        assert!(compute_max_stack(&stream).is_ok());
        let names: Vec<Opcode> = stream.instructions().map(|i| i.op).collect();
        assert_eq!(names[0], Opcode::SetupExcept);
        assert!(names.contains(&Opcode::RaiseVarargs));
        assert!(encode(&stream, true).is_ok());
    }

    #[test]
    fn test_name_access_per_mode() {
        let mut code = pass_gen();
        code.load_name("n");
        code.load_name("len");
        let ops: Vec<Opcode> = code.stream.instructions().map(|i| i.op).collect();
        assert_eq!(
            ops,
            vec![Opcode::LoadDeref, Opcode::LoadConst, Opcode::BinarySubscr, Opcode::LoadGlobal]
        );

        let mut dynamic = CodeGen::new("expr", "main.kn", 1, NameMode::Dynamic);
        dynamic.load_name("n");
        dynamic.store_name("m");
        assert!(!dynamic.stream.newlocals);
        let ops: Vec<Opcode> = dynamic.stream.instructions().map(|i| i.op).collect();
        assert_eq!(ops, vec![Opcode::LoadName, Opcode::StoreName]);
    }

    #[test]
    fn test_closure_captures_freevars() {
        let mut outer = CodeGen::new("outer", "main.kn", 1, NameMode::Dynamic);
        let mut inner = outer.nested("inner", 2, NameMode::pass(Vec::new()));
        inner.stream.freevars = vec![NODES_CELL.to_string()];
        inner.load_node(0);
        inner.op(Opcode::ReturnValue);
        outer.call_subunit(inner.finish(), "outer.inner");
        let ops: Vec<Opcode> = outer.stream.instructions().map(|i| i.op).collect();
        assert_eq!(
            ops,
            vec![
                Opcode::LoadClosure,
                Opcode::BuildTuple,
                Opcode::LoadConst,
                Opcode::LoadConst,
                Opcode::MakeFunction,
                Opcode::CallFunction,
                Opcode::PopTop
            ]
        );
        let Some(Item::Op(make)) = outer.stream.items.iter().rev().nth(2) else { panic!("expected op") };
        assert_eq!(make.arg, Arg::Int(MAKE_CLOSURE));
    }

    #[test]
    fn test_loop_control_errors() {
        let mut code = CodeGen::new("f", "main.kn", 1, NameMode::Dynamic);
        assert!(code.emit_break(4).unwrap_err().to_string().contains("'break' outside loop"));
        let head = code.label();
        code.push_loop(head);
        code.enter_block();
        code.emit_continue(5).unwrap();
        code.exit_block();
        code.emit_continue(6).unwrap();
        let previous = code.enter_finally();
        assert!(code.emit_continue(7).is_err());
        code.exit_finally(previous);
        let ops: Vec<Opcode> = code.stream.instructions().map(|i| i.op).collect();
        assert_eq!(ops, vec![Opcode::ContinueLoop, Opcode::JumpAbsolute]);
    }
}
