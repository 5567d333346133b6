//! Reference machine for encoded code units.
//!
//! Calls between code units push a [`Frame`] onto the machine's own frame
//! stack instead of recursing natively; only calls re-entering from native
//! functions or host objects nest [`Machine::call`]. Exceptions unwind
//! through each frame's block stack and then through its callers; `return`,
//! `break` and `continue` leaving a `try` with a `finally` clause park
//! themselves as pending actions that `END_FINALLY` resumes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::bytecode::decode::{read_instructions, RawInstr};
use crate::bytecode::{
    CodeUnit, CompareOp, Constant, Opcode, CALL_HAS_KWARGS, MAKE_ANNOTATIONS, MAKE_CLOSURE, MAKE_DEFAULTS, MAKE_KWDEFAULTS,
};
use crate::runtime::builtins::{builtin_attr, builtins, call_method};
use crate::runtime::exception::{ExceptionKind, ExceptionValue, TraceEntry};
use crate::runtime::ops;
use crate::runtime::runtime_error::{attribute_error, name_error, type_error, value_error, RuntimeError};
use crate::runtime::scope::{Namespace, ResolutionError, BUILTINS_NAME};
use crate::runtime::value::{Cell, Dict, DictRef, Function, IterState, Kwargs, Value};

#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub max_call_depth: usize,
    pub max_steps: Option<usize>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            max_call_depth: 200,
            max_steps: None,
        }
    }
}

/// A code unit split into instructions, with its constants converted.
struct Prepared {
    code: Rc<CodeUnit>,
    instrs: Vec<RawInstr>,
    consts: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Loop,
    Except,
    Finally,
    /// An `except` clause body; holds the exception being handled.
    Handler,
}

struct Block {
    kind: BlockKind,
    handler: u32,
    level: usize,
    exc: Option<Rc<ExceptionValue>>,
}

/// Why control is leaving the normal instruction sequence.
enum Why {
    Return(Value),
    Break,
    Continue(u32),
    Raise(Rc<ExceptionValue>),
}

/// What the machine does after one instruction.
enum Flow {
    Next,
    /// Push a frame for a call between code units.
    Call(Rc<Function>, Vec<Value>, Kwargs),
    Leave(Why),
}

/// An action suspended while a `finally` body runs. `pos` is the stack
/// slot of the `None` marker `END_FINALLY` will pop.
struct Pending {
    pos: usize,
    why: Why,
}

struct Frame<'s> {
    prepared: Rc<Prepared>,
    globals: DictRef,
    fast: Vec<Option<Value>>,
    /// Cell variables followed by free variables.
    cells: Vec<Cell>,
    stack: Vec<Value>,
    blocks: Vec<Block>,
    pending: Vec<Pending>,
    pc: usize,
    names: Option<&'s mut dyn Namespace>,
}

fn invalid(message: impl Into<String>) -> RuntimeError {
    RuntimeError::InvalidCode(message.into())
}

impl Frame<'_> {
    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or_else(|| invalid("value stack underflow"))
    }

    fn top(&self) -> Result<&Value, RuntimeError> {
        self.stack.last().ok_or_else(|| invalid("value stack underflow"))
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, RuntimeError> {
        if n > self.stack.len() {
            return Err(invalid("value stack underflow"));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn jump(&mut self, offset: u32) -> Result<(), RuntimeError> {
        self.pc = self
            .prepared
            .instrs
            .binary_search_by_key(&offset, |i| i.offset)
            .map_err(|_| invalid(format!("jump to offset {} outside the instruction stream", offset)))?;
        Ok(())
    }

    /// Drops values above `level`, along with any pending action whose
    /// marker goes with them.
    fn truncate(&mut self, level: usize) {
        self.stack.truncate(level);
        self.pending.retain(|p| p.pos < level);
    }

    fn name(&self, index: u32) -> Result<&str, RuntimeError> {
        self.prepared
            .code
            .names
            .get(index as usize)
            .map(String::as_str)
            .ok_or_else(|| invalid(format!("name index {} out of range", index)))
    }

    fn cell(&self, index: u32) -> Result<&Cell, RuntimeError> {
        self.cells
            .get(index as usize)
            .ok_or_else(|| invalid(format!("cell index {} out of range", index)))
    }

    fn current_exception(&self) -> Option<Rc<ExceptionValue>> {
        self.blocks.iter().rev().find_map(|b| b.exc.clone())
    }

    fn record_trace(&self, exc: &ExceptionValue, instr: &RawInstr) {
        let code = &self.prepared.code;
        exc.traceback.borrow_mut().push(TraceEntry {
            filename: code.filename.clone(),
            line: code.line_for(instr.offset),
            unit: code.name.clone(),
        });
    }

    /// Records the instruction that made the call now unwinding.
    fn record_call_trace(&self, exc: &ExceptionValue) {
        if let Some(instr) = self.pc.checked_sub(1).and_then(|pc| self.prepared.instrs.get(pc)) {
            self.record_trace(exc, instr);
        }
    }

    /// Pops blocks until one takes over `why`. Returns `why` when it
    /// leaves the frame instead.
    fn unwind(&mut self, why: Why) -> Result<Option<Why>, RuntimeError> {
        let Some(block) = self.blocks.pop() else {
            return Ok(Some(why));
        };
        match (block.kind, why) {
            (BlockKind::Loop, Why::Break) => {
                self.truncate(block.level);
                self.jump(block.handler)?;
            }
            (BlockKind::Loop, Why::Continue(target)) => {
                self.blocks.push(block);
                self.jump(target)?;
            }
            (BlockKind::Except, Why::Raise(exc)) => {
                self.truncate(block.level);
                self.blocks.push(Block {
                    kind: BlockKind::Handler,
                    handler: block.handler,
                    level: block.level,
                    exc: Some(exc.clone()),
                });
                self.push_exception(exc);
                self.jump(block.handler)?;
            }
            (BlockKind::Finally, Why::Raise(exc)) => {
                self.truncate(block.level);
                self.push_exception(exc);
                self.jump(block.handler)?;
            }
            (BlockKind::Finally, other) => {
                self.truncate(block.level);
                self.pending.push(Pending {
                    pos: self.stack.len(),
                    why: other,
                });
                self.push(Value::None);
                self.jump(block.handler)?;
            }
            (_, other) => {
                self.truncate(block.level);
                return self.unwind(other);
            }
        }
        Ok(None)
    }

    /// Handler entry state: traceback, value, type with the type on top.
    fn push_exception(&mut self, exc: Rc<ExceptionValue>) {
        let kind = Value::ExcType(exc.kind.clone());
        self.push(Value::None);
        self.push(Value::Exception(exc));
        self.push(kind);
    }
}

pub struct Machine {
    config: MachineConfig,
    builtins: DictRef,
    depth: usize,
    steps: usize,
    /// Keyed by unit address; each entry keeps its unit alive, so an address
    /// is not reused while cached.
    prepared: HashMap<*const CodeUnit, Rc<Prepared>>,
    sweep_at: usize,
}

/// Cache size that triggers the first sweep of unreferenced units.
const PREPARED_SWEEP: usize = 64;

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    pub fn new() -> Self {
        Self::with_config(MachineConfig::default())
    }

    pub fn with_config(config: MachineConfig) -> Self {
        Self {
            config,
            builtins: builtins().shared(),
            depth: 0,
            steps: 0,
            prepared: HashMap::new(),
            sweep_at: PREPARED_SWEEP,
        }
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// A fresh module namespace with `__builtins__` installed.
    pub fn new_globals(&self) -> DictRef {
        let mut globals = Dict::new();
        globals.set_str(BUILTINS_NAME, Value::Dict(self.builtins.clone()));
        globals.shared()
    }

    /// Calls a top-level unit with positional arguments.
    pub fn run(&mut self, unit: &Rc<CodeUnit>, globals: &DictRef, args: Vec<Value>) -> Result<Value, RuntimeError> {
        let func = self.top_level(unit, globals)?;
        self.call_function(&func, args, Vec::new(), None)
    }

    /// Evaluates an expression or suite unit with names resolved by `scope`.
    pub fn eval(&mut self, unit: &Rc<CodeUnit>, globals: &DictRef, scope: &mut dyn Namespace) -> Result<Value, RuntimeError> {
        let func = self.top_level(unit, globals)?;
        self.call_function(&func, Vec::new(), Vec::new(), Some(scope))
    }

    pub fn call(&mut self, callee: &Value, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, RuntimeError> {
        match callee {
            Value::Function(func) => self.call_function(func, args, kwargs, None),
            Value::Native(native) => {
                self.enter()?;
                let result = (native.func)(self, args, kwargs);
                self.depth -= 1;
                result
            }
            Value::Method(method) => call_method(method, args, kwargs),
            Value::ExcType(kind) => {
                if !kwargs.is_empty() {
                    return Err(type_error(format!("{}() takes no keyword arguments", kind.name)));
                }
                Ok(Value::Exception(ExceptionValue::new(kind.clone(), args)))
            }
            Value::Object(object) => {
                self.enter()?;
                let result = object.call(self, args, kwargs);
                self.depth -= 1;
                result
            }
            other => Err(type_error(format!("'{}' object is not callable", other.type_name()))),
        }
    }

    /// Calls a function whose free names resolve through `scope`, the way
    /// declarative functions run against their owning object.
    pub fn call_in_scope(
        &mut self,
        callee: &Value,
        args: Vec<Value>,
        kwargs: Kwargs,
        scope: &mut dyn Namespace,
    ) -> Result<Value, RuntimeError> {
        match callee {
            Value::Function(func) => self.call_function(func, args, kwargs, Some(scope)),
            other => self.call(other, args, kwargs),
        }
    }

    fn top_level(&mut self, unit: &Rc<CodeUnit>, globals: &DictRef) -> Result<Rc<Function>, RuntimeError> {
        if !unit.freevars.is_empty() {
            return Err(invalid(format!("'{}' needs a closure and can't run on its own", unit.name)));
        }
        if self.depth == 0 {
            self.steps = 0;
        }
        Ok(Rc::new(Function {
            code: unit.clone(),
            qualname: unit.name.clone(),
            globals: globals.clone(),
            defaults: Vec::new(),
            kwdefaults: Vec::new(),
            closure: Vec::new(),
        }))
    }

    fn enter(&mut self) -> Result<(), RuntimeError> {
        if self.depth >= self.config.max_call_depth {
            return Err(RuntimeError::RecursionLimit(self.config.max_call_depth));
        }
        self.depth += 1;
        Ok(())
    }

    fn tick(&mut self) -> Result<(), RuntimeError> {
        self.steps += 1;
        match self.config.max_steps {
            Some(max) if self.steps > max => Err(RuntimeError::StepLimit(max)),
            _ => Ok(()),
        }
    }

    fn prepare(&mut self, code: &Rc<CodeUnit>) -> Result<Rc<Prepared>, RuntimeError> {
        if let Some(prepared) = self.prepared.get(&Rc::as_ptr(code)) {
            return Ok(prepared.clone());
        }
        let instrs = read_instructions(&code.code)?;
        let consts = code
            .consts
            .iter()
            .map(|c| match c {
                Constant::Value(literal) => Value::from_literal(literal),
                Constant::Code(nested) => Value::Code(Rc::new((**nested).clone())),
            })
            .collect();
        let prepared = Rc::new(Prepared {
            code: code.clone(),
            instrs,
            consts,
        });
        if self.prepared.len() >= self.sweep_at {
            self.sweep();
        }
        self.prepared.insert(Rc::as_ptr(code), prepared.clone());
        Ok(prepared)
    }

    /// Drops cached units nothing outside the cache refers to.
    fn sweep(&mut self) {
        let before = self.prepared.len();
        self.prepared
            .retain(|_, prepared| Rc::strong_count(prepared) > 1 || Rc::strong_count(&prepared.code) > 1);
        self.sweep_at = (self.prepared.len() * 2).max(PREPARED_SWEEP);
        log::trace!("prepared cache swept from {} to {} units", before, self.prepared.len());
    }

    fn call_function(
        &mut self,
        func: &Rc<Function>,
        args: Vec<Value>,
        kwargs: Kwargs,
        names: Option<&mut dyn Namespace>,
    ) -> Result<Value, RuntimeError> {
        let base = self.depth;
        self.enter()?;
        let result = self.new_frame(func, args, kwargs, names).and_then(|frame| self.execute(frame));
        self.depth = base;
        result
    }

    fn new_frame<'f>(
        &mut self,
        func: &Rc<Function>,
        args: Vec<Value>,
        kwargs: Kwargs,
        names: Option<&'f mut dyn Namespace>,
    ) -> Result<Frame<'f>, RuntimeError> {
        let prepared = self.prepare(&func.code)?;
        let code = &prepared.code;
        let fast = bind_arguments(func, args, kwargs)?;

        let mut cells: Vec<Cell> = code
            .cellvars
            .iter()
            .map(|name| {
                let initial = code
                    .varnames
                    .iter()
                    .position(|v| v == name)
                    .and_then(|i| fast[i].clone());
                Rc::new(RefCell::new(initial))
            })
            .collect();
        if func.closure.len() != code.freevars.len() {
            return Err(invalid(format!(
                "'{}' expects {} closure cells, got {}",
                code.name,
                code.freevars.len(),
                func.closure.len()
            )));
        }
        cells.extend(func.closure.iter().cloned());
        log::trace!("enter '{}' at depth {}", func.qualname, self.depth);

        Ok(Frame {
            prepared: prepared.clone(),
            globals: func.globals.clone(),
            fast,
            cells,
            stack: Vec::with_capacity(code.stacksize as usize),
            blocks: Vec::new(),
            pending: Vec::new(),
            pc: 0,
            names,
        })
    }

    /// Runs `entry` and every frame it calls until `entry` returns.
    fn execute<'f>(&mut self, entry: Frame<'f>) -> Result<Value, RuntimeError> {
        let mut frames = vec![entry];
        loop {
            let Some(frame) = frames.last_mut() else {
                return Err(invalid("frame stack is empty"));
            };
            self.tick()?;
            let instr = *frame
                .prepared
                .instrs
                .get(frame.pc)
                .ok_or_else(|| invalid(format!("'{}' ran past its last instruction", frame.prepared.code.name)))?;
            frame.pc += 1;
            let mut why = match self.step(frame, &instr) {
                Ok(Flow::Next) => continue,
                Ok(Flow::Call(func, args, kwargs)) => {
                    match self.enter().and_then(|()| self.new_frame(&func, args, kwargs, None)) {
                        Ok(callee) => {
                            frames.push(callee);
                            continue;
                        }
                        Err(RuntimeError::Exception(exc)) => {
                            self.depth -= 1;
                            frame.record_trace(&exc, &instr);
                            Why::Raise(exc)
                        }
                        Err(other) => return Err(other),
                    }
                }
                Ok(Flow::Leave(why)) => why,
                Err(RuntimeError::Exception(exc)) => {
                    frame.record_trace(&exc, &instr);
                    Why::Raise(exc)
                }
                Err(other) => return Err(other),
            };

            // A frame the action leaves hands it to its caller.
            loop {
                let Some(frame) = frames.last_mut() else {
                    return Err(invalid("frame stack is empty"));
                };
                let left = match frame.unwind(why)? {
                    None => break,
                    Some(Why::Break | Why::Continue(_)) => return Err(invalid("'break' or 'continue' outside a loop")),
                    Some(left) => left,
                };
                frames.pop();
                let Some(caller) = frames.last_mut() else {
                    return match left {
                        Why::Raise(exc) => Err(RuntimeError::Exception(exc)),
                        Why::Return(value) => Ok(value),
                        Why::Break | Why::Continue(_) => Err(invalid("'break' or 'continue' outside a loop")),
                    };
                };
                self.depth -= 1;
                match left {
                    Why::Return(value) => {
                        caller.push(value);
                        break;
                    }
                    Why::Raise(exc) => {
                        caller.record_call_trace(&exc);
                        why = Why::Raise(exc);
                    }
                    Why::Break | Why::Continue(_) => return Err(invalid("'break' or 'continue' outside a loop")),
                }
            }
        }
    }

    fn load_global(&self, globals: &DictRef, name: &str) -> Result<Value, RuntimeError> {
        let globals = globals.borrow();
        if let Some(value) = globals.get_str(name) {
            return Ok(value.clone());
        }
        let found = match globals.get_str(BUILTINS_NAME) {
            Some(Value::Dict(builtins)) => builtins.borrow().get_str(name).cloned(),
            _ => self.builtins.borrow().get_str(name).cloned(),
        };
        found.ok_or_else(|| name_error(name))
    }

    fn get_attr(&self, object: &Value, name: &str) -> Result<Value, RuntimeError> {
        match object {
            Value::Object(o) => o.get_attr(name).ok_or_else(|| attribute_error(o.type_name(), name)),
            other => builtin_attr(other, name),
        }
    }

    fn step(&mut self, frame: &mut Frame<'_>, instr: &RawInstr) -> Result<Flow, RuntimeError> {
        let prepared = frame.prepared.clone();
        let arg = instr.arg;
        match instr.op {
            Opcode::Nop | Opcode::ExtendedArg => {}
            Opcode::PopTop => {
                frame.pop()?;
            }
            Opcode::RotTwo => {
                let a = frame.pop()?;
                let b = frame.pop()?;
                frame.push(a);
                frame.push(b);
            }
            Opcode::RotThree => {
                let a = frame.pop()?;
                let b = frame.pop()?;
                let c = frame.pop()?;
                frame.push(a);
                frame.push(c);
                frame.push(b);
            }
            Opcode::DupTop => {
                let top = frame.top()?.clone();
                frame.push(top);
            }
            Opcode::DupTopTwo => {
                let pair = frame.pop_n(2)?;
                frame.stack.extend(pair.iter().cloned());
                frame.stack.extend(pair);
            }

            Opcode::UnaryPositive | Opcode::UnaryNegative | Opcode::UnaryNot | Opcode::UnaryInvert => {
                let v = frame.pop()?;
                frame.push(ops::unary(instr.op, &v)?);
            }
            Opcode::InplaceAdd => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                match &a {
                    Value::List(items) => {
                        let more = ops::iterate(&b)?;
                        items.borrow_mut().extend(more);
                        frame.push(a);
                    }
                    _ => frame.push(ops::binary(instr.op, &a, &b)?),
                }
            }
            Opcode::BinaryPower
            | Opcode::BinaryMultiply
            | Opcode::BinaryMatrixMultiply
            | Opcode::BinaryModulo
            | Opcode::BinaryAdd
            | Opcode::BinarySubtract
            | Opcode::BinaryFloorDivide
            | Opcode::BinaryTrueDivide
            | Opcode::BinaryLshift
            | Opcode::BinaryRshift
            | Opcode::BinaryAnd
            | Opcode::BinaryXor
            | Opcode::BinaryOr
            | Opcode::InplaceSubtract
            | Opcode::InplaceMultiply
            | Opcode::InplaceMatrixMultiply
            | Opcode::InplaceModulo
            | Opcode::InplacePower
            | Opcode::InplaceFloorDivide
            | Opcode::InplaceTrueDivide
            | Opcode::InplaceLshift
            | Opcode::InplaceRshift
            | Opcode::InplaceAnd
            | Opcode::InplaceXor
            | Opcode::InplaceOr => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                frame.push(ops::binary(instr.op, &a, &b)?);
            }

            Opcode::BinarySubscr => {
                let key = frame.pop()?;
                let container = frame.pop()?;
                frame.push(ops::get_item(&container, &key)?);
            }
            Opcode::StoreSubscr => {
                let key = frame.pop()?;
                let container = frame.pop()?;
                let value = frame.pop()?;
                ops::set_item(&container, key, value)?;
            }
            Opcode::DeleteSubscr => {
                let key = frame.pop()?;
                let container = frame.pop()?;
                ops::del_item(&container, &key)?;
            }
            Opcode::BuildSlice => {
                let step = if arg == 3 { frame.pop()? } else { Value::None };
                let stop = frame.pop()?;
                let start = frame.pop()?;
                frame.push(ops::make_slice(start, stop, step));
            }

            Opcode::GetIter => {
                let v = frame.pop()?;
                let iter = match v {
                    Value::Iter(_) => v,
                    other => Value::Iter(Rc::new(RefCell::new(IterState {
                        items: ops::iterate(&other)?,
                        pos: 0,
                    }))),
                };
                frame.push(iter);
            }
            Opcode::ForIter => {
                let next = match frame.top()? {
                    Value::Iter(state) => state.borrow_mut().next(),
                    other => return Err(invalid(format!("FOR_ITER over a {}", other.type_name()))),
                };
                match next {
                    Some(item) => frame.push(item),
                    None => {
                        frame.pop()?;
                        frame.jump(instr.end + arg)?;
                    }
                }
            }

            Opcode::ReturnValue => {
                let value = frame.pop()?;
                return Ok(Flow::Leave(Why::Return(value)));
            }
            Opcode::BreakLoop => return Ok(Flow::Leave(Why::Break)),
            Opcode::ContinueLoop => return Ok(Flow::Leave(Why::Continue(arg))),
            Opcode::SetupLoop | Opcode::SetupExcept | Opcode::SetupFinally => {
                let kind = match instr.op {
                    Opcode::SetupLoop => BlockKind::Loop,
                    Opcode::SetupExcept => BlockKind::Except,
                    _ => BlockKind::Finally,
                };
                frame.blocks.push(Block {
                    kind,
                    handler: instr.end + arg,
                    level: frame.stack.len(),
                    exc: None,
                });
            }
            Opcode::PopBlock => {
                let block = frame.blocks.pop().ok_or_else(|| invalid("POP_BLOCK without a block"))?;
                frame.truncate(block.level);
            }
            Opcode::PopExcept => {
                let block = frame.blocks.pop().ok_or_else(|| invalid("POP_EXCEPT without a block"))?;
                if block.kind != BlockKind::Handler {
                    return Err(invalid("POP_EXCEPT outside an exception handler"));
                }
                frame.truncate(block.level);
            }
            Opcode::EndFinally => match frame.pop()? {
                Value::None => {
                    let pos = frame.stack.len();
                    if let Some(index) = frame.pending.iter().rposition(|p| p.pos == pos) {
                        let pending = frame.pending.remove(index);
                        return Ok(Flow::Leave(pending.why));
                    }
                }
                Value::ExcType(_) => {
                    let value = frame.pop()?;
                    frame.pop()?;
                    return match value {
                        Value::Exception(exc) => Ok(Flow::Leave(Why::Raise(exc))),
                        other => Err(invalid(format!("END_FINALLY re-raising a {}", other.type_name()))),
                    };
                }
                other => return Err(invalid(format!("END_FINALLY found a {}", other.type_name()))),
            },
            Opcode::RaiseVarargs => return self.raise(frame, arg),

            Opcode::LoadConst => {
                let value = prepared
                    .consts
                    .get(arg as usize)
                    .cloned()
                    .ok_or_else(|| invalid(format!("constant index {} out of range", arg)))?;
                frame.push(value);
            }
            Opcode::LoadName => {
                let name = frame.name(arg)?.to_string();
                let value = match frame.names.as_deref() {
                    Some(names) => names.resolve(&name).map_err(resolution)?,
                    None => self.load_global(&frame.globals, &name)?,
                };
                frame.push(value);
            }
            Opcode::StoreName => {
                let name = frame.name(arg)?.to_string();
                let value = frame.pop()?;
                match frame.names.as_deref_mut() {
                    Some(names) => names.define(&name, value),
                    None => frame.globals.borrow_mut().set_str(&name, value),
                }
            }
            Opcode::DeleteName => {
                let name = frame.name(arg)?.to_string();
                match frame.names.as_deref_mut() {
                    Some(names) => names.remove(&name).map_err(resolution)?,
                    None => {
                        frame
                            .globals
                            .borrow_mut()
                            .remove(&Value::str(name.as_str()))
                            .ok_or_else(|| name_error(&name))?;
                    }
                }
            }
            Opcode::LoadGlobal => {
                let value = self.load_global(&frame.globals, frame.name(arg)?)?;
                frame.push(value);
            }
            Opcode::StoreGlobal => {
                let name = frame.name(arg)?.to_string();
                let value = frame.pop()?;
                frame.globals.borrow_mut().set_str(&name, value);
            }
            Opcode::DeleteGlobal => {
                let name = frame.name(arg)?.to_string();
                frame
                    .globals
                    .borrow_mut()
                    .remove(&Value::str(name.as_str()))
                    .ok_or_else(|| name_error(&name))?;
            }
            Opcode::LoadFast => {
                let value = frame
                    .fast
                    .get(arg as usize)
                    .ok_or_else(|| invalid(format!("local index {} out of range", arg)))?
                    .clone()
                    .ok_or_else(|| unbound_local(&prepared.code, arg))?;
                frame.push(value);
            }
            Opcode::StoreFast => {
                let value = frame.pop()?;
                let slot = frame
                    .fast
                    .get_mut(arg as usize)
                    .ok_or_else(|| invalid(format!("local index {} out of range", arg)))?;
                *slot = Some(value);
            }
            Opcode::DeleteFast => {
                let slot = frame
                    .fast
                    .get_mut(arg as usize)
                    .ok_or_else(|| invalid(format!("local index {} out of range", arg)))?;
                if slot.take().is_none() {
                    return Err(unbound_local(&prepared.code, arg));
                }
            }
            Opcode::LoadClosure => {
                let cell = frame.cell(arg)?.clone();
                frame.push(Value::Cell(cell));
            }
            Opcode::LoadDeref => {
                let value = frame.cell(arg)?.borrow().clone().ok_or_else(|| {
                    let name = prepared.code.deref_name(arg as usize).unwrap_or("?");
                    RuntimeError::raise(
                        ExceptionKind::NameError,
                        format!("free variable '{}' referenced before assignment", name),
                    )
                })?;
                frame.push(value);
            }
            Opcode::StoreDeref => {
                let value = frame.pop()?;
                *frame.cell(arg)?.borrow_mut() = Some(value);
            }
            Opcode::DeleteDeref => {
                frame.cell(arg)?.borrow_mut().take();
            }

            Opcode::LoadAttr => {
                let object = frame.pop()?;
                let value = self.get_attr(&object, frame.name(arg)?)?;
                frame.push(value);
            }
            Opcode::StoreAttr => {
                let object = frame.pop()?;
                let value = frame.pop()?;
                let name = frame.name(arg)?;
                match &object {
                    Value::Object(o) => o.set_attr(name, value)?,
                    other => return Err(attribute_error(&other.type_name(), name)),
                }
            }
            Opcode::DeleteAttr => {
                let object = frame.pop()?;
                let name = frame.name(arg)?;
                match &object {
                    Value::Object(o) => o.del_attr(name)?,
                    other => return Err(attribute_error(&other.type_name(), name)),
                }
            }

            Opcode::BuildTuple => {
                let items = frame.pop_n(arg as usize)?;
                frame.push(Value::tuple(items));
            }
            Opcode::BuildList => {
                let items = frame.pop_n(arg as usize)?;
                frame.push(Value::list(items));
            }
            Opcode::BuildSet => {
                let mut unique: Vec<Value> = Vec::new();
                for item in frame.pop_n(arg as usize)? {
                    item.check_hashable()?;
                    if !unique.iter().any(|u| u.equals(&item)) {
                        unique.push(item);
                    }
                }
                frame.push(Value::Set(Rc::new(RefCell::new(unique))));
            }
            Opcode::BuildMap => {
                let flat = frame.pop_n(2 * arg as usize)?;
                let mut dict = Dict::new();
                let mut items = flat.into_iter();
                while let (Some(key), Some(value)) = (items.next(), items.next()) {
                    key.check_hashable()?;
                    dict.insert(key, value);
                }
                frame.push(Value::dict(dict));
            }
            Opcode::ListAppend | Opcode::SetAdd | Opcode::MapAdd => self.collection_add(frame, instr.op, arg as usize)?,

            Opcode::UnpackSequence => {
                let items = ops::iterate(&frame.pop()?)?;
                let n = arg as usize;
                if items.len() != n {
                    return Err(if items.len() < n {
                        value_error(format!("not enough values to unpack (expected {}, got {})", n, items.len()))
                    } else {
                        value_error(format!("too many values to unpack (expected {})", n))
                    });
                }
                frame.stack.extend(items.into_iter().rev());
            }
            Opcode::UnpackEx => {
                let items = ops::iterate(&frame.pop()?)?;
                let before = (arg & 0xff) as usize;
                let after = (arg >> 8) as usize;
                if items.len() < before + after {
                    return Err(value_error(format!(
                        "not enough values to unpack (expected at least {}, got {})",
                        before + after,
                        items.len()
                    )));
                }
                let split = items.len() - after;
                let mut out = items[..before].to_vec();
                out.push(Value::list(items[before..split].to_vec()));
                out.extend(items[split..].iter().cloned());
                frame.stack.extend(out.into_iter().rev());
            }

            Opcode::CompareOp => {
                let op = CompareOp::from_index(arg).ok_or_else(|| invalid(format!("comparison index {}", arg)))?;
                let b = frame.pop()?;
                let a = frame.pop()?;
                frame.push(ops::compare(op, &a, &b)?);
            }
            Opcode::JumpForward => frame.jump(instr.end + arg)?,
            Opcode::JumpAbsolute => frame.jump(arg)?,
            Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
                let v = frame.pop()?;
                if v.truthy() == (instr.op == Opcode::PopJumpIfTrue) {
                    frame.jump(arg)?;
                }
            }
            Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => {
                if frame.top()?.truthy() == (instr.op == Opcode::JumpIfTrueOrPop) {
                    frame.jump(arg)?;
                } else {
                    frame.pop()?;
                }
            }

            Opcode::CallFunction => {
                let args = frame.pop_n(arg as usize)?;
                let callee = frame.pop()?;
                return self.invoke(frame, callee, args, Vec::new());
            }
            Opcode::CallFunctionKw => {
                let names = match frame.pop()? {
                    Value::Tuple(names) => names,
                    other => return Err(invalid(format!("CALL_FUNCTION_KW names in a {}", other.type_name()))),
                };
                let mut args = frame.pop_n(arg as usize)?;
                if names.len() > args.len() {
                    return Err(invalid("more keyword names than arguments"));
                }
                let values = args.split_off(args.len() - names.len());
                let kwargs = names.iter().map(Value::to_string).zip(values).collect();
                let callee = frame.pop()?;
                return self.invoke(frame, callee, args, kwargs);
            }
            Opcode::CallFunctionEx => {
                let kwargs = if arg & CALL_HAS_KWARGS != 0 {
                    keyword_arguments(&frame.pop()?)?
                } else {
                    Vec::new()
                };
                let args = ops::iterate(&frame.pop()?)?;
                let callee = frame.pop()?;
                return self.invoke(frame, callee, args, kwargs);
            }
            Opcode::MakeFunction => {
                let function = make_function(frame, arg)?;
                frame.push(function);
            }

            Opcode::SetupWith | Opcode::WithCleanupStart | Opcode::WithCleanupFinish | Opcode::YieldValue => {
                return Err(RuntimeError::Unsupported(instr.op));
            }
        }
        Ok(Flow::Next)
    }

    /// Calls between code units become a new frame; anything else runs now.
    fn invoke(&mut self, frame: &mut Frame<'_>, callee: Value, args: Vec<Value>, kwargs: Kwargs) -> Result<Flow, RuntimeError> {
        match callee {
            Value::Function(func) => Ok(Flow::Call(func, args, kwargs)),
            other => {
                let result = self.call(&other, args, kwargs)?;
                frame.push(result);
                Ok(Flow::Next)
            }
        }
    }

    fn collection_add(&mut self, frame: &mut Frame<'_>, op: Opcode, depth: usize) -> Result<(), RuntimeError> {
        let (key, value) = match op {
            Opcode::MapAdd => {
                let key = frame.pop()?;
                (Some(key), frame.pop()?)
            }
            _ => (None, frame.pop()?),
        };
        let target = depth
            .checked_sub(1)
            .and_then(|d| frame.stack.len().checked_sub(d + 1))
            .and_then(|i| frame.stack.get(i))
            .ok_or_else(|| invalid(format!("{} depth {} beyond the stack", op, depth)))?;
        match (op, target, key) {
            (Opcode::ListAppend, Value::List(items), _) => items.borrow_mut().push(value),
            (Opcode::SetAdd, Value::Set(items), _) => {
                value.check_hashable()?;
                let mut items = items.borrow_mut();
                if !items.iter().any(|x| x.equals(&value)) {
                    items.push(value);
                }
            }
            (Opcode::MapAdd, Value::Dict(dict), Some(key)) => {
                key.check_hashable()?;
                dict.borrow_mut().insert(key, value);
            }
            (_, other, _) => return Err(invalid(format!("{} into a {}", op, other.type_name()))),
        }
        Ok(())
    }

    fn raise(&mut self, frame: &mut Frame<'_>, argc: u32) -> Result<Flow, RuntimeError> {
        match argc {
            0 => match frame.current_exception() {
                Some(exc) => Ok(Flow::Leave(Why::Raise(exc))),
                None => Err(RuntimeError::raise(ExceptionKind::RuntimeError, "No active exception to reraise")),
            },
            1 => {
                let exc = instantiate(frame.pop()?)?;
                Err(RuntimeError::Exception(exc))
            }
            2 => {
                let cause = frame.pop()?;
                let exc = instantiate(frame.pop()?)?;
                let cause = match cause {
                    Value::None => Value::None,
                    other => Value::Exception(instantiate(other)?),
                };
                *exc.cause.borrow_mut() = Some(cause);
                Err(RuntimeError::Exception(exc))
            }
            n => Err(invalid(format!("RAISE_VARARGS with {} arguments", n))),
        }
    }
}

fn resolution(err: ResolutionError) -> RuntimeError {
    match err {
        ResolutionError::NotFound { name } => name_error(&name),
        other => RuntimeError::Resolution(other),
    }
}

fn unbound_local(code: &CodeUnit, index: u32) -> RuntimeError {
    let name = code.varnames.get(index as usize).map_or("?", String::as_str);
    RuntimeError::raise(
        ExceptionKind::UnboundLocalError,
        format!("local variable '{}' referenced before assignment", name),
    )
}

fn instantiate(value: Value) -> Result<Rc<ExceptionValue>, RuntimeError> {
    match value {
        Value::Exception(exc) => Ok(exc),
        Value::ExcType(kind) => Ok(ExceptionValue::new(kind, Vec::new())),
        other => Err(type_error(format!(
            "exceptions must derive from BaseException, not '{}'",
            other.type_name()
        ))),
    }
}

fn keyword_arguments(value: &Value) -> Result<Kwargs, RuntimeError> {
    let Value::Dict(dict) = value else {
        return Err(type_error(format!(
            "argument after ** must be a mapping, not {}",
            value.type_name()
        )));
    };
    dict.borrow()
        .iter()
        .map(|(k, v)| match k {
            Value::Str(name) => Ok((name.to_string(), v.clone())),
            _ => Err(type_error("keywords must be strings")),
        })
        .collect()
}

fn make_function(frame: &mut Frame<'_>, flags: u32) -> Result<Value, RuntimeError> {
    let qualname = match frame.pop()? {
        Value::Str(name) => name.to_string(),
        other => return Err(invalid(format!("MAKE_FUNCTION name is a {}", other.type_name()))),
    };
    let code = match frame.pop()? {
        Value::Code(code) => code,
        other => return Err(invalid(format!("MAKE_FUNCTION code is a {}", other.type_name()))),
    };
    let mut closure = Vec::new();
    if flags & MAKE_CLOSURE != 0 {
        let Value::Tuple(cells) = frame.pop()? else {
            return Err(invalid("MAKE_FUNCTION closure is not a tuple"));
        };
        for cell in cells.iter() {
            match cell {
                Value::Cell(cell) => closure.push(cell.clone()),
                other => return Err(invalid(format!("closure holds a {}", other.type_name()))),
            }
        }
    }
    if flags & MAKE_ANNOTATIONS != 0 {
        frame.pop()?;
    }
    let kwdefaults = if flags & MAKE_KWDEFAULTS != 0 {
        keyword_arguments(&frame.pop()?)?
    } else {
        Vec::new()
    };
    let defaults = if flags & MAKE_DEFAULTS != 0 {
        ops::iterate(&frame.pop()?)?
    } else {
        Vec::new()
    };
    Ok(Value::Function(Rc::new(Function {
        code,
        qualname,
        globals: frame.globals.clone(),
        defaults,
        kwdefaults,
        closure,
    })))
}

/// Lays positional, keyword and default arguments into the fast slots.
fn bind_arguments(func: &Function, args: Vec<Value>, kwargs: Kwargs) -> Result<Vec<Option<Value>>, RuntimeError> {
    let code = &func.code;
    let argcount = code.argcount as usize;
    let extra_slots = code.has_varargs() as usize + code.has_varkeywords() as usize;
    if code.varnames.len() < argcount + extra_slots {
        return Err(invalid(format!("'{}' has fewer locals than parameters", code.name)));
    }
    let name = &func.qualname;
    let mut fast: Vec<Option<Value>> = vec![None; code.varnames.len()];
    let given = args.len();
    let mut extra = Vec::new();
    for (i, value) in args.into_iter().enumerate() {
        if i < argcount {
            fast[i] = Some(value);
        } else {
            extra.push(value);
        }
    }
    let mut slot = argcount;
    if code.has_varargs() {
        fast[slot] = Some(Value::tuple(extra));
        slot += 1;
    } else if !extra.is_empty() {
        return Err(type_error(format!(
            "{}() takes {} positional arguments but {} were given",
            name, argcount, given
        )));
    }

    let mut extra_kwargs = Dict::new();
    for (key, value) in kwargs {
        match code.varnames[..argcount].iter().position(|p| *p == key) {
            Some(i) if fast[i].is_some() => {
                return Err(type_error(format!("{}() got multiple values for argument '{}'", name, key)));
            }
            Some(i) => fast[i] = Some(value),
            None if code.has_varkeywords() => extra_kwargs.set_str(&key, value),
            None => {
                return Err(type_error(format!("{}() got an unexpected keyword argument '{}'", name, key)));
            }
        }
    }
    if code.has_varkeywords() {
        fast[slot] = Some(Value::dict(extra_kwargs));
    }

    let first_default = argcount.saturating_sub(func.defaults.len());
    for i in 0..argcount {
        if fast[i].is_some() {
            continue;
        }
        let param = &code.varnames[i];
        let default = if i >= first_default {
            func.defaults.get(i - first_default).cloned()
        } else {
            func.kwdefaults.iter().find(|(k, _)| k == param).map(|(_, v)| v.clone())
        };
        match default {
            Some(value) => fast[i] = Some(value),
            None => {
                return Err(type_error(format!(
                    "{}() missing required argument: '{}'",
                    name, param
                )));
            }
        }
    }
    Ok(fast)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BodyItem, Item};
    use crate::bytecode::{encode, Arg, Const, Literal, Stream};
    use crate::compiler::codegen::CodeGen;
    use crate::compiler::locals::NameMode;
    use crate::grammar::Grammar;
    use crate::parser::parse_source;
    use crate::runtime::host::AttrObject;
    use crate::runtime::scope::DynamicScope;
    use crate::runtime::value::HostObject;

    /// Compiles `body` as a declarative function `f(params)`.
    fn compile(params: &str, body: &str) -> Rc<CodeUnit> {
        let indented: String = body.lines().map(|l| format!("        {}\n", l)).collect();
        let src = format!("declare Main(Window):\n    func f({}):\n{}", params, indented);
        let module = parse_source(&src, "t.kn", &Grammar::default()).unwrap();
        let Item::Object(def) = &module.items[0] else { panic!("expected object") };
        let BodyItem::Func(func) = &def.body[0] else { panic!("expected func") };
        let mut code = CodeGen::new("f", "t.kn", 2, NameMode::function(func));
        code.stream.params = func.params.params.iter().map(|p| p.name.clone()).collect();
        code.stream.star_param = func.params.star.clone();
        code.stream.kw_star_param = func.params.double_star.clone();
        code.function_body(&func.body).unwrap();
        Rc::new(encode(&code.finish(), false).unwrap())
    }

    fn run(unit: &Rc<CodeUnit>, args: Vec<Value>) -> Result<Value, RuntimeError> {
        let mut machine = Machine::new();
        let globals = machine.new_globals();
        machine.run(unit, &globals, args)
    }

    fn ints(values: &[i64]) -> Value {
        Value::list(values.iter().map(|v| Value::Int(*v)).collect())
    }

    fn function(unit: &Rc<CodeUnit>, globals: &DictRef, defaults: Vec<Value>) -> Value {
        Value::Function(Rc::new(Function {
            code: unit.clone(),
            qualname: unit.name.clone(),
            globals: globals.clone(),
            defaults,
            kwdefaults: Vec::new(),
            closure: Vec::new(),
        }))
    }

    #[test]
    fn test_loops_with_break_and_continue() {
        let unit = compile(
            "a",
            "\
total = 0
for x in a:
    if x == 3:
        continue
    if x > 5:
        break
    total += x
return total",
        );
        let result = run(&unit, vec![ints(&[1, 2, 3, 4, 5, 6, 7, 8])]).unwrap();
        assert_eq!(result.as_int(), Some(12));
    }

    #[test]
    fn test_except_then_finally() {
        let unit = compile(
            "a",
            "\
log = []
try:
    log.append(1)
    a[5]
except IndexError as e:
    log.append(str(e))
finally:
    log.append('done')
return log",
        );
        let result = run(&unit, vec![ints(&[])]).unwrap();
        assert_eq!(result.repr(), "[1, 'list index out of range', 'done']");
    }

    #[test]
    fn test_return_runs_finally_first() {
        let unit = compile("a, b", "try:\n    return a\nfinally:\n    b.append('cleanup')");
        let log = Value::list(Vec::new());
        let result = run(&unit, vec![Value::Int(7), log.clone()]).unwrap();
        assert_eq!(result.as_int(), Some(7));
        assert_eq!(log.repr(), "['cleanup']");
    }

    #[test]
    fn test_break_through_finally() {
        let unit = compile(
            "b",
            "\
n = 0
while True:
    try:
        n += 1
        if n == 3:
            break
    finally:
        b.append(n)
return n",
        );
        let log = Value::list(Vec::new());
        let result = run(&unit, vec![log.clone()]).unwrap();
        assert_eq!(result.as_int(), Some(3));
        assert_eq!(log.repr(), "[1, 2, 3]");
    }

    #[test]
    fn test_exception_passes_through_inner_finally() {
        let unit = compile(
            "b",
            "\
try:
    try:
        raise ValueError('inner')
    finally:
        b.append('f')
except ValueError as e:
    b.append(str(e))
return len(b)",
        );
        let log = Value::list(Vec::new());
        let result = run(&unit, vec![log.clone()]).unwrap();
        assert_eq!(result.as_int(), Some(2));
        assert_eq!(log.repr(), "['f', 'inner']");
    }

    #[test]
    fn test_uncaught_exception_carries_traceback() {
        let unit = compile("a, b", "return a // b");
        let err = run(&unit, vec![Value::Int(1), Value::Int(0)]).unwrap_err();
        let exc = err.exception().expect("exception");
        assert!(exc.is_kind(ExceptionKind::ZeroDivisionError));
        let trace = exc.traceback.borrow();
        assert_eq!(trace[0].unit, "f");
        assert_eq!(trace[0].line, 3);
    }

    #[test]
    fn test_unknown_name_raises_name_error() {
        let unit = compile("", "return missing + 1");
        let err = run(&unit, Vec::new()).unwrap_err();
        assert!(err.exception().unwrap().is_kind(ExceptionKind::NameError));
        assert!(err.to_string().contains("'missing'"));
    }

    #[test]
    fn test_arguments_defaults_and_stars() {
        let unit = compile("a, b, *rest, **kw", "return [a, b, len(rest), len(kw)]");
        let mut machine = Machine::new();
        let globals = machine.new_globals();
        let f = function(&unit, &globals, vec![Value::Int(2)]);

        let result = machine
            .call(&f, vec![Value::Int(1)], vec![("z".to_string(), Value::Int(9))])
            .unwrap();
        assert_eq!(result.repr(), "[1, 2, 0, 1]");
        let result = machine.call(&f, vec![Value::Int(1), Value::Int(3), Value::Int(4)], Vec::new()).unwrap();
        assert_eq!(result.repr(), "[1, 3, 1, 0]");

        let err = machine
            .call(&f, vec![Value::Int(1)], vec![("a".to_string(), Value::Int(5))])
            .unwrap_err();
        assert!(err.to_string().contains("multiple values"));
    }

    #[test]
    fn test_missing_argument_is_type_error() {
        let unit = compile("a, b", "return a");
        let err = run(&unit, vec![Value::Int(1)]).unwrap_err();
        assert!(err.exception().unwrap().is_kind(ExceptionKind::TypeError));
        assert!(err.to_string().contains("'b'"));
    }

    #[test]
    fn test_eval_resolves_through_dynamic_scope() {
        let unit = compile("", "return width * 2 + count");
        let owner = AttrObject::new("Node").with_attr("count", Value::Int(1)).into_rc();
        let overrides = Dict::new().shared();
        let locals = [(Value::str("width"), Value::Int(10))].into_iter().collect::<Dict>().shared();

        let mut machine = Machine::new();
        let globals = machine.new_globals();
        let mut scope = DynamicScope::new(&owner, &overrides, &locals, &globals);
        let result = machine.eval(&unit, &globals, &mut scope).unwrap();
        assert_eq!(result.as_int(), Some(21));
    }

    #[test]
    fn test_call_in_scope_stores_fast_and_reads_scope() {
        let unit = compile("step", "total = count + step\nreturn total");
        let owner: Rc<dyn HostObject> = AttrObject::new("Node").with_attr("count", Value::Int(4)).into_rc();
        let overrides = Dict::new().shared();
        let locals = Dict::new().shared();

        let mut machine = Machine::new();
        let globals = machine.new_globals();
        let f = function(&unit, &globals, Vec::new());
        let mut scope = DynamicScope::new(&owner, &overrides, &locals, &globals);
        let result = machine.call_in_scope(&f, vec![Value::Int(3)], Vec::new(), &mut scope).unwrap();
        assert_eq!(result.as_int(), Some(7));
        assert!(locals.borrow().is_empty());
    }

    #[test]
    fn test_closure_cells_shared_with_nested_unit() {
        let mut inner = Stream::new("inner", "t.kn", 1);
        inner.newlocals = true;
        inner.freevars = vec!["x".into()];
        inner.emit(Opcode::LoadDeref, Arg::Free("x".into()));
        inner.emit(Opcode::LoadConst, Arg::Const(Const::Value(Literal::Int(1))));
        inner.op(Opcode::BinaryAdd);
        inner.op(Opcode::ReturnValue);

        let mut outer = Stream::new("outer", "t.kn", 1);
        outer.newlocals = true;
        outer.params = vec!["x".into()];
        outer.emit(Opcode::LoadClosure, Arg::Free("x".into()));
        outer.emit(Opcode::BuildTuple, Arg::Int(1));
        outer.emit(Opcode::LoadConst, Arg::Const(Const::Code(Box::new(inner))));
        outer.emit(Opcode::LoadConst, Arg::Const(Const::Value(Literal::str("inner"))));
        outer.emit(Opcode::MakeFunction, Arg::Int(MAKE_CLOSURE));
        outer.emit(Opcode::CallFunction, Arg::Int(0));
        outer.op(Opcode::ReturnValue);

        let unit = Rc::new(encode(&outer, false).unwrap());
        assert_eq!(unit.cellvars, vec!["x".to_string()]);
        let result = run(&unit, vec![Value::Int(41)]).unwrap();
        assert_eq!(result.as_int(), Some(42));
    }

    #[test]
    fn test_recursion_and_step_limits() {
        let unit = compile("a", "return f(a)");
        let mut machine = Machine::with_config(MachineConfig {
            max_call_depth: 40,
            max_steps: None,
        });
        let globals = machine.new_globals();
        let f = function(&unit, &globals, Vec::new());
        globals.borrow_mut().set_str("f", f.clone());
        let err = machine.call(&f, vec![Value::Int(1)], Vec::new()).unwrap_err();
        assert!(matches!(err, RuntimeError::RecursionLimit(40)));

        let spin = compile("", "while True:\n    pass");
        let mut machine = Machine::with_config(MachineConfig {
            max_call_depth: 40,
            max_steps: Some(500),
        });
        let globals = machine.new_globals();
        let err = machine.run(&spin, &globals, Vec::new()).unwrap_err();
        assert!(matches!(err, RuntimeError::StepLimit(500)));
    }

    #[test]
    fn test_deep_recursion_with_default_limits() {
        let unit = compile("n", "if n == 0:\n    return 0\nreturn f(n - 1) + 1");
        let mut machine = Machine::new();
        let globals = machine.new_globals();
        let f = function(&unit, &globals, Vec::new());
        globals.borrow_mut().set_str("f", f.clone());

        let depth = machine.config().max_call_depth as i64 - 1;
        let result = machine.call(&f, vec![Value::Int(depth - 1)], Vec::new()).unwrap();
        assert_eq!(result.as_int(), Some(depth - 1));
        let err = machine.call(&f, vec![Value::Int(10_000)], Vec::new()).unwrap_err();
        assert!(matches!(err, RuntimeError::RecursionLimit(200)));
        // the machine is usable again afterwards
        assert_eq!(machine.call(&f, vec![Value::Int(3)], Vec::new()).unwrap().as_int(), Some(3));
    }

    #[test]
    fn test_exceptions_unwind_into_callers() {
        let unit = compile(
            "n",
            "\
if n == 0:
    return 1 // n
try:
    return f(n - 1)
except ZeroDivisionError:
    return -n",
        );
        let mut machine = Machine::new();
        let globals = machine.new_globals();
        let f = function(&unit, &globals, Vec::new());
        globals.borrow_mut().set_str("f", f.clone());
        assert_eq!(machine.call(&f, vec![Value::Int(3)], Vec::new()).unwrap().as_int(), Some(-1));

        let err = machine.call(&f, vec![Value::Int(0)], Vec::new()).unwrap_err();
        assert!(err.exception().unwrap().is_kind(ExceptionKind::ZeroDivisionError));

        let plain = compile("n", "if n == 0:\n    return 1 // n\nreturn g(n - 1)");
        let g = function(&plain, &globals, Vec::new());
        globals.borrow_mut().set_str("g", g.clone());
        let err = machine.call(&g, vec![Value::Int(2)], Vec::new()).unwrap_err();
        let exc = err.exception().unwrap();
        let lines: Vec<u32> = exc.traceback.borrow().iter().map(|t| t.line).collect();
        assert_eq!(lines, vec![4, 5, 5]);
    }

    #[test]
    fn test_prepared_units_are_released() {
        let unit = compile("", "return 1");
        let mut machine = Machine::new();
        let globals = machine.new_globals();
        let kept = Rc::new((*unit).clone());
        machine.run(&kept, &globals, Vec::new()).unwrap();
        for _ in 0..500 {
            let fresh = Rc::new((*unit).clone());
            machine.run(&fresh, &globals, Vec::new()).unwrap();
        }
        assert!(machine.prepared.len() <= PREPARED_SWEEP, "{} cached", machine.prepared.len());
        assert!(machine.prepared.contains_key(&Rc::as_ptr(&kept)));
    }

    #[test]
    fn test_units_with_free_variables_need_a_closure() {
        let mut stream = Stream::new("needs", "t.kn", 1);
        stream.freevars = vec!["x".into()];
        stream.emit(Opcode::LoadDeref, Arg::Free("x".into()));
        stream.op(Opcode::ReturnValue);
        let unit = Rc::new(encode(&stream, true).unwrap());
        let err = run(&unit, Vec::new()).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidCode(_)));
    }
}
