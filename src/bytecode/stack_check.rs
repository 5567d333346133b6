use std::collections::HashMap;
use std::rc::Rc;

use crate::bytecode::{Arg, ConsistencyError, Instr, Item, Label, Opcode, Stream};

/// Slack added to the deepest observed stack for values pushed while an
/// exception unwinds.
pub const EXCEPTION_MARGIN: u32 = 3;

/// Values pushed when control enters an exception handler.
pub const HANDLER_SLOTS: u32 = 3;

/// Values reserved at a finally target for the unwinding paths.
pub const FINALLY_SLOTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Loop,
    TryExcept,
    TryFinally,
    With,
    ExceptHandler,
    /// A finally body entered at its target; holds the reserved slots.
    Finally,
}

impl BlockKind {
    fn name(self) -> &'static str {
        match self {
            BlockKind::Loop => "loop",
            BlockKind::TryExcept => "try-except",
            BlockKind::TryFinally => "try-finally",
            BlockKind::With => "with",
            BlockKind::ExceptHandler => "except handler",
            BlockKind::Finally => "finally body",
        }
    }
}

/// Instructions walked so far on one path; logged when analysis fails.
struct Trace {
    pos: usize,
    op: Opcode,
    prev: Option<Rc<Trace>>,
}

/// Abstract machine state at one instruction.
///
/// `levels[0]` counts values outside any block; each open block owns one
/// further level. Values may only be popped from the innermost level.
#[derive(Clone)]
struct State {
    pos: usize,
    levels: Vec<u32>,
    blocks: Vec<BlockKind>,
    trace: Option<Rc<Trace>>,
}

impl State {
    fn total(&self) -> u32 {
        self.levels.iter().sum()
    }

    fn top(&self) -> u32 {
        self.levels.last().copied().unwrap_or(0)
    }

    fn adjust(&mut self, op: Opcode, pops: u32, pushes: u32) -> Result<(), ConsistencyError> {
        let pos = self.pos;
        let Some(top) = self.levels.last_mut() else {
            return Err(ConsistencyError::Malformed("empty level stack".into()));
        };
        if *top < pops {
            return Err(ConsistencyError::Underflow {
                pos,
                op: op.name(),
                needed: pops,
                available: *top,
            });
        }
        *top = *top - pops + pushes;
        Ok(())
    }

    fn require(&self, op: Opcode, needed: u32) -> Result<(), ConsistencyError> {
        if self.top() < needed {
            return Err(ConsistencyError::Underflow {
                pos: self.pos,
                op: op.name(),
                needed,
                available: self.top(),
            });
        }
        Ok(())
    }

    fn push_block(&mut self, kind: BlockKind, level: u32) {
        self.blocks.push(kind);
        self.levels.push(level);
    }

    /// Leaving a block discards whatever it still holds.
    fn pop_block(&mut self) {
        self.blocks.pop();
        self.levels.pop();
    }

    fn innermost(&self) -> &'static str {
        self.blocks.last().map_or("no block", |kind| kind.name())
    }

    fn record(&mut self, op: Opcode) {
        self.trace = Some(Rc::new(Trace {
            pos: self.pos,
            op,
            prev: self.trace.take(),
        }));
    }

    fn describe(&self) -> String {
        describe(&self.levels, &self.blocks)
    }

    fn log_trace(&self) {
        let mut steps = Vec::new();
        let mut node = self.trace.as_deref();
        while let Some(step) = node {
            if steps.len() == 16 {
                steps.push("...".to_string());
                break;
            }
            steps.push(format!("{}:{}", step.pos, step.op));
            node = step.prev.as_deref();
        }
        steps.reverse();
        log::debug!("stack analysis path: {}", steps.join(" "));
    }
}

fn describe(levels: &[u32], blocks: &[BlockKind]) -> String {
    let total: u32 = levels.iter().sum();
    if blocks.is_empty() {
        return format!("depth {}", total);
    }
    let names: Vec<&str> = blocks.iter().map(|b| b.name()).collect();
    format!("depth {} (levels {:?} in {})", total, levels, names.join(", "))
}

/// Flattened instruction list with label positions resolved.
struct Flat<'a> {
    name: &'a str,
    instrs: Vec<&'a Instr>,
    positions: HashMap<Label, usize>,
    placed: HashMap<usize, Label>,
}

impl<'a> Flat<'a> {
    fn new(stream: &'a Stream) -> Result<Self, ConsistencyError> {
        let mut instrs = Vec::new();
        let mut positions = HashMap::new();
        let mut placed = HashMap::new();
        for item in &stream.items {
            match item {
                Item::Op(instr) => instrs.push(instr),
                Item::Label(label) => {
                    if positions.insert(*label, instrs.len()).is_some() {
                        return Err(ConsistencyError::DuplicateLabel(*label));
                    }
                    placed.entry(instrs.len()).or_insert(*label);
                }
                Item::Line(_) => {}
            }
        }
        for instr in &instrs {
            if let Arg::Jump(label) = instr.arg {
                if !positions.contains_key(&label) {
                    return Err(ConsistencyError::UndefinedLabel(label));
                }
            }
        }
        Ok(Self {
            name: &stream.name,
            instrs,
            positions,
            placed,
        })
    }

    fn target(&self, instr: &Instr) -> Result<usize, ConsistencyError> {
        match instr.arg {
            Arg::Jump(label) => self
                .positions
                .get(&label)
                .copied()
                .ok_or(ConsistencyError::UndefinedLabel(label)),
            ref other => Err(ConsistencyError::BadOperand {
                op: instr.op.name(),
                expected: "label",
                found: other.describe(),
            }),
        }
    }
}

fn count(instr: &Instr) -> Result<u32, ConsistencyError> {
    match instr.arg {
        Arg::Int(n) => Ok(n),
        ref other => Err(ConsistencyError::BadOperand {
            op: instr.op.name(),
            expected: "integer",
            found: other.describe(),
        }),
    }
}

/// Returns (pops, pushes) for instructions that do not touch control flow
/// or the block stack.
fn effect(instr: &Instr) -> Result<Option<(u32, u32)>, ConsistencyError> {
    use Opcode::*;
    Ok(Some(match instr.op {
        PopTop => (1, 0),
        RotTwo => (2, 2),
        RotThree => (3, 3),
        DupTop => (1, 2),
        DupTopTwo => (2, 4),
        Nop => (0, 0),

        UnaryPositive | UnaryNegative | UnaryNot | UnaryInvert | GetIter => (1, 1),

        BinaryMatrixMultiply | InplaceMatrixMultiply | BinaryPower | BinaryMultiply | BinaryModulo
        | BinaryAdd | BinarySubtract | BinarySubscr | BinaryFloorDivide | BinaryTrueDivide
        | InplaceFloorDivide | InplaceTrueDivide | InplaceAdd | InplaceSubtract | InplaceMultiply
        | InplaceModulo | BinaryLshift | BinaryRshift | BinaryAnd | BinaryXor | BinaryOr | InplacePower
        | InplaceLshift | InplaceRshift | InplaceAnd | InplaceXor | InplaceOr | CompareOp => (2, 1),

        StoreSubscr => (3, 0),
        DeleteSubscr => (2, 0),
        StoreAttr => (2, 0),
        DeleteAttr => (1, 0),
        StoreName | StoreGlobal | StoreFast | StoreDeref => (1, 0),
        DeleteName | DeleteGlobal | DeleteFast | DeleteDeref => (0, 0),
        LoadConst | LoadName | LoadGlobal | LoadFast | LoadClosure | LoadDeref => (0, 1),
        LoadAttr => (1, 1),
        YieldValue => (1, 1),

        BuildTuple | BuildList | BuildSet | BuildSlice => (count(instr)?, 1),
        BuildMap => (2 * count(instr)?, 1),
        UnpackSequence => (1, count(instr)?),
        UnpackEx => {
            let n = count(instr)?;
            (1, (n & 0xff) + (n >> 8) + 1)
        }

        CallFunction => (count(instr)? + 1, 1),
        CallFunctionKw => (count(instr)? + 2, 1),
        CallFunctionEx => (2 + (count(instr)? & crate::bytecode::CALL_HAS_KWARGS), 1),
        MakeFunction => (2 + count(instr)?.count_ones(), 1),

        // comprehension appends reach below their own operands
        ListAppend | SetAdd => (1, 0),
        MapAdd => (2, 0),

        WithCleanupStart => (0, 1),
        WithCleanupFinish => (2, 0),

        _ => return Ok(None),
    }))
}

struct Analysis<'a> {
    flat: Flat<'a>,
    seen: HashMap<usize, (Vec<u32>, Vec<BlockKind>)>,
    /// Block depth and enclosing level at each finally target, before the
    /// reserved slots.
    finally_base: HashMap<usize, (usize, u32)>,
    max: u32,
}

impl Analysis<'_> {
    fn observe(&mut self, state: &State) {
        self.max = self.max.max(state.total());
    }

    /// Records `state` at a join point. Returns false when an identical
    /// state was already explored from here.
    fn join(&mut self, state: &mut State) -> Result<bool, ConsistencyError> {
        let pos = state.pos;
        let Some(label) = self.flat.placed.get(&pos).copied() else {
            return Ok(true);
        };

        // The normal path falls into a finally body with exactly one None
        // pushed; it is lifted into the reserved block the unwinding path
        // enters with.
        if let Some(&(depth, base)) = self.finally_base.get(&pos) {
            if state.blocks.len() == depth {
                if state.top() != base + 1 {
                    state.log_trace();
                    let mut levels = state.levels.clone();
                    if let Some(top) = levels.last_mut() {
                        *top = base + 1;
                    }
                    return Err(ConsistencyError::InconsistentJoin {
                        label,
                        expected: describe(&levels, &state.blocks),
                        found: state.describe(),
                    });
                }
                if let Some(top) = state.levels.last_mut() {
                    *top = base;
                }
                state.push_block(BlockKind::Finally, FINALLY_SLOTS);
                self.observe(state);
            }
        }

        match self.seen.get(&pos) {
            Some((levels, blocks)) => {
                if *levels == state.levels && *blocks == state.blocks {
                    Ok(false)
                } else {
                    state.log_trace();
                    Err(ConsistencyError::InconsistentJoin {
                        label,
                        expected: describe(levels, blocks),
                        found: state.describe(),
                    })
                }
            }
            None => {
                self.seen.insert(pos, (state.levels.clone(), state.blocks.clone()));
                Ok(true)
            }
        }
    }

    fn run(&mut self, mut state: State, work: &mut Vec<State>) -> Result<(), ConsistencyError> {
        loop {
            if !self.join(&mut state)? {
                return Ok(());
            }
            let Some(instr) = self.flat.instrs.get(state.pos).copied() else {
                state.log_trace();
                return Err(ConsistencyError::FallsOffEnd(self.flat.name.to_string()));
            };
            state.record(instr.op);
            let next = self.step(state, instr, work).inspect_err(|_| log::debug!("while analyzing '{}'", self.flat.name))?;
            match next {
                Some(next) => {
                    self.observe(&next);
                    state = next;
                }
                None => return Ok(()),
            }
        }
    }

    /// Applies one instruction. Returns the fall-through state, or None when
    /// control does not continue on this path.
    fn step(&mut self, mut state: State, instr: &Instr, work: &mut Vec<State>) -> Result<Option<State>, ConsistencyError> {
        use Opcode::*;
        let op = instr.op;

        if let Some((pops, pushes)) = effect(instr)? {
            if matches!(op, ListAppend | SetAdd | MapAdd) {
                state.require(op, pops + count(instr)?)?;
            }
            state.adjust(op, pops, pushes)?;
            state.pos += 1;
            return Ok(Some(state));
        }

        match op {
            SetupLoop | SetupExcept | SetupFinally | SetupWith => {
                let target = self.flat.target(instr)?;
                if op == SetupWith {
                    // manager is replaced by its exit callable
                    state.adjust(op, 1, 1)?;
                }
                let mut jump = state.clone();
                jump.pos = target;
                match op {
                    SetupLoop => state.push_block(BlockKind::Loop, 0),
                    SetupExcept => {
                        jump.push_block(BlockKind::ExceptHandler, HANDLER_SLOTS);
                        state.push_block(BlockKind::TryExcept, 0);
                    }
                    SetupFinally => {
                        self.finally_base.insert(target, (jump.blocks.len(), jump.top()));
                        jump.push_block(BlockKind::Finally, FINALLY_SLOTS);
                        state.push_block(BlockKind::TryFinally, 0);
                    }
                    _ => {
                        self.finally_base.insert(target, (jump.blocks.len(), jump.top()));
                        jump.push_block(BlockKind::Finally, FINALLY_SLOTS);
                        state.push_block(BlockKind::With, 1);
                    }
                }
                self.observe(&jump);
                work.push(jump);
                state.pos += 1;
                Ok(Some(state))
            }
            PopBlock => match state.blocks.last() {
                Some(kind) if !matches!(kind, BlockKind::ExceptHandler | BlockKind::Finally) => {
                    state.pop_block();
                    state.pos += 1;
                    Ok(Some(state))
                }
                _ => Err(ConsistencyError::MismatchedBlock {
                    pos: state.pos,
                    op: op.name(),
                    found: state.innermost(),
                }),
            },
            PopExcept => match state.blocks.last() {
                Some(BlockKind::ExceptHandler) => {
                    state.pop_block();
                    state.pos += 1;
                    Ok(Some(state))
                }
                _ => Err(ConsistencyError::MismatchedBlock {
                    pos: state.pos,
                    op: op.name(),
                    found: state.innermost(),
                }),
            },
            EndFinally => match state.blocks.last() {
                Some(BlockKind::Finally) => {
                    state.adjust(op, FINALLY_SLOTS, 0)?;
                    state.pop_block();
                    state.pos += 1;
                    Ok(Some(state))
                }
                // re-raises the handled exception
                Some(BlockKind::ExceptHandler) => Ok(None),
                _ => Err(ConsistencyError::MismatchedBlock {
                    pos: state.pos,
                    op: op.name(),
                    found: state.innermost(),
                }),
            },
            ForIter => {
                let mut jump = state.clone();
                jump.pos = self.flat.target(instr)?;
                jump.adjust(op, 1, 0)?;
                work.push(jump);
                state.adjust(op, 1, 2)?;
                state.pos += 1;
                Ok(Some(state))
            }
            PopJumpIfFalse | PopJumpIfTrue => {
                state.adjust(op, 1, 0)?;
                let mut jump = state.clone();
                jump.pos = self.flat.target(instr)?;
                work.push(jump);
                state.pos += 1;
                Ok(Some(state))
            }
            JumpIfFalseOrPop | JumpIfTrueOrPop => {
                state.require(op, 1)?;
                let mut jump = state.clone();
                jump.pos = self.flat.target(instr)?;
                work.push(jump);
                state.adjust(op, 1, 0)?;
                state.pos += 1;
                Ok(Some(state))
            }
            JumpForward | JumpAbsolute => {
                state.pos = self.flat.target(instr)?;
                Ok(Some(state))
            }
            BreakLoop | ContinueLoop => {
                if !state.blocks.contains(&BlockKind::Loop) {
                    return Err(ConsistencyError::MismatchedBlock {
                        pos: state.pos,
                        op: op.name(),
                        found: state.innermost(),
                    });
                }
                if op == ContinueLoop {
                    self.flat.target(instr)?;
                }
                Ok(None)
            }
            ReturnValue => {
                state.adjust(op, 1, 0)?;
                Ok(None)
            }
            RaiseVarargs => {
                let n = count(instr)?;
                if n > 2 {
                    return Err(ConsistencyError::BadOperand {
                        op: op.name(),
                        expected: "count of at most 2",
                        found: format!("{}", n),
                    });
                }
                state.adjust(op, n, 0)?;
                Ok(None)
            }
            _ => Err(ConsistencyError::Malformed(format!(
                "{} cannot appear in a symbolic stream",
                op.name()
            ))),
        }
    }
}

/// Computes the deepest value stack any path through `stream` can reach,
/// plus [`EXCEPTION_MARGIN`].
///
/// Every path is walked with an explicit work-list. Paths meeting at a
/// label must agree on the per-block stack levels and the block kinds,
/// except at finally targets (see [`FINALLY_SLOTS`]).
pub fn compute_max_stack(stream: &Stream) -> Result<u32, ConsistencyError> {
    let flat = Flat::new(stream)?;
    let mut analysis = Analysis {
        flat,
        seen: HashMap::new(),
        finally_base: HashMap::new(),
        max: 0,
    };
    let mut work = vec![State {
        pos: 0,
        levels: vec![0],
        blocks: Vec::new(),
        trace: None,
    }];
    while let Some(state) = work.pop() {
        analysis.run(state, &mut work)?;
    }
    Ok(analysis.max + EXCEPTION_MARGIN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Const, Literal};

    fn stream() -> Stream {
        Stream::new("test", "<test>", 1)
    }

    fn load(s: &mut Stream, value: i64) {
        s.emit(Opcode::LoadConst, Arg::Const(Const::Value(Literal::Int(value))));
    }

    fn ret_none(s: &mut Stream) {
        s.emit(Opcode::LoadConst, Arg::Const(Const::Value(Literal::None)));
        s.op(Opcode::ReturnValue);
    }

    #[test]
    fn test_straight_line_is_prefix_max_plus_margin() {
        let mut s = stream();
        load(&mut s, 1);
        load(&mut s, 2);
        load(&mut s, 3);
        s.emit(Opcode::BuildTuple, Arg::Int(3));
        s.op(Opcode::PopTop);
        load(&mut s, 4);
        s.line(7);
        load(&mut s, 5);
        s.op(Opcode::BinaryAdd);
        s.op(Opcode::ReturnValue);
        assert_eq!(compute_max_stack(&s).unwrap(), 3 + EXCEPTION_MARGIN);
    }

    #[test]
    fn test_handler_reserves_exception_slots() {
        let mut s = stream();
        let handler = s.new_label();
        let end = s.new_label();
        load(&mut s, 1);
        s.emit(Opcode::SetupExcept, Arg::Jump(handler));
        load(&mut s, 2);
        s.op(Opcode::PopTop);
        s.op(Opcode::PopBlock);
        s.emit(Opcode::JumpForward, Arg::Jump(end));
        s.mark(handler);
        s.op(Opcode::PopTop);
        s.op(Opcode::PopTop);
        s.op(Opcode::PopTop);
        s.op(Opcode::PopExcept);
        s.mark(end);
        s.op(Opcode::PopTop);
        ret_none(&mut s);
        // one value below the block plus three for the exception
        assert_eq!(compute_max_stack(&s).unwrap(), 1 + HANDLER_SLOTS + EXCEPTION_MARGIN);
    }

    #[test]
    fn test_unmatched_handler_reraises() {
        let mut s = stream();
        let handler = s.new_label();
        let next = s.new_label();
        let end = s.new_label();
        s.emit(Opcode::SetupExcept, Arg::Jump(handler));
        s.op(Opcode::PopBlock);
        s.emit(Opcode::JumpForward, Arg::Jump(end));
        s.mark(handler);
        s.op(Opcode::DupTop);
        s.emit(Opcode::LoadGlobal, Arg::Name("ValueError".into()));
        s.emit(Opcode::CompareOp, Arg::Compare(crate::bytecode::CompareOp::ExceptionMatch));
        s.emit(Opcode::PopJumpIfFalse, Arg::Jump(next));
        s.op(Opcode::PopTop);
        s.op(Opcode::PopTop);
        s.op(Opcode::PopTop);
        s.op(Opcode::PopExcept);
        s.emit(Opcode::JumpForward, Arg::Jump(end));
        s.mark(next);
        s.op(Opcode::EndFinally);
        s.mark(end);
        ret_none(&mut s);
        assert_eq!(compute_max_stack(&s).unwrap(), 5 + EXCEPTION_MARGIN);
    }

    #[test]
    fn test_finally_join_is_normalized() {
        let mut s = stream();
        let fin = s.new_label();
        s.emit(Opcode::SetupFinally, Arg::Jump(fin));
        load(&mut s, 1);
        s.op(Opcode::PopTop);
        s.op(Opcode::PopBlock);
        s.emit(Opcode::LoadConst, Arg::Const(Const::Value(Literal::None)));
        s.mark(fin);
        s.emit(Opcode::LoadGlobal, Arg::Name("cleanup".into()));
        s.emit(Opcode::CallFunction, Arg::Int(0));
        s.op(Opcode::PopTop);
        s.op(Opcode::EndFinally);
        ret_none(&mut s);
        assert_eq!(compute_max_stack(&s).unwrap(), FINALLY_SLOTS + 1 + EXCEPTION_MARGIN);
    }

    #[test]
    fn test_finally_join_rejects_other_depths() {
        for extra in [0, 2] {
            let mut s = stream();
            let fin = s.new_label();
            s.emit(Opcode::SetupFinally, Arg::Jump(fin));
            s.op(Opcode::PopBlock);
            for _ in 0..extra {
                s.emit(Opcode::LoadConst, Arg::Const(Const::Value(Literal::None)));
            }
            s.mark(fin);
            s.op(Opcode::EndFinally);
            ret_none(&mut s);
            let err = compute_max_stack(&s).unwrap_err();
            assert!(
                matches!(err, ConsistencyError::InconsistentJoin { label, .. } if label == fin),
                "{} values: {:?}",
                extra,
                err
            );
        }
    }

    #[test]
    fn test_end_finally_outside_finally_or_handler() {
        let mut s = stream();
        load(&mut s, 1);
        load(&mut s, 2);
        load(&mut s, 3);
        s.op(Opcode::EndFinally);
        ret_none(&mut s);
        assert!(matches!(compute_max_stack(&s), Err(ConsistencyError::MismatchedBlock { pos: 3, .. })));
    }

    #[test]
    fn test_loop_with_iterator() {
        let mut s = stream();
        let exit = s.new_label();
        let head = s.new_label();
        let done = s.new_label();
        s.emit(Opcode::SetupLoop, Arg::Jump(exit));
        s.emit(Opcode::LoadGlobal, Arg::Name("items".into()));
        s.op(Opcode::GetIter);
        s.mark(head);
        s.emit(Opcode::ForIter, Arg::Jump(done));
        s.emit(Opcode::StoreFast, Arg::Local("x".into()));
        s.emit(Opcode::JumpAbsolute, Arg::Jump(head));
        s.mark(done);
        s.op(Opcode::PopBlock);
        s.mark(exit);
        ret_none(&mut s);
        assert_eq!(compute_max_stack(&s).unwrap(), 2 + EXCEPTION_MARGIN);
    }

    #[test]
    fn test_join_mismatch_is_reported() {
        let mut s = stream();
        let join = s.new_label();
        s.emit(Opcode::LoadConst, Arg::Const(Const::Value(Literal::Bool(true))));
        s.emit(Opcode::PopJumpIfFalse, Arg::Jump(join));
        load(&mut s, 1);
        s.mark(join);
        ret_none(&mut s);
        let err = compute_max_stack(&s).unwrap_err();
        assert!(matches!(err, ConsistencyError::InconsistentJoin { label, .. } if label == join));
    }

    #[test]
    fn test_structural_errors() {
        let mut s = stream();
        s.op(Opcode::PopTop);
        assert!(matches!(compute_max_stack(&s), Err(ConsistencyError::Underflow { needed: 1, .. })));

        let mut s = stream();
        s.op(Opcode::PopExcept);
        assert!(matches!(compute_max_stack(&s), Err(ConsistencyError::MismatchedBlock { .. })));

        let mut s = stream();
        load(&mut s, 1);
        assert!(matches!(compute_max_stack(&s), Err(ConsistencyError::FallsOffEnd(_))));

        let mut s = stream();
        let nowhere = s.new_label();
        s.emit(Opcode::JumpAbsolute, Arg::Jump(nowhere));
        assert_eq!(compute_max_stack(&s), Err(ConsistencyError::UndefinedLabel(nowhere)));
    }

    #[test]
    fn test_values_below_a_block_are_out_of_reach() {
        let mut s = stream();
        let exit = s.new_label();
        load(&mut s, 1);
        s.emit(Opcode::SetupLoop, Arg::Jump(exit));
        s.op(Opcode::PopTop);
        s.op(Opcode::PopBlock);
        s.mark(exit);
        ret_none(&mut s);
        assert!(matches!(compute_max_stack(&s), Err(ConsistencyError::Underflow { pos: 2, .. })));
    }
}
