use std::collections::BTreeMap;

use crate::bytecode::{
    Arg, CodeFlags, CodeUnit, CompareOp, Const, ConsistencyError, Constant, Instr, Item, Label, Opcode, OperandKind,
    Stream,
};

/// One instruction read back from a code unit, with any EXTENDED_ARG
/// prefix folded into its operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawInstr {
    /// Offset of the first byte, including the prefix.
    pub offset: u32,
    /// Offset of the following instruction.
    pub end: u32,
    pub op: Opcode,
    pub arg: u32,
}

impl RawInstr {
    pub fn jump_target(&self) -> Option<u32> {
        match self.op.operand_kind() {
            OperandKind::RelJump => self.end.checked_add(self.arg),
            OperandKind::AbsJump => Some(self.arg),
            _ => None,
        }
    }
}

/// Splits raw code bytes into instructions.
pub fn read_instructions(code: &[u8]) -> Result<Vec<RawInstr>, ConsistencyError> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    let mut start = 0usize;
    let mut extended: u32 = 0;
    while pos < code.len() {
        let byte = code[pos];
        let op = Opcode::from_u8(byte)
            .ok_or_else(|| ConsistencyError::Malformed(format!("unknown opcode {} at offset {}", byte, pos)))?;
        let mut arg = 0;
        let mut end = pos + 1;
        if op.has_arg() {
            let bytes = code
                .get(pos + 1..pos + 3)
                .ok_or_else(|| ConsistencyError::Malformed(format!("truncated operand at offset {}", pos)))?;
            arg = extended | u16::from_le_bytes([bytes[0], bytes[1]]) as u32;
            end = pos + 3;
        }
        if op == Opcode::ExtendedArg {
            extended = arg << 16;
            pos = end;
            continue;
        }
        out.push(RawInstr {
            offset: start as u32,
            end: end as u32,
            op,
            arg,
        });
        extended = 0;
        pos = end;
        start = end;
    }
    if start != code.len() {
        return Err(ConsistencyError::Malformed("dangling EXTENDED_ARG".into()));
    }
    Ok(out)
}

fn table<'a>(table: &'a [String], index: u32, what: &str) -> Result<&'a String, ConsistencyError> {
    table
        .get(index as usize)
        .ok_or_else(|| ConsistencyError::Malformed(format!("{} index {} out of range", what, index)))
}

/// Converts a code unit back into a symbolic stream.
///
/// Labels are created for jump targets in offset order and line markers
/// for each line table entry, so `decode(encode(s))` equals `s` up to
/// [`Stream::canonical`].
pub fn decode(unit: &CodeUnit) -> Result<Stream, ConsistencyError> {
    let raw = read_instructions(&unit.code)?;
    let end = unit.code.len() as u32;

    let mut stream = Stream::new(unit.name.clone(), unit.filename.clone(), unit.first_line);

    let mut targets: BTreeMap<u32, Label> = BTreeMap::new();
    for instr in &raw {
        if let Some(target) = instr.jump_target() {
            let valid = target == end || raw.binary_search_by_key(&target, |r| r.offset).is_ok();
            if !valid {
                return Err(ConsistencyError::Malformed(format!(
                    "{} at offset {} jumps into the middle of an instruction",
                    instr.op, instr.offset
                )));
            }
            targets.entry(target).or_insert(Label(0));
        }
    }
    for label in targets.values_mut() {
        *label = stream.new_label();
    }

    let lines: BTreeMap<u32, u32> = unit.lines.iter().copied().collect();
    for instr in &raw {
        if let Some(label) = targets.get(&instr.offset) {
            stream.mark(*label);
        }
        if let Some(line) = lines.get(&instr.offset) {
            stream.line(*line);
        }
        let arg = operand(unit, instr, &targets)?;
        stream.items.push(Item::Op(Instr { op: instr.op, arg }));
    }
    if let Some(label) = targets.get(&end) {
        stream.mark(*label);
    }

    let argcount = unit.argcount as usize;
    if unit.varnames.len() < argcount {
        return Err(ConsistencyError::Malformed("argcount exceeds varnames".into()));
    }
    stream.params = unit.varnames[..argcount].to_vec();
    let mut extra = unit.varnames[argcount..].iter();
    if unit.has_varargs() {
        stream.star_param = extra.next().cloned();
    }
    if unit.has_varkeywords() {
        stream.kw_star_param = extra.next().cloned();
    }
    stream.freevars = unit.freevars.clone();
    stream.newlocals = unit.flags.contains(CodeFlags::NEWLOCALS);
    Ok(stream)
}

fn operand(unit: &CodeUnit, instr: &RawInstr, targets: &BTreeMap<u32, Label>) -> Result<Arg, ConsistencyError> {
    Ok(match instr.op.operand_kind() {
        OperandKind::None => Arg::None,
        OperandKind::Int => Arg::Int(instr.arg),
        OperandKind::Compare => Arg::Compare(
            CompareOp::from_index(instr.arg)
                .ok_or_else(|| ConsistencyError::Malformed(format!("bad comparison {}", instr.arg)))?,
        ),
        OperandKind::Name => Arg::Name(table(&unit.names, instr.arg, "name")?.clone()),
        OperandKind::Local => Arg::Local(table(&unit.varnames, instr.arg, "local")?.clone()),
        OperandKind::Free => Arg::Free(
            unit.deref_name(instr.arg as usize)
                .ok_or_else(|| ConsistencyError::Malformed(format!("deref index {} out of range", instr.arg)))?
                .to_string(),
        ),
        OperandKind::Const => match unit.consts.get(instr.arg as usize) {
            Some(Constant::Value(literal)) => Arg::Const(Const::Value(literal.clone())),
            Some(Constant::Code(code)) => Arg::Const(Const::Code(Box::new(decode(code)?))),
            None => return Err(ConsistencyError::Malformed(format!("constant index {} out of range", instr.arg))),
        },
        OperandKind::RelJump | OperandKind::AbsJump => {
            let target = instr
                .jump_target()
                .ok_or(ConsistencyError::JumpOutOfRange { op: instr.op.name() })?;
            Arg::Jump(targets.get(&target).copied().ok_or(ConsistencyError::JumpOutOfRange { op: instr.op.name() })?)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{encode, Literal};

    fn ret_none(s: &mut Stream) {
        s.emit(Opcode::LoadConst, Arg::Const(Const::Value(Literal::None)));
        s.op(Opcode::ReturnValue);
    }

    fn function() -> Stream {
        let mut inner = Stream::new("inner", "<test>", 3);
        inner.newlocals = true;
        inner.freevars = vec!["captured".into()];
        inner.params = vec!["a".into()];
        inner.line(4);
        inner.emit(Opcode::LoadDeref, Arg::Free("captured".into()));
        inner.emit(Opcode::LoadFast, Arg::Local("a".into()));
        inner.op(Opcode::BinaryAdd);
        inner.op(Opcode::ReturnValue);

        let mut s = Stream::new("outer", "<test>", 1);
        s.newlocals = true;
        s.params = vec!["x".into(), "y".into()];
        s.star_param = Some("rest".into());
        let skip = s.new_label();
        let top = s.new_label();
        s.line(2);
        s.emit(Opcode::LoadFast, Arg::Local("x".into()));
        s.emit(Opcode::StoreDeref, Arg::Free("captured".into()));
        s.emit(Opcode::LoadClosure, Arg::Free("captured".into()));
        s.emit(Opcode::BuildTuple, Arg::Int(1));
        s.emit(Opcode::LoadConst, Arg::Const(Const::Code(Box::new(inner))));
        s.emit(Opcode::LoadConst, Arg::Const(Const::Value(Literal::str("outer.<locals>.inner"))));
        s.emit(Opcode::MakeFunction, Arg::Int(crate::bytecode::MAKE_CLOSURE));
        s.emit(Opcode::StoreFast, Arg::Local("f".into()));
        s.mark(top);
        s.line(5);
        s.emit(Opcode::LoadFast, Arg::Local("y".into()));
        s.emit(Opcode::PopJumpIfFalse, Arg::Jump(skip));
        s.emit(Opcode::LoadConst, Arg::Const(Const::Value(Literal::Bool(false))));
        s.emit(Opcode::StoreFast, Arg::Local("y".into()));
        s.emit(Opcode::JumpAbsolute, Arg::Jump(top));
        s.mark(skip);
        s.line(6);
        ret_none(&mut s);
        s
    }

    #[test]
    fn test_round_trip_up_to_labels() {
        let stream = function();
        let unit = encode(&stream, false).unwrap();
        assert_eq!(unit.varnames, vec!["x", "y", "rest", "f"]);
        assert_eq!(unit.cellvars, vec!["captured"]);
        assert!(unit.has_varargs());
        assert_eq!(unit.lines, vec![(0, 2), (24, 5), (39, 6)]);
        let decoded = decode(&unit).unwrap();
        assert_eq!(decoded.canonical(), stream.canonical());
    }

    #[test]
    fn test_flags() {
        let unit = encode(&function(), false).unwrap();
        assert!(unit.flags.contains(CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS));
        assert!(!unit.flags.contains(CodeFlags::NOFREE));
        assert!(!unit.flags.contains(CodeFlags::NESTED));
        let Constant::Code(inner) = &unit.consts[0] else { panic!("expected code constant") };
        assert!(inner.flags.contains(CodeFlags::NESTED));
        assert_eq!(inner.freevars, vec!["captured"]);

        let mut plain = Stream::new("m", "<test>", 1);
        ret_none(&mut plain);
        let unit = encode(&plain, false).unwrap();
        assert_eq!(unit.flags, CodeFlags(CodeFlags::NOFREE));
    }

    #[test]
    fn test_free_variables_need_a_function() {
        let mut s = Stream::new("m", "<test>", 1);
        s.freevars = vec!["x".into()];
        ret_none(&mut s);
        assert_eq!(
            encode(&s, false).unwrap_err(),
            ConsistencyError::FreevarsOutsideFunction("m".into())
        );
    }

    #[test]
    fn test_long_jumps_are_widened() {
        let mut s = Stream::new("m", "<test>", 1);
        let end = s.new_label();
        s.emit(Opcode::JumpAbsolute, Arg::Jump(end));
        for _ in 0..70_000 {
            s.op(Opcode::Nop);
        }
        s.mark(end);
        ret_none(&mut s);
        let unit = encode(&s, false).unwrap();
        assert_eq!(unit.code[0], Opcode::ExtendedArg as u8);
        let raw = read_instructions(&unit.code).unwrap();
        assert_eq!(raw[0].op, Opcode::JumpAbsolute);
        assert_eq!(raw[0].jump_target(), Some(6 + 70_000));
        assert_eq!(decode(&unit).unwrap().canonical(), s.canonical());
    }

    #[test]
    fn test_relative_jumps_point_forward() {
        let mut s = Stream::new("m", "<test>", 1);
        let back = s.new_label();
        s.mark(back);
        s.emit(Opcode::JumpForward, Arg::Jump(back));
        assert!(matches!(
            encode(&s, false),
            Err(ConsistencyError::BackwardRelativeJump { .. })
        ));
    }

    #[test]
    fn test_operand_mismatch() {
        let mut s = Stream::new("m", "<test>", 1);
        s.emit(Opcode::LoadFast, Arg::Name("x".into()));
        s.op(Opcode::ReturnValue);
        let err = encode(&s, false).unwrap_err();
        assert_eq!(err.to_string(), "LOAD_FAST expects a local operand, got name 'x'");
    }

    #[test]
    fn test_constants_are_shared_by_identity() {
        let mut s = Stream::new("m", "<test>", 1);
        for literal in [Literal::Int(1), Literal::Bool(true), Literal::Int(1), Literal::Float(1.0)] {
            s.emit(Opcode::LoadConst, Arg::Const(Const::Value(literal)));
            s.op(Opcode::PopTop);
        }
        ret_none(&mut s);
        let unit = encode(&s, false).unwrap();
        assert_eq!(unit.consts.len(), 4);
    }

    #[test]
    fn test_malformed_code() {
        let mut s = Stream::new("m", "<test>", 1);
        ret_none(&mut s);
        let mut unit = encode(&s, false).unwrap();
        unit.code = vec![Opcode::LoadConst as u8, 0];
        assert!(matches!(decode(&unit), Err(ConsistencyError::Malformed(_))));
        unit.code = vec![0];
        assert!(matches!(decode(&unit), Err(ConsistencyError::Malformed(_))));
    }

    #[test]
    fn test_jump_targets_must_start_an_instruction() {
        let mut s = Stream::new("m", "<test>", 1);
        ret_none(&mut s);
        let mut unit = encode(&s, false).unwrap();
        unit.code = vec![Opcode::JumpAbsolute as u8, 3, 0, Opcode::Nop as u8];
        assert!(decode(&unit).is_ok());
        unit.code = vec![Opcode::JumpAbsolute as u8, 1, 0, Opcode::Nop as u8];
        assert!(matches!(decode(&unit), Err(ConsistencyError::Malformed(_))));
    }

    #[test]
    fn test_many_jumps_decode() {
        let mut s = Stream::new("m", "<test>", 1);
        for _ in 0..5_000 {
            let next = s.new_label();
            s.emit(Opcode::JumpAbsolute, Arg::Jump(next));
            s.mark(next);
        }
        ret_none(&mut s);
        let unit = encode(&s, false).unwrap();
        assert_eq!(decode(&unit).unwrap().canonical(), s.canonical());
    }
}
