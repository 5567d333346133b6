use std::collections::HashMap;

use crate::bytecode::{
    compute_max_stack, Arg, CodeFlags, CodeUnit, Const, ConsistencyError, Constant, Instr, Item, Label, Opcode,
    OperandKind,
};
use crate::bytecode::Stream;

/// Operand after table lookup; jumps stay symbolic until layout.
#[derive(Debug, Clone, Copy)]
enum Operand {
    None,
    Value(u32),
    Jump(Label),
}

/// Per-unit tables, filled in order of first use.
#[derive(Default)]
struct Tables {
    consts: Vec<Constant>,
    names: Vec<String>,
    varnames: Vec<String>,
    cellvars: Vec<String>,
}

fn slot(table: &mut Vec<String>, name: &str) -> u32 {
    match table.iter().position(|n| n == name) {
        Some(i) => i as u32,
        None => {
            table.push(name.to_string());
            (table.len() - 1) as u32
        }
    }
}

fn bad_operand(instr: &Instr) -> ConsistencyError {
    ConsistencyError::BadOperand {
        op: instr.op.name(),
        expected: instr.op.operand_kind().describe(),
        found: instr.arg.describe(),
    }
}

/// Converts a symbolic stream into an executable code unit.
///
/// `nested` marks units created inside another function; only those may
/// reference free variables.
pub fn encode(stream: &Stream, nested: bool) -> Result<CodeUnit, ConsistencyError> {
    if !stream.freevars.is_empty() && !nested {
        return Err(ConsistencyError::FreevarsOutsideFunction(stream.name.clone()));
    }
    let stacksize = compute_max_stack(stream)?;

    let mut tables = Tables::default();
    for param in stream
        .params
        .iter()
        .chain(stream.star_param.iter())
        .chain(stream.kw_star_param.iter())
    {
        slot(&mut tables.varnames, param);
    }
    // cells are deref names not supplied by an enclosing unit
    for instr in stream.instructions() {
        if let Arg::Free(name) = &instr.arg {
            if !stream.freevars.contains(name) {
                slot(&mut tables.cellvars, name);
            }
        }
    }

    let mut ops: Vec<(Opcode, Operand)> = Vec::new();
    let mut marks: Vec<Mark> = Vec::new();
    for item in &stream.items {
        match item {
            Item::Op(instr) => ops.push((instr.op, resolve(instr, stream, &mut tables)?)),
            Item::Label(label) => marks.push(Mark::Label(*label, ops.len())),
            Item::Line(line) => marks.push(Mark::Line(*line, ops.len())),
        }
    }

    let mut labels: HashMap<Label, usize> = HashMap::new();
    for mark in &marks {
        if let Mark::Label(label, index) = mark {
            if labels.insert(*label, *index).is_some() {
                return Err(ConsistencyError::DuplicateLabel(*label));
            }
        }
    }

    let offsets = layout(&ops, &labels)?;
    let code = assemble(&ops, &offsets, &labels)?;
    let lines = line_table(&marks, &offsets, ops.len(), stream.first_line);

    let mut flags = CodeFlags::default();
    if stream.newlocals {
        flags.insert(CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS);
    }
    if stream.star_param.is_some() {
        flags.insert(CodeFlags::VARARGS);
    }
    if stream.kw_star_param.is_some() {
        flags.insert(CodeFlags::VARKEYWORDS);
    }
    if nested {
        flags.insert(CodeFlags::NESTED);
    }
    if ops.iter().any(|(op, _)| *op == Opcode::YieldValue) {
        flags.insert(CodeFlags::GENERATOR);
    }
    if stream.freevars.is_empty() && tables.cellvars.is_empty() {
        flags.insert(CodeFlags::NOFREE);
    }

    log::trace!(
        "encoded '{}': {} bytes, {} consts, stacksize {}",
        stream.name,
        code.len(),
        tables.consts.len(),
        stacksize
    );

    Ok(CodeUnit {
        name: stream.name.clone(),
        filename: stream.filename.clone(),
        first_line: stream.first_line,
        argcount: stream.params.len() as u32,
        flags,
        stacksize,
        code,
        consts: tables.consts,
        names: tables.names,
        varnames: tables.varnames,
        cellvars: tables.cellvars,
        freevars: stream.freevars.clone(),
        lines,
    })
}

enum Mark {
    Label(Label, usize),
    Line(u32, usize),
}

fn resolve(instr: &Instr, stream: &Stream, tables: &mut Tables) -> Result<Operand, ConsistencyError> {
    let kind = instr.op.operand_kind();
    let operand = match (kind, &instr.arg) {
        (OperandKind::None, Arg::None) => Operand::None,
        (OperandKind::Int, Arg::Int(n)) if instr.op != Opcode::ExtendedArg => Operand::Value(*n),
        (OperandKind::Compare, Arg::Compare(op)) => Operand::Value(op.index()),
        (OperandKind::Name, Arg::Name(name)) => Operand::Value(slot(&mut tables.names, name)),
        (OperandKind::Local, Arg::Local(name)) => Operand::Value(slot(&mut tables.varnames, name)),
        (OperandKind::Free, Arg::Free(name)) => {
            let index = match stream.freevars.iter().position(|n| n == name) {
                Some(i) => tables.cellvars.len() + i,
                None => slot(&mut tables.cellvars, name) as usize,
            };
            Operand::Value(index as u32)
        }
        (OperandKind::Const, Arg::Const(Const::Value(literal))) => {
            let existing = tables
                .consts
                .iter()
                .position(|c| matches!(c, Constant::Value(v) if v.same(literal)));
            let index = existing.unwrap_or_else(|| {
                tables.consts.push(Constant::Value(literal.clone()));
                tables.consts.len() - 1
            });
            Operand::Value(index as u32)
        }
        (OperandKind::Const, Arg::Const(Const::Code(code))) => {
            let unit = encode(code, true)?;
            tables.consts.push(Constant::Code(Box::new(unit)));
            Operand::Value((tables.consts.len() - 1) as u32)
        }
        (OperandKind::RelJump | OperandKind::AbsJump, Arg::Jump(label)) => Operand::Jump(*label),
        _ => return Err(bad_operand(instr)),
    };
    Ok(operand)
}

fn size(op: Opcode, value: Option<u32>) -> usize {
    match value {
        None if !op.has_arg() => 1,
        Some(v) if v > 0xFFFF => 6,
        _ => 3,
    }
}

/// Assigns byte offsets, widening jumps whose operand outgrows 16 bits
/// until the layout is stable. Returns one offset per instruction plus the
/// end offset.
fn layout(ops: &[(Opcode, Operand)], labels: &HashMap<Label, usize>) -> Result<Vec<u32>, ConsistencyError> {
    let mut wide = vec![false; ops.len()];
    loop {
        let mut offsets = Vec::with_capacity(ops.len() + 1);
        let mut offset: usize = 0;
        for (i, (op, operand)) in ops.iter().enumerate() {
            offsets.push(offset);
            offset += match operand {
                Operand::None => size(*op, None),
                Operand::Value(v) => size(*op, Some(*v)),
                Operand::Jump(_) => {
                    if wide[i] {
                        6
                    } else {
                        3
                    }
                }
            };
        }
        offsets.push(offset);

        let mut changed = false;
        for (i, (op, operand)) in ops.iter().enumerate() {
            if let Operand::Jump(label) = operand {
                let arg = jump_arg(*op, *label, i, &offsets, labels)?;
                if arg > 0xFFFF && !wide[i] {
                    wide[i] = true;
                    changed = true;
                }
            }
        }
        if !changed {
            return offsets
                .into_iter()
                .map(|o| u32::try_from(o).map_err(|_| ConsistencyError::JumpOutOfRange { op: "code" }))
                .collect();
        }
    }
}

fn jump_arg(
    op: Opcode,
    label: Label,
    index: usize,
    offsets: &[usize],
    labels: &HashMap<Label, usize>,
) -> Result<u64, ConsistencyError> {
    let target = labels.get(&label).ok_or(ConsistencyError::UndefinedLabel(label))?;
    let target = offsets[*target] as u64;
    if op.operand_kind() == OperandKind::RelJump {
        let after = offsets[index + 1] as u64;
        if target < after {
            return Err(ConsistencyError::BackwardRelativeJump { op: op.name(), label });
        }
        Ok(target - after)
    } else {
        Ok(target)
    }
}

fn assemble(
    ops: &[(Opcode, Operand)],
    offsets: &[u32],
    labels: &HashMap<Label, usize>,
) -> Result<Vec<u8>, ConsistencyError> {
    let widths: Vec<usize> = offsets.iter().map(|o| *o as usize).collect();
    let mut code = Vec::with_capacity(widths.last().copied().unwrap_or(0));
    for (i, (op, operand)) in ops.iter().enumerate() {
        let value = match operand {
            Operand::None => {
                code.push(*op as u8);
                continue;
            }
            Operand::Value(v) => *v,
            Operand::Jump(label) => {
                let arg = jump_arg(*op, *label, i, &widths, labels)?;
                u32::try_from(arg).map_err(|_| ConsistencyError::JumpOutOfRange { op: op.name() })?
            }
        };
        let slot_size = widths[i + 1] - widths[i];
        if slot_size == 6 {
            code.push(Opcode::ExtendedArg as u8);
            code.extend_from_slice(&((value >> 16) as u16).to_le_bytes());
        }
        code.push(*op as u8);
        code.extend_from_slice(&((value & 0xFFFF) as u16).to_le_bytes());
    }
    Ok(code)
}

/// Entries only where the line changes, anchored at the next instruction.
fn line_table(marks: &[Mark], offsets: &[u32], count: usize, first_line: u32) -> Vec<(u32, u32)> {
    let mut lines: Vec<(u32, u32)> = Vec::new();
    let mut current = first_line;
    for mark in marks {
        let Mark::Line(line, index) = mark else { continue };
        if *index >= count {
            continue;
        }
        let offset = offsets[*index];
        if let Some(last) = lines.last_mut() {
            if last.0 == offset {
                last.1 = *line;
                current = *line;
                continue;
            }
        }
        if *line != current {
            lines.push((offset, *line));
            current = *line;
        }
    }
    // a replaced entry may now repeat the line before it
    let mut previous = first_line;
    lines.retain(|(_, line)| {
        let keep = *line != previous;
        previous = *line;
        keep
    });
    lines
}
