use crate::bytecode::decode::{read_instructions, RawInstr};
use crate::bytecode::{CodeUnit, CompareOp, ConsistencyError, Constant, OperandKind};
use std::collections::HashMap;
use std::fmt::Write;

/// Print disassembly of a code unit and every unit nested in it
pub fn print_unit(unit: &CodeUnit) -> Result<(), ConsistencyError> {
    print!("{}", disassemble(unit)?);
    Ok(())
}

/// Return disassembly as a String
pub fn disassemble(unit: &CodeUnit) -> Result<String, ConsistencyError> {
    let mut output = String::new();
    write_unit(&mut output, unit, 0)?;
    Ok(output)
}

fn write_unit(out: &mut String, unit: &CodeUnit, indent: usize) -> Result<(), ConsistencyError> {
    let prefix = "  ".repeat(indent);
    let raw = read_instructions(&unit.code)?;

    let _ = writeln!(out, "{}════════════════════════════════════════", prefix);
    let _ = writeln!(out, "{} {} ({}:{})", prefix, unit.name, unit.filename, unit.first_line);
    let _ = writeln!(
        out,
        "{} {} instructions, stacksize {}, flags {}",
        prefix,
        raw.len(),
        unit.stacksize,
        unit.flags.names().join("|")
    );
    if !unit.cellvars.is_empty() {
        let _ = writeln!(out, "{} cells: {}", prefix, unit.cellvars.join(", "));
    }
    if !unit.freevars.is_empty() {
        let _ = writeln!(out, "{} free:  {}", prefix, unit.freevars.join(", "));
    }
    let _ = writeln!(out, "{}════════════════════════════════════════", prefix);

    let targets = collect_jump_targets(&raw);
    let mut last_line = None;
    for instr in &raw {
        if targets.contains(&instr.offset) {
            let _ = writeln!(out, "{}         ┌──────────────────────────────────", prefix);
        }
        let line = unit.line_for(instr.offset);
        let line_col = if last_line == Some(line) {
            "     ".to_string()
        } else {
            format!("{:>4} ", line)
        };
        last_line = Some(line);
        let marker = if targets.contains(&instr.offset) { "► " } else { "  " };
        let _ = writeln!(
            out,
            "{}{}{:04} {}{}",
            prefix,
            line_col,
            instr.offset,
            marker,
            format_instr(unit, instr)
        );
    }
    let _ = writeln!(out);

    for constant in &unit.consts {
        if let Constant::Code(code) = constant {
            write_unit(out, code, indent + 1)?;
        }
    }
    Ok(())
}

fn collect_jump_targets(raw: &[RawInstr]) -> Vec<u32> {
    let mut targets = Vec::new();
    for instr in raw {
        if let Some(target) = instr.jump_target() {
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
    }
    targets
}

fn format_instr(unit: &CodeUnit, instr: &RawInstr) -> String {
    let name = instr.op.name();
    let detail = match instr.op.operand_kind() {
        OperandKind::None => return name.to_string(),
        OperandKind::Int => String::new(),
        OperandKind::Const => match unit.consts.get(instr.arg as usize) {
            Some(Constant::Value(literal)) => format!("({})", literal),
            Some(Constant::Code(code)) => format!("(<code {}>)", code.name),
            None => "(?)".to_string(),
        },
        OperandKind::Name => format!("({})", unit.names.get(instr.arg as usize).map_or("?", String::as_str)),
        OperandKind::Local => format!("({})", unit.varnames.get(instr.arg as usize).map_or("?", String::as_str)),
        OperandKind::Free => format!("({})", unit.deref_name(instr.arg as usize).unwrap_or("?")),
        OperandKind::Compare => format!("({})", CompareOp::from_index(instr.arg).map_or("?", CompareOp::symbol)),
        OperandKind::RelJump | OperandKind::AbsJump => match instr.jump_target() {
            Some(target) => {
                let direction = if target <= instr.offset { "↑" } else { "↓" };
                format!("{} (→ {:04})", direction, target)
            }
            None => "(?)".to_string(),
        },
    };
    format!("{:<22}{:>5} {}", name, instr.arg, detail).trim_end().to_string()
}

// =============================================================================
// Statistics
// =============================================================================

/// Print instruction statistics for a unit tree
pub fn print_stats(unit: &CodeUnit) -> Result<(), ConsistencyError> {
    println!("=== BYTECODE STATISTICS ===\n");

    let mut counts: HashMap<&'static str, usize> = HashMap::new();
    let mut units = 0;
    count_ops(unit, &mut counts, &mut units)?;
    let total: usize = counts.values().sum();

    println!("Code units:       {}", units);
    println!("Instructions:     {}", total);
    println!();

    println!("Op frequency:");
    let mut sorted: Vec<_> = counts.iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
    for (op, count) in sorted.iter().take(10) {
        let pct = (**count as f64 / total as f64) * 100.0;
        println!("  {:<22} {:>4} ({:>5.1}%)", op, count, pct);
    }
    Ok(())
}

fn count_ops(
    unit: &CodeUnit,
    counts: &mut HashMap<&'static str, usize>,
    units: &mut usize,
) -> Result<(), ConsistencyError> {
    *units += 1;
    for instr in read_instructions(&unit.code)? {
        *counts.entry(instr.op.name()).or_insert(0) += 1;
    }
    for constant in &unit.consts {
        if let Constant::Code(code) = constant {
            count_ops(code, counts, units)?;
        }
    }
    Ok(())
}
