//! Expression code generation.

use crate::ast::{BinOp, BoolOp, CmpOp, Comprehension, Expr, ExprKind, Keyword, UnaryOp};
use crate::bytecode::{Arg, CompareOp, Opcode, CALL_HAS_KWARGS};
use crate::compiler::codegen::{literal, CodeGen, CompileResult};

pub fn binary_opcode(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::BinaryAdd,
        BinOp::Sub => Opcode::BinarySubtract,
        BinOp::Mul => Opcode::BinaryMultiply,
        BinOp::MatMul => Opcode::BinaryMatrixMultiply,
        BinOp::Div => Opcode::BinaryTrueDivide,
        BinOp::FloorDiv => Opcode::BinaryFloorDivide,
        BinOp::Mod => Opcode::BinaryModulo,
        BinOp::Pow => Opcode::BinaryPower,
        BinOp::LShift => Opcode::BinaryLshift,
        BinOp::RShift => Opcode::BinaryRshift,
        BinOp::BitAnd => Opcode::BinaryAnd,
        BinOp::BitOr => Opcode::BinaryOr,
        BinOp::BitXor => Opcode::BinaryXor,
    }
}

pub fn inplace_opcode(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::InplaceAdd,
        BinOp::Sub => Opcode::InplaceSubtract,
        BinOp::Mul => Opcode::InplaceMultiply,
        BinOp::MatMul => Opcode::InplaceMatrixMultiply,
        BinOp::Div => Opcode::InplaceTrueDivide,
        BinOp::FloorDiv => Opcode::InplaceFloorDivide,
        BinOp::Mod => Opcode::InplaceModulo,
        BinOp::Pow => Opcode::InplacePower,
        BinOp::LShift => Opcode::InplaceLshift,
        BinOp::RShift => Opcode::InplaceRshift,
        BinOp::BitAnd => Opcode::InplaceAnd,
        BinOp::BitOr => Opcode::InplaceOr,
        BinOp::BitXor => Opcode::InplaceXor,
    }
}

fn compare_op(op: CmpOp) -> CompareOp {
    match op {
        CmpOp::Lt => CompareOp::Lt,
        CmpOp::LtE => CompareOp::Le,
        CmpOp::Eq => CompareOp::Eq,
        CmpOp::NotEq => CompareOp::Ne,
        CmpOp::Gt => CompareOp::Gt,
        CmpOp::GtE => CompareOp::Ge,
        CmpOp::In => CompareOp::In,
        CmpOp::NotIn => CompareOp::NotIn,
        CmpOp::Is => CompareOp::Is,
        CmpOp::IsNot => CompareOp::IsNot,
    }
}

fn is_starred(expr: &Expr) -> bool {
    matches!(expr.kind, ExprKind::Starred(_))
}

impl CodeGen {
    pub fn expr(&mut self, expr: &Expr) -> CompileResult {
        match &expr.kind {
            ExprKind::Name(name) => self.load_name(name),
            ExprKind::Constant(c) => self.load_const(literal(c)),
            ExprKind::Attribute { value, attr } => {
                self.expr(value)?;
                self.load_attr(attr);
            }
            ExprKind::Subscript { value, index } => {
                self.expr(value)?;
                self.expr(index)?;
                self.op(Opcode::BinarySubscr);
            }
            ExprKind::Slice { lower, upper, step } => {
                for part in [lower, upper] {
                    match part {
                        Some(e) => self.expr(e)?,
                        None => self.load_none(),
                    }
                }
                match step {
                    Some(e) => {
                        self.expr(e)?;
                        self.int(Opcode::BuildSlice, 3);
                    }
                    None => self.int(Opcode::BuildSlice, 2),
                }
            }
            ExprKind::Call { func, args, keywords } => self.call_expr(func, args, keywords)?,
            ExprKind::Starred(_) => {
                return Err(self.error(expr.line, "can't use starred expression here"));
            }
            ExprKind::List(items) => {
                if items.iter().any(is_starred) {
                    self.build_list_with_stars(items)?;
                } else {
                    self.exprs(items)?;
                    self.int(Opcode::BuildList, items.len());
                }
            }
            ExprKind::Tuple(items) | ExprKind::Set(items) if items.iter().any(is_starred) => {
                let builtin = if matches!(expr.kind, ExprKind::Tuple(_)) { "tuple" } else { "set" };
                self.load_global(builtin);
                self.build_list_with_stars(items)?;
                self.call(1);
            }
            ExprKind::Tuple(items) => {
                self.exprs(items)?;
                self.int(Opcode::BuildTuple, items.len());
            }
            ExprKind::Set(items) => {
                self.exprs(items)?;
                self.int(Opcode::BuildSet, items.len());
            }
            ExprKind::Dict(pairs) => {
                for (key, value) in pairs {
                    self.expr(key)?;
                    self.expr(value)?;
                }
                self.int(Opcode::BuildMap, pairs.len());
            }
            ExprKind::ListComp { element, generators } => self.list_comp(element, generators)?,
            ExprKind::UnaryOp { op, operand } => {
                self.expr(operand)?;
                self.op(match op {
                    UnaryOp::Not => Opcode::UnaryNot,
                    UnaryOp::Neg => Opcode::UnaryNegative,
                    UnaryOp::Pos => Opcode::UnaryPositive,
                    UnaryOp::Invert => Opcode::UnaryInvert,
                });
            }
            ExprKind::BinOp { left, op, right } => {
                self.expr(left)?;
                self.expr(right)?;
                self.op(binary_opcode(*op));
            }
            ExprKind::BoolOp { op, values } => {
                let end = self.label();
                let jump = match op {
                    BoolOp::And => Opcode::JumpIfFalseOrPop,
                    BoolOp::Or => Opcode::JumpIfTrueOrPop,
                };
                let (last, init) = values
                    .split_last()
                    .ok_or_else(|| self.error(expr.line, "empty boolean operation"))?;
                for value in init {
                    self.expr(value)?;
                    self.jump(jump, end);
                }
                self.expr(last)?;
                self.mark(end);
            }
            ExprKind::Compare { left, ops, comparators } => self.compare(left, ops, comparators, expr.line)?,
            ExprKind::IfExp { test, body, orelse } => {
                let otherwise = self.label();
                let end = self.label();
                self.expr(test)?;
                self.jump(Opcode::PopJumpIfFalse, otherwise);
                self.expr(body)?;
                self.jump(Opcode::JumpForward, end);
                self.mark(otherwise);
                self.expr(orelse)?;
                self.mark(end);
            }
        }
        Ok(())
    }

    fn exprs(&mut self, items: &[Expr]) -> CompileResult {
        items.iter().try_for_each(|e| self.expr(e))
    }

    /// Leaves a list on the stack; starred items are spliced in with
    /// `extend`, the rest appended.
    fn build_list_with_stars(&mut self, items: &[Expr]) -> CompileResult {
        let leading = items.iter().take_while(|e| !is_starred(e)).count();
        self.exprs(&items[..leading])?;
        self.int(Opcode::BuildList, leading);
        for item in &items[leading..] {
            self.op(Opcode::DupTop);
            match &item.kind {
                ExprKind::Starred(inner) => {
                    self.load_attr("extend");
                    self.expr(inner)?;
                }
                _ => {
                    self.load_attr("append");
                    self.expr(item)?;
                }
            }
            self.call(1);
            self.op(Opcode::PopTop);
        }
        Ok(())
    }

    fn call_expr(&mut self, func: &Expr, args: &[Expr], keywords: &[Keyword]) -> CompileResult {
        self.expr(func)?;
        let spread = args.iter().any(is_starred) || keywords.iter().any(|k| k.arg.is_none());
        if !spread {
            self.exprs(args)?;
            if keywords.is_empty() {
                self.call(args.len());
            } else {
                let mut names = Vec::with_capacity(keywords.len());
                for keyword in keywords {
                    self.expr(&keyword.value)?;
                    names.extend(keyword.arg.iter().cloned());
                }
                self.load_str_tuple(&names);
                self.int(Opcode::CallFunctionKw, args.len() + keywords.len());
            }
            return Ok(());
        }

        self.build_list_with_stars(args)?;
        let mut flags = 0;
        if !keywords.is_empty() {
            flags |= CALL_HAS_KWARGS;
            self.int(Opcode::BuildMap, 0);
            for keyword in keywords {
                self.op(Opcode::DupTop);
                match &keyword.arg {
                    Some(name) => {
                        self.expr(&keyword.value)?;
                        self.op(Opcode::RotTwo);
                        self.load_str(name);
                        self.op(Opcode::StoreSubscr);
                    }
                    None => {
                        self.load_attr("update");
                        self.expr(&keyword.value)?;
                        self.call(1);
                        self.op(Opcode::PopTop);
                    }
                }
            }
        }
        self.emit(Opcode::CallFunctionEx, Arg::Int(flags));
        Ok(())
    }

    fn compare(&mut self, left: &Expr, ops: &[CmpOp], comparators: &[Expr], line: usize) -> CompileResult {
        if ops.is_empty() || ops.len() != comparators.len() {
            return Err(self.error(line, "malformed comparison"));
        }
        self.expr(left)?;
        if ops.len() == 1 {
            self.expr(&comparators[0])?;
            self.emit(Opcode::CompareOp, Arg::Compare(compare_op(ops[0])));
            return Ok(());
        }

        let cleanup = self.label();
        let end = self.label();
        let last = ops.len() - 1;
        for (i, (op, right)) in ops.iter().zip(comparators).enumerate() {
            self.expr(right)?;
            if i < last {
                self.op(Opcode::DupTop);
                self.op(Opcode::RotThree);
                self.emit(Opcode::CompareOp, Arg::Compare(compare_op(*op)));
                self.jump(Opcode::JumpIfFalseOrPop, cleanup);
            } else {
                self.emit(Opcode::CompareOp, Arg::Compare(compare_op(*op)));
            }
        }
        self.jump(Opcode::JumpForward, end);
        self.mark(cleanup);
        self.op(Opcode::RotTwo);
        self.op(Opcode::PopTop);
        self.mark(end);
        Ok(())
    }

    fn list_comp(&mut self, element: &Expr, generators: &[Comprehension]) -> CompileResult {
        self.int(Opcode::BuildList, 0);
        let mut loops = Vec::with_capacity(generators.len());
        for generator in generators {
            let head = self.label();
            let exit = self.label();
            self.expr(&generator.iter)?;
            self.op(Opcode::GetIter);
            self.mark(head);
            self.jump(Opcode::ForIter, exit);
            self.store_target(&generator.target)?;
            for cond in &generator.ifs {
                self.expr(cond)?;
                self.jump(Opcode::PopJumpIfFalse, head);
            }
            loops.push((head, exit));
        }
        self.expr(element)?;
        self.int(Opcode::ListAppend, generators.len() + 1);
        for (head, exit) in loops.into_iter().rev() {
            self.jump(Opcode::JumpAbsolute, head);
            self.mark(exit);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{compute_max_stack, encode};
    use crate::compiler::locals::NameMode;
    use crate::grammar::Grammar;
    use crate::parser::parse_source;

    /// Parses `text` as the value of a binding and compiles it alone.
    fn compile(text: &str) -> CodeGen {
        let src = format!("declare Main(Window):\n    x = {}\n", text);
        let module = parse_source(&src, "t.kn", &Grammar::default()).unwrap();
        let crate::ast::Item::Object(def) = &module.items[0] else { panic!("expected object") };
        let crate::ast::BodyItem::Binding(binding) = &def.body[0] else { panic!("expected binding") };
        let crate::ast::BindValue::Expr(expr) = &binding.expr.value else { panic!("expected expression") };
        let mut code = CodeGen::new("expr", "t.kn", 2, NameMode::Dynamic);
        code.expr(expr).unwrap();
        code.op(Opcode::ReturnValue);
        code
    }

    fn ops(code: &CodeGen) -> Vec<Opcode> {
        code.stream.instructions().map(|i| i.op).collect()
    }

    #[test]
    fn test_keyword_call() {
        let code = compile("f(1, key=2)");
        assert_eq!(
            ops(&code),
            vec![
                Opcode::LoadName,
                Opcode::LoadConst,
                Opcode::LoadConst,
                Opcode::LoadConst,
                Opcode::CallFunctionKw,
                Opcode::ReturnValue
            ]
        );
    }

    #[test]
    fn test_spread_call_balances() {
        let code = compile("f(a, *b, c, k=1, **d)");
        let listing = ops(&code);
        assert!(listing.contains(&Opcode::CallFunctionEx));
        assert!(compute_max_stack(&code.stream).unwrap() >= 4);
        assert!(encode(&code.stream, false).is_ok());
    }

    #[test]
    fn test_chained_compare_and_boolops() {
        let code = compile("a < b <= c and not d or e if f else g");
        assert!(encode(&code.stream, false).is_ok());
        assert!(ops(&code).contains(&Opcode::RotThree));
    }

    #[test]
    fn test_comprehension_nesting() {
        let code = compile("[x * y for x in a if x for y in b]");
        let listing = ops(&code);
        assert_eq!(listing.iter().filter(|op| **op == Opcode::ForIter).count(), 2);
        let append = code
            .stream
            .instructions()
            .find(|i| i.op == Opcode::ListAppend)
            .map(|i| i.arg.clone());
        assert_eq!(append, Some(Arg::Int(3)));
        assert!(encode(&code.stream, false).is_ok());
    }

    #[test]
    fn test_starred_displays() {
        let code = compile("(1, *rest)");
        assert_eq!(ops(&code)[0], Opcode::LoadGlobal);
        assert!(encode(&code.stream, false).is_ok());
        let code = compile("x[1:2, ::3]");
        assert!(ops(&code).contains(&Opcode::BuildSlice));
    }
}
