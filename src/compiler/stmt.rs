//! Statement code generation for function bodies and `::` suites.

use crate::ast::{ExceptHandler, Expr, ExprKind, Stmt, StmtKind};
use crate::bytecode::{Arg, CompareOp, Opcode};
use crate::compiler::codegen::{CodeGen, CompileResult};
use crate::compiler::expr::inplace_opcode;
use crate::parser::{validate_target, TargetContext};

impl CodeGen {
    pub fn block(&mut self, body: &[Stmt]) -> CompileResult {
        body.iter().try_for_each(|s| self.stmt(s))
    }

    /// Emits `body` and returns `None` unless it already ends in a return.
    pub fn function_body(&mut self, body: &[Stmt]) -> CompileResult {
        self.block(body)?;
        if !self.ends_in_terminal() {
            self.return_none();
        }
        Ok(())
    }

    pub fn stmt(&mut self, stmt: &Stmt) -> CompileResult {
        self.set_line(stmt.line);
        match &stmt.kind {
            StmtKind::Expr(e) => {
                self.expr(e)?;
                self.op(Opcode::PopTop);
            }
            StmtKind::Assign { targets, value } => {
                self.expr(value)?;
                for (i, target) in targets.iter().enumerate() {
                    if i + 1 < targets.len() {
                        self.op(Opcode::DupTop);
                    }
                    self.store_target(target)?;
                }
            }
            StmtKind::AugAssign { target, op, value } => self.aug_assign(target, inplace_opcode(*op), value)?,
            StmtKind::Delete(targets) => {
                for target in targets {
                    self.delete_target(target)?;
                }
            }
            StmtKind::Pass => {}
            StmtKind::Break => self.emit_break(stmt.line)?,
            StmtKind::Continue => self.emit_continue(stmt.line)?,
            StmtKind::Return(value) => {
                match value {
                    Some(e) => self.expr(e)?,
                    None => self.load_none(),
                }
                self.op(Opcode::ReturnValue);
            }
            StmtKind::Raise { exc, cause } => {
                let mut argc = 0;
                if let Some(e) = exc {
                    self.expr(e)?;
                    argc += 1;
                    if let Some(c) = cause {
                        self.expr(c)?;
                        argc += 1;
                    }
                }
                self.int(Opcode::RaiseVarargs, argc);
            }
            StmtKind::Assert { test, msg } => {
                let ok = self.label();
                self.expr(test)?;
                self.jump(Opcode::PopJumpIfTrue, ok);
                self.load_global("AssertionError");
                if let Some(m) = msg {
                    self.expr(m)?;
                    self.call(1);
                }
                self.int(Opcode::RaiseVarargs, 1);
                self.mark(ok);
            }
            StmtKind::If { test, body, orelse } => {
                let otherwise = self.label();
                let end = self.label();
                self.expr(test)?;
                self.jump(Opcode::PopJumpIfFalse, otherwise);
                self.block(body)?;
                if !orelse.is_empty() && !self.ends_in_terminal() {
                    self.jump(Opcode::JumpForward, end);
                }
                self.mark(otherwise);
                self.block(orelse)?;
                self.mark(end);
            }
            StmtKind::While { test, body, orelse } => {
                let head = self.label();
                let otherwise = self.label();
                let exit = self.label();
                self.jump(Opcode::SetupLoop, exit);
                self.mark(head);
                self.expr(test)?;
                self.jump(Opcode::PopJumpIfFalse, otherwise);
                self.push_loop(head);
                self.block(body)?;
                self.pop_loop();
                self.jump(Opcode::JumpAbsolute, head);
                self.mark(otherwise);
                self.op(Opcode::PopBlock);
                self.block(orelse)?;
                self.mark(exit);
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                let head = self.label();
                let otherwise = self.label();
                let exit = self.label();
                self.jump(Opcode::SetupLoop, exit);
                self.expr(iter)?;
                self.op(Opcode::GetIter);
                self.mark(head);
                self.jump(Opcode::ForIter, otherwise);
                self.store_target(target)?;
                self.push_loop(head);
                self.block(body)?;
                self.pop_loop();
                self.jump(Opcode::JumpAbsolute, head);
                self.mark(otherwise);
                self.op(Opcode::PopBlock);
                self.block(orelse)?;
                self.mark(exit);
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => {
                if finalbody.is_empty() {
                    self.try_except(body, handlers, orelse)?;
                } else {
                    let finally = self.label();
                    self.jump(Opcode::SetupFinally, finally);
                    self.enter_block();
                    if handlers.is_empty() {
                        self.block(body)?;
                    } else {
                        self.try_except(body, handlers, orelse)?;
                    }
                    self.exit_block();
                    self.op(Opcode::PopBlock);
                    self.load_none();
                    self.mark(finally);
                    let previous = self.enter_finally();
                    self.block(finalbody)?;
                    self.exit_finally(previous);
                    self.op(Opcode::EndFinally);
                }
            }
        }
        Ok(())
    }

    fn try_except(&mut self, body: &[Stmt], handlers: &[ExceptHandler], orelse: &[Stmt]) -> CompileResult {
        let handler_start = self.label();
        let otherwise = self.label();
        let end = self.label();

        self.jump(Opcode::SetupExcept, handler_start);
        self.enter_block();
        self.block(body)?;
        self.exit_block();
        self.op(Opcode::PopBlock);
        self.jump(Opcode::JumpForward, otherwise);

        self.mark(handler_start);
        self.enter_block();
        let mut reraise = true;
        for handler in handlers {
            self.set_line(handler.line);
            let next = self.label();
            match &handler.kind {
                Some(kind) => {
                    self.op(Opcode::DupTop);
                    self.expr(kind)?;
                    self.emit(Opcode::CompareOp, Arg::Compare(CompareOp::ExceptionMatch));
                    self.jump(Opcode::PopJumpIfFalse, next);
                }
                None => reraise = false,
            }
            self.op(Opcode::PopTop);
            match &handler.name {
                Some(name) => self.store_name(name),
                None => self.op(Opcode::PopTop),
            }
            self.op(Opcode::PopTop);
            self.block(&handler.body)?;
            self.op(Opcode::PopExcept);
            self.jump(Opcode::JumpForward, end);
            if handler.kind.is_some() {
                self.mark(next);
            }
        }
        self.exit_block();
        if reraise {
            self.op(Opcode::EndFinally);
        }
        self.mark(otherwise);
        self.block(orelse)?;
        self.mark(end);
        Ok(())
    }

    pub fn store_target(&mut self, target: &Expr) -> CompileResult {
        validate_target(target, TargetContext::Store).map_err(|(message, line, _)| self.error(line, message))?;
        self.store_valid_target(target)
    }

    fn store_valid_target(&mut self, target: &Expr) -> CompileResult {
        match &target.kind {
            ExprKind::Name(name) => self.store_name(name),
            ExprKind::Attribute { value, attr } => {
                self.expr(value)?;
                self.emit(Opcode::StoreAttr, Arg::Name(attr.clone()));
            }
            ExprKind::Subscript { value, index } => {
                self.expr(value)?;
                self.expr(index)?;
                self.op(Opcode::StoreSubscr);
            }
            ExprKind::List(items) | ExprKind::Tuple(items) => {
                match items.iter().position(|e| matches!(e.kind, ExprKind::Starred(_))) {
                    Some(star) => {
                        let after = items.len() - star - 1;
                        if star > 0xff || after > 0xff {
                            return Err(self.error(target.line, "too many expressions in star-unpacking assignment"));
                        }
                        self.int(Opcode::UnpackEx, star | (after << 8));
                    }
                    None => self.int(Opcode::UnpackSequence, items.len()),
                }
                for item in items {
                    match &item.kind {
                        ExprKind::Starred(inner) => self.store_valid_target(inner)?,
                        _ => self.store_valid_target(item)?,
                    }
                }
            }
            _ => return Err(self.error(target.line, format!("can't assign to {}", target.describe()))),
        }
        Ok(())
    }

    fn delete_target(&mut self, target: &Expr) -> CompileResult {
        validate_target(target, TargetContext::Delete).map_err(|(message, line, _)| self.error(line, message))?;
        match &target.kind {
            ExprKind::Name(name) => self.delete_name(name, target.line)?,
            ExprKind::Attribute { value, attr } => {
                self.expr(value)?;
                self.emit(Opcode::DeleteAttr, Arg::Name(attr.clone()));
            }
            ExprKind::Subscript { value, index } => {
                self.expr(value)?;
                self.expr(index)?;
                self.op(Opcode::DeleteSubscr);
            }
            ExprKind::List(items) | ExprKind::Tuple(items) => {
                for item in items {
                    self.delete_target(item)?;
                }
            }
            _ => return Err(self.error(target.line, format!("can't delete {}", target.describe()))),
        }
        Ok(())
    }

    fn aug_assign(&mut self, target: &Expr, op: Opcode, value: &Expr) -> CompileResult {
        match &target.kind {
            ExprKind::Name(name) => {
                self.load_name(name);
                self.expr(value)?;
                self.op(op);
                self.store_name(name);
            }
            ExprKind::Attribute { value: object, attr } => {
                self.expr(object)?;
                self.op(Opcode::DupTop);
                self.load_attr(attr);
                self.expr(value)?;
                self.op(op);
                self.op(Opcode::RotTwo);
                self.emit(Opcode::StoreAttr, Arg::Name(attr.clone()));
            }
            ExprKind::Subscript { value: object, index } => {
                self.expr(object)?;
                self.expr(index)?;
                self.op(Opcode::DupTopTwo);
                self.op(Opcode::BinarySubscr);
                self.expr(value)?;
                self.op(op);
                self.op(Opcode::RotThree);
                self.op(Opcode::StoreSubscr);
            }
            _ => return Err(self.error(target.line, "illegal expression for augmented assignment")),
        }
        Ok(())
    }
}
