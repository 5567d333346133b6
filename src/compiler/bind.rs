//! Third pass: the `populate` unit that attaches bindings, aliases and
//! declarative functions to the already constructed nodes.

use crate::ast::{
    AliasExpr, BindOp, BindValue, BodyItem, ChildDef, ExBinding, FuncDef, ObjectDef, OperatorExpr, StorageDef,
    Template, TemplateInst, TemplateItem,
};
use crate::bytecode::{Opcode, Stream, MAKE_DEFAULTS};
use crate::compiler::codegen::{CodeGen, CompileResult, GLOBALS_CELL, NODES_CELL};
use crate::compiler::compile_error::CompileError;
use crate::compiler::helpers::Helper;
use crate::compiler::layout::{Cursor, Layout, NodeKind};
use crate::compiler::locals::{NameMode, LOCALS_CELL};
use crate::parser::{validate_target, TargetContext};

/// Name under which the runtime supplies the value a write unit stores.
pub const VALUE_NAME: &str = "__value__";

struct BindPass<'a> {
    code: CodeGen,
    cursor: Cursor<'a>,
    /// qualified name of the definition, for nested unit names
    owner: String,
}

pub fn object_unit(def: &ObjectDef, layout: &Layout, filename: &str) -> CompileResult<Stream> {
    let mut pass = BindPass::new(&def.typename, filename, def.lineno, layout, None);
    let root = pass.take(NodeKind::Root, def.lineno)?;
    pass.body(&def.body, root)?;
    pass.finish()
}

pub fn template_unit(template: &Template, layout: &Layout, filename: &str, locals: Vec<String>) -> CompileResult<Stream> {
    let mut pass = BindPass::new(&template.name, filename, template.lineno, layout, Some(locals));
    let root = pass.take(NodeKind::Root, template.lineno)?;
    for item in &template.body {
        match item {
            TemplateItem::Const(_) => {}
            TemplateItem::Child(child) => pass.child(child)?,
            TemplateItem::Inst(inst) => pass.template_inst(inst)?,
        }
    }
    debug_assert_eq!(root, 0);
    pass.finish()
}

impl<'a> BindPass<'a> {
    fn new(name: &str, filename: &str, line: usize, layout: &'a Layout, locals: Option<Vec<String>>) -> Self {
        let mut freevars = vec![NODES_CELL.to_string(), GLOBALS_CELL.to_string()];
        if locals.is_some() {
            freevars.push(LOCALS_CELL.to_string());
        }
        let mut code = CodeGen::new(
            format!("{}.populate", name),
            filename,
            line,
            NameMode::pass(locals.unwrap_or_default()),
        );
        code.stream.freevars = freevars;
        Self {
            code,
            cursor: Cursor::new(layout),
            owner: name.to_string(),
        }
    }

    fn take(&mut self, kind: NodeKind, line: usize) -> CompileResult<usize> {
        self.cursor
            .take(kind)
            .map(|(index, _)| index)
            .ok_or_else(|| CompileError::internal(format!("node layout out of step at line {}", line)))
    }

    fn body(&mut self, body: &[BodyItem], node: usize) -> CompileResult {
        for item in body {
            match item {
                BodyItem::Storage(storage) => self.storage_default(storage, node)?,
                BodyItem::Binding(binding) => {
                    self.code.set_line(binding.lineno);
                    self.operator(node, &binding.name, &binding.expr)?;
                }
                BodyItem::ExBinding(binding) => self.chained(binding, node)?,
                BodyItem::Alias(alias) => self.alias(alias, node),
                BodyItem::Func(func) => self.function(func, node)?,
                BodyItem::Child(child) => self.child(child)?,
                BodyItem::TemplateInst(inst) => self.template_inst(inst)?,
            }
        }
        Ok(())
    }

    fn child(&mut self, child: &ChildDef) -> CompileResult {
        let index = self.take(NodeKind::Child, child.lineno)?;
        self.body(&child.body, index)
    }

    fn storage_default(&mut self, storage: &StorageDef, node: usize) -> CompileResult {
        if let Some(expr) = &storage.expr {
            self.code.set_line(storage.lineno);
            self.operator(node, &storage.name, expr)?;
        }
        Ok(())
    }

    /// `run_operator(node, name, op, read, write, globals, scope)`
    fn operator(&mut self, node: usize, name: &str, expr: &OperatorExpr) -> CompileResult {
        let (read, write) = self.operator_units(name, expr)?;
        self.code.remapped(expr.lineno, |g| {
            g.load_helper(Helper::RunOperator);
            g.load_node(node);
            g.load_str(name);
            push_operator_args(g, expr.operator, read, write);
            g.call(7);
            g.op(Opcode::PopTop);
            Ok(())
        })
    }

    fn chained(&mut self, binding: &ExBinding, node: usize) -> CompileResult {
        self.code.set_line(binding.lineno);
        let (read, write) = self.operator_units(&binding.chain.join("."), &binding.expr)?;
        self.code.remapped(binding.lineno, |g| {
            g.load_helper(Helper::RunChainedOperator);
            g.load_node(node);
            g.load_str_tuple(&binding.chain);
            push_operator_args(g, binding.expr.operator, read, write);
            g.call(7);
            g.op(Opcode::PopTop);
            Ok(())
        })
    }

    fn alias(&mut self, alias: &AliasExpr, node: usize) {
        let code = &mut self.code;
        code.set_line(alias.lineno);
        code.load_helper(Helper::AddAlias);
        code.load_node(node);
        code.load_str(&alias.name);
        code.load_str(&alias.target);
        code.load_str_tuple(&alias.chain);
        code.call(4);
        code.op(Opcode::PopTop);
    }

    fn function(&mut self, func: &FuncDef, node: usize) -> CompileResult {
        let qualname = format!("{}.{}", self.owner, func.name);
        let mut body = self.code.nested(qualname.clone(), func.lineno, NameMode::function(func));
        body.stream.params = func.params.params.iter().map(|p| p.name.clone()).collect();
        body.stream.star_param = func.params.star.clone();
        body.stream.kw_star_param = func.params.double_star.clone();
        body.function_body(&func.body)?;
        let unit = body.finish();

        let code = &mut self.code;
        code.set_line(func.lineno);
        code.load_helper(Helper::AddDeclFunction);
        code.load_node(node);
        let defaults: Vec<_> = func.params.params.iter().filter_map(|p| p.default.as_ref()).collect();
        let mut flags = 0;
        if !defaults.is_empty() {
            for default in &defaults {
                code.expr(default)?;
            }
            code.int(Opcode::BuildTuple, defaults.len());
            flags |= MAKE_DEFAULTS;
        }
        code.make_function(unit, &qualname, flags);
        code.load_const(crate::bytecode::Literal::Bool(func.is_override));
        code.call(3);
        code.op(Opcode::PopTop);
        Ok(())
    }

    fn template_inst(&mut self, inst: &TemplateInst) -> CompileResult {
        let index = self.take(NodeKind::TemplateInst, inst.lineno)?;
        for binding in &inst.body {
            self.code.set_line(binding.lineno);
            let label = format!("{}.{}", binding.name, binding.chain.join("."));
            let (read, write) = self.operator_units(&label, &binding.expr)?;
            self.code.remapped(binding.lineno, |g| {
                g.load_helper(Helper::RunTemplateOperator);
                g.load_node(index);
                g.load_str(&binding.name);
                g.load_str_tuple(&binding.chain);
                push_operator_args(g, binding.expr.operator, read, write);
                g.call(8);
                g.op(Opcode::PopTop);
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Builds the read and write units an operator needs.
    fn operator_units(&self, name: &str, expr: &OperatorExpr) -> CompileResult<(Option<Stream>, Option<Stream>)> {
        let read = if expr.operator.reads() {
            let BindValue::Expr(value) = &expr.value else {
                return Err(self.code.error(expr.lineno, format!("'{}' requires an expression", expr.operator.symbol())));
            };
            let mut unit = self.code.nested(name, expr.lineno, NameMode::Dynamic);
            unit.set_line(expr.lineno);
            unit.expr(value)?;
            unit.op(Opcode::ReturnValue);
            Some(unit.finish())
        } else {
            None
        };

        let write = if expr.operator.writes() {
            let mut unit = self.code.nested(format!("{}.write", name), expr.lineno, NameMode::Dynamic);
            unit.set_line(expr.lineno);
            match &expr.value {
                BindValue::Suite(body) => unit.block(body)?,
                BindValue::Expr(target) => {
                    validate_target(target, TargetContext::Store).map_err(|(message, line, _)| {
                        self.code.error(line, message).with_hint(format!(
                            "the right side of '{}' must be assignable",
                            expr.operator.symbol()
                        ))
                    })?;
                    unit.load_name(VALUE_NAME);
                    unit.store_target(target)?;
                }
            }
            if !unit.ends_in_terminal() {
                unit.return_none();
            }
            Some(unit.finish())
        } else {
            None
        };
        Ok((read, write))
    }

    fn finish(mut self) -> CompileResult<Stream> {
        if !self.cursor.finished() {
            return Err(CompileError::internal(format!(
                "'{}' did not visit every laid out node",
                self.code.stream.name
            )));
        }
        self.code.return_none();
        log::trace!("built binding unit '{}'", self.code.stream.name);
        Ok(self.code.finish())
    }
}

/// Pushes `op, read, write, globals, scope`.
fn push_operator_args(code: &mut CodeGen, op: BindOp, read: Option<Stream>, write: Option<Stream>) {
    code.load_str(op.symbol());
    for unit in [read, write] {
        match unit {
            Some(unit) => code.load_code(unit),
            None => code.load_none(),
        }
    }
    code.load_deref(GLOBALS_CELL);
    code.load_template_scope();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Item;
    use crate::bytecode::{encode, Arg, Const};
    use crate::grammar::Grammar;
    use crate::parser::parse_source;

    fn object(src: &str) -> (ObjectDef, Layout) {
        let module = parse_source(src, "t.kn", &Grammar::default()).unwrap();
        let Item::Object(def) = module.items.into_iter().next().unwrap() else { panic!("expected object") };
        let layout = Layout::of_object(&def);
        (def, layout)
    }

    fn code_consts(stream: &Stream) -> Vec<&Stream> {
        stream
            .instructions()
            .filter_map(|i| match &i.arg {
                Arg::Const(Const::Code(code)) => Some(code.as_ref()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_binding_units_per_operator() {
        let (def, layout) = object(
            "\
declare Main(Window):
    attr count: int = 0
    title << 'x' + name
    name >> model.value
    clicked ::
        count += 1
    Label:
        text := model.text
",
        );
        let stream = object_unit(&def, &layout, "t.kn").unwrap();
        let units = code_consts(&stream);
        let names: Vec<&str> = units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["count", "title", "name.write", "clicked.write", "text", "text.write"]
        );
        for unit in &units {
            assert!(!unit.newlocals, "{} should use dynamic names", unit.name);
        }
        // the delegate binding targets the child node
        let node_indexes: Vec<Arg> = stream
            .instructions()
            .filter(|i| i.op == Opcode::LoadConst)
            .filter_map(|i| match &i.arg {
                Arg::Const(Const::Value(crate::bytecode::Literal::Int(n))) => Some(Arg::Int(*n as u32)),
                _ => None,
            })
            .collect();
        assert!(node_indexes.contains(&Arg::Int(1)));
        assert!(encode(&stream, true).is_ok());
    }

    #[test]
    fn test_delegate_requires_assignable_target() {
        let (def, layout) = object("declare Main(Window):\n    name := a + b\n");
        let err = object_unit(&def, &layout, "t.kn").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("can't assign to operator"), "{}", text);
        assert!(text.contains("hint"));
    }

    #[test]
    fn test_declarative_function_with_defaults() {
        let (def, layout) = object(
            "\
declare Main(Window):
    func reset(value=0, *rest):
        count = value
    clicked => ():
        pass
",
        );
        let stream = object_unit(&def, &layout, "t.kn").unwrap();
        let makes: Vec<Arg> = stream
            .instructions()
            .filter(|i| i.op == Opcode::MakeFunction)
            .map(|i| i.arg.clone())
            .collect();
        assert_eq!(makes, vec![Arg::Int(MAKE_DEFAULTS), Arg::Int(0)]);
        let units = code_consts(&stream);
        assert_eq!(units[0].params, vec!["value"]);
        assert_eq!(units[0].star_param.as_deref(), Some("rest"));
        assert!(units[0].newlocals);
        let unit = encode(&stream, true).unwrap();
        assert!(unit.stacksize > 0);
    }
}
