//! Second pass: the unit that builds the construct-node tree.
//!
//! Each node is validated, created through the helper table, stored at its
//! layout index and appended to its parent's children. Storage is declared
//! on the node right after it is created.

use crate::ast::{BodyItem, ChildDef, ObjectDef, StorageDef, Template, TemplateInst, TemplateItem};
use crate::bytecode::{Opcode, Stream};
use crate::compiler::codegen::{CodeGen, CompileResult, KEY_CELL, NODES_CELL};
use crate::compiler::compile_error::CompileError;
use crate::compiler::helpers::Helper;
use crate::compiler::layout::{Cursor, Layout, NodeKind};
use crate::compiler::locals::{NameMode, LOCALS_CELL};

/// Fast slot holding the validated base type of the node being built.
const BASE: &str = "__base";

struct ConstructPass<'a> {
    code: CodeGen,
    cursor: Cursor<'a>,
}

pub fn object_unit(def: &ObjectDef, layout: &Layout, filename: &str) -> CompileResult<Stream> {
    let mut pass = ConstructPass::new(&def.typename, filename, def.lineno, layout, None);
    let (root, _) = pass.take(NodeKind::Root, def.lineno)?;
    let code = &mut pass.code;
    code.set_line(def.lineno);
    code.remapped(def.lineno, |g| {
        g.load_helper(Helper::ValidateDeclarative);
        load_dotted(g, &def.base);
        g.call(1);
        g.store_fast(BASE);

        g.load_helper(Helper::MakeObjectNode);
        g.load_fast(BASE);
        g.load_str(&def.typename);
        load_optional_str(g, def.identifier.as_deref());
        g.load_deref(KEY_CELL);
        load_optional_str(g, def.doc.as_deref());
        g.call(5);
        g.store_node(root);
        declare_storage(g, root, &def.body)
    })?;
    pass.body(&def.body, root)?;
    pass.finish()
}

pub fn template_unit(template: &Template, layout: &Layout, filename: &str, locals: Vec<String>) -> CompileResult<Stream> {
    let mut pass = ConstructPass::new(&template.name, filename, template.lineno, layout, Some(locals));
    let (root, _) = pass.take(NodeKind::Root, template.lineno)?;
    let code = &mut pass.code;
    code.set_line(template.lineno);
    code.load_helper(Helper::MakeTemplateNode);
    code.load_deref(KEY_CELL);
    code.call(1);
    code.store_node(root);
    for item in &template.body {
        match item {
            TemplateItem::Const(_) => {}
            TemplateItem::Child(child) => pass.child(child, root)?,
            TemplateItem::Inst(inst) => pass.template_inst(inst, root)?,
        }
    }
    pass.finish()
}

impl<'a> ConstructPass<'a> {
    fn new(name: &str, filename: &str, line: usize, layout: &'a Layout, locals: Option<Vec<String>>) -> Self {
        let mut freevars = vec![NODES_CELL.to_string(), KEY_CELL.to_string()];
        if locals.is_some() {
            freevars.push(LOCALS_CELL.to_string());
        }
        let mut code = CodeGen::new(
            format!("{}.construct", name),
            filename,
            line,
            NameMode::pass(locals.unwrap_or_default()),
        );
        code.stream.freevars = freevars;
        Self {
            code,
            cursor: Cursor::new(layout),
        }
    }

    fn take(&mut self, kind: NodeKind, line: usize) -> CompileResult<(usize, Option<usize>)> {
        self.cursor
            .take(kind)
            .map(|(index, record)| (index, record.parent))
            .ok_or_else(|| CompileError::internal(format!("node layout out of step at line {}", line)))
    }

    fn body(&mut self, body: &[BodyItem], parent: usize) -> CompileResult {
        for item in body {
            match item {
                BodyItem::Child(child) => self.child(child, parent)?,
                BodyItem::TemplateInst(inst) => self.template_inst(inst, parent)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn child(&mut self, child: &ChildDef, parent: usize) -> CompileResult {
        let (index, recorded) = self.take(NodeKind::Child, child.lineno)?;
        debug_assert_eq!(recorded, Some(parent));
        let code = &mut self.code;
        code.set_line(child.lineno);
        code.remapped(child.lineno, |g| {
            g.load_helper(Helper::ValidateDeclarative);
            load_dotted(g, &child.typename);
            g.call(1);
            g.store_fast(BASE);

            g.load_helper(Helper::MakeChildNode);
            g.load_fast(BASE);
            load_optional_str(g, child.identifier.as_deref());
            g.load_deref(KEY_CELL);
            g.call(3);
            g.store_node(index);
            append_child(g, parent, index);
            declare_storage(g, index, &child.body)
        })?;
        self.body(&child.body, index)
    }

    fn template_inst(&mut self, inst: &TemplateInst, parent: usize) -> CompileResult {
        let (index, _) = self.take(NodeKind::TemplateInst, inst.lineno)?;
        let code = &mut self.code;
        code.set_line(inst.lineno);
        code.remapped(inst.lineno, |g| {
            g.load_helper(Helper::ValidateTemplate);
            load_dotted(g, &inst.name);
            g.call(1);
            g.store_fast(BASE);

            g.load_helper(Helper::MakeTemplateInstNode);
            g.load_fast(BASE);
            for arg in &inst.args {
                g.expr(arg)?;
            }
            g.int(Opcode::BuildTuple, inst.args.len());
            match &inst.star_arg {
                Some(star) => g.expr(star)?,
                None => g.load_none(),
            }
            match &inst.identifiers {
                Some(ids) => {
                    g.load_str_tuple(&ids.names);
                    load_optional_str(g, ids.starname.as_deref());
                }
                None => {
                    g.load_none();
                    g.load_none();
                }
            }
            g.load_deref(KEY_CELL);
            g.call(6);
            g.store_node(index);
            append_child(g, parent, index);
            Ok(())
        })
    }

    fn finish(mut self) -> CompileResult<Stream> {
        if !self.cursor.finished() {
            return Err(CompileError::internal(format!(
                "'{}' did not visit every laid out node",
                self.code.stream.name
            )));
        }
        self.code.return_none();
        log::trace!("built construction unit '{}'", self.code.stream.name);
        Ok(self.code.finish())
    }
}

fn load_optional_str(code: &mut CodeGen, text: Option<&str>) {
    match text {
        Some(t) => code.load_str(t),
        None => code.load_none(),
    }
}

/// `a.b.c` loads `a` through the name mode, then each attribute.
pub fn load_dotted(code: &mut CodeGen, dotted: &str) {
    let mut parts = dotted.split('.');
    if let Some(first) = parts.next() {
        code.load_name(first);
    }
    for attr in parts {
        code.load_attr(attr);
    }
}

fn append_child(code: &mut CodeGen, parent: usize, index: usize) {
    code.load_node(parent);
    code.load_attr("children");
    code.load_attr("append");
    code.load_node(index);
    code.call(1);
    code.op(Opcode::PopTop);
}

fn declare_storage(code: &mut CodeGen, index: usize, body: &[BodyItem]) -> CompileResult {
    for item in body {
        if let BodyItem::Storage(StorageDef {
            kind, name, typename, lineno, ..
        }) = item
        {
            code.set_line(*lineno);
            code.load_helper(Helper::AddStorage);
            code.load_node(index);
            code.load_str(name);
            match typename {
                Some(t) => code.expr(t)?,
                None => code.load_none(),
            }
            code.load_str(kind.keyword());
            code.call(4);
            code.op(Opcode::PopTop);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Item;
    use crate::bytecode::{encode, Arg, Const, Literal};
    use crate::compiler::locals::template_locals;
    use crate::grammar::Grammar;
    use crate::parser::parse_source;

    fn helper_calls(stream: &Stream) -> Vec<String> {
        stream
            .instructions()
            .filter(|i| i.op == Opcode::LoadAttr)
            .filter_map(|i| match &i.arg {
                Arg::Name(n) if Helper::from_name(n).is_some() => Some(n.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_object_construction_order() {
        let src = "\
declare Main(ui.Window): main:
    attr count: int = 0
    Label: label:
        event clicked
";
        let module = parse_source(src, "t.kn", &Grammar::default()).unwrap();
        let Item::Object(def) = &module.items[0] else { panic!("expected object") };
        let layout = Layout::of_object(def);
        let stream = object_unit(def, &layout, "t.kn").unwrap();
        assert_eq!(
            helper_calls(&stream),
            vec![
                "validate_declarative",
                "make_object_node",
                "add_storage",
                "remap_error",
                "validate_declarative",
                "make_child_node",
                "add_storage",
                "remap_error"
            ]
        );
        assert_eq!(stream.freevars, vec![NODES_CELL, KEY_CELL]);
        assert!(stream
            .instructions()
            .any(|i| i.arg == Arg::Const(Const::Value(Literal::str("event")))));
        assert!(encode(&stream, true).is_ok());
    }

    #[test]
    fn test_template_construction() {
        let src = "\
template Pair(a, b):
    const n = a + b
    Label:
        text = str(n)
    Other(n, *a): x, *rest:
        pass
";
        let module = parse_source(src, "t.kn", &Grammar::default()).unwrap();
        let Item::Template(template) = &module.items[0] else { panic!("expected template") };
        let layout = Layout::of_template(template);
        let stream = template_unit(template, &layout, "t.kn", template_locals(template)).unwrap();
        assert_eq!(stream.freevars.last().map(String::as_str), Some(LOCALS_CELL));
        let calls = helper_calls(&stream);
        assert_eq!(calls[0], "make_template_node");
        assert!(calls.contains(&"make_template_inst_node".to_string()));
        // template arguments come from the scope map
        assert!(stream.instructions().any(|i| i.arg == Arg::Free(LOCALS_CELL.to_string())));
        assert!(encode(&stream, true).is_ok());
    }
}
