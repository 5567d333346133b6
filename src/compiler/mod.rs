//! Tree-to-instructions compiler.
//!
//! Every top-level definition becomes one outer unit called by the embedding
//! runtime as `unit(f_globals, scope_key, *template_args)`. The outer unit
//! sets up the shared cells, runs the construction unit and returns
//! `(root_node, populate)`.

pub mod bind;
pub mod codegen;
pub mod compile_error;
pub mod construct;
pub mod expr;
pub mod helpers;
pub mod layout;
pub mod locals;
pub mod stmt;

pub use compile_error::CompileError;
pub use helpers::{Helper, HELPERS_GLOBAL};
pub use layout::Layout;

use crate::ast::{Item, Module, ObjectDef, Template, TemplateItem};
use crate::bytecode::{encode, CodeUnit, Opcode, Stream};
use crate::grammar::Grammar;
use crate::parser::parse_source;
use codegen::{CodeGen, CompileResult, GLOBALS_CELL, KEY_CELL, NODES_CELL};
use locals::{template_locals, NameMode, LOCALS_CELL};

/// Parameter receiving the defining module's globals.
pub const GLOBALS_PARAM: &str = "__f_globals";
/// Parameter receiving the identity key of the scope being built.
pub const SCOPE_KEY_PARAM: &str = "__scope_key";

#[derive(Debug, Clone, PartialEq)]
pub enum ItemKind {
    Declarative,
    /// Template parameter names in call order; keyword parameters follow
    /// the positional ones and take their defaults from the defaults unit.
    Template { params: Vec<String>, star: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledItem {
    pub name: String,
    pub kind: ItemKind,
    pub unit: CodeUnit,
    /// Evaluates the keyword defaults of a template as a tuple.
    pub defaults: Option<CodeUnit>,
    pub node_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledModule {
    pub filename: String,
    pub items: Vec<CompiledItem>,
}

impl CompiledModule {
    pub fn get(&self, name: &str) -> Option<&CompiledItem> {
        self.items.iter().find(|item| item.name == name)
    }
}

pub struct Compiler {
    grammar: Grammar,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new(Grammar::default())
    }
}

impl Compiler {
    pub fn new(grammar: Grammar) -> Self {
        Self { grammar }
    }

    pub fn grammar(&self) -> &Grammar {
        &self.grammar
    }

    pub fn compile_source(&self, source: &str, filename: &str) -> Result<CompiledModule, CompileError> {
        let module = parse_source(source, filename, &self.grammar).map_err(|e| e.located(filename, source))?;
        self.compile(&module)
    }

    /// Compiles every definition; the first failure aborts the module.
    pub fn compile(&self, module: &Module) -> Result<CompiledModule, CompileError> {
        let mut items = Vec::with_capacity(module.items.len());
        for item in &module.items {
            let compiled = match item {
                Item::Object(def) => compile_object(def, &module.filename)?,
                Item::Template(template) => compile_template(template, &module.filename)?,
            };
            log::debug!(
                "compiled '{}' from {}: {} nodes, {} bytes",
                compiled.name,
                module.filename,
                compiled.node_count,
                compiled.unit.code.len()
            );
            items.push(compiled);
        }
        Ok(CompiledModule {
            filename: module.filename.clone(),
            items,
        })
    }
}

fn finish_unit(stream: Stream) -> Result<CodeUnit, CompileError> {
    encode(&stream, false).map_err(|source| CompileError::consistency(&stream.name, source))
}

fn compile_object(def: &ObjectDef, filename: &str) -> CompileResult<CompiledItem> {
    let layout = Layout::of_object(def);
    let construct = construct::object_unit(def, &layout, filename)?;
    let populate = bind::object_unit(def, &layout, filename)?;

    let mut code = CodeGen::new(def.typename.clone(), filename, def.lineno, NameMode::TemplateOuter { fast: Vec::new() });
    code.stream.params = vec![GLOBALS_PARAM.to_string(), SCOPE_KEY_PARAM.to_string()];
    setup_cells(&mut code, layout.len());
    finish_outer(&mut code, construct, populate);

    Ok(CompiledItem {
        name: def.typename.clone(),
        kind: ItemKind::Declarative,
        unit: finish_unit(code.finish())?,
        defaults: None,
        node_count: layout.len(),
    })
}

fn compile_template(template: &Template, filename: &str) -> CompileResult<CompiledItem> {
    let layout = Layout::of_template(template);
    let locals = template_locals(template);
    let construct = construct::template_unit(template, &layout, filename, locals.clone())?;
    let populate = bind::template_unit(template, &layout, filename, locals.clone())?;

    let mut code = CodeGen::new(template.name.clone(), filename, template.lineno, NameMode::template_outer(template));
    let mut params = vec![GLOBALS_PARAM.to_string(), SCOPE_KEY_PARAM.to_string()];
    params.extend(template.params.positional.iter().cloned());
    params.extend(template.params.keyword.iter().map(|(name, _)| name.clone()));
    code.stream.params = params;
    code.stream.star_param = template.params.star.clone();
    setup_cells(&mut code, layout.len());

    for item in &template.body {
        let TemplateItem::Const(c) = item else { continue };
        code.set_line(c.lineno);
        match &c.typename {
            Some(typename) => {
                code.load_helper(Helper::ValidateConst);
                code.load_str(&c.name);
                code.expr(&c.value)?;
                code.expr(typename)?;
                code.call(3);
            }
            None => code.expr(&c.value)?,
        }
        code.store_name(&c.name);
    }

    code.set_line(template.lineno);
    code.load_helper(Helper::MakeTemplateScope);
    for name in &locals {
        code.load_str(name);
        code.load_fast(name);
    }
    code.int(Opcode::BuildMap, locals.len());
    code.call(1);
    code.store_deref(LOCALS_CELL);
    finish_outer(&mut code, construct, populate);

    let defaults = if template.params.keyword.is_empty() {
        None
    } else {
        let mut defaults = CodeGen::new(format!("{}.defaults", template.name), filename, template.lineno, NameMode::Dynamic);
        defaults.set_line(template.lineno);
        for (_, value) in &template.params.keyword {
            defaults.expr(value)?;
        }
        defaults.int(Opcode::BuildTuple, template.params.keyword.len());
        defaults.op(Opcode::ReturnValue);
        Some(finish_unit(defaults.finish())?)
    };

    let mut call_params = template.params.positional.clone();
    call_params.extend(template.params.keyword.iter().map(|(name, _)| name.clone()));
    Ok(CompiledItem {
        name: template.name.clone(),
        kind: ItemKind::Template {
            params: call_params,
            star: template.params.star.clone(),
        },
        unit: finish_unit(code.finish())?,
        defaults,
        node_count: layout.len(),
    })
}

/// Stores the scope key and globals in cells and allocates `[None] * n`
/// for the node list.
fn setup_cells(code: &mut CodeGen, nodes: usize) {
    code.load_fast(SCOPE_KEY_PARAM);
    code.store_deref(KEY_CELL);
    code.load_fast(GLOBALS_PARAM);
    code.store_deref(GLOBALS_CELL);
    code.load_none();
    code.int(Opcode::BuildList, 1);
    code.load_int(nodes);
    code.op(Opcode::BinaryMultiply);
    code.store_deref(NODES_CELL);
}

/// Runs construction, then returns `(nodes[0], populate)`.
fn finish_outer(code: &mut CodeGen, construct: Stream, populate: Stream) {
    let construct_name = construct.name.clone();
    code.call_subunit(construct, &construct_name);
    code.load_node(0);
    let populate_name = populate.name.clone();
    code.make_function(populate, &populate_name, 0);
    code.int(Opcode::BuildTuple, 2);
    code.op(Opcode::ReturnValue);
}
