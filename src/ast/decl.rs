//! Declarative constructs.

use super::expr::Expr;
use super::stmt::Stmt;

#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub filename: String,
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Object(ObjectDef),
    Template(Template),
}

impl Item {
    pub fn name(&self) -> &str {
        match self {
            Item::Object(def) => &def.typename,
            Item::Template(template) => &template.name,
        }
    }
}

/// `declare Name(Base): ident:`
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDef {
    pub typename: String,
    pub base: String,
    pub identifier: Option<String>,
    pub doc: Option<String>,
    pub body: Vec<BodyItem>,
    pub lineno: usize,
}

/// `Type: ident:` nested inside a definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildDef {
    pub typename: String,
    pub identifier: Option<String>,
    pub body: Vec<BodyItem>,
    pub lineno: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BodyItem {
    Storage(StorageDef),
    Binding(Binding),
    ExBinding(ExBinding),
    Alias(AliasExpr),
    Func(FuncDef),
    Child(ChildDef),
    TemplateInst(TemplateInst),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Attr,
    Event,
}

impl StorageKind {
    pub fn keyword(self) -> &'static str {
        match self {
            StorageKind::Attr => "attr",
            StorageKind::Event => "event",
        }
    }
}

/// `attr name: Type = expr` or `event name: Type`.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageDef {
    pub kind: StorageKind,
    pub name: String,
    pub typename: Option<Expr>,
    pub expr: Option<OperatorExpr>,
    pub lineno: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOp {
    Assign,
    Subscribe,
    Update,
    Delegate,
    Notify,
}

impl BindOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BindOp::Assign => "=",
            BindOp::Subscribe => "<<",
            BindOp::Update => ">>",
            BindOp::Delegate => ":=",
            BindOp::Notify => "::",
        }
    }

    /// Whether the runtime reads the expression to produce a value.
    pub fn reads(self) -> bool {
        matches!(self, BindOp::Assign | BindOp::Subscribe | BindOp::Delegate)
    }

    /// Whether the runtime pushes changes back into the expression.
    pub fn writes(self) -> bool {
        matches!(self, BindOp::Update | BindOp::Delegate | BindOp::Notify)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Expr(Expr),
    /// Statement suite of a `::` binding.
    Suite(Vec<Stmt>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperatorExpr {
    pub operator: BindOp,
    pub value: BindValue,
    pub lineno: usize,
}

/// `name op expr`
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub name: String,
    pub expr: OperatorExpr,
    pub lineno: usize,
}

/// `a.b.c op expr`, bound on the object named by the chain prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct ExBinding {
    pub chain: Vec<String>,
    pub expr: OperatorExpr,
    pub lineno: usize,
}

/// `alias name: target.chain` (the target defaults to `name`).
#[derive(Debug, Clone, PartialEq)]
pub struct AliasExpr {
    pub name: String,
    pub target: String,
    pub chain: Vec<String>,
    pub lineno: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Parameters {
    pub params: Vec<Param>,
    pub star: Option<String>,
    pub double_star: Option<String>,
}

impl Parameters {
    /// Parameter names in slot order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.params.iter().map(|p| p.name.clone()).collect();
        names.extend(self.star.iter().cloned());
        names.extend(self.double_star.iter().cloned());
        names
    }
}

/// `func name(params):` or the override form `name => (params):`.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncDef {
    pub name: String,
    pub params: Parameters,
    pub body: Vec<Stmt>,
    pub is_override: bool,
    pub lineno: usize,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TemplateParams {
    pub positional: Vec<String>,
    pub keyword: Vec<(String, Expr)>,
    pub star: Option<String>,
}

impl TemplateParams {
    pub fn names(&self) -> Vec<String> {
        let mut names = self.positional.clone();
        names.extend(self.keyword.iter().map(|(name, _)| name.clone()));
        names.extend(self.star.iter().cloned());
        names
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub name: String,
    pub params: TemplateParams,
    pub doc: Option<String>,
    pub body: Vec<TemplateItem>,
    pub lineno: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplateItem {
    Const(ConstExpr),
    Child(ChildDef),
    Inst(TemplateInst),
}

/// `const name: Type = expr` inside a template.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstExpr {
    pub name: String,
    pub typename: Option<Expr>,
    pub value: Expr,
    pub lineno: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TemplateIds {
    pub names: Vec<String>,
    pub starname: Option<String>,
}

/// `Name(args, *rest): a, b, *others:`
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateInst {
    pub name: String,
    pub args: Vec<Expr>,
    pub star_arg: Option<Expr>,
    pub identifiers: Option<TemplateIds>,
    pub body: Vec<TemplateInstBinding>,
    pub lineno: usize,
}

/// `ident.attr op expr` inside a template instantiation.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateInstBinding {
    pub name: String,
    pub chain: Vec<String>,
    pub expr: OperatorExpr,
    pub lineno: usize,
}
