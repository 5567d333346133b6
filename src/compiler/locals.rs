//! How free names in generated code are loaded and stored.

use crate::ast::{assigned_names, Comprehension, Expr, ExprKind, FuncDef, Stmt, StmtKind, Template, TemplateItem};

/// Name of the cell holding the template scope map inside pass units.
pub const LOCALS_CELL: &str = "__locals";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameMode {
    /// Binding expressions and `::` suites: every name goes through the
    /// dynamic scope supplied at evaluation time.
    Dynamic,
    /// Declarative function bodies: parameters and assigned names are fast
    /// slots, everything else goes through the dynamic scope.
    Function { fast: Vec<String> },
    /// The outer unit of a template: parameters and consts are fast slots,
    /// everything else is a global.
    TemplateOuter { fast: Vec<String> },
    /// Construction and binding units: template locals are read from the
    /// scope map cell, everything else is a global.
    Pass { template_locals: Vec<String>, fast: Vec<String> },
}

/// Where a single load or store goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Name,
    Fast,
    Global,
    /// `__locals[name]`; read only.
    ScopeMap,
}

impl NameMode {
    pub fn function(func: &FuncDef) -> NameMode {
        let mut fast = func.params.names();
        assigned_names(&func.body, &mut fast);
        comprehension_targets(&func.body, &mut fast);
        NameMode::Function { fast }
    }

    pub fn template_outer(template: &Template) -> NameMode {
        NameMode::TemplateOuter {
            fast: template_locals(template),
        }
    }

    pub fn pass(template_locals: Vec<String>) -> NameMode {
        NameMode::Pass {
            template_locals,
            fast: Vec::new(),
        }
    }

    pub fn load(&self, name: &str) -> Access {
        match self {
            NameMode::Dynamic => Access::Name,
            NameMode::Function { fast } if fast.iter().any(|n| n == name) => Access::Fast,
            NameMode::Function { .. } => Access::Name,
            NameMode::TemplateOuter { fast } if fast.iter().any(|n| n == name) => Access::Fast,
            NameMode::TemplateOuter { .. } => Access::Global,
            NameMode::Pass { fast, .. } if fast.iter().any(|n| n == name) => Access::Fast,
            NameMode::Pass { template_locals, .. } if template_locals.iter().any(|n| n == name) => Access::ScopeMap,
            NameMode::Pass { .. } => Access::Global,
        }
    }

    /// Stores bind a fast slot in every optimized unit, adding the name if
    /// it was not collected up front.
    pub fn store(&mut self, name: &str) -> Access {
        match self {
            NameMode::Dynamic => Access::Name,
            NameMode::Function { fast } | NameMode::TemplateOuter { fast } | NameMode::Pass { fast, .. } => {
                if !fast.iter().any(|n| n == name) {
                    fast.push(name.to_string());
                }
                Access::Fast
            }
        }
    }

    pub fn uses_fast_locals(&self) -> bool {
        !matches!(self, NameMode::Dynamic)
    }
}

/// Template parameters followed by const names, in declaration order.
pub fn template_locals(template: &Template) -> Vec<String> {
    let mut names = template.params.names();
    for item in &template.body {
        if let TemplateItem::Const(c) = item {
            if !names.contains(&c.name) {
                names.push(c.name.clone());
            }
        }
    }
    names
}

fn comprehension_targets(body: &[Stmt], out: &mut Vec<String>) {
    for stmt in body {
        match &stmt.kind {
            StmtKind::Expr(e) | StmtKind::Return(Some(e)) => expr_comprehensions(e, out),
            StmtKind::Assign { targets, value } => {
                targets.iter().for_each(|t| expr_comprehensions(t, out));
                expr_comprehensions(value, out);
            }
            StmtKind::AugAssign { value, .. } => expr_comprehensions(value, out),
            StmtKind::If { test, body, orelse } | StmtKind::While { test, body, orelse } => {
                expr_comprehensions(test, out);
                comprehension_targets(body, out);
                comprehension_targets(orelse, out);
            }
            StmtKind::For { iter, body, orelse, .. } => {
                expr_comprehensions(iter, out);
                comprehension_targets(body, out);
                comprehension_targets(orelse, out);
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => {
                comprehension_targets(body, out);
                for handler in handlers {
                    comprehension_targets(&handler.body, out);
                }
                comprehension_targets(orelse, out);
                comprehension_targets(finalbody, out);
            }
            _ => {}
        }
    }
}

fn expr_comprehensions(expr: &Expr, out: &mut Vec<String>) {
    match &expr.kind {
        ExprKind::ListComp { element, generators } => {
            for Comprehension { target, iter, ifs } in generators {
                target.target_names(out);
                expr_comprehensions(iter, out);
                ifs.iter().for_each(|e| expr_comprehensions(e, out));
            }
            expr_comprehensions(element, out);
        }
        ExprKind::Call { func, args, keywords } => {
            expr_comprehensions(func, out);
            args.iter().for_each(|e| expr_comprehensions(e, out));
            keywords.iter().for_each(|k| expr_comprehensions(&k.value, out));
        }
        ExprKind::List(items) | ExprKind::Tuple(items) | ExprKind::Set(items) => {
            items.iter().for_each(|e| expr_comprehensions(e, out))
        }
        ExprKind::BinOp { left, right, .. } => {
            expr_comprehensions(left, out);
            expr_comprehensions(right, out);
        }
        ExprKind::UnaryOp { operand, .. } | ExprKind::Starred(operand) => expr_comprehensions(operand, out),
        ExprKind::BoolOp { values, .. } => values.iter().for_each(|e| expr_comprehensions(e, out)),
        ExprKind::Attribute { value, .. } => expr_comprehensions(value, out),
        ExprKind::Subscript { value, index } => {
            expr_comprehensions(value, out);
            expr_comprehensions(index, out);
        }
        ExprKind::IfExp { test, body, orelse } => {
            expr_comprehensions(test, out);
            expr_comprehensions(body, out);
            expr_comprehensions(orelse, out);
        }
        ExprKind::Compare { left, comparators, .. } => {
            expr_comprehensions(left, out);
            comparators.iter().for_each(|e| expr_comprehensions(e, out));
        }
        ExprKind::Dict(pairs) => {
            for (k, v) in pairs {
                expr_comprehensions(k, out);
                expr_comprehensions(v, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Item, ObjectDef};
    use crate::grammar::Grammar;
    use crate::parser::parse_source;

    fn object(src: &str) -> ObjectDef {
        let module = parse_source(src, "t.kn", &Grammar::default()).unwrap();
        match module.items.into_iter().next() {
            Some(Item::Object(def)) => def,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_function_locals() {
        let def = object(
            "\
declare Main(Window):
    func f(a, *rest):
        b = [c for c in rest]
        for d in rest:
            pass
        return e
",
        );
        let crate::ast::BodyItem::Func(func) = &def.body[0] else { panic!("expected func") };
        let mode = NameMode::function(func);
        for name in ["a", "rest", "b", "c", "d"] {
            assert_eq!(mode.load(name), Access::Fast, "{}", name);
        }
        assert_eq!(mode.load("e"), Access::Name);
    }

    #[test]
    fn test_template_modes() {
        let module = parse_source(
            "template T(a, b=1, *c):\n    const d = a\n    Label:\n        pass\n",
            "t.kn",
            &Grammar::default(),
        )
        .unwrap();
        let Some(Item::Template(template)) = module.items.first() else { panic!("expected template") };
        assert_eq!(template_locals(template), vec!["a", "b", "c", "d"]);

        let outer = NameMode::template_outer(template);
        assert_eq!(outer.load("d"), Access::Fast);
        assert_eq!(outer.load("len"), Access::Global);

        let mut pass = NameMode::pass(template_locals(template));
        assert_eq!(pass.load("a"), Access::ScopeMap);
        assert_eq!(pass.store("a"), Access::Fast);
        assert_eq!(pass.load("a"), Access::Fast);
        assert_eq!(NameMode::Dynamic.load("a"), Access::Name);
    }
}
