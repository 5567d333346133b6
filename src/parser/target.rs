use super::Parser;
use crate::ast::{Expr, ExprKind};
use crate::parser_error::{ParseError, ParseErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetContext {
    Store,
    Delete,
}

impl TargetContext {
    fn verb(self) -> &'static str {
        match self {
            TargetContext::Store => "assign to",
            TargetContext::Delete => "delete",
        }
    }
}

/// Checks that `expr` may appear on the left of an assignment or in `del`.
///
/// Names, attributes and subscripts are targets. Lists and tuples are
/// targets when all their elements are, with at most one starred element
/// when storing.
pub fn validate(expr: &Expr, context: TargetContext) -> Result<(), (String, usize, usize)> {
    validate_inner(expr, context, false)
}

fn validate_inner(expr: &Expr, context: TargetContext, in_sequence: bool) -> Result<(), (String, usize, usize)> {
    let fail = |what: &str| Err((format!("can't {} {}", context.verb(), what), expr.line, expr.column));
    match &expr.kind {
        ExprKind::Name(_) | ExprKind::Attribute { .. } | ExprKind::Subscript { .. } => Ok(()),
        ExprKind::List(items) | ExprKind::Tuple(items) => {
            if context == TargetContext::Store {
                let starred = items.iter().filter(|e| matches!(e.kind, ExprKind::Starred(_))).count();
                if starred > 1 {
                    return Err(("two starred expressions in assignment".to_string(), expr.line, expr.column));
                }
            }
            items.iter().try_for_each(|item| validate_inner(item, context, true))
        }
        ExprKind::Starred(inner) => {
            if context == TargetContext::Delete {
                return fail("starred");
            }
            if !in_sequence {
                return Err((
                    "starred assignment target must be in a list or tuple".to_string(),
                    expr.line,
                    expr.column,
                ));
            }
            validate_inner(inner, context, false)
        }
        _ => fail(expr.describe()),
    }
}

impl Parser<'_, '_> {
    pub(super) fn check_target(&self, expr: &Expr, context: TargetContext) -> Result<(), ParseError> {
        validate(expr, context)
            .map_err(|(message, line, column)| self.error_at(ParseErrorKind::InvalidTarget, message, line, column))
    }

    pub(super) fn check_aug_target(&self, expr: &Expr) -> Result<(), ParseError> {
        match expr.kind {
            ExprKind::Name(_) | ExprKind::Attribute { .. } | ExprKind::Subscript { .. } => Ok(()),
            _ => Err(self.error_at(
                ParseErrorKind::InvalidTarget,
                "illegal expression for augmented assignment",
                expr.line,
                expr.column,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinOp, Constant};

    fn at(kind: ExprKind) -> Expr {
        Expr::new(kind, 1, 1)
    }

    fn name(n: &str) -> Expr {
        at(ExprKind::Name(n.to_string()))
    }

    fn message(expr: &Expr, context: TargetContext) -> String {
        validate(expr, context).unwrap_err().0
    }

    #[test]
    fn test_simple_targets() {
        assert!(validate(&name("a"), TargetContext::Store).is_ok());
        let attr = at(ExprKind::Attribute {
            value: name("a").boxed(),
            attr: "b".into(),
        });
        assert!(validate(&attr, TargetContext::Delete).is_ok());
    }

    #[test]
    fn test_nested_sequences() {
        let inner = at(ExprKind::List(vec![name("b"), at(ExprKind::Starred(name("c").boxed()))]));
        let target = at(ExprKind::Tuple(vec![name("a"), inner]));
        assert!(validate(&target, TargetContext::Store).is_ok());

        let bad = at(ExprKind::Tuple(vec![name("a"), at(ExprKind::Constant(Constant::Int(1)))]));
        assert_eq!(message(&bad, TargetContext::Store), "can't assign to literal");
    }

    #[test]
    fn test_starred_rules() {
        let two = at(ExprKind::Tuple(vec![
            at(ExprKind::Starred(name("a").boxed())),
            at(ExprKind::Starred(name("b").boxed())),
        ]));
        assert_eq!(message(&two, TargetContext::Store), "two starred expressions in assignment");
        let lone = at(ExprKind::Starred(name("a").boxed()));
        assert_eq!(message(&lone, TargetContext::Store), "starred assignment target must be in a list or tuple");
        let seq = at(ExprKind::List(vec![at(ExprKind::Starred(name("a").boxed()))]));
        assert_eq!(message(&seq, TargetContext::Delete), "can't delete starred");
    }

    #[test]
    fn test_kinds_in_messages() {
        let op = at(ExprKind::BinOp {
            left: name("a").boxed(),
            op: BinOp::Add,
            right: name("b").boxed(),
        });
        assert_eq!(message(&op, TargetContext::Delete), "can't delete operator");
        let kw = at(ExprKind::Constant(Constant::None));
        assert_eq!(message(&kw, TargetContext::Store), "can't assign to keyword");
    }
}
