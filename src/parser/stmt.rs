use super::{Parser, TargetContext};
use crate::ast::*;
use crate::parser_error::{ParseError, ParseErrorKind};
use crate::token::TokenKind;

/// Statement keywords outside the supported subset, with their diagnostics.
const UNSUPPORTED: &[(&str, &str)] = &[
    ("def", "def statements are not supported, declare functions with 'func'"),
    ("class", "class definitions are not supported"),
    ("with", "with statements are not supported"),
    ("async", "async statements are not supported"),
    ("global", "global statements are not supported"),
    ("nonlocal", "nonlocal statements are not supported"),
    ("import", "import statements are not supported"),
    ("from", "import statements are not supported"),
];

impl Parser<'_, '_> {
    /// Body after a `:` or `::`: simple statements on the same line, or an
    /// indented block.
    pub(super) fn parse_suite(&mut self) -> Result<Vec<Stmt>, ParseError> {
        if !self.at(&TokenKind::Newline) {
            return self.parse_simple_stmt();
        }
        self.advance();
        if !self.eat(&TokenKind::Indent) {
            let (line, column) = self.position();
            return Err(self.error_at(ParseErrorKind::ExpectedIndent, "expected an indented block", line, column));
        }
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Some(TokenKind::Dedent) => {
                    self.advance();
                    break;
                }
                None | Some(TokenKind::EndMarker) => return Err(self.unexpected()),
                Some(TokenKind::Newline) => {
                    self.advance();
                }
                _ => body.extend(self.parse_statement()?),
            }
        }
        Ok(body)
    }

    fn parse_statement(&mut self) -> Result<Vec<Stmt>, ParseError> {
        if let Some(kind) = self.peek() {
            if let Some((_, message)) = UNSUPPORTED.iter().find(|(word, _)| kind.is_keyword(word)) {
                return Err(self.error(*message));
            }
        }
        let stmt = match self.peek() {
            Some(k) if k.is_keyword("if") => self.parse_if()?,
            Some(k) if k.is_keyword("while") => self.parse_while()?,
            Some(k) if k.is_keyword("for") => self.parse_for()?,
            Some(k) if k.is_keyword("try") => self.parse_try()?,
            _ => return self.parse_simple_stmt(),
        };
        Ok(vec![stmt])
    }

    fn parse_simple_stmt(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut out = vec![self.parse_small_stmt()?];
        while self.eat(&TokenKind::Semicolon) {
            if self.at(&TokenKind::Newline) {
                break;
            }
            out.push(self.parse_small_stmt()?);
        }
        self.expect_newline()?;
        Ok(out)
    }

    fn parse_small_stmt(&mut self) -> Result<Stmt, ParseError> {
        let line = self.current_line();
        if let Some(kind) = self.peek() {
            if let Some((_, message)) = UNSUPPORTED.iter().find(|(word, _)| kind.is_keyword(word)) {
                return Err(self.error(*message));
            }
        }
        let kind = match self.peek() {
            Some(k) if k.is_keyword("pass") => {
                self.advance();
                StmtKind::Pass
            }
            Some(k) if k.is_keyword("break") => {
                self.advance();
                StmtKind::Break
            }
            Some(k) if k.is_keyword("continue") => {
                self.advance();
                StmtKind::Continue
            }
            Some(k) if k.is_keyword("return") => {
                self.advance();
                let value = if self.starts_expression() { Some(self.parse_testlist()?) } else { None };
                StmtKind::Return(value)
            }
            Some(k) if k.is_keyword("raise") => {
                self.advance();
                let exc = if self.starts_expression() { Some(self.parse_test()?) } else { None };
                let cause = if exc.is_some() && self.eat_keyword("from") { Some(self.parse_test()?) } else { None };
                StmtKind::Raise { exc, cause }
            }
            Some(k) if k.is_keyword("del") => {
                self.advance();
                let targets = match self.parse_exprlist()? {
                    Expr {
                        kind: ExprKind::Tuple(items),
                        ..
                    } => items,
                    single => vec![single],
                };
                for target in &targets {
                    self.check_target(target, TargetContext::Delete)?;
                }
                StmtKind::Delete(targets)
            }
            Some(k) if k.is_keyword("assert") => {
                self.advance();
                let test = self.parse_test()?;
                let msg = if self.eat(&TokenKind::Comma) { Some(self.parse_test()?) } else { None };
                StmtKind::Assert { test, msg }
            }
            _ => self.parse_expr_stmt()?,
        };
        Ok(Stmt::new(kind, line))
    }

    fn parse_expr_stmt(&mut self) -> Result<StmtKind, ParseError> {
        let first = self.parse_testlist()?;
        if let Some(TokenKind::AugAssign(symbol)) = self.peek() {
            let symbol = *symbol;
            self.check_aug_target(&first)?;
            self.advance();
            let op = BinOp::from_symbol(symbol).ok_or_else(|| self.error("unknown augmented assignment"))?;
            let value = self.parse_testlist()?;
            return Ok(StmtKind::AugAssign {
                target: first,
                op,
                value,
            });
        }
        if !self.at(&TokenKind::Equal) {
            return Ok(StmtKind::Expr(first));
        }
        let mut targets = vec![first];
        while self.eat(&TokenKind::Equal) {
            targets.push(self.parse_testlist()?);
        }
        let value = targets.pop().ok_or_else(|| self.unexpected())?;
        for target in &targets {
            self.check_target(target, TargetContext::Store)?;
        }
        Ok(StmtKind::Assign { targets, value })
    }

    fn parse_else_suite(&mut self) -> Result<Vec<Stmt>, ParseError> {
        if self.eat_keyword("else") {
            self.expect(TokenKind::Colon)?;
            return self.parse_suite();
        }
        Ok(Vec::new())
    }

    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        let line = self.current_line();
        // `if` or `elif`
        self.advance();
        let test = self.parse_test()?;
        self.expect(TokenKind::Colon)?;
        let body = self.parse_suite()?;
        let orelse = if self.at_keyword("elif") {
            vec![self.parse_if()?]
        } else {
            self.parse_else_suite()?
        };
        Ok(Stmt::new(StmtKind::If { test, body, orelse }, line))
    }

    fn parse_while(&mut self) -> Result<Stmt, ParseError> {
        let line = self.expect_keyword("while")?.line;
        let test = self.parse_test()?;
        self.expect(TokenKind::Colon)?;
        let body = self.parse_suite()?;
        let orelse = self.parse_else_suite()?;
        Ok(Stmt::new(StmtKind::While { test, body, orelse }, line))
    }

    fn parse_for(&mut self) -> Result<Stmt, ParseError> {
        let line = self.expect_keyword("for")?.line;
        let target = self.parse_exprlist()?;
        self.check_target(&target, TargetContext::Store)?;
        self.expect_keyword("in")?;
        let iter = self.parse_testlist()?;
        self.expect(TokenKind::Colon)?;
        let body = self.parse_suite()?;
        let orelse = self.parse_else_suite()?;
        Ok(Stmt::new(
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            },
            line,
        ))
    }

    fn parse_try(&mut self) -> Result<Stmt, ParseError> {
        let line = self.expect_keyword("try")?.line;
        self.expect(TokenKind::Colon)?;
        let body = self.parse_suite()?;

        let mut handlers: Vec<ExceptHandler> = Vec::new();
        while self.at_keyword("except") {
            let (handler_line, column) = self.position();
            if handlers.last().is_some_and(|h| h.kind.is_none()) {
                return Err(self.error_at(ParseErrorKind::Syntax, "default 'except:' must be last", handler_line, column));
            }
            self.advance();
            let kind = if self.at(&TokenKind::Colon) { None } else { Some(self.parse_test()?) };
            let name = if kind.is_some() && self.eat_keyword("as") { Some(self.expect_name()?) } else { None };
            self.expect(TokenKind::Colon)?;
            let handler_body = self.parse_suite()?;
            handlers.push(ExceptHandler {
                kind,
                name,
                body: handler_body,
                line: handler_line,
            });
        }

        let orelse = if handlers.is_empty() { Vec::new() } else { self.parse_else_suite()? };
        let finalbody = if self.eat_keyword("finally") {
            self.expect(TokenKind::Colon)?;
            self.parse_suite()?
        } else {
            Vec::new()
        };
        if handlers.is_empty() && finalbody.is_empty() {
            return Err(self.error("expected 'except' or 'finally' block"));
        }
        Ok(Stmt::new(
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            },
            line,
        ))
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::*;
    use crate::grammar::Grammar;
    use crate::lexer::tokenize;
    use crate::parser::Parser;
    use crate::parser_error::{ParseError, ParseErrorKind};

    fn statements(source: &str) -> Result<Vec<Stmt>, ParseError> {
        let grammar = Grammar::default();
        let mut tokens = tokenize(source, &grammar);
        let mut parser = Parser::new(&mut tokens);
        let mut out = Vec::new();
        while !parser.at(&crate::token::TokenKind::EndMarker) {
            out.extend(parser.parse_statement()?);
        }
        Ok(out)
    }

    #[test]
    fn test_assignment_forms() {
        let body = statements("a = b = 1\nx, *y = z\nn += 2\ndel a[0], b.c\n").unwrap();
        assert!(matches!(&body[0].kind, StmtKind::Assign { targets, .. } if targets.len() == 2));
        assert!(matches!(&body[1].kind, StmtKind::Assign { targets, .. } if matches!(targets[0].kind, ExprKind::Tuple(_))));
        assert!(matches!(&body[2].kind, StmtKind::AugAssign { op: BinOp::Add, .. }));
        assert!(matches!(&body[3].kind, StmtKind::Delete(t) if t.len() == 2));
    }

    #[test]
    fn test_compound_statements() {
        let src = "\
if a:
    pass
elif b:
    pass
else:
    c = 1
for i in range(3):
    continue
else:
    pass
while x:
    break
try:
    f()
except ValueError as e:
    g(e)
except:
    h()
else:
    k()
finally:
    m()
";
        let body = statements(src).unwrap();
        assert_eq!(body.len(), 4);
        match &body[0].kind {
            StmtKind::If { orelse, .. } => assert!(matches!(&orelse[0].kind, StmtKind::If { .. })),
            other => panic!("unexpected {:?}", other),
        }
        match &body[3].kind {
            StmtKind::Try {
                handlers,
                orelse,
                finalbody,
                ..
            } => {
                assert_eq!(handlers.len(), 2);
                assert_eq!(handlers[0].name.as_deref(), Some("e"));
                assert_eq!(orelse.len(), 1);
                assert_eq!(finalbody.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bare_except_must_be_last() {
        let err = statements("try:\n    f()\nexcept:\n    g()\nexcept E:\n    h()\n").unwrap_err();
        assert_eq!(err.message, "default 'except:' must be last");
    }

    #[test]
    fn test_invalid_targets() {
        let err = statements("f() = 1\n").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::InvalidTarget);
        assert_eq!(err.message, "can't assign to function call");
        let err = statements("del a + b\n").unwrap_err();
        assert_eq!(err.message, "can't delete operator");
        let err = statements("[x for x in y] += 1\n").unwrap_err();
        assert_eq!(err.message, "illegal expression for augmented assignment");
    }

    #[test]
    fn test_unsupported_statements() {
        assert_eq!(statements("with a:\n    pass\n").unwrap_err().message, "with statements are not supported");
        assert_eq!(statements("global x\n").unwrap_err().message, "global statements are not supported");
        assert_eq!(statements("x = yield\n").unwrap_err().message, "yield expressions are not supported");
    }

    #[test]
    fn test_semicolons() {
        assert_eq!(statements("a = 1; b = 2;\n").unwrap().len(), 2);
    }
}
