use super::Parser;
use crate::ast::*;
use crate::parser_error::ParseError;
use crate::token::{Token, TokenKind};

type BinLevel = fn(&TokenKind) -> Option<BinOp>;

fn or_level(kind: &TokenKind) -> Option<BinOp> {
    matches!(kind, TokenKind::Pipe).then_some(BinOp::BitOr)
}

fn xor_level(kind: &TokenKind) -> Option<BinOp> {
    matches!(kind, TokenKind::Caret).then_some(BinOp::BitXor)
}

fn and_level(kind: &TokenKind) -> Option<BinOp> {
    matches!(kind, TokenKind::Ampersand).then_some(BinOp::BitAnd)
}

fn shift_level(kind: &TokenKind) -> Option<BinOp> {
    match kind {
        TokenKind::LeftShift => Some(BinOp::LShift),
        TokenKind::RightShift => Some(BinOp::RShift),
        _ => None,
    }
}

fn arith_level(kind: &TokenKind) -> Option<BinOp> {
    match kind {
        TokenKind::Plus => Some(BinOp::Add),
        TokenKind::Minus => Some(BinOp::Sub),
        _ => None,
    }
}

fn term_level(kind: &TokenKind) -> Option<BinOp> {
    match kind {
        TokenKind::Star => Some(BinOp::Mul),
        TokenKind::Slash => Some(BinOp::Div),
        TokenKind::DoubleSlash => Some(BinOp::FloorDiv),
        TokenKind::Percent => Some(BinOp::Mod),
        TokenKind::At => Some(BinOp::MatMul),
        _ => None,
    }
}

/// Binary precedence levels, loosest first.
const LEVELS: [BinLevel; 6] = [or_level, xor_level, and_level, shift_level, arith_level, term_level];

impl Parser<'_, '_> {
    fn reject_unsupported_expr(&self) -> Result<(), ParseError> {
        let Some(kind) = self.peek() else {
            return Ok(());
        };
        let what = match kind {
            k if k.is_keyword("lambda") => "lambda expressions are not supported",
            k if k.is_keyword("yield") => "yield expressions are not supported",
            k if k.is_keyword("await") => "await expressions are not supported",
            _ => return Ok(()),
        };
        Err(self.error(what))
    }

    /// `test (',' test)* [',']`, a tuple when a comma is present.
    /// Starred items are allowed.
    pub(super) fn parse_testlist(&mut self) -> Result<Expr, ParseError> {
        let (line, column) = self.position();
        let first = self.parse_test_or_star()?;
        if !self.at(&TokenKind::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&TokenKind::Comma) {
            if !self.starts_expression() {
                break;
            }
            items.push(self.parse_test_or_star()?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), line, column))
    }

    /// Like [`Parser::parse_testlist`] but at bitwise-or precedence, for
    /// `for` and `del` targets.
    pub(super) fn parse_exprlist(&mut self) -> Result<Expr, ParseError> {
        let (line, column) = self.position();
        let first = self.parse_expr_or_star()?;
        if !self.at(&TokenKind::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&TokenKind::Comma) {
            if !self.starts_expression() {
                break;
            }
            items.push(self.parse_expr_or_star()?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), line, column))
    }

    /// Whether the next token can begin an expression.
    pub(super) fn starts_expression(&self) -> bool {
        match self.peek() {
            Some(
                TokenKind::Name(_)
                | TokenKind::Integer(_)
                | TokenKind::Float(_)
                | TokenKind::String(_)
                | TokenKind::Bytes(_)
                | TokenKind::LParen
                | TokenKind::LBracket
                | TokenKind::LBrace
                | TokenKind::Minus
                | TokenKind::Plus
                | TokenKind::Tilde
                | TokenKind::Star,
            ) => true,
            Some(k) => ["None", "True", "False", "not", "lambda", "yield", "await"].iter().any(|w| k.is_keyword(w)),
            None => false,
        }
    }

    fn parse_test_or_star(&mut self) -> Result<Expr, ParseError> {
        if self.at(&TokenKind::Star) {
            let (line, column) = self.position();
            self.advance();
            let inner = self.parse_expr()?;
            return Ok(Expr::new(ExprKind::Starred(inner.boxed()), line, column));
        }
        self.parse_test()
    }

    fn parse_expr_or_star(&mut self) -> Result<Expr, ParseError> {
        if self.at(&TokenKind::Star) {
            let (line, column) = self.position();
            self.advance();
            let inner = self.parse_expr()?;
            return Ok(Expr::new(ExprKind::Starred(inner.boxed()), line, column));
        }
        self.parse_expr()
    }

    pub(super) fn parse_test(&mut self) -> Result<Expr, ParseError> {
        self.nested(Self::parse_conditional)
    }

    fn parse_conditional(&mut self) -> Result<Expr, ParseError> {
        self.reject_unsupported_expr()?;
        let (line, column) = self.position();
        let body = self.parse_or_test()?;
        if !self.eat_keyword("if") {
            return Ok(body);
        }
        let test = self.parse_or_test()?;
        self.expect_keyword("else")?;
        let orelse = self.parse_test()?;
        Ok(Expr::new(
            ExprKind::IfExp {
                test: test.boxed(),
                body: body.boxed(),
                orelse: orelse.boxed(),
            },
            line,
            column,
        ))
    }

    fn parse_bool_chain(&mut self, word: &str, op: BoolOp) -> Result<Expr, ParseError> {
        let (line, column) = self.position();
        let first = if op == BoolOp::Or {
            self.parse_bool_chain("and", BoolOp::And)?
        } else {
            self.parse_not_test()?
        };
        if !self.at_keyword(word) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_keyword(word) {
            values.push(if op == BoolOp::Or {
                self.parse_bool_chain("and", BoolOp::And)?
            } else {
                self.parse_not_test()?
            });
        }
        Ok(Expr::new(ExprKind::BoolOp { op, values }, line, column))
    }

    fn parse_or_test(&mut self) -> Result<Expr, ParseError> {
        self.parse_bool_chain("or", BoolOp::Or)
    }

    fn parse_not_test(&mut self) -> Result<Expr, ParseError> {
        let (line, column) = self.position();
        if self.eat_keyword("not") {
            let operand = self.nested(Self::parse_not_test)?;
            return Ok(Expr::new(
                ExprKind::UnaryOp {
                    op: UnaryOp::Not,
                    operand: operand.boxed(),
                },
                line,
                column,
            ));
        }
        self.parse_comparison()
    }

    fn comparison_operator(&mut self) -> Option<CmpOp> {
        let op = match self.peek()? {
            TokenKind::Less => CmpOp::Lt,
            TokenKind::LessEqual => CmpOp::LtE,
            TokenKind::EqEqual => CmpOp::Eq,
            TokenKind::NotEqual => CmpOp::NotEq,
            TokenKind::Greater => CmpOp::Gt,
            TokenKind::GreaterEqual => CmpOp::GtE,
            k if k.is_keyword("in") => CmpOp::In,
            k if k.is_keyword("not") => {
                if !self.peek_second().is_some_and(|k| k.is_keyword("in")) {
                    return None;
                }
                self.advance();
                CmpOp::NotIn
            }
            k if k.is_keyword("is") => {
                if self.peek_second().is_some_and(|k| k.is_keyword("not")) {
                    self.advance();
                    CmpOp::IsNot
                } else {
                    CmpOp::Is
                }
            }
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let (line, column) = self.position();
        let left = self.parse_expr()?;
        let mut ops = Vec::new();
        let mut comparators = Vec::new();
        while let Some(op) = self.comparison_operator() {
            ops.push(op);
            comparators.push(self.parse_expr()?);
        }
        if ops.is_empty() {
            return Ok(left);
        }
        Ok(Expr::new(
            ExprKind::Compare {
                left: left.boxed(),
                ops,
                comparators,
            },
            line,
            column,
        ))
    }

    /// Bitwise-or level expression.
    pub(super) fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary(0)
    }

    fn parse_binary(&mut self, level: usize) -> Result<Expr, ParseError> {
        if level == LEVELS.len() {
            return self.parse_factor();
        }
        let (line, column) = self.position();
        let mut left = self.parse_binary(level + 1)?;
        while let Some(op) = self.peek().and_then(LEVELS[level]) {
            self.advance();
            let right = self.parse_binary(level + 1)?;
            left = Expr::new(
                ExprKind::BinOp {
                    left: left.boxed(),
                    op,
                    right: right.boxed(),
                },
                line,
                column,
            );
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Expr, ParseError> {
        let (line, column) = self.position();
        let op = match self.peek() {
            Some(TokenKind::Minus) => UnaryOp::Neg,
            Some(TokenKind::Plus) => UnaryOp::Pos,
            Some(TokenKind::Tilde) => UnaryOp::Invert,
            _ => return self.parse_power(),
        };
        self.advance();
        let operand = self.nested(Self::parse_factor)?;
        Ok(Expr::new(
            ExprKind::UnaryOp {
                op,
                operand: operand.boxed(),
            },
            line,
            column,
        ))
    }

    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let (line, column) = self.position();
        let base = self.parse_atom_expr()?;
        if !self.eat(&TokenKind::DoubleStar) {
            return Ok(base);
        }
        let exponent = self.nested(Self::parse_factor)?;
        Ok(Expr::new(
            ExprKind::BinOp {
                left: base.boxed(),
                op: BinOp::Pow,
                right: exponent.boxed(),
            },
            line,
            column,
        ))
    }

    fn parse_atom_expr(&mut self) -> Result<Expr, ParseError> {
        self.reject_unsupported_expr()?;
        let (line, column) = self.position();
        let mut expr = self.parse_atom()?;
        loop {
            match self.peek() {
                Some(TokenKind::LParen) => {
                    self.advance();
                    let (args, keywords) = self.parse_call_args()?;
                    self.expect(TokenKind::RParen)?;
                    expr = Expr::new(
                        ExprKind::Call {
                            func: expr.boxed(),
                            args,
                            keywords,
                        },
                        line,
                        column,
                    );
                }
                Some(TokenKind::LBracket) => {
                    self.advance();
                    let index = self.parse_subscript_list()?;
                    self.expect(TokenKind::RBracket)?;
                    expr = Expr::new(
                        ExprKind::Subscript {
                            value: expr.boxed(),
                            index: index.boxed(),
                        },
                        line,
                        column,
                    );
                }
                Some(TokenKind::Dot) => {
                    self.advance();
                    let attr = self.expect_name()?;
                    expr = Expr::new(
                        ExprKind::Attribute {
                            value: expr.boxed(),
                            attr,
                        },
                        line,
                        column,
                    );
                }
                _ => return Ok(expr),
            }
        }
    }

    fn reject_generator(&self) -> Result<(), ParseError> {
        if self.at_keyword("for") {
            return Err(self.error("generator expressions are not supported"));
        }
        Ok(())
    }

    fn parse_call_args(&mut self) -> Result<(Vec<Expr>, Vec<Keyword>), ParseError> {
        let mut args = Vec::new();
        let mut keywords: Vec<Keyword> = Vec::new();
        while !self.at(&TokenKind::RParen) {
            let (line, column) = self.position();
            if self.eat(&TokenKind::DoubleStar) {
                let value = self.parse_test()?;
                keywords.push(Keyword { arg: None, value });
            } else if self.eat(&TokenKind::Star) {
                if keywords.iter().any(|k| k.arg.is_none()) {
                    return Err(self.error("iterable argument unpacking follows keyword argument unpacking"));
                }
                let inner = self.parse_test()?;
                args.push(Expr::new(ExprKind::Starred(inner.boxed()), line, column));
            } else if matches!(self.peek(), Some(TokenKind::Name(_))) && self.peek_second() == Some(&TokenKind::Equal) {
                let name = self.expect_name()?;
                self.expect(TokenKind::Equal)?;
                if keywords.iter().any(|k| k.arg.as_ref() == Some(&name)) {
                    return Err(self.error_at(
                        crate::parser_error::ParseErrorKind::Syntax,
                        format!("keyword argument repeated: {}", name),
                        line,
                        column,
                    ));
                }
                let value = self.parse_test()?;
                keywords.push(Keyword { arg: Some(name), value });
            } else {
                let value = self.parse_test()?;
                self.reject_generator()?;
                if !keywords.is_empty() {
                    return Err(self.error_at(
                        crate::parser_error::ParseErrorKind::Syntax,
                        "positional argument follows keyword argument",
                        line,
                        column,
                    ));
                }
                args.push(value);
            }
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok((args, keywords))
    }

    fn parse_subscript_list(&mut self) -> Result<Expr, ParseError> {
        let (line, column) = self.position();
        let first = self.parse_subscript()?;
        if !self.at(&TokenKind::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&TokenKind::Comma) {
            if self.at(&TokenKind::RBracket) {
                break;
            }
            items.push(self.parse_subscript()?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), line, column))
    }

    fn slice_part(&mut self) -> Result<Option<Box<Expr>>, ParseError> {
        match self.peek() {
            Some(TokenKind::Colon | TokenKind::DoubleColon | TokenKind::RBracket | TokenKind::Comma) => Ok(None),
            _ => Ok(Some(self.parse_test()?.boxed())),
        }
    }

    fn parse_subscript(&mut self) -> Result<Expr, ParseError> {
        let (line, column) = self.position();
        let lower = self.slice_part()?;
        let (upper, step) = if self.eat(&TokenKind::DoubleColon) {
            // `a[x::s]` lexes its two colons as one token
            (None, self.slice_part()?)
        } else if self.eat(&TokenKind::Colon) {
            let upper = self.slice_part()?;
            let step = if self.eat(&TokenKind::Colon) { self.slice_part()? } else { None };
            (upper, step)
        } else {
            return match lower {
                Some(expr) => Ok(*expr),
                None => Err(self.unexpected()),
            };
        };
        Ok(Expr::new(ExprKind::Slice { lower, upper, step }, line, column))
    }

    fn parse_strings(&mut self) -> Result<Expr, ParseError> {
        let (line, column) = self.position();
        let mut text: Option<String> = None;
        let mut bytes: Option<Vec<u8>> = None;
        loop {
            match self.peek() {
                Some(TokenKind::String(_)) if bytes.is_some() => {
                    return Err(self.error("cannot mix bytes and nonbytes literals"));
                }
                Some(TokenKind::Bytes(_)) if text.is_some() => {
                    return Err(self.error("cannot mix bytes and nonbytes literals"));
                }
                Some(TokenKind::String(_) | TokenKind::Bytes(_)) => {}
                _ => break,
            }
            match self.advance() {
                Some(Token {
                    kind: TokenKind::String(s),
                    ..
                }) => text.get_or_insert_with(String::new).push_str(&s),
                Some(Token {
                    kind: TokenKind::Bytes(b),
                    ..
                }) => bytes.get_or_insert_with(Vec::new).extend(b),
                _ => break,
            }
        }
        let constant = match (text, bytes) {
            (_, Some(b)) => Constant::Bytes(b),
            (Some(s), None) => Constant::Str(s),
            (None, None) => return Err(self.unexpected()),
        };
        Ok(Expr::new(ExprKind::Constant(constant), line, column))
    }

    fn parse_atom(&mut self) -> Result<Expr, ParseError> {
        let (line, column) = self.position();
        let Some(kind) = self.peek() else {
            return Err(self.unexpected());
        };
        let expr_kind = match kind {
            TokenKind::String(_) | TokenKind::Bytes(_) => return self.parse_strings(),
            TokenKind::Name(_) => ExprKind::Name(self.expect_name()?),
            TokenKind::Integer(n) => {
                let n = *n;
                self.advance();
                ExprKind::Constant(Constant::Int(n))
            }
            TokenKind::Float(n) => {
                let n = *n;
                self.advance();
                ExprKind::Constant(Constant::Float(n))
            }
            k if k.is_keyword("None") => {
                self.advance();
                ExprKind::Constant(Constant::None)
            }
            k if k.is_keyword("True") => {
                self.advance();
                ExprKind::Constant(Constant::Bool(true))
            }
            k if k.is_keyword("False") => {
                self.advance();
                ExprKind::Constant(Constant::Bool(false))
            }
            TokenKind::LParen => return self.parse_paren(),
            TokenKind::LBracket => return self.parse_list_display(),
            TokenKind::LBrace => return self.parse_brace_display(),
            _ => return Err(self.unexpected()),
        };
        Ok(Expr::new(expr_kind, line, column))
    }

    fn parse_paren(&mut self) -> Result<Expr, ParseError> {
        let (line, column) = self.position();
        self.expect(TokenKind::LParen)?;
        if self.eat(&TokenKind::RParen) {
            return Ok(Expr::new(ExprKind::Tuple(Vec::new()), line, column));
        }
        let first = self.parse_test_or_star()?;
        self.reject_generator()?;
        if self.eat(&TokenKind::RParen) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&TokenKind::Comma) {
            if self.at(&TokenKind::RParen) {
                break;
            }
            items.push(self.parse_test_or_star()?);
        }
        self.expect(TokenKind::RParen)?;
        Ok(Expr::new(ExprKind::Tuple(items), line, column))
    }

    fn parse_list_display(&mut self) -> Result<Expr, ParseError> {
        let (line, column) = self.position();
        self.expect(TokenKind::LBracket)?;
        if self.eat(&TokenKind::RBracket) {
            return Ok(Expr::new(ExprKind::List(Vec::new()), line, column));
        }
        let first = self.parse_test_or_star()?;
        if self.at_keyword("for") {
            let generators = self.parse_comprehension_clauses()?;
            self.expect(TokenKind::RBracket)?;
            return Ok(Expr::new(
                ExprKind::ListComp {
                    element: first.boxed(),
                    generators,
                },
                line,
                column,
            ));
        }
        let mut items = vec![first];
        while self.eat(&TokenKind::Comma) {
            if self.at(&TokenKind::RBracket) {
                break;
            }
            items.push(self.parse_test_or_star()?);
        }
        self.expect(TokenKind::RBracket)?;
        Ok(Expr::new(ExprKind::List(items), line, column))
    }

    fn parse_comprehension_clauses(&mut self) -> Result<Vec<Comprehension>, ParseError> {
        let mut generators = Vec::new();
        while self.eat_keyword("for") {
            let target = self.parse_exprlist()?;
            self.check_target(&target, super::TargetContext::Store)?;
            self.expect_keyword("in")?;
            let iter = self.parse_or_test()?;
            let mut ifs = Vec::new();
            while self.eat_keyword("if") {
                ifs.push(self.parse_or_test()?);
            }
            generators.push(Comprehension { target, iter, ifs });
        }
        Ok(generators)
    }

    fn parse_brace_display(&mut self) -> Result<Expr, ParseError> {
        let (line, column) = self.position();
        self.expect(TokenKind::LBrace)?;
        if self.eat(&TokenKind::RBrace) {
            return Ok(Expr::new(ExprKind::Dict(Vec::new()), line, column));
        }
        if self.at(&TokenKind::DoubleStar) {
            return Err(self.error("dict unpacking is not supported"));
        }
        let first = self.parse_test_or_star()?;
        if self.at_keyword("for") {
            return Err(self.error("set and dict comprehensions are not supported"));
        }
        if self.eat(&TokenKind::Colon) {
            let value = self.parse_test()?;
            if self.at_keyword("for") {
                return Err(self.error("set and dict comprehensions are not supported"));
            }
            let mut pairs = vec![(first, value)];
            while self.eat(&TokenKind::Comma) {
                if self.at(&TokenKind::RBrace) {
                    break;
                }
                let key = self.parse_test()?;
                self.expect(TokenKind::Colon)?;
                let value = self.parse_test()?;
                pairs.push((key, value));
            }
            self.expect(TokenKind::RBrace)?;
            return Ok(Expr::new(ExprKind::Dict(pairs), line, column));
        }
        let mut items = vec![first];
        while self.eat(&TokenKind::Comma) {
            if self.at(&TokenKind::RBrace) {
                break;
            }
            items.push(self.parse_test_or_star()?);
        }
        self.expect(TokenKind::RBrace)?;
        Ok(Expr::new(ExprKind::Set(items), line, column))
    }
}
