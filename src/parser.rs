mod expr;
mod stmt;
mod target;

use std::collections::VecDeque;

use crate::ast::*;
use crate::grammar::Grammar;
use crate::lexer::{TokenStream, tokenize};
use crate::parser_error::{ParseError, ParseErrorKind};
use crate::token::{Token, TokenKind};

pub use target::{validate as validate_target, TargetContext};

const LOOKAHEAD: usize = 2;

/// Recursive-descent parser for Kindle modules.
///
/// Tokens are pulled lazily from a [`TokenStream`] through a two-token
/// lookahead window, which is enough to tell child definitions, template
/// instances and the binding forms apart by their second token.
pub struct Parser<'s, 'a> {
    tokens: &'s mut TokenStream<'a>,
    lookahead: VecDeque<Token>,
    /// Position of the most recently consumed token, for errors at end of input.
    last_pos: (usize, usize),
    /// Open expression nesting levels, bounded by [`MAX_NESTING`].
    nesting: usize,
}

/// Deepest expression nesting accepted. Parsing and compiling recurse once
/// per level, so this bounds native stack use.
pub const MAX_NESTING: usize = 48;

/// Parses a whole module.
///
/// A failure recorded inside the token stream takes precedence over the
/// parser's own error when the parser ran out of tokens because of it.
pub fn parse(mut tokens: TokenStream<'_>, filename: &str) -> Result<Module, ParseError> {
    let (result, exhausted) = {
        let mut parser = Parser::new(&mut tokens);
        let result = parser.parse_module(filename);
        let exhausted = parser.lookahead.is_empty();
        (result, exhausted)
    };
    let err = match (result, tokens.take_error()) {
        (Ok(module), None) => return Ok(module),
        (Ok(_), Some(lex)) => lex,
        (Err(err), None) => err,
        (Err(err), Some(lex)) => {
            if exhausted || (lex.line, lex.column) <= (err.line, err.column) {
                lex
            } else {
                err
            }
        }
    };
    log::debug!("parse of {} failed: {}", filename, err);
    Err(err.in_file(filename))
}

pub fn parse_source(source: &str, filename: &str, grammar: &Grammar) -> Result<Module, ParseError> {
    parse(tokenize(source, grammar), filename)
}

fn binding_operator(kind: &TokenKind) -> Option<BindOp> {
    match kind {
        TokenKind::Equal => Some(BindOp::Assign),
        TokenKind::LeftShift => Some(BindOp::Subscribe),
        TokenKind::RightShift => Some(BindOp::Update),
        TokenKind::ColonEqual => Some(BindOp::Delegate),
        TokenKind::DoubleColon => Some(BindOp::Notify),
        _ => None,
    }
}

impl<'s, 'a> Parser<'s, 'a> {
    pub fn new(tokens: &'s mut TokenStream<'a>) -> Self {
        let mut parser = Parser {
            tokens,
            lookahead: VecDeque::new(),
            last_pos: (1, 1),
            nesting: 0,
        };
        parser.refill();
        parser
    }

    fn refill(&mut self) {
        while self.lookahead.len() < LOOKAHEAD {
            match self.tokens.next() {
                Some(token) => self.lookahead.push_back(token),
                None => break,
            }
        }
    }

    fn peek(&self) -> Option<&TokenKind> {
        self.lookahead.front().map(|t| &t.kind)
    }

    fn peek_second(&self) -> Option<&TokenKind> {
        self.lookahead.get(1).map(|t| &t.kind)
    }

    fn at(&self, kind: &TokenKind) -> bool {
        self.peek() == Some(kind)
    }

    fn at_keyword(&self, word: &str) -> bool {
        self.peek().is_some_and(|k| k.is_keyword(word))
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.lookahead.pop_front();
        if let Some(t) = &token {
            self.last_pos = (t.line, t.column);
        }
        self.refill();
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        if self.at_keyword(word) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Current position: the next token, or the last consumed one at end of input.
    fn position(&self) -> (usize, usize) {
        self.lookahead.front().map(|t| (t.line, t.column)).unwrap_or(self.last_pos)
    }

    fn error_at(&self, kind: ParseErrorKind, message: impl Into<String>, line: usize, column: usize) -> ParseError {
        let mut err = ParseError::new(kind, message, line, column);
        err.source_line = self.tokens.source_line(line);
        err
    }

    /// Runs `parse` one expression level deeper.
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T, ParseError>) -> Result<T, ParseError> {
        if self.nesting >= MAX_NESTING {
            let (line, column) = self.position();
            return Err(self.error_at(ParseErrorKind::TooDeep, "expression nested too deeply", line, column));
        }
        self.nesting += 1;
        let result = parse(self);
        self.nesting -= 1;
        result
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        let (line, column) = self.position();
        self.error_at(ParseErrorKind::Syntax, message, line, column)
    }

    fn unexpected(&self) -> ParseError {
        match self.peek() {
            Some(kind) => self.error(format!("unexpected {}", kind.describe())),
            None => self.error("unexpected end of input"),
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, ParseError> {
        if self.at(&kind) {
            if let Some(token) = self.advance() {
                return Ok(token);
            }
        }
        match self.peek() {
            Some(found) => Err(self.error(format!("expected '{}', found {}", kind, found.describe()))),
            None => Err(self.error(format!("expected '{}', found end of input", kind))),
        }
    }

    fn expect_newline(&mut self) -> Result<(), ParseError> {
        match self.peek() {
            Some(TokenKind::Newline) => {
                self.advance();
                Ok(())
            }
            Some(found) => Err(self.error(format!("expected end of line, found {}", found.describe()))),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn expect_keyword(&mut self, word: &str) -> Result<Token, ParseError> {
        if self.at_keyword(word) {
            if let Some(token) = self.advance() {
                return Ok(token);
            }
        }
        Err(self.error(format!("expected '{}'", word)))
    }

    fn expect_name(&mut self) -> Result<String, ParseError> {
        if let Some(TokenKind::Name(_)) = self.peek() {
            if let Some(Token {
                kind: TokenKind::Name(name),
                ..
            }) = self.advance()
            {
                return Ok(name);
            }
        }
        match self.peek() {
            Some(found) => Err(self.error(format!("expected a name, found {}", found.describe()))),
            None => Err(self.error("expected a name, found end of input")),
        }
    }

    fn current_line(&self) -> usize {
        self.position().0
    }

    // ---- module level -------------------------------------------------

    pub fn parse_module(&mut self, filename: &str) -> Result<Module, ParseError> {
        let mut items = Vec::new();
        loop {
            match self.peek() {
                Some(TokenKind::EndMarker) => break,
                None => return Err(self.error("unexpected end of input")),
                Some(TokenKind::Newline) => {
                    self.advance();
                }
                Some(k) if k.is_keyword("declare") => items.push(Item::Object(self.parse_object_def()?)),
                Some(k) if k.is_keyword("template") => items.push(Item::Template(self.parse_template()?)),
                Some(k) if k.is_keyword("import") || k.is_keyword("from") => {
                    return Err(self.error("import statements are not supported"));
                }
                Some(_) => return Err(self.error("expected 'declare' or 'template' at module level")),
            }
        }
        log::debug!("parsed {} top-level definitions from {}", items.len(), filename);
        Ok(Module {
            filename: filename.to_string(),
            items,
        })
    }

    fn parse_object_def(&mut self) -> Result<ObjectDef, ParseError> {
        let lineno = self.expect_keyword("declare")?.line;
        let typename = self.expect_name()?;
        self.expect(TokenKind::LParen)?;
        let mut base = self.expect_name()?;
        while self.eat(&TokenKind::Dot) {
            base.push('.');
            base.push_str(&self.expect_name()?);
        }
        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::Colon)?;
        let identifier = self.parse_identifier_suffix()?;
        let (doc, body) = self.parse_body_block(true)?;
        Ok(ObjectDef {
            typename,
            base,
            identifier,
            doc,
            body,
            lineno,
        })
    }

    /// `ident:` following a definition header.
    fn parse_identifier_suffix(&mut self) -> Result<Option<String>, ParseError> {
        if matches!(self.peek(), Some(TokenKind::Name(_))) && self.peek_second() == Some(&TokenKind::Colon) {
            let name = self.expect_name()?;
            self.expect(TokenKind::Colon)?;
            return Ok(Some(name));
        }
        Ok(None)
    }

    fn parse_docstring(&mut self) -> Result<Option<String>, ParseError> {
        if !matches!(self.peek(), Some(TokenKind::String(_))) {
            return Ok(None);
        }
        let mut doc = String::new();
        while let Some(TokenKind::String(_)) = self.peek() {
            if let Some(Token {
                kind: TokenKind::String(part),
                ..
            }) = self.advance()
            {
                doc.push_str(&part);
            }
        }
        self.expect_newline()?;
        Ok(Some(doc))
    }

    /// Opens an indented block, or accepts an inline `pass`.
    /// Returns false for the inline form.
    fn open_block(&mut self) -> Result<bool, ParseError> {
        if self.eat_keyword("pass") {
            self.expect_newline()?;
            return Ok(false);
        }
        self.expect_newline()?;
        if !self.eat(&TokenKind::Indent) {
            let (line, column) = self.position();
            return Err(self.error_at(ParseErrorKind::ExpectedIndent, "expected an indented block", line, column));
        }
        Ok(true)
    }

    fn parse_body_block(&mut self, allow_doc: bool) -> Result<(Option<String>, Vec<BodyItem>), ParseError> {
        let mut body = Vec::new();
        if !self.open_block()? {
            return Ok((None, body));
        }
        let doc = if allow_doc { self.parse_docstring()? } else { None };
        loop {
            match self.peek() {
                Some(TokenKind::Dedent) => {
                    self.advance();
                    break;
                }
                None | Some(TokenKind::EndMarker) => return Err(self.unexpected()),
                _ => {
                    if let Some(item) = self.parse_body_item()? {
                        body.push(item);
                    }
                }
            }
        }
        Ok((doc, body))
    }

    fn parse_body_item(&mut self) -> Result<Option<BodyItem>, ParseError> {
        let Some(kind) = self.peek() else {
            return Err(self.unexpected());
        };
        let item = match kind {
            k if k.is_keyword("attr") || k.is_keyword("event") => BodyItem::Storage(self.parse_storage()?),
            k if k.is_keyword("alias") => BodyItem::Alias(self.parse_alias()?),
            k if k.is_keyword("func") => BodyItem::Func(self.parse_func_def()?),
            k if k.is_keyword("pass") => {
                self.advance();
                self.expect_newline()?;
                return Ok(None);
            }
            k if k.is_keyword("const") => {
                return Err(self.error("'const' is only allowed in a template body"));
            }
            TokenKind::Newline => {
                self.advance();
                return Ok(None);
            }
            TokenKind::Name(_) => match self.peek_second() {
                Some(TokenKind::Colon) => BodyItem::Child(self.parse_child_def()?),
                Some(TokenKind::LParen) => BodyItem::TemplateInst(self.parse_template_inst()?),
                Some(TokenKind::Dot) => BodyItem::ExBinding(self.parse_ex_binding()?),
                Some(TokenKind::RightArrow) => BodyItem::Func(self.parse_override()?),
                Some(second) if binding_operator(second).is_some() => BodyItem::Binding(self.parse_binding()?),
                _ => {
                    self.advance();
                    return Err(self.unexpected());
                }
            },
            _ => return Err(self.unexpected()),
        };
        Ok(Some(item))
    }

    /// Parses the right-hand side of a binding, after its operator.
    fn parse_operator_expr(&mut self, operator: BindOp, lineno: usize) -> Result<OperatorExpr, ParseError> {
        let value = if operator == BindOp::Notify {
            BindValue::Suite(self.parse_suite()?)
        } else {
            let expr = self.parse_testlist()?;
            if operator == BindOp::Update {
                self.check_target(&expr, TargetContext::Store)?;
            }
            self.expect_newline()?;
            BindValue::Expr(expr)
        };
        Ok(OperatorExpr {
            operator,
            value,
            lineno,
        })
    }

    fn take_binding_operator(&mut self) -> Result<BindOp, ParseError> {
        match self.peek().and_then(binding_operator) {
            Some(op) => {
                self.advance();
                Ok(op)
            }
            None => Err(self.error("expected a binding operator")),
        }
    }

    fn parse_binding(&mut self) -> Result<Binding, ParseError> {
        let lineno = self.current_line();
        let name = self.expect_name()?;
        let op = self.take_binding_operator()?;
        let expr = self.parse_operator_expr(op, lineno)?;
        Ok(Binding { name, expr, lineno })
    }

    fn parse_name_chain(&mut self) -> Result<Vec<String>, ParseError> {
        let mut chain = vec![self.expect_name()?];
        while self.eat(&TokenKind::Dot) {
            chain.push(self.expect_name()?);
        }
        Ok(chain)
    }

    fn parse_ex_binding(&mut self) -> Result<ExBinding, ParseError> {
        let lineno = self.current_line();
        let chain = self.parse_name_chain()?;
        let op = self.take_binding_operator()?;
        let expr = self.parse_operator_expr(op, lineno)?;
        Ok(ExBinding { chain, expr, lineno })
    }

    fn parse_storage(&mut self) -> Result<StorageDef, ParseError> {
        let lineno = self.current_line();
        let kind = if self.eat_keyword("attr") {
            StorageKind::Attr
        } else {
            self.expect_keyword("event")?;
            StorageKind::Event
        };
        let name = self.expect_name()?;
        let typename = if self.eat(&TokenKind::Colon) {
            Some(self.parse_dotted_expr()?)
        } else {
            None
        };
        let expr = match self.peek().and_then(binding_operator) {
            Some(_) if kind == StorageKind::Event => {
                return Err(self.error("event declarations cannot have a default value"));
            }
            Some(op) => {
                self.advance();
                Some(self.parse_operator_expr(op, lineno)?)
            }
            None => {
                self.expect_newline()?;
                None
            }
        };
        Ok(StorageDef {
            kind,
            name,
            typename,
            expr,
            lineno,
        })
    }

    fn parse_alias(&mut self) -> Result<AliasExpr, ParseError> {
        let lineno = self.expect_keyword("alias")?.line;
        let name = self.expect_name()?;
        let (target, chain) = if self.eat(&TokenKind::Colon) {
            let mut chain = self.parse_name_chain()?;
            let target = chain.remove(0);
            (target, chain)
        } else {
            (name.clone(), Vec::new())
        };
        self.expect_newline()?;
        Ok(AliasExpr {
            name,
            target,
            chain,
            lineno,
        })
    }

    fn parse_func_def(&mut self) -> Result<FuncDef, ParseError> {
        let lineno = self.expect_keyword("func")?.line;
        let name = self.expect_name()?;
        self.finish_func(name, false, lineno)
    }

    fn parse_override(&mut self) -> Result<FuncDef, ParseError> {
        let lineno = self.current_line();
        let name = self.expect_name()?;
        self.expect(TokenKind::RightArrow)?;
        self.finish_func(name, true, lineno)
    }

    fn finish_func(&mut self, name: String, is_override: bool, lineno: usize) -> Result<FuncDef, ParseError> {
        self.expect(TokenKind::LParen)?;
        let params = self.parse_parameters()?;
        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::Colon)?;
        let body = self.parse_suite()?;
        Ok(FuncDef {
            name,
            params,
            body,
            is_override,
            lineno,
        })
    }

    fn parse_parameters(&mut self) -> Result<Parameters, ParseError> {
        let mut params = Parameters::default();
        let mut seen: Vec<String> = Vec::new();
        let mut saw_default = false;
        while !self.at(&TokenKind::RParen) {
            let (line, column) = self.position();
            let name;
            if self.eat(&TokenKind::DoubleStar) {
                name = self.expect_name()?;
                params.double_star = Some(name.clone());
            } else if self.eat(&TokenKind::Star) {
                if params.star.is_some() || params.double_star.is_some() {
                    return Err(self.error("invalid '*' parameter"));
                }
                if !matches!(self.peek(), Some(TokenKind::Name(_))) {
                    return Err(self.error("keyword-only parameters are not supported"));
                }
                name = self.expect_name()?;
                params.star = Some(name.clone());
            } else {
                if params.star.is_some() || params.double_star.is_some() {
                    return Err(self.error("keyword-only parameters are not supported"));
                }
                name = self.expect_name()?;
                let default = if self.eat(&TokenKind::Equal) {
                    saw_default = true;
                    Some(self.parse_test()?)
                } else {
                    if saw_default {
                        return Err(self.error_at(
                            ParseErrorKind::Syntax,
                            "non-default argument follows default argument",
                            line,
                            column,
                        ));
                    }
                    None
                };
                params.params.push(Param {
                    name: name.clone(),
                    default,
                });
            }
            if seen.contains(&name) {
                return Err(self.error_at(
                    ParseErrorKind::Syntax,
                    format!("duplicate argument '{}' in function definition", name),
                    line,
                    column,
                ));
            }
            seen.push(name);
            if params.double_star.is_some() && !self.at(&TokenKind::RParen) && !self.at(&TokenKind::Comma) {
                return Err(self.unexpected());
            }
            if !self.eat(&TokenKind::Comma) {
                break;
            }
            if params.double_star.is_some() && !self.at(&TokenKind::RParen) {
                return Err(self.error("'**' parameter must be last"));
            }
        }
        Ok(params)
    }

    fn parse_child_def(&mut self) -> Result<ChildDef, ParseError> {
        let lineno = self.current_line();
        let typename = self.expect_name()?;
        self.expect(TokenKind::Colon)?;
        let identifier = self.parse_identifier_suffix()?;
        let (_, body) = self.parse_body_block(false)?;
        Ok(ChildDef {
            typename,
            identifier,
            body,
            lineno,
        })
    }

    // ---- templates ----------------------------------------------------

    fn parse_template(&mut self) -> Result<Template, ParseError> {
        let lineno = self.expect_keyword("template")?.line;
        let name = self.expect_name()?;
        self.expect(TokenKind::LParen)?;
        let params = self.parse_template_params()?;
        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::Colon)?;

        let mut body = Vec::new();
        let mut doc = None;
        if self.open_block()? {
            doc = self.parse_docstring()?;
            loop {
                let Some(kind) = self.peek() else {
                    return Err(self.unexpected());
                };
                let item = match kind {
                    TokenKind::Dedent => {
                        self.advance();
                        break;
                    }
                    k if k.is_keyword("const") => TemplateItem::Const(self.parse_const()?),
                    k if k.is_keyword("pass") => {
                        self.advance();
                        self.expect_newline()?;
                        continue;
                    }
                    TokenKind::Name(_) => match self.peek_second() {
                        Some(TokenKind::Colon) => TemplateItem::Child(self.parse_child_def()?),
                        Some(TokenKind::LParen) => TemplateItem::Inst(self.parse_template_inst()?),
                        _ => {
                            return Err(self.error(
                                "a template body may only contain 'const' declarations, child definitions and template instances",
                            ));
                        }
                    },
                    _ => return Err(self.unexpected()),
                };
                body.push(item);
            }
        }
        Ok(Template {
            name,
            params,
            doc,
            body,
            lineno,
        })
    }

    fn parse_template_params(&mut self) -> Result<TemplateParams, ParseError> {
        let mut params = TemplateParams::default();
        let mut seen: Vec<String> = Vec::new();
        while !self.at(&TokenKind::RParen) {
            let (line, column) = self.position();
            if params.star.is_some() {
                return Err(self.error("'*' parameter must be last"));
            }
            let name;
            if self.eat(&TokenKind::Star) {
                name = self.expect_name()?;
                params.star = Some(name.clone());
            } else {
                name = self.expect_name()?;
                if self.eat(&TokenKind::Equal) {
                    let default = self.parse_test()?;
                    params.keyword.push((name.clone(), default));
                } else if !params.keyword.is_empty() {
                    return Err(self.error_at(
                        ParseErrorKind::Syntax,
                        "non-default argument follows default argument",
                        line,
                        column,
                    ));
                } else {
                    params.positional.push(name.clone());
                }
            }
            if seen.contains(&name) {
                return Err(self.error_at(
                    ParseErrorKind::Syntax,
                    format!("duplicate argument '{}' in template definition", name),
                    line,
                    column,
                ));
            }
            seen.push(name);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok(params)
    }

    fn parse_const(&mut self) -> Result<ConstExpr, ParseError> {
        let lineno = self.expect_keyword("const")?.line;
        let name = self.expect_name()?;
        let typename = if self.eat(&TokenKind::Colon) {
            Some(self.parse_dotted_expr()?)
        } else {
            None
        };
        self.expect(TokenKind::Equal)?;
        let value = self.parse_test()?;
        self.expect_newline()?;
        Ok(ConstExpr {
            name,
            typename,
            value,
            lineno,
        })
    }

    fn parse_template_inst(&mut self) -> Result<TemplateInst, ParseError> {
        let lineno = self.current_line();
        let name = self.expect_name()?;
        self.expect(TokenKind::LParen)?;
        let mut args = Vec::new();
        let mut star_arg = None;
        while !self.at(&TokenKind::RParen) {
            if star_arg.is_some() {
                return Err(self.error("'*' argument must be last"));
            }
            if self.eat(&TokenKind::Star) {
                star_arg = Some(self.parse_test()?);
            } else {
                if matches!(self.peek(), Some(TokenKind::Name(_))) && self.peek_second() == Some(&TokenKind::Equal) {
                    return Err(self.error("keyword arguments are not supported in template instantiation"));
                }
                args.push(self.parse_test()?);
            }
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::Colon)?;

        let identifiers = if matches!(self.peek(), Some(TokenKind::Name(_) | TokenKind::Star)) {
            let ids = self.parse_template_ids()?;
            self.expect(TokenKind::Colon)?;
            Some(ids)
        } else {
            None
        };

        let mut body = Vec::new();
        if self.open_block()? {
            loop {
                match self.peek() {
                    Some(TokenKind::Dedent) => {
                        self.advance();
                        break;
                    }
                    Some(k) if k.is_keyword("pass") => {
                        self.advance();
                        self.expect_newline()?;
                    }
                    Some(TokenKind::Name(_)) => body.push(self.parse_template_inst_binding(identifiers.as_ref())?),
                    _ => return Err(self.unexpected()),
                }
            }
        }
        Ok(TemplateInst {
            name,
            args,
            star_arg,
            identifiers,
            body,
            lineno,
        })
    }

    fn parse_template_ids(&mut self) -> Result<TemplateIds, ParseError> {
        let mut ids = TemplateIds {
            names: Vec::new(),
            starname: None,
        };
        let mut seen: Vec<String> = Vec::new();
        loop {
            let (line, column) = self.position();
            if ids.starname.is_some() {
                return Err(self.error("'*' identifier must be last"));
            }
            let name = if self.eat(&TokenKind::Star) {
                let name = self.expect_name()?;
                ids.starname = Some(name.clone());
                name
            } else {
                let name = self.expect_name()?;
                ids.names.push(name.clone());
                name
            };
            if seen.contains(&name) {
                return Err(self.error_at(
                    ParseErrorKind::Syntax,
                    format!("duplicate identifier '{}'", name),
                    line,
                    column,
                ));
            }
            seen.push(name);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok(ids)
    }

    fn parse_template_inst_binding(&mut self, ids: Option<&TemplateIds>) -> Result<TemplateInstBinding, ParseError> {
        let (lineno, column) = self.position();
        let mut chain = self.parse_name_chain()?;
        let name = chain.remove(0);
        if chain.is_empty() {
            return Err(self.error_at(
                ParseErrorKind::Syntax,
                "template instance bindings must name an attribute of an identifier",
                lineno,
                column,
            ));
        }
        let known = ids.is_some_and(|ids| ids.names.contains(&name) || ids.starname.as_ref() == Some(&name));
        if !known {
            return Err(self.error_at(
                ParseErrorKind::Syntax,
                format!("'{}' is not an identifier of this template instance", name),
                lineno,
                column,
            ));
        }
        let op = self.take_binding_operator()?;
        let expr = self.parse_operator_expr(op, lineno)?;
        Ok(TemplateInstBinding {
            name,
            chain,
            expr,
            lineno,
        })
    }

    /// `name(.name)*` as an expression, used for type annotations.
    fn parse_dotted_expr(&mut self) -> Result<Expr, ParseError> {
        let (line, column) = self.position();
        let mut expr = Expr::new(ExprKind::Name(self.expect_name()?), line, column);
        while self.eat(&TokenKind::Dot) {
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
        Ok(expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Module {
        parse_source(source, "test.kn", &Grammar::default()).unwrap()
    }

    fn parse_err(source: &str) -> ParseError {
        parse_source(source, "test.kn", &Grammar::default()).unwrap_err()
    }

    fn object(module: &Module) -> &ObjectDef {
        match &module.items[0] {
            Item::Object(def) => def,
            other => panic!("expected an object definition, got {:?}", other),
        }
    }

    #[test]
    fn test_object_def_with_child_and_bindings() {
        let src = "\
declare Main(Window): main:
    \"\"\"Main window.\"\"\"
    attr count: int = 0
    event clicked
    title = 'hi'
    Label: label:
        text << str(count)
";
        let module = parse_ok(src);
        let def = object(&module);
        assert_eq!(def.typename, "Main");
        assert_eq!(def.base, "Window");
        assert_eq!(def.identifier.as_deref(), Some("main"));
        assert_eq!(def.doc.as_deref(), Some("Main window."));
        assert_eq!(def.body.len(), 4);
        match &def.body[3] {
            BodyItem::Child(child) => {
                assert_eq!(child.typename, "Label");
                assert_eq!(child.identifier.as_deref(), Some("label"));
                assert_eq!(child.lineno, 6);
                match &child.body[0] {
                    BodyItem::Binding(b) => {
                        assert_eq!(b.name, "text");
                        assert_eq!(b.expr.operator, BindOp::Subscribe);
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_binding_forms() {
        let src = "\
declare A(B):
    label.font << size + 1
    value >> model.value
    other := model.other
    clicked :: print(count)
    changed ::
        x = 1
        print(x)
    alias title: label.text
    func reset(value=0, *rest):
        count = value
    activate => (evt):
        return evt
";
        let module = parse_ok(src);
        let body = &object(&module).body;
        assert!(matches!(&body[0], BodyItem::ExBinding(b) if b.chain == ["label", "font"]));
        assert!(matches!(&body[1], BodyItem::Binding(b) if b.expr.operator == BindOp::Update));
        assert!(matches!(&body[2], BodyItem::Binding(b) if b.expr.operator == BindOp::Delegate));
        match &body[4] {
            BodyItem::Binding(b) => match &b.expr.value {
                BindValue::Suite(stmts) => assert_eq!(stmts.len(), 2),
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(&body[5], BodyItem::Alias(a) if a.target == "label" && a.chain == ["text"]));
        assert!(matches!(&body[6], BodyItem::Func(f) if !f.is_override && f.params.star.as_deref() == Some("rest")));
        assert!(matches!(&body[7], BodyItem::Func(f) if f.is_override && f.name == "activate"));
    }

    #[test]
    fn test_template_and_instance() {
        let src = "\
template Row(n, spacing=5, *rest):
    const total = n + len(rest)
    Label:
        text = str(total)

declare Main(Window):
    Row(3, *extra): a, b, *others:
        a.text = 'first'
";
        let module = parse_ok(src);
        match &module.items[0] {
            Item::Template(t) => {
                assert_eq!(t.params.positional, vec!["n"]);
                assert_eq!(t.params.keyword.len(), 1);
                assert_eq!(t.params.star.as_deref(), Some("rest"));
                assert!(matches!(&t.body[0], TemplateItem::Const(c) if c.name == "total"));
                assert!(matches!(&t.body[1], TemplateItem::Child(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
        let inst = match &module.items[1] {
            Item::Object(def) => match &def.body[0] {
                BodyItem::TemplateInst(inst) => inst,
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(inst.name, "Row");
        assert_eq!(inst.args.len(), 1);
        assert!(inst.star_arg.is_some());
        let ids = inst.identifiers.as_ref().unwrap();
        assert_eq!(ids.names, vec!["a", "b"]);
        assert_eq!(ids.starname.as_deref(), Some("others"));
        assert_eq!(inst.body[0].name, "a");
        assert_eq!(inst.body[0].chain, vec!["text"]);
    }

    #[test]
    fn test_template_param_errors() {
        let err = parse_err("template T(a=1, b):\n    pass\n");
        assert_eq!(err.message, "non-default argument follows default argument");
        let err = parse_err("template T(a, a):\n    pass\n");
        assert!(err.message.contains("duplicate argument 'a'"));
    }

    #[test]
    fn test_event_default_rejected() {
        let err = parse_err("declare A(B):\n    event e = 1\n");
        assert!(err.message.contains("event"));
    }

    #[test]
    fn test_update_requires_target() {
        let err = parse_err("declare A(B):\n    v >> a + 1\n");
        assert_eq!(err.kind, ParseErrorKind::InvalidTarget);
        assert_eq!(err.message, "can't assign to operator");
    }

    #[test]
    fn test_lexer_error_is_reraised() {
        let err = parse_err("declare A(B):\n    t = 'oops\n");
        assert_eq!(err.kind, ParseErrorKind::UnterminatedString);
        assert_eq!(err.filename, "test.kn");
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_missing_block() {
        let err = parse_err("declare A(B):\nx = 1\n");
        assert_eq!(err.kind, ParseErrorKind::ExpectedIndent);
    }

    #[test]
    fn test_instance_binding_must_use_identifier() {
        let err = parse_err("declare A(B):\n    Row(): a:\n        c.text = 1\n");
        assert!(err.message.contains("'c'"));
    }
}
