//! Parser front end for `.zmodel` documents.
//!
//! Built from `nom` combinators. Most productions are sequenced by hand
//! (`let (i, x) = ...?`) rather than composed, which keeps span bookkeeping
//! simple: the offset of a position is the source length minus the length of
//! the remaining input.
//!
//! Errors become `nom::Err::Failure` as soon as a production has committed
//! (after its keyword or opening delimiter), so the reported location is the
//! innermost point where the input stopped making sense.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_until, take_while},
    character::complete::{char as pchar, digit1, multispace1, not_line_ending, satisfy},
    combinator::{not, opt, recognize, value},
    error::{VerboseError, VerboseErrorKind},
    multi::many0_count,
    sequence::{pair, terminated, tuple},
    IResult,
};
use thiserror::Error;

use crate::ast::{
    line_col, Argument, AttributeApp, AttributeDecl, BinaryOp, ConfigBlock, ConfigField,
    DataModel, Declaration, Document, EnumDecl, EnumMember, Expr, ExprKind, Field, FunctionDecl,
    FunctionParam, Ident, Literal, ParamSpec, Quantifier, Span, TypeName, TypeSpec, UnaryOp,
};

type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("parse error on line {line}, column {column}: {message}")]
    Syntax {
        line: usize,
        column: usize,
        offset: usize,
        message: String,
    },
}

impl ParseError {
    pub fn offset(&self) -> usize {
        match self {
            ParseError::Syntax { offset, .. } => *offset,
        }
    }
}

/// Parse a complete `.zmodel` document.
pub fn parse_document(text: &str) -> Result<Document, ParseError> {
    let parser = Parser { src: text };
    parser
        .document(text)
        .map(|(_, document)| document)
        .map_err(|e| to_parse_error(text, e))
}

/// Parse a standalone expression (e.g. a policy condition).
pub fn parse_expression(text: &str) -> Result<Expr, ParseError> {
    let parser = Parser { src: text };
    parser
        .expr(text)
        .and_then(|(rest, expr)| {
            let (rest, _) = ws(rest)?;
            if rest.is_empty() {
                Ok(expr)
            } else {
                Err(fail(rest, "unexpected trailing input after expression"))
            }
        })
        .map_err(|e| to_parse_error(text, e))
}

// ============================================================================
// Errors
// ============================================================================

fn fail<'a>(input: &'a str, message: &'static str) -> nom::Err<VerboseError<&'a str>> {
    nom::Err::Failure(VerboseError {
        errors: vec![(input, VerboseErrorKind::Context(message))],
    })
}

fn backtrack<'a>(input: &'a str, message: &'static str) -> nom::Err<VerboseError<&'a str>> {
    nom::Err::Error(VerboseError {
        errors: vec![(input, VerboseErrorKind::Context(message))],
    })
}

/// Promote a recoverable error to a committed failure.
fn commit<E>(err: nom::Err<E>) -> nom::Err<E> {
    match err {
        nom::Err::Error(e) => nom::Err::Failure(e),
        other => other,
    }
}

fn to_parse_error(src: &str, err: nom::Err<VerboseError<&str>>) -> ParseError {
    let (offset, message) = match err {
        nom::Err::Incomplete(_) => (src.len(), "unexpected end of input".to_string()),
        nom::Err::Error(e) | nom::Err::Failure(e) => {
            let context = e.errors.iter().find_map(|(input, kind)| match kind {
                VerboseErrorKind::Context(message) => Some((*input, message.to_string())),
                _ => None,
            });
            match context {
                Some((input, message)) => (src.len() - input.len(), message),
                None => match e.errors.first() {
                    Some((input, VerboseErrorKind::Char(c))) => {
                        (src.len() - input.len(), format!("expected `{c}`"))
                    }
                    Some((input, _)) => (src.len() - input.len(), "unexpected input".to_string()),
                    None => (0, "unexpected input".to_string()),
                },
            }
        }
    };
    let (line, column) = line_col(src, offset);
    ParseError::Syntax {
        line,
        column,
        offset,
        message,
    }
}

// ============================================================================
// Lexical helpers
// ============================================================================

fn line_comment(i: &str) -> PResult<'_, &str> {
    recognize(pair(tag("//"), not_line_ending))(i)
}

fn block_comment(i: &str) -> PResult<'_, &str> {
    recognize(tuple((tag("/*"), take_until("*/"), tag("*/"))))(i)
}

/// Skip whitespace and comments.
fn ws(i: &str) -> PResult<'_, ()> {
    value((), many0_count(alt((multispace1, line_comment, block_comment))))(i)
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn identifier(i: &str) -> PResult<'_, &str> {
    recognize(pair(satisfy(is_ident_start), take_while(is_ident_continue)))(i)
}

fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    terminated(tag(kw), not(satisfy(is_ident_continue)))
}

fn number(i: &str) -> PResult<'_, &str> {
    recognize(pair(digit1, opt(pair(pchar('.'), digit1))))(i)
}

/// Single- or double-quoted string with backslash escapes.
fn string_literal(i: &str) -> PResult<'_, String> {
    let quote = match i.chars().next() {
        Some(c @ ('"' | '\'')) => c,
        _ => return Err(backtrack(i, "expected a string literal")),
    };
    let body = &i[1..];
    let mut out = String::new();
    let mut chars = body.char_indices();
    while let Some((idx, c)) = chars.next() {
        if c == quote {
            return Ok((&body[idx + 1..], out));
        }
        if c == '\\' {
            match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, 'r')) => out.push('\r'),
                Some((_, escaped)) => out.push(escaped),
                None => break,
            }
            continue;
        }
        if c == '\n' {
            break;
        }
        out.push(c);
    }
    Err(fail(i, "unterminated string literal"))
}

/// Binary operators grouped by precedence, loosest first.
const BINARY_LEVELS: [&[(&str, BinaryOp)]; 6] = [
    &[("||", BinaryOp::Or)],
    &[("&&", BinaryOp::And)],
    &[("==", BinaryOp::Eq), ("!=", BinaryOp::Ne)],
    &[
        ("<=", BinaryOp::Le),
        (">=", BinaryOp::Ge),
        ("<", BinaryOp::Lt),
        (">", BinaryOp::Gt),
    ],
    &[("+", BinaryOp::Add), ("-", BinaryOp::Sub)],
    &[("*", BinaryOp::Mul), ("/", BinaryOp::Div)],
];

fn separator_message(close: char) -> &'static str {
    match close {
        ')' => "expected `,` or `)`",
        ']' => "expected `,` or `]`",
        _ => "expected `,` or a closing delimiter",
    }
}

// ============================================================================
// Grammar
// ============================================================================

struct Parser<'a> {
    src: &'a str,
}

impl<'a> Parser<'a> {
    fn offset(&self, rest: &'a str) -> usize {
        self.src.len() - rest.len()
    }

    fn span(&self, start: usize, rest: &'a str) -> Span {
        Span::new(start, self.offset(rest))
    }

    fn ident(&self, i: &'a str) -> PResult<'a, Ident> {
        let (i, _) = ws(i)?;
        let start = self.offset(i);
        let (rest, name) = identifier(i)?;
        Ok((rest, Ident::new(name, self.span(start, rest))))
    }

    fn expect(&self, i: &'a str, c: char, message: &'static str) -> PResult<'a, ()> {
        let (i, _) = ws(i)?;
        match i.strip_prefix(c) {
            Some(rest) => Ok((rest, ())),
            None => Err(fail(i, message)),
        }
    }

    /// `open item (, item)* [,] close`
    fn list<T>(
        &self,
        i: &'a str,
        open: char,
        close: char,
        mut item: impl FnMut(&'a str) -> PResult<'a, T>,
    ) -> PResult<'a, Vec<T>> {
        let (i, _) = ws(i)?;
        let Some(mut i) = i.strip_prefix(open) else {
            return Err(backtrack(i, "expected an opening delimiter"));
        };
        let mut items = Vec::new();
        loop {
            let (rest, _) = ws(i)?;
            if let Some(rest) = rest.strip_prefix(close) {
                return Ok((rest, items));
            }
            let (rest, it) = item(rest).map_err(commit)?;
            items.push(it);
            let (rest, _) = ws(rest)?;
            if let Some(rest) = rest.strip_prefix(',') {
                i = rest;
                continue;
            }
            if let Some(rest) = rest.strip_prefix(close) {
                return Ok((rest, items));
            }
            return Err(fail(rest, separator_message(close)));
        }
    }

    // ------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------

    fn document(&self, mut i: &'a str) -> PResult<'a, Document> {
        let mut declarations = Vec::new();
        loop {
            let (rest, _) = ws(i)?;
            if rest.is_empty() {
                return Ok((rest, Document { declarations }));
            }
            let (rest, declaration) = self.declaration(rest)?;
            declarations.push(declaration);
            i = rest;
        }
    }

    fn declaration(&self, i: &'a str) -> PResult<'a, Declaration> {
        let start = self.offset(i);
        if let Ok((rest, _)) = keyword("datasource")(i) {
            let (rest, block) = self.config_block(rest, start)?;
            return Ok((rest, Declaration::DataSource(block)));
        }
        if let Ok((rest, _)) = keyword("plugin")(i) {
            let (rest, block) = self.config_block(rest, start)?;
            return Ok((rest, Declaration::Plugin(block)));
        }
        if let Ok((rest, _)) = keyword("enum")(i) {
            let (rest, decl) = self.enum_decl(rest, start)?;
            return Ok((rest, Declaration::Enum(decl)));
        }
        if let Ok((rest, _)) = keyword("abstract")(i) {
            let (rest, _) = ws(rest)?;
            let (rest, _) =
                keyword("model")(rest).map_err(|_| fail(rest, "expected `model` after `abstract`"))?;
            let (rest, model) = self.model(rest, start, true)?;
            return Ok((rest, Declaration::Model(model)));
        }
        if let Ok((rest, _)) = keyword("model")(i) {
            let (rest, model) = self.model(rest, start, false)?;
            return Ok((rest, Declaration::Model(model)));
        }
        if let Ok((rest, _)) = keyword("function")(i) {
            let (rest, function) = self.function(rest, start)?;
            return Ok((rest, Declaration::Function(function)));
        }
        if let Ok((rest, _)) = keyword("attribute")(i) {
            let (rest, attribute) = self.attribute_decl(rest, start)?;
            return Ok((rest, Declaration::Attribute(attribute)));
        }
        Err(fail(
            i,
            "expected a declaration: datasource, plugin, enum, model, function or attribute",
        ))
    }

    fn config_block(&self, i: &'a str, start: usize) -> PResult<'a, ConfigBlock> {
        let (i, name) = self
            .ident(i)
            .map_err(|_| fail(i, "expected a block name"))?;
        let (mut i, _) = self.expect(i, '{', "expected `{`")?;
        let mut fields = Vec::new();
        loop {
            let (rest, _) = ws(i)?;
            if let Some(rest) = rest.strip_prefix('}') {
                return Ok((
                    rest,
                    ConfigBlock {
                        name,
                        fields,
                        span: self.span(start, rest),
                    },
                ));
            }
            let field_start = self.offset(rest);
            let (rest, key) = self
                .ident(rest)
                .map_err(|_| fail(rest, "expected a `name = value` entry or `}`"))?;
            let (rest, _) = self.expect(rest, '=', "expected `=`")?;
            let (rest, value) = self.expr(rest).map_err(commit)?;
            fields.push(ConfigField {
                name: key,
                value,
                span: self.span(field_start, rest),
            });
            i = rest;
        }
    }

    fn enum_decl(&self, i: &'a str, start: usize) -> PResult<'a, EnumDecl> {
        let (i, name) = self
            .ident(i)
            .map_err(|_| fail(i, "expected an enum name"))?;
        let (mut i, _) = self.expect(i, '{', "expected `{` to open the enum body")?;
        let mut members = Vec::new();
        let mut attributes = Vec::new();
        loop {
            let (rest, _) = ws(i)?;
            if let Some(rest) = rest.strip_prefix('}') {
                return Ok((
                    rest,
                    EnumDecl {
                        name,
                        members,
                        attributes,
                        span: self.span(start, rest),
                    },
                ));
            }
            if rest.starts_with("@@") {
                let (rest, attribute) = self.attribute_app(rest, "@@")?;
                attributes.push(attribute);
                i = rest;
                continue;
            }
            let member_start = self.offset(rest);
            let (rest, member) = self
                .ident(rest)
                .map_err(|_| fail(rest, "expected an enum member or `}`"))?;
            let (rest, member_attributes) = self.field_attributes(rest)?;
            members.push(EnumMember {
                name: member,
                attributes: member_attributes,
                span: self.span(member_start, rest),
            });
            i = rest;
        }
    }

    fn model(&self, i: &'a str, start: usize, is_abstract: bool) -> PResult<'a, DataModel> {
        let (i, name) = self
            .ident(i)
            .map_err(|_| fail(i, "expected a model name"))?;

        let (after, _) = ws(i)?;
        let (i, extends) = match keyword("extends")(after) {
            Ok((rest, _)) => {
                let (mut rest, first) = self
                    .ident(rest)
                    .map_err(|_| fail(rest, "expected a base model name"))?;
                let mut bases = vec![first];
                loop {
                    let (r, _) = ws(rest)?;
                    let Some(r) = r.strip_prefix(',') else { break };
                    let (r, base) = self
                        .ident(r)
                        .map_err(|_| fail(r, "expected a base model name"))?;
                    bases.push(base);
                    rest = r;
                }
                (rest, bases)
            }
            Err(_) => (i, Vec::new()),
        };

        let (mut i, _) = self.expect(i, '{', "expected `{` to open the model body")?;
        let mut fields = Vec::new();
        let mut attributes = Vec::new();
        loop {
            let (rest, _) = ws(i)?;
            if let Some(rest) = rest.strip_prefix('}') {
                return Ok((
                    rest,
                    DataModel {
                        name,
                        is_abstract,
                        extends,
                        fields,
                        attributes,
                        span: self.span(start, rest),
                    },
                ));
            }
            if rest.starts_with("@@") {
                let (rest, attribute) = self.attribute_app(rest, "@@")?;
                attributes.push(attribute);
                i = rest;
                continue;
            }
            let (rest, field) = self.field(rest)?;
            fields.push(field);
            i = rest;
        }
    }

    fn field(&self, i: &'a str) -> PResult<'a, Field> {
        let start = self.offset(i);
        let (i, name) = self.ident(i).map_err(|_| {
            fail(
                i,
                "expected a field declaration, a model attribute or `}`",
            )
        })?;
        let (i, ty) = self.type_spec(i)?;
        let (i, attributes) = self.field_attributes(i)?;
        Ok((
            i,
            Field {
                name,
                ty,
                attributes,
                span: self.span(start, i),
            },
        ))
    }

    fn type_spec(&self, i: &'a str) -> PResult<'a, TypeSpec> {
        let (i, _) = ws(i)?;
        let start = self.offset(i);
        let (rest, name) = identifier(i).map_err(|_| fail(i, "expected a type"))?;
        let (rest, type_name) = if name == "Unsupported" {
            let (rest, _) = self.expect(rest, '(', "expected `(` after `Unsupported`")?;
            let (rest, _) = ws(rest)?;
            let (rest, text) = string_literal(rest)
                .map_err(|_| fail(rest, "expected a string literal"))?;
            let (rest, _) = self.expect(rest, ')', "expected `)`")?;
            (rest, TypeName::Unsupported(text))
        } else {
            (
                rest,
                TypeName::from_identifier(Ident::new(name, self.span(start, rest))),
            )
        };
        let (rest, is_array) = match rest.strip_prefix("[]") {
            Some(r) => (r, true),
            None => (rest, false),
        };
        let (rest, is_optional) = match rest.strip_prefix('?') {
            Some(r) => (r, true),
            None => (rest, false),
        };
        Ok((
            rest,
            TypeSpec {
                name: type_name,
                is_array,
                is_optional,
                span: self.span(start, rest),
            },
        ))
    }

    fn field_attributes(&self, mut i: &'a str) -> PResult<'a, Vec<AttributeApp>> {
        let mut attributes = Vec::new();
        loop {
            let (rest, _) = ws(i)?;
            if rest.starts_with('@') && !rest.starts_with("@@") {
                let (rest, attribute) = self.attribute_app(rest, "@")?;
                attributes.push(attribute);
                i = rest;
            } else {
                return Ok((i, attributes));
            }
        }
    }

    /// `prefix NAME [( ARGS )]`; `i` must start with `prefix`.
    fn attribute_app(&self, i: &'a str, prefix: &'static str) -> PResult<'a, AttributeApp> {
        let start = self.offset(i);
        let Some(rest) = i.strip_prefix(prefix) else {
            return Err(backtrack(i, "expected an attribute"));
        };
        let (rest, name) =
            identifier(rest).map_err(|_| fail(rest, "expected an attribute name"))?;
        let name = Ident::new(format!("{prefix}{name}"), self.span(start, rest));
        let (after, _) = ws(rest)?;
        let (rest, args) = if after.starts_with('(') {
            self.arguments(after)?
        } else {
            (rest, Vec::new())
        };
        Ok((
            rest,
            AttributeApp {
                name,
                args,
                span: self.span(start, rest),
            },
        ))
    }

    fn function(&self, i: &'a str, start: usize) -> PResult<'a, FunctionDecl> {
        let (i, name) = self
            .ident(i)
            .map_err(|_| fail(i, "expected a function name"))?;
        let (i, _) = ws(i)?;
        if !i.starts_with('(') {
            return Err(fail(i, "expected `(` to open the parameter list"));
        }
        let (i, params) = self.list(i, '(', ')', |i| self.function_param(i))?;
        let (i, _) = self.expect(i, ':', "expected `:` before the return type")?;
        let (i, return_type) = self.type_spec(i)?;
        let (i, _) = self.expect(i, '{', "expected `{` to open the function body")?;
        let (i, _) = ws(i)?;
        let (i, body) = if i.starts_with('}') {
            (i, None)
        } else {
            let (i, body) = self.expr(i).map_err(commit)?;
            (i, Some(body))
        };
        let (i, _) = self.expect(i, '}', "expected `}` to close the function body")?;
        Ok((
            i,
            FunctionDecl {
                name,
                params,
                return_type,
                body,
                span: self.span(start, i),
            },
        ))
    }

    fn function_param(&self, i: &'a str) -> PResult<'a, FunctionParam> {
        let (i, name) = self
            .ident(i)
            .map_err(|_| fail(i, "expected a parameter name"))?;
        let (i, _) = self.expect(i, ':', "expected `:` after the parameter name")?;
        let (i, ty) = self.type_spec(i)?;
        Ok((i, FunctionParam { name, ty }))
    }

    fn attribute_decl(&self, i: &'a str, start: usize) -> PResult<'a, AttributeDecl> {
        let (i, _) = ws(i)?;
        let name_start = self.offset(i);
        let prefix = ["@@@", "@@", "@"]
            .into_iter()
            .find(|p| i.starts_with(p))
            .ok_or_else(|| fail(i, "expected an attribute name starting with `@`"))?;
        let rest = &i[prefix.len()..];
        let (rest, name) =
            identifier(rest).map_err(|_| fail(rest, "expected an attribute name"))?;
        let name = Ident::new(format!("{prefix}{name}"), self.span(name_start, rest));

        let (rest, _) = ws(rest)?;
        if !rest.starts_with('(') {
            return Err(fail(rest, "expected `(` to open the parameter list"));
        }
        let (mut i, params) = self.list(rest, '(', ')', |i| self.param_spec(i))?;

        let mut meta = Vec::new();
        loop {
            let (rest, _) = ws(i)?;
            if !rest.starts_with("@@@") {
                break;
            }
            let (rest, attribute) = self.attribute_app(rest, "@@@")?;
            meta.push(attribute);
            i = rest;
        }
        Ok((
            i,
            AttributeDecl {
                name,
                params,
                meta,
                span: self.span(start, i),
            },
        ))
    }

    fn param_spec(&self, i: &'a str) -> PResult<'a, ParamSpec> {
        let (i, _) = ws(i)?;
        let (i, positional) = match i.strip_prefix('_') {
            Some(rest) if rest.starts_with(char::is_whitespace) => (rest, true),
            _ => (i, false),
        };
        let (i, name) = self
            .ident(i)
            .map_err(|_| fail(i, "expected a parameter name"))?;
        let (i, _) = self.expect(i, ':', "expected `:` after the parameter name")?;
        let (i, ty) = self.type_spec(i)?;
        Ok((
            i,
            ParamSpec {
                name,
                ty,
                positional,
            },
        ))
    }

    fn arguments(&self, i: &'a str) -> PResult<'a, Vec<Argument>> {
        self.list(i, '(', ')', |i| self.argument(i))
    }

    fn argument(&self, i: &'a str) -> PResult<'a, Argument> {
        if let Ok((rest, name)) = self.ident(i) {
            let (after, _) = ws(rest)?;
            if let Some(after) = after.strip_prefix(':') {
                let (rest, value) = self.expr(after).map_err(commit)?;
                return Ok((rest, Argument::Named { name, value }));
            }
        }
        let (rest, value) = self.expr(i)?;
        Ok((rest, Argument::Positional { value }))
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn expr(&self, i: &'a str) -> PResult<'a, Expr> {
        self.binary(i, 0)
    }

    fn binary(&self, i: &'a str, level: usize) -> PResult<'a, Expr> {
        if level == BINARY_LEVELS.len() {
            return self.unary(i);
        }
        let (mut i, mut left) = self.binary(i, level + 1)?;
        loop {
            let (rest, _) = ws(i)?;
            let Some(&(symbol, op)) = BINARY_LEVELS[level]
                .iter()
                .find(|(symbol, _)| rest.starts_with(symbol))
            else {
                break;
            };
            let (rest, right) = self
                .binary(&rest[symbol.len()..], level + 1)
                .map_err(commit)?;
            let span = left.span.to(right.span);
            left = Expr::new(
                ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
            i = rest;
        }
        Ok((i, left))
    }

    fn unary(&self, i: &'a str) -> PResult<'a, Expr> {
        let (i, _) = ws(i)?;
        let start = self.offset(i);
        let op = match i.chars().next() {
            Some('!') => Some(UnaryOp::Not),
            Some('-') => Some(UnaryOp::Negate),
            _ => None,
        };
        match op {
            Some(op) => {
                let (rest, operand) = self.unary(&i[1..]).map_err(commit)?;
                Ok((
                    rest,
                    Expr::new(
                        ExprKind::Unary {
                            op,
                            operand: Box::new(operand),
                        },
                        self.span(start, rest),
                    ),
                ))
            }
            None => self.postfix(i),
        }
    }

    fn postfix(&self, i: &'a str) -> PResult<'a, Expr> {
        let start = self.offset(i);
        let (mut i, mut expr) = self.primary(i)?;
        loop {
            let (rest, _) = ws(i)?;
            if let Some(after_dot) = rest.strip_prefix('.') {
                let (after, member) = self
                    .ident(after_dot)
                    .map_err(|_| fail(after_dot, "expected a member name after `.`"))?;
                expr = Expr::new(
                    ExprKind::MemberAccess {
                        object: Box::new(expr),
                        member,
                    },
                    self.span(start, after),
                );
                i = after;
                continue;
            }
            if let Some(quantifier) = rest.chars().next().and_then(Quantifier::from_symbol) {
                let (after, _) = ws(&rest[1..])?;
                if let Some(inner) = after.strip_prefix('[') {
                    let (inner, condition) = self.expr(inner).map_err(commit)?;
                    let (inner, _) =
                        self.expect(inner, ']', "expected `]` to close the collection predicate")?;
                    expr = Expr::new(
                        ExprKind::CollectionPredicate {
                            collection: Box::new(expr),
                            quantifier,
                            condition: Box::new(condition),
                        },
                        self.span(start, inner),
                    );
                    i = inner;
                    continue;
                }
            }
            break;
        }
        Ok((i, expr))
    }

    fn primary(&self, i: &'a str) -> PResult<'a, Expr> {
        let (i, _) = ws(i)?;
        let start = self.offset(i);

        if let Some(inner) = i.strip_prefix('(') {
            let (rest, expr) = self.expr(inner).map_err(commit)?;
            let (rest, _) = self.expect(rest, ')', "expected `)`")?;
            return Ok((
                rest,
                Expr {
                    span: self.span(start, rest),
                    ..expr
                },
            ));
        }

        if i.starts_with('[') {
            let (rest, items) = self.list(i, '[', ']', |i| self.expr(i))?;
            return Ok((
                rest,
                Expr::new(ExprKind::Array(items), self.span(start, rest)),
            ));
        }

        if i.starts_with('"') || i.starts_with('\'') {
            let (rest, text) = string_literal(i)?;
            return Ok((
                rest,
                Expr::new(
                    ExprKind::Literal(Literal::String(text)),
                    self.span(start, rest),
                ),
            ));
        }

        if i.starts_with(|c: char| c.is_ascii_digit()) {
            let (rest, text) = number(i)?;
            return Ok((
                rest,
                Expr::new(
                    ExprKind::Literal(Literal::Number(text.to_string())),
                    self.span(start, rest),
                ),
            ));
        }

        if let Ok((rest, name)) = identifier(i) {
            let kind = match name {
                "true" => ExprKind::Literal(Literal::Boolean(true)),
                "false" => ExprKind::Literal(Literal::Boolean(false)),
                "null" => ExprKind::Literal(Literal::Null),
                "this" => ExprKind::This,
                _ => {
                    let function = Ident::new(name, self.span(start, rest));
                    let (after, _) = ws(rest)?;
                    if after.starts_with('(') {
                        let (rest, args) = self.arguments(after)?;
                        return Ok((
                            rest,
                            Expr::new(
                                ExprKind::Invocation { function, args },
                                self.span(start, rest),
                            ),
                        ));
                    }
                    ExprKind::Reference(function)
                }
            };
            return Ok((rest, Expr::new(kind, self.span(start, rest))));
        }

        Err(backtrack(i, "expected an expression"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::ScalarKind;

    fn expr(text: &str) -> Expr {
        parse_expression(text).expect("parse expression")
    }

    #[test]
    fn parses_models_with_fields_and_attributes() {
        let doc = parse_document(
            r#"
            // blog schema
            model Post {
                id        String   @id @default(uuid())
                title     String?
                tags      String[]
                author    User     @relation(fields: [authorId], references: [id])
                authorId  String
                /* policies */
                @@allow('read', true)
            }
            "#,
        )
        .expect("parse");
        let post = doc.find_model("Post").expect("Post");
        assert!(!post.is_abstract);
        assert_eq!(post.fields.len(), 5);
        assert_eq!(post.fields[0].attributes.len(), 2);
        assert_eq!(post.fields[1].ty.scalar_kind(), Some(ScalarKind::String));
        assert!(post.fields[1].ty.is_optional);
        assert!(post.fields[2].ty.is_array);
        assert_eq!(post.fields[3].ty.named().map(|i| i.as_str()), Some("User"));
        assert_eq!(post.attributes[0].name.as_str(), "@@allow");
        assert_eq!(post.attributes[0].args.len(), 2);
    }

    #[test]
    fn parses_abstract_models_and_extends_lists() {
        let doc = parse_document(
            "abstract model Base { id Int @id }\nmodel Post extends Base, Timestamps { title String }",
        )
        .expect("parse");
        let models: Vec<_> = doc.models().collect();
        assert!(models[0].is_abstract);
        let names: Vec<_> = models[1].extends.iter().map(|i| i.as_str()).collect();
        assert_eq!(names, vec!["Base", "Timestamps"]);
    }

    #[test]
    fn parses_named_arguments_inside_field_reference_arrays() {
        let doc = parse_document("model M { a Int\n b Int\n @@unique([a(sort: Asc), b]) }")
            .expect("parse");
        let model = doc.find_model("M").expect("M");
        let unique = &model.attributes[0];
        let ExprKind::Array(items) = &unique.args[0].value().kind else {
            panic!("expected array argument");
        };
        let ExprKind::Invocation { function, args } = &items[0].kind else {
            panic!("expected invocation, got {:?}", items[0].kind);
        };
        assert_eq!(function.as_str(), "a");
        assert_eq!(args[0].name().map(|n| n.as_str()), Some("sort"));
        assert_eq!(
            args[0].value().as_reference().map(|r| r.as_str()),
            Some("Asc")
        );
        assert_eq!(items[1].as_reference().map(|r| r.as_str()), Some("b"));
    }

    #[test]
    fn parses_attribute_declarations_with_positional_params_and_meta() {
        let doc = parse_document(
            "attribute @id(map: String?, _ length: Int?) @@@targetField([IntField, StringField])",
        )
        .expect("parse");
        let decl = doc.attribute_decls().next().expect("decl");
        assert_eq!(decl.name.as_str(), "@id");
        assert!(!decl.params[0].positional);
        assert!(decl.params[1].positional);
        assert!(decl.params[1].ty.is_optional);
        assert_eq!(decl.meta[0].name.as_str(), "@@@targetField");
    }

    #[test]
    fn parses_functions_with_and_without_bodies() {
        let doc = parse_document(
            "function now(): DateTime {}\nfunction isAdmin(u: User): Boolean { u.role == ADMIN }",
        )
        .expect("parse");
        let functions: Vec<_> = doc.functions().collect();
        assert!(functions[0].body.is_none());
        assert_eq!(functions[1].params[0].name.as_str(), "u");
        assert!(functions[1].body.is_some());
    }

    #[test]
    fn parses_datasource_plugin_and_enum_blocks() {
        let doc = parse_document(
            r#"
            datasource db {
                provider = 'postgresql'
                url = env("DATABASE_URL")
            }
            plugin hooks { provider = '@core/hooks' }
            enum Role {
                USER
                ADMIN @map("admin")
                @@map("roles")
            }
            "#,
        )
        .expect("parse");
        let Declaration::DataSource(ds) = &doc.declarations[0] else {
            panic!("datasource expected");
        };
        assert_eq!(
            ds.field("provider").and_then(|f| f.value.as_string_literal()),
            Some("postgresql")
        );
        let role = doc.enums().next().expect("enum");
        assert_eq!(role.members.len(), 2);
        assert_eq!(role.members[1].attributes[0].name.as_str(), "@map");
        assert_eq!(role.attributes[0].name.as_str(), "@@map");
    }

    #[test]
    fn unsupported_type_keeps_its_text() {
        let doc = parse_document("model M { id Int @id\n loc Unsupported(\"point\")? }").expect("parse");
        let field = &doc.find_model("M").expect("M").fields[1];
        assert_eq!(field.ty.name, TypeName::Unsupported("point".to_string()));
        assert!(field.ty.is_optional);
    }

    #[test]
    fn binary_operators_follow_precedence() {
        let parsed = expr("a || b && c == d < e + f * g");
        let ExprKind::Binary { op, right, .. } = &parsed.kind else {
            panic!("binary expected");
        };
        assert_eq!(*op, BinaryOp::Or);
        let ExprKind::Binary { op, right, .. } = &right.kind else {
            panic!("binary expected");
        };
        assert_eq!(*op, BinaryOp::And);
        let ExprKind::Binary { op, right, .. } = &right.kind else {
            panic!("binary expected");
        };
        assert_eq!(*op, BinaryOp::Eq);
        let ExprKind::Binary { op, right, .. } = &right.kind else {
            panic!("binary expected");
        };
        assert_eq!(*op, BinaryOp::Lt);
        let ExprKind::Binary { op, right, .. } = &right.kind else {
            panic!("binary expected");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(
            right.kind,
            ExprKind::Binary {
                op: BinaryOp::Mul,
                ..
            }
        ));
    }

    #[test]
    fn parentheses_override_precedence_and_are_not_kept() {
        assert_eq!(expr("(a || b) && c"), expr("((a || b)) && (c)"));
        let ExprKind::Binary { op, left, .. } = expr("(a || b) && c").kind else {
            panic!("binary expected");
        };
        assert_eq!(op, BinaryOp::And);
        assert!(matches!(
            left.kind,
            ExprKind::Binary {
                op: BinaryOp::Or,
                ..
            }
        ));
    }

    #[test]
    fn subtraction_is_left_associative() {
        assert_eq!(expr("a - b - c"), expr("(a - b) - c"));
        assert_ne!(expr("a - b - c"), expr("a - (b - c)"));
    }

    #[test]
    fn collection_predicates_accept_spacing_and_nesting() {
        assert_eq!(expr("posts?[published]"), expr("posts ? [published]"));
        let nested = expr("a?[b?[c == 1]]");
        let ExprKind::CollectionPredicate {
            quantifier,
            condition,
            ..
        } = nested.kind
        else {
            panic!("predicate expected");
        };
        assert_eq!(quantifier, Quantifier::Some);
        assert!(matches!(
            condition.kind,
            ExprKind::CollectionPredicate { .. }
        ));
        assert!(matches!(
            expr("members![active]").kind,
            ExprKind::CollectionPredicate {
                quantifier: Quantifier::Every,
                ..
            }
        ));
        assert!(matches!(
            expr("members^[banned]").kind,
            ExprKind::CollectionPredicate {
                quantifier: Quantifier::None,
                ..
            }
        ));
    }

    #[test]
    fn not_equal_is_not_mistaken_for_every_predicate() {
        assert!(matches!(
            expr("auth() != null").kind,
            ExprKind::Binary {
                op: BinaryOp::Ne,
                ..
            }
        ));
    }

    #[test]
    fn member_access_chains_and_literals() {
        let parsed = expr("auth().profile.name == 'x'");
        let ExprKind::Binary { left, right, .. } = parsed.kind else {
            panic!("binary expected");
        };
        let ExprKind::MemberAccess { object, member } = left.kind else {
            panic!("member access expected");
        };
        assert_eq!(member.as_str(), "name");
        assert!(matches!(object.kind, ExprKind::MemberAccess { .. }));
        assert_eq!(right.as_string_literal(), Some("x"));
        assert_eq!(
            expr("1.5").kind,
            ExprKind::Literal(Literal::Number("1.5".to_string()))
        );
        assert_eq!(expr("this").kind, ExprKind::This);
        assert!(expr("null").is_null());
    }

    #[test]
    fn string_escapes_are_decoded() {
        assert_eq!(expr(r#""a\"b\\c""#).as_string_literal(), Some("a\"b\\c"));
        assert_eq!(expr("'it\\'s'").as_string_literal(), Some("it's"));
    }

    #[test]
    fn reports_line_and_column_of_errors() {
        let err = parse_document("model M {\n  id Int @id\n  name String @default(\n}")
            .expect_err("should fail");
        let ParseError::Syntax { line, .. } = err;
        assert_eq!(line, 4);

        let err = parse_document("modle M {}").expect_err("should fail");
        assert!(err.to_string().contains("expected a declaration"), "err={err}");
    }

    #[test]
    fn reports_unterminated_strings() {
        let err = parse_expression("'abc").expect_err("should fail");
        assert!(err.to_string().contains("unterminated string"), "err={err}");
    }
}
