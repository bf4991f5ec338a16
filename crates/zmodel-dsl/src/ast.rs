//! Typed AST for `.zmodel` documents.
//!
//! Every node carries a [`Span`] pointing back into the source text. Spans
//! are positional metadata only: they never take part in `==`, so an AST
//! parsed from printed output compares equal to the AST it was printed from.

use serde::{Deserialize, Serialize};

pub type Name = String;

// ============================================================================
// Spans and identifiers
// ============================================================================

/// Byte range `start..end` in the source text.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl PartialEq for Span {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl Eq for Span {}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Smallest span covering both `self` and `other`.
    pub fn to(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// 1-based `(line, column)` of the span start within `source`.
    pub fn line_col(&self, source: &str) -> (usize, usize) {
        line_col(source, self.start)
    }
}

/// 1-based `(line, column)` of a byte offset. Columns count characters.
pub fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let before = &source[..offset];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map(|i| i + 1).unwrap_or(0);
    let column = before[line_start..].chars().count() + 1;
    (line, column)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ident {
    pub name: Name,
    pub span: Span,
}

impl Ident {
    pub fn new(name: impl Into<Name>, span: Span) -> Self {
        Self {
            name: name.into(),
            span,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for Ident {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

// ============================================================================
// Documents and declarations
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub declarations: Vec<Declaration>,
}

impl Document {
    pub fn models(&self) -> impl Iterator<Item = &DataModel> {
        self.declarations.iter().filter_map(|d| match d {
            Declaration::Model(m) => Some(m),
            _ => None,
        })
    }

    pub fn enums(&self) -> impl Iterator<Item = &EnumDecl> {
        self.declarations.iter().filter_map(|d| match d {
            Declaration::Enum(e) => Some(e),
            _ => None,
        })
    }

    pub fn functions(&self) -> impl Iterator<Item = &FunctionDecl> {
        self.declarations.iter().filter_map(|d| match d {
            Declaration::Function(f) => Some(f),
            _ => None,
        })
    }

    pub fn attribute_decls(&self) -> impl Iterator<Item = &AttributeDecl> {
        self.declarations.iter().filter_map(|d| match d {
            Declaration::Attribute(a) => Some(a),
            _ => None,
        })
    }

    pub fn find_model(&self, name: &str) -> Option<&DataModel> {
        self.models().find(|m| m.name.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "declaration", rename_all = "snake_case")]
pub enum Declaration {
    DataSource(ConfigBlock),
    Plugin(ConfigBlock),
    Enum(EnumDecl),
    Model(DataModel),
    Function(FunctionDecl),
    Attribute(AttributeDecl),
}

impl Declaration {
    pub fn name(&self) -> &Ident {
        match self {
            Declaration::DataSource(b) | Declaration::Plugin(b) => &b.name,
            Declaration::Enum(e) => &e.name,
            Declaration::Model(m) => &m.name,
            Declaration::Function(f) => &f.name,
            Declaration::Attribute(a) => &a.name,
        }
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            Declaration::DataSource(_) => "datasource",
            Declaration::Plugin(_) => "plugin",
            Declaration::Enum(_) => "enum",
            Declaration::Model(_) => "model",
            Declaration::Function(_) => "function",
            Declaration::Attribute(_) => "attribute",
        }
    }
}

/// `datasource` and `plugin` blocks: a name and `key = value` entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigBlock {
    pub name: Ident,
    pub fields: Vec<ConfigField>,
    pub span: Span,
}

impl ConfigBlock {
    pub fn field(&self, name: &str) -> Option<&ConfigField> {
        self.fields.iter().find(|f| f.name.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigField {
    pub name: Ident,
    pub value: Expr,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumDecl {
    pub name: Ident,
    pub members: Vec<EnumMember>,
    pub attributes: Vec<AttributeApp>,
    pub span: Span,
}

impl EnumDecl {
    pub fn member(&self, name: &str) -> Option<&EnumMember> {
        self.members.iter().find(|m| m.name.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumMember {
    pub name: Ident,
    pub attributes: Vec<AttributeApp>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataModel {
    pub name: Ident,
    pub is_abstract: bool,
    pub extends: Vec<Ident>,
    pub fields: Vec<Field>,
    pub attributes: Vec<AttributeApp>,
    pub span: Span,
}

impl DataModel {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name.name == name)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a.name.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: Ident,
    pub ty: TypeSpec,
    pub attributes: Vec<AttributeApp>,
    pub span: Span,
}

impl Field {
    pub fn attribute(&self, name: &str) -> Option<&AttributeApp> {
        self.attributes.iter().find(|a| a.name.name == name)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attribute(name).is_some()
    }
}

// ============================================================================
// Types
// ============================================================================

/// A type reference with its list/optional modifiers.
///
/// Used for model fields, function parameters and return types, and
/// attribute parameters alike; which [`TypeName`]s are legal depends on the
/// position and is checked semantically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeSpec {
    pub name: TypeName,
    pub is_array: bool,
    pub is_optional: bool,
    pub span: Span,
}

impl TypeSpec {
    pub fn scalar(kind: ScalarKind) -> Self {
        Self {
            name: TypeName::Scalar(kind),
            is_array: false,
            is_optional: false,
            span: Span::default(),
        }
    }

    pub fn scalar_kind(&self) -> Option<ScalarKind> {
        match self.name {
            TypeName::Scalar(kind) => Some(kind),
            _ => None,
        }
    }

    pub fn named(&self) -> Option<&Ident> {
        match &self.name {
            TypeName::Named(ident) => Some(ident),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tag", content = "value", rename_all = "snake_case")]
pub enum TypeName {
    Scalar(ScalarKind),
    Builtin(BuiltinType),
    /// `Unsupported("...")`: an opaque database type.
    Unsupported(String),
    /// A model or enum, resolved semantically.
    Named(Ident),
}

impl TypeName {
    pub fn from_identifier(ident: Ident) -> TypeName {
        if let Some(kind) = ScalarKind::from_name(&ident.name) {
            TypeName::Scalar(kind)
        } else if let Some(builtin) = BuiltinType::from_name(&ident.name) {
            TypeName::Builtin(builtin)
        } else {
            TypeName::Named(ident)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarKind {
    String,
    Boolean,
    Int,
    BigInt,
    Float,
    Decimal,
    DateTime,
    Json,
    Bytes,
}

impl ScalarKind {
    pub const ALL: [ScalarKind; 9] = [
        ScalarKind::String,
        ScalarKind::Boolean,
        ScalarKind::Int,
        ScalarKind::BigInt,
        ScalarKind::Float,
        ScalarKind::Decimal,
        ScalarKind::DateTime,
        ScalarKind::Json,
        ScalarKind::Bytes,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScalarKind::String => "String",
            ScalarKind::Boolean => "Boolean",
            ScalarKind::Int => "Int",
            ScalarKind::BigInt => "BigInt",
            ScalarKind::Float => "Float",
            ScalarKind::Decimal => "Decimal",
            ScalarKind::DateTime => "DateTime",
            ScalarKind::Json => "Json",
            ScalarKind::Bytes => "Bytes",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ScalarKind::Int | ScalarKind::BigInt | ScalarKind::Float | ScalarKind::Decimal
        )
    }
}

/// Pseudo types that only appear in function and attribute signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuiltinType {
    Any,
    /// The type of the field the attribute decorates (`@default`).
    ContextType,
    /// A field of the model the attribute is applied to.
    FieldReference,
    /// A field of the model on the other side of a relation.
    TransitiveFieldReference,
    Null,
    Object,
}

impl BuiltinType {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "Any" => BuiltinType::Any,
            "ContextType" => BuiltinType::ContextType,
            "FieldReference" => BuiltinType::FieldReference,
            "TransitiveFieldReference" => BuiltinType::TransitiveFieldReference,
            "Null" => BuiltinType::Null,
            "Object" => BuiltinType::Object,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuiltinType::Any => "Any",
            BuiltinType::ContextType => "ContextType",
            BuiltinType::FieldReference => "FieldReference",
            BuiltinType::TransitiveFieldReference => "TransitiveFieldReference",
            BuiltinType::Null => "Null",
            BuiltinType::Object => "Object",
        }
    }
}

// ============================================================================
// Attributes, functions, attribute declarations
// ============================================================================

/// An attribute application: `@id`, `@default(now())`, `@@allow('read', true)`.
///
/// `name` includes the `@`/`@@` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeApp {
    pub name: Ident,
    pub args: Vec<Argument>,
    pub span: Span,
}

impl AttributeApp {
    pub fn is_model_level(&self) -> bool {
        self.name.name.starts_with("@@")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Argument {
    Positional { value: Expr },
    Named { name: Ident, value: Expr },
}

impl Argument {
    pub fn value(&self) -> &Expr {
        match self {
            Argument::Positional { value } | Argument::Named { value, .. } => value,
        }
    }

    pub fn name(&self) -> Option<&Ident> {
        match self {
            Argument::Positional { .. } => None,
            Argument::Named { name, .. } => Some(name),
        }
    }

    pub fn span(&self) -> Span {
        match self {
            Argument::Positional { value } => value.span,
            Argument::Named { name, value } => name.span.to(value.span),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: Ident,
    pub params: Vec<FunctionParam>,
    pub return_type: TypeSpec,
    pub body: Option<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionParam {
    pub name: Ident,
    pub ty: TypeSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDecl {
    pub name: Ident,
    pub params: Vec<ParamSpec>,
    /// `@@@targetField(...)` and friends.
    pub meta: Vec<AttributeApp>,
    pub span: Span,
}

impl AttributeDecl {
    pub fn is_model_level(&self) -> bool {
        self.name.name.starts_with("@@")
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name.name == name)
    }

    pub fn meta(&self, name: &str) -> Option<&AttributeApp> {
        self.meta.iter().find(|m| m.name.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: Ident,
    pub ty: TypeSpec,
    /// Declared with a leading `_`: may be bound by an unnamed argument.
    pub positional: bool,
}

impl ParamSpec {
    pub fn is_required(&self) -> bool {
        !self.ty.is_optional
    }
}

// ============================================================================
// Expressions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }

    pub fn as_string_literal(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Literal(Literal::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&Ident> {
        match &self.kind {
            ExprKind::Reference(ident) => Some(ident),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ExprKind::Literal(Literal::Null))
    }

    /// Binding strength used by the parser and the printer.
    pub fn precedence(&self) -> u8 {
        match &self.kind {
            ExprKind::Binary { op, .. } => op.precedence(),
            ExprKind::Unary { .. } => 7,
            _ => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "expr", content = "data", rename_all = "snake_case")]
pub enum ExprKind {
    Literal(Literal),
    This,
    Reference(Ident),
    MemberAccess {
        object: Box<Expr>,
        member: Ident,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Invocation {
        function: Ident,
        args: Vec<Argument>,
    },
    Array(Vec<Expr>),
    CollectionPredicate {
        collection: Box<Expr>,
        quantifier: Quantifier,
        condition: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "literal", content = "value", rename_all = "snake_case")]
pub enum Literal {
    String(String),
    /// Kept as written so printing is lossless.
    Number(String),
    Boolean(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Negate,
}

impl UnaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            UnaryOp::Not => "!",
            UnaryOp::Negate => "-",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Mul,
    Div,
    Add,
    Sub,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }

    /// Higher binds tighter. Unary operators sit at 7, postfix forms at 8.
    pub fn precedence(&self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq | BinaryOp::Ne => 3,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 4,
            BinaryOp::Add | BinaryOp::Sub => 5,
            BinaryOp::Mul | BinaryOp::Div => 6,
        }
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    pub fn is_equality(&self) -> bool {
        matches!(self, BinaryOp::Eq | BinaryOp::Ne)
    }

    pub fn is_relational(&self) -> bool {
        matches!(
            self,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Add | BinaryOp::Sub
        )
    }
}

/// Collection predicate flavour: `?[...]` (some), `![...]` (every), `^[...]` (none).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quantifier {
    Some,
    Every,
    None,
}

impl Quantifier {
    pub fn symbol(&self) -> char {
        match self {
            Quantifier::Some => '?',
            Quantifier::Every => '!',
            Quantifier::None => '^',
        }
    }

    pub fn from_symbol(c: char) -> Option<Self> {
        match c {
            '?' => Some(Quantifier::Some),
            '!' => Some(Quantifier::Every),
            '^' => Some(Quantifier::None),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_do_not_affect_equality() {
        let a = Ident::new("x", Span::new(0, 1));
        let b = Ident::new("x", Span::new(10, 11));
        assert_eq!(a, b);
        assert_ne!(a, Ident::new("y", Span::new(0, 1)));
    }

    #[test]
    fn line_col_counts_from_one() {
        let src = "model A {\n  id Int @id\n}";
        assert_eq!(line_col(src, 0), (1, 1));
        assert_eq!(line_col(src, 12), (2, 3));
    }

    #[test]
    fn type_names_classify_identifiers() {
        let s = Span::default();
        assert_eq!(
            TypeName::from_identifier(Ident::new("DateTime", s)),
            TypeName::Scalar(ScalarKind::DateTime)
        );
        assert_eq!(
            TypeName::from_identifier(Ident::new("FieldReference", s)),
            TypeName::Builtin(BuiltinType::FieldReference)
        );
        assert!(matches!(
            TypeName::from_identifier(Ident::new("Post", s)),
            TypeName::Named(_)
        ));
    }
}
