//! Reference resolution.
//!
//! Two halves:
//!
//! - [`check_references`]: the declaration-level link pass (field and
//!   parameter types, attribute names, `extends` targets);
//! - [`ScopeStack`]: identifier lookup inside expressions, shared by the type
//!   checker and the expression writer so both resolve names identically.
//!
//! Lookup order inside expressions: function parameters and
//! collection-predicate element scopes (innermost first) shadow the fields of
//! the enclosing record, which shadow document-level enum members.

use thiserror::Error;
use zmodel_dsl::ast::{
    AttributeApp, DataModel, Declaration, EnumDecl, EnumMember, Field, FunctionParam, Ident,
    Span, TypeName, TypeSpec,
};

use crate::diagnostic::{Diagnostic, DiagnosticKind, Diagnostics, Severity};
use crate::inheritance::{FieldRef, Hierarchy};
use crate::symbols::{FieldType, SymbolTable};

/// The principal model that `auth()` designates.
pub const PRINCIPAL_MODEL: &str = "User";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    TypeDeclaration,
    ReferenceTarget,
    FunctionDecl,
    DataModelField,
    Attribute,
    DataModel,
}

impl std::fmt::Display for RefKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RefKind::TypeDeclaration => "TypeDeclaration",
            RefKind::ReferenceTarget => "ReferenceTarget",
            RefKind::FunctionDecl => "FunctionDecl",
            RefKind::DataModelField => "DataModelField",
            RefKind::Attribute => "Attribute",
            RefKind::DataModel => "DataModel",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Could not resolve reference to {kind} named '{name}'.")]
pub struct LinkError {
    pub kind: RefKind,
    pub name: String,
    pub span: Span,
}

impl LinkError {
    pub fn new(kind: RefKind, ident: &Ident) -> Self {
        Self {
            kind,
            name: ident.name.clone(),
            span: ident.span,
        }
    }
}

impl From<LinkError> for Diagnostic {
    fn from(err: LinkError) -> Self {
        Diagnostic {
            message: err.to_string(),
            severity: Severity::Error,
            kind: DiagnosticKind::Link,
            span: err.span,
        }
    }
}

/// Read-only view over the resolved declarations of one compile unit.
#[derive(Debug, Clone, Copy)]
pub struct Env<'a, 'd> {
    pub symbols: &'a SymbolTable<'d>,
    pub hierarchy: &'a Hierarchy<'d>,
}

impl<'a, 'd> Env<'a, 'd> {
    pub fn new(symbols: &'a SymbolTable<'d>, hierarchy: &'a Hierarchy<'d>) -> Self {
        Self { symbols, hierarchy }
    }

    /// Own and inherited fields of `model`.
    pub fn fields(&self, model: &DataModel) -> &'a [FieldRef<'d>] {
        self.hierarchy.fields(model.name.as_str())
    }

    pub fn field(&self, model: &DataModel, name: &str) -> Option<&'a FieldRef<'d>> {
        self.fields(model).iter().find(|f| f.field.name.name == name)
    }

    pub fn field_type(&self, field: &Field) -> FieldType<'d> {
        self.symbols.resolve_type(&field.ty)
    }

    pub fn resolve_type(&self, ty: &TypeSpec) -> FieldType<'d> {
        self.symbols.resolve_type(ty)
    }

    pub fn principal(&self) -> Option<&'d DataModel> {
        self.symbols.model(PRINCIPAL_MODEL)
    }

    /// Fields identifying a record: `@id` fields, else `@@id` fields, else
    /// the first `@unique` field.
    pub fn id_fields(&self, model: &DataModel) -> Vec<&'d Field> {
        let fields = self.fields(model);
        let ids: Vec<&'d Field> = fields
            .iter()
            .filter(|f| f.field.has_attribute("@id"))
            .map(|f| f.field)
            .collect();
        if !ids.is_empty() {
            return ids;
        }
        let composite = self
            .hierarchy
            .attributes(model.name.as_str())
            .iter()
            .find(|a| a.attribute.name.as_str() == "@@id")
            .map(|a| field_reference_names(a.attribute));
        if let Some(names) = composite {
            return names
                .iter()
                .filter_map(|n| self.field(model, n).map(|f| f.field))
                .collect();
        }
        fields
            .iter()
            .find(|f| f.field.has_attribute("@unique"))
            .map(|f| vec![f.field])
            .unwrap_or_default()
    }
}

/// Field names listed in the first argument of `@@id`/`@@unique`/`@@index`.
pub fn field_reference_names(attribute: &AttributeApp) -> Vec<String> {
    let Some(first) = attribute.args.first() else {
        return Vec::new();
    };
    match &first.value().kind {
        zmodel_dsl::ast::ExprKind::Array(items) => items
            .iter()
            .filter_map(field_reference_name)
            .map(|i| i.name.clone())
            .collect(),
        _ => Vec::new(),
    }
}

/// `a` or `a(sort: Desc)` inside a field-reference list.
pub fn field_reference_name(expr: &zmodel_dsl::ast::Expr) -> Option<&Ident> {
    match &expr.kind {
        zmodel_dsl::ast::ExprKind::Reference(ident) => Some(ident),
        zmodel_dsl::ast::ExprKind::Invocation { function, .. } => Some(function),
        _ => None,
    }
}

// ============================================================================
// Expression scopes
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub enum Frame<'d> {
    /// The record a policy or attribute is evaluated against.
    Record(&'d DataModel),
    /// The element bound by a collection predicate.
    Element(&'d DataModel),
    Function(&'d [FunctionParam]),
}

#[derive(Debug, Clone, Copy)]
pub enum Binding<'d> {
    Param {
        frame: usize,
        index: usize,
        param: &'d FunctionParam,
    },
    Field {
        frame: usize,
        model: &'d DataModel,
        field: &'d Field,
    },
    EnumMember {
        decl: &'d EnumDecl,
        member: &'d EnumMember,
    },
}

#[derive(Debug, Clone, Default)]
pub struct ScopeStack<'d> {
    frames: Vec<Frame<'d>>,
}

impl<'d> ScopeStack<'d> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(frame: Frame<'d>) -> Self {
        Self {
            frames: vec![frame],
        }
    }

    pub fn push(&mut self, frame: Frame<'d>) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Option<Frame<'d>> {
        self.frames.pop()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Innermost record or element frame: what `this` denotes.
    pub fn this_model(&self) -> Option<(usize, &'d DataModel)> {
        self.frames
            .iter()
            .enumerate()
            .rev()
            .find_map(|(idx, frame)| match frame {
                Frame::Record(m) | Frame::Element(m) => Some((idx, *m)),
                Frame::Function(_) => None,
            })
    }

    /// The outermost record frame.
    pub fn record_model(&self) -> Option<&'d DataModel> {
        self.frames.iter().find_map(|frame| match frame {
            Frame::Record(m) => Some(*m),
            _ => None,
        })
    }

    /// Index among value-carrying (record/element) frames, i.e. the evaluation
    /// scope a field binding reads from.
    pub fn value_scope(&self, frame: usize) -> usize {
        self.frames[..frame]
            .iter()
            .filter(|f| !matches!(f, Frame::Function(_)))
            .count()
    }

    /// Number of value-carrying frames currently open.
    pub fn value_depth(&self) -> usize {
        self.value_scope(self.frames.len())
    }

    pub fn lookup(&self, env: Env<'_, 'd>, name: &str) -> Option<Binding<'d>> {
        for (idx, frame) in self.frames.iter().enumerate().rev() {
            match *frame {
                Frame::Function(params) => {
                    if let Some((index, param)) =
                        params.iter().enumerate().find(|(_, p)| p.name.name == name)
                    {
                        return Some(Binding::Param {
                            frame: idx,
                            index,
                            param,
                        });
                    }
                }
                Frame::Record(model) | Frame::Element(model) => {
                    if let Some(field) = env.field(model, name) {
                        tracing::trace!(name, model = %model.name, "resolved field reference");
                        return Some(Binding::Field {
                            frame: idx,
                            model,
                            field: field.field,
                        });
                    }
                }
            }
        }
        env.symbols
            .enum_member(name)
            .map(|(decl, member)| Binding::EnumMember { decl, member })
    }
}

// ============================================================================
// Declaration-level link pass
// ============================================================================

/// Check that every type, attribute and `extends` reference names a declaration.
pub fn check_references(symbols: &SymbolTable<'_>, diagnostics: &mut Diagnostics) {
    let before = diagnostics.len();
    for decl in &symbols.document().declarations {
        match decl {
            Declaration::Model(model) => {
                for base in &model.extends {
                    if symbols.model(base.as_str()).is_none() {
                        diagnostics.push(LinkError::new(RefKind::DataModel, base).into());
                    }
                }
                for field in &model.fields {
                    check_type(symbols, &field.ty, diagnostics);
                    check_attribute_names(symbols, &field.attributes, diagnostics);
                }
                check_attribute_names(symbols, &model.attributes, diagnostics);
            }
            Declaration::Enum(decl) => {
                for member in &decl.members {
                    check_attribute_names(symbols, &member.attributes, diagnostics);
                }
                check_attribute_names(symbols, &decl.attributes, diagnostics);
            }
            Declaration::Function(function) => {
                for param in &function.params {
                    check_type(symbols, &param.ty, diagnostics);
                }
                check_type(symbols, &function.return_type, diagnostics);
            }
            Declaration::Attribute(attribute) => {
                for param in &attribute.params {
                    check_type(symbols, &param.ty, diagnostics);
                }
                check_attribute_names(symbols, &attribute.meta, diagnostics);
            }
            Declaration::DataSource(_) | Declaration::Plugin(_) => {}
        }
    }
    tracing::debug!(
        unresolved = diagnostics.len() - before,
        "checked declaration references"
    );
}

fn check_type(symbols: &SymbolTable<'_>, ty: &TypeSpec, diagnostics: &mut Diagnostics) {
    if let TypeName::Named(ident) = &ty.name {
        let found = symbols.model(ident.as_str()).is_some()
            || symbols.enum_decl(ident.as_str()).is_some();
        if !found {
            diagnostics.push(LinkError::new(RefKind::TypeDeclaration, ident).into());
        }
    }
}

fn check_attribute_names(
    symbols: &SymbolTable<'_>,
    attributes: &[AttributeApp],
    diagnostics: &mut Diagnostics,
) {
    for attribute in attributes {
        if symbols.attribute(attribute.name.as_str()).is_none() {
            diagnostics.push(LinkError::new(RefKind::Attribute, &attribute.name).into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stdlib::stdlib;
    use zmodel_dsl::parse_document;

    fn link_messages(src: &str) -> Vec<String> {
        let doc = parse_document(src).expect("parse");
        let mut diags = Diagnostics::new();
        let symbols = SymbolTable::build(&doc, stdlib(), &mut diags);
        check_references(&symbols, &mut diags);
        diags.iter().map(|d| d.message.clone()).collect()
    }

    #[test]
    fn unresolved_types_attributes_and_bases_are_link_errors() {
        let messages = link_messages(
            "model A extends Missing { id Int @id @bogus\n other Nope\n @@wat }\nfunction f(x: Ghost): Boolean {}",
        );
        assert!(messages.contains(&"Could not resolve reference to DataModel named 'Missing'.".to_string()));
        assert!(messages.contains(&"Could not resolve reference to Attribute named '@bogus'.".to_string()));
        assert!(messages.contains(&"Could not resolve reference to TypeDeclaration named 'Nope'.".to_string()));
        assert!(messages.contains(&"Could not resolve reference to Attribute named '@@wat'.".to_string()));
        assert!(messages.contains(&"Could not resolve reference to TypeDeclaration named 'Ghost'.".to_string()));
    }

    #[test]
    fn well_formed_documents_link_cleanly() {
        let messages = link_messages(
            "enum Role { USER }\nmodel U { id Int @id @default(autoincrement())\n role Role @default(USER) }",
        );
        assert!(messages.is_empty(), "{messages:?}");
    }
}
