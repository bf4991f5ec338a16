//! Name → declaration index for one compile unit.
//!
//! User declarations are merged with the shared standard library. The
//! library document is borrowed, never copied, and user declarations may not
//! shadow its names.

use std::collections::HashMap;

use zmodel_dsl::ast::{
    AttributeDecl, BuiltinType, DataModel, Declaration, Document, EnumDecl, EnumMember,
    FunctionDecl, ScalarKind, TypeName, TypeSpec,
};

use crate::diagnostic::{DiagnosticKind, Diagnostics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct DeclId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Document,
    Stdlib,
}

#[derive(Debug, Clone, Copy)]
struct Symbol<'d> {
    decl: &'d Declaration,
    origin: Origin,
}

/// What a field's declared type resolves to.
#[derive(Debug, Clone, Copy)]
pub enum FieldType<'d> {
    Scalar(ScalarKind),
    Enum(&'d EnumDecl),
    Model(&'d DataModel),
    Builtin(BuiltinType),
    Unsupported,
    Unresolved,
}

impl<'d> FieldType<'d> {
    pub fn is_scalar_or_enum(&self) -> bool {
        matches!(self, FieldType::Scalar(_) | FieldType::Enum(_))
    }

    pub fn as_model(&self) -> Option<&'d DataModel> {
        match self {
            FieldType::Model(m) => Some(m),
            _ => None,
        }
    }

    /// Same scalar kind, or the same enum.
    pub fn same_scalar_as(&self, other: &FieldType<'_>) -> bool {
        match (self, other) {
            (FieldType::Scalar(a), FieldType::Scalar(b)) => a == b,
            (FieldType::Enum(a), FieldType::Enum(b)) => a.name == b.name,
            _ => false,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            FieldType::Scalar(kind) => kind.as_str().to_string(),
            FieldType::Enum(e) => e.name.name.clone(),
            FieldType::Model(m) => m.name.name.clone(),
            FieldType::Builtin(b) => b.as_str().to_string(),
            FieldType::Unsupported => "Unsupported".to_string(),
            FieldType::Unresolved => "<unresolved>".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct SymbolTable<'d> {
    document: &'d Document,
    symbols: Vec<Symbol<'d>>,
    by_name: HashMap<&'d str, DeclId>,
}

impl<'d> SymbolTable<'d> {
    /// Index `stdlib` and `document`, reporting duplicate and shadowing names.
    pub fn build(
        document: &'d Document,
        stdlib: &'d Document,
        diagnostics: &mut Diagnostics,
    ) -> Self {
        let mut table = Self {
            document,
            symbols: Vec::new(),
            by_name: HashMap::new(),
        };
        for decl in &stdlib.declarations {
            table.insert(decl, Origin::Stdlib);
        }
        for decl in &document.declarations {
            let name = decl.name();
            let existing = table.origin(name.as_str());
            match existing {
                Some(Origin::Stdlib) => diagnostics.error(
                    DiagnosticKind::Structural,
                    name.span,
                    format!("Declaration \"{name}\" conflicts with a standard library declaration"),
                ),
                Some(Origin::Document) => diagnostics.error(
                    DiagnosticKind::Structural,
                    name.span,
                    format!("Duplicated declaration name \"{name}\""),
                ),
                None => table.insert(decl, Origin::Document),
            }
        }
        tracing::debug!(
            symbols = table.symbols.len(),
            document = document.declarations.len(),
            "built symbol table"
        );
        table
    }

    fn insert(&mut self, decl: &'d Declaration, origin: Origin) {
        let id = DeclId(self.symbols.len());
        self.symbols.push(Symbol { decl, origin });
        self.by_name.entry(decl.name().as_str()).or_insert(id);
    }

    pub fn document(&self) -> &'d Document {
        self.document
    }

    fn lookup(&self, name: &str) -> Option<Symbol<'d>> {
        let id = self.by_name.get(name)?;
        self.symbols.get(id.0).copied()
    }

    pub fn get(&self, name: &str) -> Option<&'d Declaration> {
        self.lookup(name).map(|symbol| symbol.decl)
    }

    pub fn origin(&self, name: &str) -> Option<Origin> {
        self.lookup(name).map(|symbol| symbol.origin)
    }

    pub fn model(&self, name: &str) -> Option<&'d DataModel> {
        match self.get(name)? {
            Declaration::Model(m) => Some(m),
            _ => None,
        }
    }

    pub fn enum_decl(&self, name: &str) -> Option<&'d EnumDecl> {
        match self.get(name)? {
            Declaration::Enum(e) => Some(e),
            _ => None,
        }
    }

    pub fn function(&self, name: &str) -> Option<&'d FunctionDecl> {
        match self.get(name)? {
            Declaration::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&'d AttributeDecl> {
        match self.get(name)? {
            Declaration::Attribute(a) => Some(a),
            _ => None,
        }
    }

    /// Models declared by the user document, in declaration order.
    pub fn models(&self) -> impl Iterator<Item = &'d DataModel> {
        self.document.models()
    }

    /// Every indexed enum, user declarations first.
    pub fn enums(&self) -> impl Iterator<Item = &'d EnumDecl> + '_ {
        let mut enums: Vec<(Origin, &'d EnumDecl)> = self
            .symbols
            .iter()
            .filter_map(|s| match s.decl {
                Declaration::Enum(e) => Some((s.origin, e)),
                _ => None,
            })
            .collect();
        enums.sort_by_key(|(origin, _)| *origin == Origin::Stdlib);
        enums.into_iter().map(|(_, e)| e)
    }

    /// Enum members are visible by bare name throughout the document.
    pub fn enum_member(&self, name: &str) -> Option<(&'d EnumDecl, &'d EnumMember)> {
        self.enums()
            .find_map(|e| e.member(name).map(|member| (e, member)))
    }

    pub fn resolve_type(&self, ty: &TypeSpec) -> FieldType<'d> {
        match &ty.name {
            TypeName::Scalar(kind) => FieldType::Scalar(*kind),
            TypeName::Builtin(builtin) => FieldType::Builtin(*builtin),
            TypeName::Unsupported(_) => FieldType::Unsupported,
            TypeName::Named(ident) => match self.get(ident.as_str()) {
                Some(Declaration::Model(m)) => FieldType::Model(m),
                Some(Declaration::Enum(e)) => FieldType::Enum(e),
                _ => FieldType::Unresolved,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stdlib::stdlib;
    use zmodel_dsl::parse_document;

    #[test]
    fn reports_duplicates_and_stdlib_shadowing() {
        let doc = parse_document(
            "model A { id Int @id }\nmodel A { id Int @id }\nenum SortOrder { X }",
        )
        .expect("parse");
        let mut diags = Diagnostics::new();
        let table = SymbolTable::build(&doc, stdlib(), &mut diags);
        assert!(diags.contains("Duplicated declaration name \"A\""));
        assert!(diags.contains("conflicts with a standard library declaration"));
        assert_eq!(table.origin("SortOrder"), Some(Origin::Stdlib));
        assert_eq!(table.origin("A"), Some(Origin::Document));
        let first = table.get("A").expect("A");
        assert!(std::ptr::eq(first, &doc.declarations[0]));
        assert!(table.model("A").is_some());
        assert!(table.get("Missing").is_none());
    }

    #[test]
    fn user_enum_members_win_over_stdlib_members() {
        let doc = parse_document("enum Order { Asc }").expect("parse");
        let mut diags = Diagnostics::new();
        let table = SymbolTable::build(&doc, stdlib(), &mut diags);
        let (decl, _) = table.enum_member("Asc").expect("member");
        assert_eq!(decl.name.as_str(), "Order");
        let (decl, _) = table.enum_member("Cascade").expect("member");
        assert_eq!(decl.name.as_str(), "ReferentialAction");
    }

    #[test]
    fn resolves_field_types() {
        let doc = parse_document("enum Role { USER }\nmodel U { id Int @id\n role Role\n b Bogus }")
            .expect("parse");
        let mut diags = Diagnostics::new();
        let table = SymbolTable::build(&doc, stdlib(), &mut diags);
        let model = table.model("U").expect("U");
        assert!(matches!(table.resolve_type(&model.fields[0].ty), FieldType::Scalar(ScalarKind::Int)));
        assert!(matches!(table.resolve_type(&model.fields[1].ty), FieldType::Enum(_)));
        assert!(matches!(table.resolve_type(&model.fields[2].ty), FieldType::Unresolved));
    }
}
