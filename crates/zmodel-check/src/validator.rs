//! The validation pipeline and the validated compile unit.

use serde::{Deserialize, Serialize};
use zmodel_dsl::ast::{Document, Expr};

use crate::attributes::check_attributes;
use crate::compiler::{compile_predicate, CompileError, Predicate};
use crate::diagnostic::{Diagnostic, Diagnostics, Severity};
use crate::expressions::ExprChecker;
use crate::inheritance::{Hierarchy, InheritanceEdge};
use crate::policy::{compile_policies, PolicyBundle};
use crate::relations::{infer_relations, RelationEdge};
use crate::resolver::{check_references, Env, Frame, ScopeStack};
use crate::stdlib::stdlib;
use crate::structure::check_structure;
use crate::symbols::SymbolTable;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationOptions {
    /// Report documents without a `datasource` block.
    pub require_datasource: bool,
    /// Promote warnings to errors.
    pub deny_warnings: bool,
}

#[derive(Debug)]
pub struct ValidationResult<'d> {
    pub diagnostics: Diagnostics,
    /// Present only when no error-severity diagnostic was reported.
    pub validated: Option<ValidatedDocument<'d>>,
}

impl<'d> ValidationResult<'d> {
    pub fn is_valid(&self) -> bool {
        self.validated.is_some()
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.has_errors()
    }
}

/// A document that passed validation, with its derived relation and
/// inheritance edges.
#[derive(Debug)]
pub struct ValidatedDocument<'d> {
    symbols: SymbolTable<'d>,
    hierarchy: Hierarchy<'d>,
    relations: Vec<RelationEdge>,
}

impl<'d> ValidatedDocument<'d> {
    pub fn document(&self) -> &'d Document {
        self.symbols.document()
    }

    pub fn env(&self) -> Env<'_, 'd> {
        Env::new(&self.symbols, &self.hierarchy)
    }

    pub fn relations(&self) -> &[RelationEdge] {
        &self.relations
    }

    pub fn relations_of<'s>(&'s self, model: &'s str) -> impl Iterator<Item = &'s RelationEdge> + 's {
        self.relations
            .iter()
            .filter(move |edge| edge.ends.iter().any(|end| end.model == model))
    }

    pub fn inheritance_edges(&self) -> &[InheritanceEdge] {
        self.hierarchy.edges()
    }

    /// Type-check `expr` against a record of `model` and compile it.
    pub fn compile<'s>(&'s self, model: &str, expr: &'s Expr) -> Result<Predicate, CompileError> {
        let env: Env<'s, 's> = self.env();
        let Some(record) = self.symbols.model(model) else {
            return Err(CompileError::Unresolved(model.to_string()));
        };
        let mut diagnostics = Diagnostics::new();
        let mut scope = ScopeStack::with(Frame::Record(record));
        let ty = ExprChecker::new(env, &mut diagnostics)
            .allow_future(true)
            .check(expr, &mut scope);
        if !ty.is_boolean_like() {
            diagnostics.error(
                crate::DiagnosticKind::Expression,
                expr.span,
                format!("Expected a Boolean expression, found \"{}\"", ty.describe()),
            );
        }
        if let Some(first) = diagnostics.errors().next() {
            return Err(CompileError::Invalid(first.message.clone()));
        }
        compile_predicate(env, expr, &mut scope)
    }

    pub fn policies(&self) -> Result<PolicyBundle, CompileError> {
        compile_policies(self.env())
    }
}

pub fn validate_document(document: &Document) -> ValidationResult<'_> {
    validate_document_with(document, &ValidationOptions::default())
}

pub fn validate_document_with<'d>(
    document: &'d Document,
    options: &ValidationOptions,
) -> ValidationResult<'d> {
    let mut diagnostics = Diagnostics::new();
    let symbols = SymbolTable::build(document, stdlib(), &mut diagnostics);
    check_references(&symbols, &mut diagnostics);
    let hierarchy = Hierarchy::resolve(&symbols, &mut diagnostics);

    let env = Env::new(&symbols, &hierarchy);
    check_structure(env, options, &mut diagnostics);
    let relations = infer_relations(env, &mut diagnostics);
    check_attributes(env, &mut diagnostics);
    for function in document.functions() {
        ExprChecker::new(env, &mut diagnostics).check_function(function);
    }

    if options.deny_warnings {
        diagnostics = diagnostics
            .into_vec()
            .into_iter()
            .map(|d| Diagnostic {
                severity: Severity::Error,
                ..d
            })
            .collect();
    }

    let errors = diagnostics.errors().count();
    tracing::debug!(
        errors,
        warnings = diagnostics.len() - errors,
        relations = relations.len(),
        "validated document"
    );
    let validated = (errors == 0).then(|| ValidatedDocument {
        symbols,
        hierarchy,
        relations,
    });
    ValidationResult {
        diagnostics,
        validated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zmodel_dsl::{parse_document, parse_expression};

    const BLOG: &str = r#"
        datasource db {
            provider = "postgresql"
            url = env("DATABASE_URL")
        }
        model User {
            id    String @id @default(uuid())
            email String @unique
            posts Post[]
            @@allow('read', true)
        }
        model Post {
            id       String @id @default(cuid())
            title    String
            author   User   @relation(fields: [authorId], references: [id], onDelete: Cascade)
            authorId String
            @@allow('all', author == auth())
        }
    "#;

    #[test]
    fn valid_document_exposes_derived_data() {
        let doc = parse_document(BLOG).expect("parse");
        let result = validate_document(&doc);
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        let validated = result.validated.expect("validated");
        assert_eq!(validated.relations().len(), 1);
        assert_eq!(validated.relations_of("User").count(), 1);
        let bundle = validated.policies().expect("policies");
        assert_eq!(bundle.models.len(), 2);
    }

    #[test]
    fn compile_rejects_ill_typed_expressions() {
        let doc = parse_document(BLOG).expect("parse");
        let result = validate_document(&doc);
        let validated = result.validated.expect("validated");
        let ok = parse_expression("title == 'x' || author == auth()").expect("parse");
        assert!(validated.compile("Post", &ok).is_ok());
        let bad = parse_expression("title + 1").expect("parse");
        assert!(matches!(
            validated.compile("Post", &bad),
            Err(CompileError::Invalid(_))
        ));
        assert_eq!(
            validated.compile("Nope", &ok),
            Err(CompileError::Unresolved("Nope".to_string()))
        );
    }

    #[test]
    fn errors_withhold_the_validated_document() {
        let doc = parse_document("model M { x Int }").expect("parse");
        let result = validate_document(&doc);
        assert!(!result.is_valid());
        assert!(result.diagnostics.contains("Model must have at least one unique criteria"));
    }

    #[test]
    fn deny_warnings_promotes_warnings() {
        let doc = parse_document(
            "datasource db { provider = 'sqlite'\n url = 'file:x'\n extra = 1 }\nmodel M { id Int @id }",
        )
        .expect("parse");
        assert!(validate_document(&doc).is_valid());
        let strict = ValidationOptions {
            deny_warnings: true,
            ..Default::default()
        };
        let result = validate_document_with(&doc, &strict);
        assert!(!result.is_valid());
        assert_eq!(result.diagnostics.errors().count(), 1);
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: ValidationOptions =
            serde_json::from_str(r#"{ "require_datasource": true }"#).expect("options");
        assert!(options.require_datasource);
        assert!(!options.deny_warnings);
    }
}
