//! Semantic validation for zmodel documents.
//!
//! The entry point is [`validate_document`], a multi-pass batch pipeline over
//! a parsed [`zmodel_dsl::ast::Document`]:
//!
//! 1. symbol tables (user declarations merged with the bundled standard library),
//! 2. reference resolution (types, attributes, `extends` targets),
//! 3. inheritance (edge classification, cycle detection, member flattening),
//! 4. structural model rules (ids, unique criteria, datasource, enums),
//! 5. relation inference,
//! 6. attribute argument binding and policy-expression type checking,
//! 7. function bodies.
//!
//! Passes accumulate [`Diagnostic`]s instead of aborting. A document with no
//! error-severity diagnostics yields a [`ValidatedDocument`], from which
//! relation edges, inheritance edges and compiled policy predicates can be read.

pub mod attributes;
pub mod compiler;
pub mod diagnostic;
pub mod expressions;
pub mod inheritance;
pub mod policy;
pub mod relations;
pub mod resolver;
pub mod stdlib;
pub mod structure;
pub mod symbols;
pub mod validator;

pub use diagnostic::{Diagnostic, DiagnosticKind, Diagnostics, Severity};
pub use validator::{
    validate_document, validate_document_with, ValidatedDocument, ValidationOptions,
    ValidationResult,
};
