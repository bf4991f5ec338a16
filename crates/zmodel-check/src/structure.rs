//! Structural rules: model identity criteria, field type shapes,
//! datasource/plugin blocks and enums.

use std::collections::HashSet;

use zmodel_dsl::ast::{ConfigBlock, Declaration, EnumDecl, Expr, ExprKind, Span};

use crate::diagnostic::{DiagnosticKind, Diagnostics};
use crate::inheritance::FieldRef;
use crate::resolver::{field_reference_names, Env};
use crate::symbols::FieldType;
use crate::validator::ValidationOptions;

pub const SUPPORTED_PROVIDERS: [&str; 5] =
    ["postgresql", "mysql", "sqlite", "sqlserver", "cockroachdb"];

const RELATION_MODES: [&str; 2] = ["foreignKeys", "prisma"];

const URL_FIELDS: [&str; 3] = ["url", "directUrl", "shadowDatabaseUrl"];

pub fn check_structure(env: Env<'_, '_>, options: &ValidationOptions, diagnostics: &mut Diagnostics) {
    let before = diagnostics.len();
    check_models(env, diagnostics);
    check_declarations(env, options, diagnostics);
    tracing::debug!(
        reported = diagnostics.len() - before,
        "checked structural rules"
    );
}

fn check_models(env: Env<'_, '_>, diagnostics: &mut Diagnostics) {
    for model in env.hierarchy.models() {
        for field in &model.fields {
            if field.ty.is_array && field.ty.is_optional {
                diagnostics.error(
                    DiagnosticKind::Structural,
                    field.ty.span,
                    "Optional lists are not supported. Use either `Type[]` or `Type?`",
                );
            }
            match env.field_type(field) {
                FieldType::Builtin(builtin) => diagnostics.error(
                    DiagnosticKind::Structural,
                    field.ty.span,
                    format!("Type \"{}\" cannot be used as a field type", builtin.as_str()),
                ),
                FieldType::Model(target) if target.is_abstract => diagnostics.error(
                    DiagnosticKind::Structural,
                    field.ty.span,
                    format!(
                        "Field \"{}\" cannot reference abstract model \"{}\"",
                        field.name, target.name
                    ),
                ),
                _ => {}
            }
        }

        if !model.is_abstract {
            check_identity(env, model, diagnostics);
        }
    }
}

/// A field that can take part in an identifying criterion.
fn is_identifying(env: Env<'_, '_>, field: &FieldRef<'_>) -> bool {
    !field.field.ty.is_optional
        && !field.field.ty.is_array
        && env.field_type(field.field).is_scalar_or_enum()
}

fn check_identity(
    env: Env<'_, '_>,
    model: &zmodel_dsl::ast::DataModel,
    diagnostics: &mut Diagnostics,
) {
    let fields = env.fields(model);
    let attributes = env.hierarchy.attributes(model.name.as_str());

    let id_fields: Vec<&FieldRef<'_>> = fields
        .iter()
        .filter(|f| f.field.has_attribute("@id"))
        .collect();
    let model_ids: Vec<_> = attributes
        .iter()
        .filter(|a| a.attribute.name.as_str() == "@@id")
        .collect();

    if id_fields.len() > 1 {
        diagnostics.error(
            DiagnosticKind::Structural,
            model.name.span,
            "Model can include at most one field with @id attribute",
        );
    }
    for id in &id_fields {
        if id.field.ty.is_array || !env.field_type(id.field).is_scalar_or_enum() {
            diagnostics.error(
                DiagnosticKind::Structural,
                id.field.name.span,
                "Field with @id attribute must be of scalar or enum type",
            );
        } else if id.field.ty.is_optional {
            diagnostics.error(
                DiagnosticKind::Structural,
                id.field.name.span,
                "Field with @id attribute must not be optional",
            );
        }
    }
    if !id_fields.is_empty() && !model_ids.is_empty() {
        diagnostics.error(
            DiagnosticKind::Structural,
            model.name.span,
            "Model cannot have both field-level @id and model-level @@id attributes",
        );
    }
    if model_ids.len() > 1 {
        diagnostics.error(
            DiagnosticKind::Structural,
            model.name.span,
            "Model can include at most one @@id attribute",
        );
    }
    for id in &model_ids {
        for name in field_reference_names(id.attribute) {
            if let Some(field) = env.field(model, &name) {
                if !is_identifying(env, field) {
                    diagnostics.error(
                        DiagnosticKind::Structural,
                        id.attribute.span,
                        format!(
                            "Field \"{name}\" cannot be used in @@id: it must be a required, non-list scalar or enum field"
                        ),
                    );
                }
            }
        }
    }

    let unique_field = fields
        .iter()
        .any(|f| f.field.has_attribute("@unique") && is_identifying(env, f));
    let unique_composite = attributes
        .iter()
        .filter(|a| a.attribute.name.as_str() == "@@unique")
        .any(|a| {
            let names = field_reference_names(a.attribute);
            !names.is_empty()
                && names.iter().all(|n| {
                    env.field(model, n)
                        .map(|f| is_identifying(env, f))
                        .unwrap_or(false)
                })
        });
    if id_fields.is_empty() && model_ids.is_empty() && !unique_field && !unique_composite {
        diagnostics.error(
            DiagnosticKind::Structural,
            model.name.span,
            "Model must have at least one unique criteria. Either mark a single field with `@id`, `@unique` or add a multi field criterion with `@@id([])` or `@@unique([])` to the model.",
        );
    }
}

fn check_declarations(env: Env<'_, '_>, options: &ValidationOptions, diagnostics: &mut Diagnostics) {
    let mut datasources = 0usize;
    for decl in &env.symbols.document().declarations {
        match decl {
            Declaration::DataSource(block) => {
                datasources += 1;
                if datasources > 1 {
                    diagnostics.error(
                        DiagnosticKind::Structural,
                        block.name.span,
                        "Multiple datasource declarations are not allowed",
                    );
                }
                check_datasource(block, diagnostics);
            }
            Declaration::Plugin(block) => {
                if block
                    .field("provider")
                    .and_then(|f| f.value.as_string_literal())
                    .is_none()
                {
                    diagnostics.error(
                        DiagnosticKind::Structural,
                        block.name.span,
                        format!("Plugin \"{}\" must declare a \"provider\" string", block.name),
                    );
                }
            }
            Declaration::Enum(decl) => check_enum(decl, diagnostics),
            _ => {}
        }
    }
    if options.require_datasource && datasources == 0 {
        diagnostics.error(
            DiagnosticKind::Structural,
            Span::default(),
            "A datasource declaration is required",
        );
    }
}

fn check_datasource(block: &ConfigBlock, diagnostics: &mut Diagnostics) {
    match block.field("provider") {
        None => diagnostics.error(
            DiagnosticKind::Structural,
            block.name.span,
            format!("Datasource \"{}\" must declare a \"provider\"", block.name),
        ),
        Some(field) => match field.value.as_string_literal() {
            None => diagnostics.error(
                DiagnosticKind::Structural,
                field.value.span,
                "\"provider\" must be a string literal",
            ),
            Some(provider) if !SUPPORTED_PROVIDERS.contains(&provider) => diagnostics.error(
                DiagnosticKind::Structural,
                field.value.span,
                format!(
                    "Provider \"{provider}\" is not supported. Supported providers: {}",
                    SUPPORTED_PROVIDERS.join(", ")
                ),
            ),
            Some(_) => {}
        },
    }

    if block.field("url").is_none() {
        diagnostics.error(
            DiagnosticKind::Structural,
            block.name.span,
            format!("Datasource \"{}\" must declare a \"url\"", block.name),
        );
    }

    for field in &block.fields {
        let name = field.name.as_str();
        if URL_FIELDS.contains(&name) {
            if !is_connection_string(&field.value) {
                diagnostics.error(
                    DiagnosticKind::Structural,
                    field.value.span,
                    format!("\"{name}\" must be a string literal or an env() call"),
                );
            }
        } else if name == "relationMode" {
            let valid = field
                .value
                .as_string_literal()
                .map(|mode| RELATION_MODES.contains(&mode))
                .unwrap_or(false);
            if !valid {
                diagnostics.error(
                    DiagnosticKind::Structural,
                    field.value.span,
                    "\"relationMode\" must be \"foreignKeys\" or \"prisma\"",
                );
            }
        } else if name != "provider" {
            diagnostics.warning(
                DiagnosticKind::Structural,
                field.name.span,
                format!("Unknown datasource field \"{name}\""),
            );
        }
    }
}

/// A string literal, or `env("NAME")`.
fn is_connection_string(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Literal(zmodel_dsl::ast::Literal::String(_)) => true,
        ExprKind::Invocation { function, args } => {
            function.as_str() == "env"
                && args.len() == 1
                && args[0].name().is_none()
                && args[0].value().as_string_literal().is_some()
        }
        _ => false,
    }
}

fn check_enum(decl: &EnumDecl, diagnostics: &mut Diagnostics) {
    if decl.members.is_empty() {
        diagnostics.error(
            DiagnosticKind::Structural,
            decl.name.span,
            format!("Enum \"{}\" must have at least one member", decl.name),
        );
    }
    let mut seen = HashSet::new();
    for member in &decl.members {
        if !seen.insert(member.name.as_str()) {
            diagnostics.error(
                DiagnosticKind::Structural,
                member.name.span,
                format!("Duplicated declaration name \"{}\"", member.name),
            );
        }
    }
}
