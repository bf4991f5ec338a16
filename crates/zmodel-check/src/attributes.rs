//! Attribute argument binding and checking.
//!
//! [`bind_arguments`] is pure: it maps the arguments of one application onto
//! the parameters of its declaration and reports every binding error at once.
//! [`check_attributes`] walks the document, binds each application and then
//! type-checks the bound values against the declared parameter types.

use thiserror::Error;
use zmodel_dsl::ast::{
    Argument, AttributeApp, AttributeDecl, BuiltinType, DataModel, Expr, ExprKind, Field, Ident,
    ParamSpec, ScalarKind, Span, TypeName,
};

use crate::diagnostic::{Diagnostic, DiagnosticKind, Diagnostics, Severity};
use crate::expressions::{assignable, ExprChecker, Ty};
use crate::policy::PolicyOperation;
use crate::resolver::{field_reference_name, Env, Frame, LinkError, RefKind, ScopeStack};
use crate::symbols::FieldType;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindError {
    #[error("Unexpected unnamed argument for attribute \"{attribute}\"")]
    UnexpectedUnnamed { attribute: String, span: Span },
    #[error("Attribute \"{attribute}\" doesn't have a parameter named \"{name}\"")]
    UnknownParameter {
        attribute: String,
        name: String,
        span: Span,
    },
    #[error("Parameter \"{param}\" is already provided for attribute \"{attribute}\"")]
    AlreadyProvided {
        attribute: String,
        param: String,
        span: Span,
    },
    #[error("Required parameter not provided: \"{param}\" of attribute \"{attribute}\"")]
    MissingRequired {
        attribute: String,
        param: String,
        span: Span,
    },
    #[error("Value is not assignable to parameter \"{param}\" of attribute \"{attribute}\"")]
    NotAssignable {
        attribute: String,
        param: String,
        span: Span,
    },
    #[error("attribute \"{attribute}\" cannot be used on this type of field")]
    NotApplicable { attribute: String, span: Span },
}

impl BindError {
    pub fn span(&self) -> Span {
        match self {
            BindError::UnexpectedUnnamed { span, .. }
            | BindError::UnknownParameter { span, .. }
            | BindError::AlreadyProvided { span, .. }
            | BindError::MissingRequired { span, .. }
            | BindError::NotAssignable { span, .. }
            | BindError::NotApplicable { span, .. } => *span,
        }
    }

    pub fn attribute(&self) -> &str {
        match self {
            BindError::UnexpectedUnnamed { attribute, .. }
            | BindError::UnknownParameter { attribute, .. }
            | BindError::AlreadyProvided { attribute, .. }
            | BindError::MissingRequired { attribute, .. }
            | BindError::NotAssignable { attribute, .. }
            | BindError::NotApplicable { attribute, .. } => attribute,
        }
    }
}

impl From<BindError> for Diagnostic {
    fn from(err: BindError) -> Self {
        Diagnostic {
            message: err.to_string(),
            severity: Severity::Error,
            kind: DiagnosticKind::AttributeBinding,
            span: err.span(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BoundArgument<'a> {
    pub param: &'a ParamSpec,
    pub value: &'a Expr,
    pub span: Span,
}

/// Arguments of one application, in parameter declaration order.
#[derive(Debug, Clone, Default)]
pub struct BoundArguments<'a> {
    bindings: Vec<BoundArgument<'a>>,
}

impl<'a> BoundArguments<'a> {
    pub fn get(&self, param: &str) -> Option<&'a Expr> {
        self.bindings
            .iter()
            .find(|b| b.param.name.name == param)
            .map(|b| b.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BoundArgument<'a>> {
        self.bindings.iter()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Bind the arguments of `app` to the parameters of `decl`.
///
/// Named arguments bind by name. An unnamed argument binds to the earliest
/// positional (`_`-marked) parameter that is still unbound. When none is left
/// and one of them was bound by name, the argument is reported as supplying
/// that parameter twice.
pub fn bind_arguments<'a>(
    decl: &'a AttributeDecl,
    app: &'a AttributeApp,
) -> Result<BoundArguments<'a>, Vec<BindError>> {
    let attribute = app.name.name.clone();
    let mut slots: Vec<Option<&'a Argument>> = vec![None; decl.params.len()];
    let mut errors = Vec::new();

    for arg in &app.args {
        let index = match arg.name() {
            Some(name) => match decl.params.iter().position(|p| p.name.name == name.name) {
                Some(index) => index,
                None => {
                    errors.push(BindError::UnknownParameter {
                        attribute: attribute.clone(),
                        name: name.name.clone(),
                        span: name.span,
                    });
                    continue;
                }
            },
            None => {
                let next = decl
                    .params
                    .iter()
                    .enumerate()
                    .position(|(i, p)| p.positional && slots[i].is_none());
                match next {
                    Some(index) => index,
                    None => {
                        // A positional slot claimed by name means this value supplies it again.
                        let claimed = decl.params.iter().zip(&slots).find(|(p, slot)| {
                            p.positional && slot.is_some_and(|a| a.name().is_some())
                        });
                        errors.push(match claimed {
                            Some((param, _)) => BindError::AlreadyProvided {
                                attribute: attribute.clone(),
                                param: param.name.name.clone(),
                                span: arg.span(),
                            },
                            None => BindError::UnexpectedUnnamed {
                                attribute: attribute.clone(),
                                span: arg.span(),
                            },
                        });
                        continue;
                    }
                }
            }
        };
        if slots[index].is_some() {
            errors.push(BindError::AlreadyProvided {
                attribute: attribute.clone(),
                param: decl.params[index].name.name.clone(),
                span: arg.span(),
            });
            continue;
        }
        slots[index] = Some(arg);
    }

    let mut bindings = Vec::new();
    for (param, slot) in decl.params.iter().zip(slots) {
        match slot {
            Some(arg) => bindings.push(BoundArgument {
                param,
                value: arg.value(),
                span: arg.span(),
            }),
            None if param.is_required() => errors.push(BindError::MissingRequired {
                attribute: attribute.clone(),
                param: param.name.name.clone(),
                span: app.span,
            }),
            None => {}
        }
    }

    if errors.is_empty() {
        Ok(BoundArguments { bindings })
    } else {
        Err(errors)
    }
}

/// One entry of a field-reference list: `a` or `a(sort: Desc, length: 10)`.
#[derive(Debug, Clone)]
pub struct FieldReferenceItem<'a> {
    pub field: &'a Ident,
    pub options: Vec<(&'a Ident, &'a Expr)>,
}

/// Entries of a field-reference list argument such as `[a(sort: Asc), b]`.
pub fn field_reference_items(value: &Expr) -> Vec<FieldReferenceItem<'_>> {
    let items: Vec<&Expr> = match &value.kind {
        ExprKind::Array(items) => items.iter().collect(),
        _ => vec![value],
    };
    items
        .into_iter()
        .filter_map(|item| {
            let field = field_reference_name(item)?;
            let options = match &item.kind {
                ExprKind::Invocation { args, .. } => args
                    .iter()
                    .filter_map(|a| a.name().map(|n| (n, a.value())))
                    .collect(),
                _ => Vec::new(),
            };
            Some(FieldReferenceItem { field, options })
        })
        .collect()
}

// ============================================================================
// Checking
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Target<'d> {
    Field {
        model: &'d DataModel,
        field: &'d Field,
    },
    Model(&'d DataModel),
    /// Enum members, enum bodies and attribute declarations: no record in scope.
    Detached,
}

impl<'d> Target<'d> {
    fn model(&self) -> Option<&'d DataModel> {
        match *self {
            Target::Field { model, .. } | Target::Model(model) => Some(model),
            Target::Detached => None,
        }
    }

    fn scope(&self) -> ScopeStack<'d> {
        match self.model() {
            Some(model) => ScopeStack::with(Frame::Record(model)),
            None => ScopeStack::new(),
        }
    }
}

/// Bind and type-check every attribute application in the document.
pub fn check_attributes(env: Env<'_, '_>, diagnostics: &mut Diagnostics) {
    let before = diagnostics.len();
    let mut checker = AttributeChecker { env, diagnostics };
    for model in env.symbols.models() {
        for field in &model.fields {
            for app in &field.attributes {
                checker.check(Target::Field { model, field }, app);
            }
        }
        for app in &model.attributes {
            checker.check(Target::Model(model), app);
        }
    }
    for decl in env.symbols.document().enums() {
        for member in &decl.members {
            for app in &member.attributes {
                checker.check(Target::Detached, app);
            }
        }
        for app in &decl.attributes {
            checker.check(Target::Detached, app);
        }
    }
    for decl in env.symbols.document().attribute_decls() {
        for app in &decl.meta {
            checker.check(Target::Detached, app);
        }
    }
    tracing::debug!(
        diagnostics = checker.diagnostics.len() - before,
        "checked attribute applications"
    );
}

struct AttributeChecker<'c, 'd> {
    env: Env<'c, 'd>,
    diagnostics: &'c mut Diagnostics,
}

impl<'c, 'd> AttributeChecker<'c, 'd> {
    fn not_assignable(&mut self, app: &AttributeApp, param: &str, span: Span) {
        self.diagnostics.push(
            BindError::NotAssignable {
                attribute: app.name.name.clone(),
                param: param.to_string(),
                span,
            }
            .into(),
        );
    }

    fn error(&mut self, span: Span, message: impl Into<String>) {
        self.diagnostics
            .error(DiagnosticKind::AttributeBinding, span, message);
    }

    fn check(&mut self, target: Target<'d>, app: &'d AttributeApp) {
        // Unknown attribute names were reported by the link pass.
        let Some(decl) = self.env.symbols.attribute(app.name.as_str()) else {
            return;
        };
        let bound = match bind_arguments(decl, app) {
            Ok(bound) => bound,
            Err(errors) => {
                self.diagnostics.extend(errors.into_iter().map(Diagnostic::from));
                return;
            }
        };
        if let Target::Field { field, .. } = target {
            if !self.applicable(decl, field) {
                self.diagnostics.push(
                    BindError::NotApplicable {
                        attribute: app.name.name.clone(),
                        span: app.name.span,
                    }
                    .into(),
                );
                return;
            }
        }
        match app.name.as_str() {
            "@@allow" | "@@deny" | "@allow" | "@deny" => self.check_policy(target, app, &bound),
            "@@delegate" => {
                if let Some(model) = target.model() {
                    self.check_delegate(model, app, &bound);
                }
            }
            _ => {
                for binding in bound.iter() {
                    self.check_value(target, app, binding);
                }
            }
        }
    }

    /// Honour `@@@targetField([...])` on the declaration.
    fn applicable(&self, decl: &AttributeDecl, field: &Field) -> bool {
        let Some(first) = decl
            .meta("@@@targetField")
            .and_then(|meta| meta.args.first())
        else {
            return true;
        };
        let ExprKind::Array(allowed) = &first.value().kind else {
            return true;
        };
        let Some(kind) = target_field_kind(self.env.field_type(field), field.ty.is_array) else {
            return false;
        };
        allowed
            .iter()
            .filter_map(|e| e.as_reference())
            .any(|i| i.as_str() == kind)
    }

    fn check_value(&mut self, target: Target<'d>, app: &'d AttributeApp, binding: &BoundArgument<'d>) {
        let param = binding.param;
        let expected = match &param.ty.name {
            TypeName::Builtin(BuiltinType::FieldReference) => {
                self.check_field_references(target.model(), app, binding);
                return;
            }
            TypeName::Builtin(BuiltinType::TransitiveFieldReference) => {
                let related = match target {
                    Target::Field { field, .. } => self.env.field_type(field).as_model(),
                    _ => None,
                };
                self.check_field_references(related, app, binding);
                return;
            }
            TypeName::Builtin(BuiltinType::ContextType) => match target {
                Target::Field { field, .. } => {
                    Ty::from_field_type(self.env.field_type(field), field.ty.is_array)
                }
                _ => Ty::any(),
            },
            _ => Ty::from_field_type(self.env.resolve_type(&param.ty), param.ty.is_array),
        };
        let mut scope = target.scope();
        let actual = ExprChecker::new(self.env, &mut *self.diagnostics).check(binding.value, &mut scope);
        let literal = binding.value.as_string_literal().is_some();
        if !assignable(&expected, &actual, literal) {
            self.not_assignable(app, param.name.as_str(), binding.value.span);
        }
    }

    /// Entries must name fields of `model`; `sort`/`length` are the only
    /// per-entry options.
    fn check_field_references(
        &mut self,
        model: Option<&'d DataModel>,
        app: &AttributeApp,
        binding: &BoundArgument<'d>,
    ) {
        let param = binding.param.name.as_str();
        let value = binding.value;
        let entries: Vec<&Expr> = match (&value.kind, binding.param.ty.is_array) {
            (ExprKind::Array(items), true) => items.iter().collect(),
            (_, false) => vec![value],
            _ => {
                self.not_assignable(app, param, value.span);
                return;
            }
        };
        let Some(model) = model else {
            return;
        };
        for entry in entries {
            let Some(name) = field_reference_name(entry) else {
                self.not_assignable(app, param, entry.span);
                continue;
            };
            if self.env.field(model, name.as_str()).is_none() {
                self.diagnostics
                    .push(LinkError::new(RefKind::DataModelField, name).into());
            }
            if let ExprKind::Invocation { args, .. } = &entry.kind {
                for arg in args {
                    self.check_reference_option(app, arg);
                }
            }
        }
    }

    fn check_reference_option(&mut self, app: &AttributeApp, arg: &Argument) {
        let value = arg.value();
        match arg.name().map(|n| n.as_str()) {
            Some("sort") => {
                let ok = value.as_reference().is_some_and(|member| {
                    self.env
                        .symbols
                        .enum_decl("SortOrder")
                        .is_some_and(|e| e.member(member.as_str()).is_some())
                });
                if !ok {
                    self.not_assignable(app, "sort", value.span);
                }
            }
            Some("length") => {
                if !matches!(&value.kind, ExprKind::Literal(zmodel_dsl::ast::Literal::Number(n)) if !n.contains('.'))
                {
                    self.not_assignable(app, "length", value.span);
                }
            }
            Some(other) => self.error(
                arg.span(),
                format!("Unexpected option \"{other}\" in field reference"),
            ),
            None => self.error(arg.span(), "Field reference options must be named"),
        }
    }

    fn check_policy(&mut self, target: Target<'d>, app: &'d AttributeApp, bound: &BoundArguments<'d>) {
        let field_level = matches!(target, Target::Field { .. });
        let mut update_only = false;
        if let Some(operation) = bound.get("operation") {
            match operation.as_string_literal() {
                Some(text) => match PolicyOperation::parse_list(text, field_level) {
                    Ok(ops) => update_only = ops == [PolicyOperation::Update],
                    Err(bad) => {
                        let scope = if field_level { "field" } else { "model" };
                        self.error(
                            operation.span,
                            format!("Invalid policy operation \"{bad}\" for a {scope}-level rule"),
                        );
                    }
                },
                None => self.not_assignable(app, "operation", operation.span),
            }
        }
        if let Some(condition) = bound.get("condition") {
            let mut scope = target.scope();
            let ty = ExprChecker::new(self.env, &mut *self.diagnostics)
                .allow_future(update_only)
                .check(condition, &mut scope);
            if !ty.is_boolean_like() {
                self.not_assignable(app, "condition", condition.span);
            }
        }
    }

    /// The discriminator is a String or enum field declared on the base itself.
    fn check_delegate(&mut self, model: &'d DataModel, app: &AttributeApp, bound: &BoundArguments<'d>) {
        let Some(value) = bound.get("discriminator") else {
            return;
        };
        let Some(name) = value.as_reference() else {
            self.not_assignable(app, "discriminator", value.span);
            return;
        };
        let Some(field) = model.field(name.as_str()) else {
            if self.env.field(model, name.as_str()).is_some() {
                self.error(
                    name.span,
                    format!(
                        "Discriminator field \"{name}\" must be declared on model \"{}\"",
                        model.name
                    ),
                );
            } else {
                self.diagnostics
                    .push(LinkError::new(RefKind::DataModelField, name).into());
            }
            return;
        };
        let ok = !field.ty.is_array
            && matches!(
                self.env.field_type(field),
                FieldType::Scalar(ScalarKind::String) | FieldType::Enum(_)
            );
        if !ok {
            self.error(
                name.span,
                format!("Discriminator field \"{name}\" must be of String or enum type"),
            );
        }
    }
}

/// The `AttributeTargetField` member describing a field's shape.
fn target_field_kind(ty: FieldType<'_>, array: bool) -> Option<String> {
    match ty {
        FieldType::Model(_) => Some("ModelField".to_string()),
        _ if array => None,
        FieldType::Scalar(kind) => Some(format!("{}Field", kind.as_str())),
        FieldType::Enum(_) => Some("EnumField".to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stdlib::stdlib;
    use zmodel_dsl::parse_document;

    fn decl(name: &str) -> &'static AttributeDecl {
        stdlib()
            .attribute_decls()
            .find(|d| d.name.as_str() == name)
            .expect("stdlib attribute")
    }

    /// The first model-level attribute of the single model in `src`.
    fn app(src: &str) -> AttributeApp {
        let doc = parse_document(src).expect("parse");
        let model = doc.models().next().expect("model");
        model.attributes[0].clone()
    }

    #[test]
    fn positional_arguments_fill_positional_parameters_in_order() {
        let app = app("model M { x Int @id\n @@allow('read', true) }");
        let bound = bind_arguments(decl("@@allow"), &app).expect("bind");
        assert_eq!(
            bound.get("operation").and_then(|e| e.as_string_literal()),
            Some("read")
        );
        assert!(bound.get("condition").is_some());
    }

    #[test]
    fn named_arguments_bind_regardless_of_position() {
        let app = app("model M { x Int @id\n @@allow(condition: true, 'read') }");
        let bound = bind_arguments(decl("@@allow"), &app).expect("bind");
        assert_eq!(
            bound.get("operation").and_then(|e| e.as_string_literal()),
            Some("read")
        );
    }

    #[test]
    fn reports_every_binding_error() {
        let app = app("model M { x Int @id\n @@index([x], 'a', bogus: 1, map: 'm', map: 'n') }");
        let errors = bind_arguments(decl("@@index"), &app).expect_err("errors");
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        assert_eq!(
            messages,
            vec![
                "Unexpected unnamed argument for attribute \"@@index\"",
                "Attribute \"@@index\" doesn't have a parameter named \"bogus\"",
                "Parameter \"map\" is already provided for attribute \"@@index\"",
            ]
        );
        assert!(errors.iter().all(|e| e.attribute() == "@@index"));
    }

    #[test]
    fn positional_then_named_duplicate_is_rejected() {
        let app = app("model M { x Int @id\n @@allow('read', true, operation: 'all') }");
        let errors = bind_arguments(decl("@@allow"), &app).expect_err("errors");
        assert!(matches!(
            &errors[..],
            [BindError::AlreadyProvided { param, .. }] if param == "operation"
        ));
    }

    #[test]
    fn named_then_positional_duplicate_is_rejected() {
        let doc = parse_document("model M { id Int @id\n n Int @default(value: 1, 2) }").expect("parse");
        let model = doc.models().next().expect("model");
        let app = &model.fields[1].attributes[0];
        let errors = bind_arguments(decl("@default"), app).expect_err("errors");
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        assert_eq!(
            messages,
            vec!["Parameter \"value\" is already provided for attribute \"@default\""]
        );

        let app = self::app("model M { x Int @id\n @@allow(operation: 'read', condition: true, false) }");
        let errors = bind_arguments(decl("@@allow"), &app).expect_err("errors");
        assert!(matches!(
            &errors[..],
            [BindError::AlreadyProvided { param, .. }] if param == "operation"
        ));
    }

    #[test]
    fn missing_required_parameters_are_reported() {
        let app = app("model M { x Int @id\n @@allow('read') }");
        let errors = bind_arguments(decl("@@allow"), &app).expect_err("errors");
        assert_eq!(
            errors[0].to_string(),
            "Required parameter not provided: \"condition\" of attribute \"@@allow\""
        );
    }

    #[test]
    fn field_reference_entries_carry_their_options() {
        let app = app("model M { a Int\n b Int\n @@unique([a(sort: Asc), b]) }");
        let bound = bind_arguments(decl("@@unique"), &app).expect("bind");
        let items = field_reference_items(bound.get("fields").expect("fields"));
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].field.as_str(), "a");
        let (name, value) = items[0].options[0];
        assert_eq!(name.as_str(), "sort");
        assert_eq!(value.as_reference().map(|i| i.as_str()), Some("Asc"));
        assert_eq!(items[1].field.as_str(), "b");
        assert!(items[1].options.is_empty());
    }

    #[test]
    fn target_field_kinds() {
        assert_eq!(
            target_field_kind(FieldType::Scalar(ScalarKind::DateTime), false).as_deref(),
            Some("DateTimeField")
        );
        assert_eq!(target_field_kind(FieldType::Scalar(ScalarKind::String), true), None);
    }
}
