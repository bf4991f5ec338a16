//! Expression type checker.
//!
//! Types form a small closed set ([`TyKind`]); an expression that fails to
//! check is reported once and typed as `Any`, so one mistake does not cascade
//! into its parents. Identifier lookup goes through the shared
//! [`ScopeStack`](crate::resolver::ScopeStack).

use zmodel_dsl::ast::{
    Argument, BinaryOp, DataModel, EnumDecl, Expr, ExprKind, Field, FunctionDecl, Ident,
    Literal, ScalarKind, Span, TypeSpec, UnaryOp,
};

use crate::diagnostic::{DiagnosticKind, Diagnostics};
use crate::resolver::{Binding, Env, Frame, LinkError, RefKind, ScopeStack, PRINCIPAL_MODEL};
use crate::symbols::FieldType;

#[derive(Debug, Clone, Copy)]
pub enum TyKind<'d> {
    Scalar(ScalarKind),
    Enum(&'d EnumDecl),
    Model(&'d DataModel),
    Null,
    Any,
    Unsupported,
}

#[derive(Debug, Clone, Copy)]
pub struct Ty<'d> {
    pub kind: TyKind<'d>,
    pub array: bool,
}

impl<'d> Ty<'d> {
    pub fn any() -> Self {
        Self {
            kind: TyKind::Any,
            array: false,
        }
    }

    pub fn scalar(kind: ScalarKind) -> Self {
        Self {
            kind: TyKind::Scalar(kind),
            array: false,
        }
    }

    pub fn boolean() -> Self {
        Self::scalar(ScalarKind::Boolean)
    }

    pub fn model(model: &'d DataModel) -> Self {
        Self {
            kind: TyKind::Model(model),
            array: false,
        }
    }

    pub fn from_field_type(ty: FieldType<'d>, array: bool) -> Self {
        let kind = match ty {
            FieldType::Scalar(kind) => TyKind::Scalar(kind),
            FieldType::Enum(e) => TyKind::Enum(e),
            FieldType::Model(m) => TyKind::Model(m),
            FieldType::Unsupported => TyKind::Unsupported,
            FieldType::Builtin(zmodel_dsl::ast::BuiltinType::Null) => TyKind::Null,
            FieldType::Builtin(_) | FieldType::Unresolved => TyKind::Any,
        };
        Self { kind, array }
    }

    pub fn is_any(&self) -> bool {
        matches!(self.kind, TyKind::Any)
    }

    pub fn is_boolean_like(&self) -> bool {
        self.is_any() || (!self.array && matches!(self.kind, TyKind::Scalar(ScalarKind::Boolean)))
    }

    fn is_numeric_like(&self) -> bool {
        self.is_any() || (!self.array && matches!(self.kind, TyKind::Scalar(k) if k.is_numeric()))
    }

    fn is_datetime(&self) -> bool {
        !self.array && matches!(self.kind, TyKind::Scalar(ScalarKind::DateTime))
    }

    /// The model of a single (non-list) model-typed value.
    pub fn as_model(&self) -> Option<&'d DataModel> {
        match self.kind {
            TyKind::Model(m) if !self.array => Some(m),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        let base = match self.kind {
            TyKind::Scalar(kind) => kind.as_str().to_string(),
            TyKind::Enum(e) => e.name.name.clone(),
            TyKind::Model(m) => m.name.name.clone(),
            TyKind::Null => "Null".to_string(),
            TyKind::Any => "Any".to_string(),
            TyKind::Unsupported => "Unsupported".to_string(),
        };
        if self.array {
            format!("{base}[]")
        } else {
            base
        }
    }
}

/// Whether a value of type `value` may flow into a slot of type `target`.
///
/// `string_literal` enables the literal-only coercions (a string literal is
/// accepted for `DateTime` and `Bytes`).
pub fn assignable(target: &Ty<'_>, value: &Ty<'_>, string_literal: bool) -> bool {
    if value.is_any() || matches!(value.kind, TyKind::Null) {
        return true;
    }
    if target.is_any() {
        return !target.array || value.array;
    }
    if target.array != value.array {
        return false;
    }
    match (target.kind, value.kind) {
        (TyKind::Scalar(t), TyKind::Scalar(v)) => {
            t == v
                || (v == ScalarKind::Int
                    && matches!(t, ScalarKind::BigInt | ScalarKind::Float | ScalarKind::Decimal))
                || (v == ScalarKind::Float && t == ScalarKind::Decimal)
                || (string_literal
                    && v == ScalarKind::String
                    && matches!(t, ScalarKind::DateTime | ScalarKind::Bytes))
        }
        (TyKind::Enum(t), TyKind::Enum(v)) => t.name == v.name,
        (TyKind::Model(t), TyKind::Model(v)) => t.name == v.name,
        _ => false,
    }
}

/// Whether `==`/`!=` may compare the two types.
fn comparable(left: &Ty<'_>, right: &Ty<'_>) -> bool {
    let loose = |t: &Ty<'_>| t.is_any() || matches!(t.kind, TyKind::Null);
    if loose(left) || loose(right) {
        return true;
    }
    if left.array != right.array {
        return false;
    }
    match (left.kind, right.kind) {
        (TyKind::Scalar(a), TyKind::Scalar(b)) => a == b || (a.is_numeric() && b.is_numeric()),
        (TyKind::Enum(a), TyKind::Enum(b)) => a.name == b.name,
        (TyKind::Model(a), TyKind::Model(b)) => a.name == b.name,
        _ => false,
    }
}

pub struct ExprChecker<'c, 'd> {
    env: Env<'c, 'd>,
    diagnostics: &'c mut Diagnostics,
    allow_future: bool,
}

impl<'c, 'd> ExprChecker<'c, 'd> {
    pub fn new(env: Env<'c, 'd>, diagnostics: &'c mut Diagnostics) -> Self {
        Self {
            env,
            diagnostics,
            allow_future: false,
        }
    }

    /// Permit `future()` (policy rules that only cover `update`).
    pub fn allow_future(mut self, allow: bool) -> Self {
        self.allow_future = allow;
        self
    }

    fn error(&mut self, span: Span, message: impl Into<String>) {
        self.diagnostics
            .error(DiagnosticKind::Expression, span, message);
    }

    fn unresolved(&mut self, kind: RefKind, ident: &Ident) {
        self.diagnostics.push(LinkError::new(kind, ident).into());
    }

    pub fn type_of_spec(&self, spec: &TypeSpec) -> Ty<'d> {
        Ty::from_field_type(self.env.resolve_type(spec), spec.is_array)
    }

    fn field_ty(&mut self, field: &'d Field, span: Span) -> Ty<'d> {
        match self.env.field_type(field) {
            FieldType::Unsupported => {
                self.error(
                    span,
                    "Field of \"Unsupported\" type cannot be used in expressions",
                );
                Ty::any()
            }
            other => Ty::from_field_type(other, field.ty.is_array),
        }
    }

    pub fn check(&mut self, expr: &'d Expr, scope: &mut ScopeStack<'d>) -> Ty<'d> {
        match &expr.kind {
            ExprKind::Literal(literal) => match literal {
                Literal::String(_) => Ty::scalar(ScalarKind::String),
                Literal::Number(text) if text.contains('.') => Ty::scalar(ScalarKind::Float),
                Literal::Number(_) => Ty::scalar(ScalarKind::Int),
                Literal::Boolean(_) => Ty::boolean(),
                Literal::Null => Ty {
                    kind: TyKind::Null,
                    array: false,
                },
            },
            ExprKind::This => match scope.this_model() {
                Some((_, model)) => Ty::model(model),
                None => {
                    self.error(expr.span, "\"this\" can only be used inside a model");
                    Ty::any()
                }
            },
            ExprKind::Reference(ident) => self.check_reference(ident, scope),
            ExprKind::MemberAccess { object, member } => {
                let object_ty = self.check(object, scope);
                self.check_member(&object_ty, member)
            }
            ExprKind::Unary { op, operand } => {
                let ty = self.check(operand, scope);
                match op {
                    UnaryOp::Not => {
                        if !ty.is_boolean_like() {
                            self.error(expr.span, "Operand of \"!\" must be a Boolean");
                        }
                        Ty::boolean()
                    }
                    UnaryOp::Negate => {
                        if !ty.is_numeric_like() {
                            self.error(expr.span, "Operand of \"-\" must be numeric");
                            return Ty::any();
                        }
                        ty
                    }
                }
            }
            ExprKind::Binary { op, left, right } => {
                let left_ty = self.check(left, scope);
                let right_ty = self.check(right, scope);
                self.check_binary(*op, &left_ty, &right_ty, expr.span)
            }
            ExprKind::Invocation { function, args } => {
                self.check_invocation(function, args, scope)
            }
            ExprKind::Array(items) => {
                let mut element: Option<Ty<'d>> = None;
                for item in items {
                    let ty = self.check(item, scope);
                    element = Some(match element {
                        None => ty,
                        Some(prev) if assignable(&prev, &ty, false) => prev,
                        Some(prev) if assignable(&ty, &prev, false) => ty,
                        Some(_) => Ty::any(),
                    });
                }
                let element = element.unwrap_or_else(Ty::any);
                if element.array {
                    return Ty {
                        kind: TyKind::Any,
                        array: true,
                    };
                }
                Ty {
                    kind: element.kind,
                    array: true,
                }
            }
            ExprKind::CollectionPredicate {
                collection,
                condition,
                ..
            } => {
                let collection_ty = self.check(collection, scope);
                match collection_ty.kind {
                    TyKind::Model(model) if collection_ty.array => {
                        scope.push(Frame::Element(model));
                        let condition_ty = self.check(condition, scope);
                        scope.pop();
                        if !condition_ty.is_boolean_like() {
                            self.error(
                                condition.span,
                                "Collection predicate condition must be a Boolean expression",
                            );
                        }
                    }
                    TyKind::Any => {}
                    _ => self.error(
                        collection.span,
                        "collection predicate can only be used on an array of model type",
                    ),
                }
                Ty::boolean()
            }
        }
    }

    fn check_reference(&mut self, ident: &'d Ident, scope: &ScopeStack<'d>) -> Ty<'d> {
        match scope.lookup(self.env, ident.as_str()) {
            Some(Binding::Param { param, .. }) => self.type_of_spec(&param.ty),
            Some(Binding::Field { field, .. }) => self.field_ty(field, ident.span),
            Some(Binding::EnumMember { decl, .. }) => Ty {
                kind: TyKind::Enum(decl),
                array: false,
            },
            None => {
                self.unresolved(RefKind::ReferenceTarget, ident);
                Ty::any()
            }
        }
    }

    fn check_member(&mut self, object: &Ty<'d>, member: &'d Ident) -> Ty<'d> {
        match object.kind {
            TyKind::Any => Ty::any(),
            TyKind::Model(model) if !object.array => match self.env.field(model, member.as_str()) {
                Some(field) => self.field_ty(field.field, member.span),
                None => {
                    self.unresolved(RefKind::DataModelField, member);
                    Ty::any()
                }
            },
            TyKind::Model(_) => {
                self.error(
                    member.span,
                    format!(
                        "Member \"{member}\" cannot be accessed on a list; use a collection predicate"
                    ),
                );
                Ty::any()
            }
            _ => {
                self.error(
                    member.span,
                    format!(
                        "Member access requires a model-typed operand, found \"{}\"",
                        object.describe()
                    ),
                );
                Ty::any()
            }
        }
    }

    fn check_binary(&mut self, op: BinaryOp, left: &Ty<'d>, right: &Ty<'d>, span: Span) -> Ty<'d> {
        let symbol = op.symbol();
        if op.is_logical() {
            if !left.is_boolean_like() || !right.is_boolean_like() {
                self.error(span, format!("Operands of \"{symbol}\" must be Boolean"));
            }
            return Ty::boolean();
        }
        if op.is_arithmetic() {
            if !left.is_numeric_like() || !right.is_numeric_like() {
                self.error(span, format!("Operands of \"{symbol}\" must be numeric"));
                return Ty::any();
            }
            return match (left.kind, right.kind) {
                (TyKind::Any, _) | (_, TyKind::Any) => Ty::any(),
                (TyKind::Scalar(a), TyKind::Scalar(b)) if a == b => Ty::scalar(a),
                (TyKind::Scalar(ScalarKind::Decimal), _) | (_, TyKind::Scalar(ScalarKind::Decimal)) => {
                    Ty::scalar(ScalarKind::Decimal)
                }
                _ => Ty::scalar(ScalarKind::Float),
            };
        }
        if op.is_relational() {
            let ok = (left.is_numeric_like() && right.is_numeric_like())
                || ((left.is_datetime() || left.is_any()) && (right.is_datetime() || right.is_any()));
            if !ok {
                self.error(
                    span,
                    format!("Operands of \"{symbol}\" must be numeric or DateTime"),
                );
            }
            return Ty::boolean();
        }
        if !comparable(left, right) {
            self.error(
                span,
                format!(
                    "Incompatible operand types \"{}\" and \"{}\" for \"{symbol}\"",
                    left.describe(),
                    right.describe()
                ),
            );
        }
        Ty::boolean()
    }

    fn check_invocation(
        &mut self,
        function: &'d Ident,
        args: &'d [Argument],
        scope: &mut ScopeStack<'d>,
    ) -> Ty<'d> {
        match function.as_str() {
            "auth" => {
                return match self.env.principal() {
                    Some(principal) => Ty::model(principal),
                    None => {
                        self.error(
                            function.span,
                            format!(
                                "auth() cannot be resolved because no \"{PRINCIPAL_MODEL}\" model is defined"
                            ),
                        );
                        Ty::any()
                    }
                };
            }
            "future" => {
                if !self.allow_future {
                    self.error(
                        function.span,
                        "\"future()\" can only be used in \"update\" policy rules",
                    );
                }
                return match scope.record_model() {
                    Some(model) => Ty::model(model),
                    None => {
                        self.error(function.span, "\"future()\" can only be used inside a model");
                        Ty::any()
                    }
                };
            }
            _ => {}
        }

        let Some(decl) = self.env.symbols.function(function.as_str()) else {
            self.unresolved(RefKind::FunctionDecl, function);
            for arg in args {
                self.check(arg.value(), scope);
            }
            return Ty::any();
        };
        self.check_call_arguments(decl, function, args, scope);
        self.type_of_spec(&decl.return_type)
    }

    fn check_call_arguments(
        &mut self,
        decl: &'d FunctionDecl,
        function: &'d Ident,
        args: &'d [Argument],
        scope: &mut ScopeStack<'d>,
    ) {
        let required = decl.params.iter().filter(|p| !p.ty.is_optional).count();
        if args.len() > decl.params.len() {
            self.error(
                function.span,
                format!(
                    "Function \"{function}\" expects at most {} argument(s) but {} were provided",
                    decl.params.len(),
                    args.len()
                ),
            );
        } else if args.len() < required {
            self.error(
                function.span,
                format!(
                    "Function \"{function}\" requires {required} argument(s) but {} were provided",
                    args.len()
                ),
            );
        }
        for (i, arg) in args.iter().enumerate() {
            if let Some(name) = arg.name() {
                self.error(
                    name.span,
                    format!("Arguments of function \"{function}\" cannot be named"),
                );
            }
            let value = arg.value();
            let ty = self.check(value, scope);
            let Some(param) = decl.params.get(i) else {
                continue;
            };
            let target = self.type_of_spec(&param.ty);
            if !assignable(&target, &ty, value.as_string_literal().is_some()) {
                self.error(
                    value.span,
                    format!(
                        "Argument of type \"{}\" is not assignable to parameter \"{}\" of function \"{function}\"",
                        ty.describe(),
                        param.name
                    ),
                );
            }
        }
    }

    /// Check a function body with its parameters as the only scope.
    pub fn check_function(&mut self, function: &'d FunctionDecl) {
        let Some(body) = &function.body else {
            return;
        };
        let mut scope = ScopeStack::with(Frame::Function(&function.params));
        let ty = self.check(body, &mut scope);
        let expected = self.type_of_spec(&function.return_type);
        if !assignable(&expected, &ty, body.as_string_literal().is_some()) {
            self.error(
                body.span,
                format!(
                    "Body of function \"{}\" has type \"{}\", which is not assignable to return type \"{}\"",
                    function.name,
                    ty.describe(),
                    expected.describe()
                ),
            );
        }
    }
}

/// Type of `expr` in `scope`, discarding diagnostics.
pub fn infer_type<'d>(
    env: Env<'_, 'd>,
    expr: &'d Expr,
    scope: &mut ScopeStack<'d>,
) -> Ty<'d> {
    let mut scratch = Diagnostics::new();
    ExprChecker::new(env, &mut scratch)
        .allow_future(true)
        .check(expr, scope)
}
