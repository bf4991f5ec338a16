//! Access policies and predicate evaluation.
//!
//! A [`PolicyBundle`] holds the compiled `@@allow`/`@@deny` rules of every
//! concrete model plus the field-level `@allow`/`@deny` rules. Decisions are
//! deny-first: any matching deny rule rejects, otherwise at least one allow
//! rule must pass. Field rules default to allowed when none apply.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use zmodel_dsl::ast::{AttributeApp, DataModel};
use zmodel_dsl::print_expression;

use crate::attributes::bind_arguments;
use crate::compiler::{compile_predicate, ArithmeticOp, CompareOp, CompileError, Operand, Predicate};
use crate::resolver::{Env, Frame, ScopeStack};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyOperation {
    Create,
    Read,
    Update,
    Delete,
}

impl PolicyOperation {
    pub const ALL: [PolicyOperation; 4] = [
        PolicyOperation::Create,
        PolicyOperation::Read,
        PolicyOperation::Update,
        PolicyOperation::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyOperation::Create => "create",
            PolicyOperation::Read => "read",
            PolicyOperation::Update => "update",
            PolicyOperation::Delete => "delete",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == name)
    }

    /// Parse a comma-separated operation list such as `"create,read"` or `"all"`.
    ///
    /// Field-level rules only know `read` and `update`. Returns the first
    /// unrecognised token on failure.
    pub fn parse_list(text: &str, field_level: bool) -> Result<Vec<Self>, String> {
        let mut ops = Vec::new();
        for token in text.split(',').map(str::trim) {
            let expanded: Vec<Self> = match token {
                "all" if field_level => vec![PolicyOperation::Read, PolicyOperation::Update],
                "all" => Self::ALL.to_vec(),
                _ => match Self::from_name(token) {
                    Some(op) if !field_level || op.applies_to_fields() => vec![op],
                    _ => return Err(token.to_string()),
                },
            };
            for op in expanded {
                if !ops.contains(&op) {
                    ops.push(op);
                }
            }
        }
        ops.sort();
        Ok(ops)
    }

    pub fn applies_to_fields(&self) -> bool {
        matches!(self, PolicyOperation::Read | PolicyOperation::Update)
    }
}

impl std::fmt::Display for PolicyOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub kind: PolicyKind,
    pub operations: Vec<PolicyOperation>,
    pub predicate: Predicate,
    /// The condition as written, in canonical form.
    pub source: String,
}

impl PolicyRule {
    pub fn covers(&self, op: PolicyOperation) -> bool {
        self.operations.contains(&op)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPolicy {
    pub model: String,
    pub rules: Vec<PolicyRule>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub field_rules: BTreeMap<String, Vec<PolicyRule>>,
}

impl ModelPolicy {
    /// Deny rules win; without a passing allow rule the operation is denied.
    pub fn is_allowed(&self, op: PolicyOperation, ctx: &EvalContext<'_>) -> Result<bool, EvalError> {
        decide(&self.rules, op, ctx, false)
    }

    /// Like [`ModelPolicy::is_allowed`], but a field without applicable rules is allowed.
    pub fn is_field_allowed(
        &self,
        field: &str,
        op: PolicyOperation,
        ctx: &EvalContext<'_>,
    ) -> Result<bool, EvalError> {
        match self.field_rules.get(field) {
            Some(rules) => decide(rules, op, ctx, true),
            None => Ok(true),
        }
    }
}

fn decide(
    rules: &[PolicyRule],
    op: PolicyOperation,
    ctx: &EvalContext<'_>,
    allow_when_unguarded: bool,
) -> Result<bool, EvalError> {
    let applicable: Vec<&PolicyRule> = rules.iter().filter(|r| r.covers(op)).collect();
    for rule in applicable.iter().filter(|r| r.kind == PolicyKind::Deny) {
        if rule.predicate.evaluate(ctx)? {
            return Ok(false);
        }
    }
    let mut allows = applicable
        .iter()
        .filter(|r| r.kind == PolicyKind::Allow)
        .peekable();
    if allows.peek().is_none() {
        return Ok(allow_when_unguarded);
    }
    for rule in allows {
        if rule.predicate.evaluate(ctx)? {
            return Ok(true);
        }
    }
    Ok(false)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyBundle {
    pub models: BTreeMap<String, ModelPolicy>,
}

impl PolicyBundle {
    pub fn model(&self, name: &str) -> Option<&ModelPolicy> {
        self.models.get(name)
    }
}

/// Compile the policy rules of every concrete model.
pub fn compile_policies(env: Env<'_, '_>) -> Result<PolicyBundle, CompileError> {
    let mut bundle = PolicyBundle::default();
    for &model in env.hierarchy.models() {
        if model.is_abstract {
            continue;
        }
        let mut policy = ModelPolicy {
            model: model.name.name.clone(),
            ..ModelPolicy::default()
        };
        for attribute in env.hierarchy.attributes(model.name.as_str()) {
            if let Some(rule) = compile_rule(env, model, attribute.attribute, false)? {
                policy.rules.push(rule);
            }
        }
        for field in env.fields(model) {
            for app in &field.field.attributes {
                if let Some(rule) = compile_rule(env, model, app, true)? {
                    policy
                        .field_rules
                        .entry(field.field.name.name.clone())
                        .or_default()
                        .push(rule);
                }
            }
        }
        tracing::debug!(
            model = %model.name,
            rules = policy.rules.len(),
            fields = policy.field_rules.len(),
            "compiled model policy"
        );
        bundle.models.insert(policy.model.clone(), policy);
    }
    Ok(bundle)
}

fn compile_rule<'d>(
    env: Env<'_, 'd>,
    model: &'d DataModel,
    app: &'d AttributeApp,
    field_level: bool,
) -> Result<Option<PolicyRule>, CompileError> {
    let kind = match app.name.as_str().trim_start_matches('@') {
        "allow" => PolicyKind::Allow,
        "deny" => PolicyKind::Deny,
        _ => return Ok(None),
    };
    let Some(decl) = env.symbols.attribute(app.name.as_str()) else {
        return Ok(None);
    };
    let Ok(bound) = bind_arguments(decl, app) else {
        return Ok(None);
    };
    let (Some(operation), Some(condition)) = (bound.get("operation"), bound.get("condition")) else {
        return Ok(None);
    };
    let operations = operation
        .as_string_literal()
        .and_then(|text| PolicyOperation::parse_list(text, field_level).ok())
        .unwrap_or_default();
    let mut scope = ScopeStack::with(Frame::Record(model));
    let predicate = compile_predicate(env, condition, &mut scope)?;
    Ok(Some(PolicyRule {
        kind,
        operations,
        predicate,
        source: print_expression(condition),
    }))
}

// ============================================================================
// Evaluation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("unknown function \"{0}\"")]
    UnknownFunction(String),
    #[error("scope {0} is not bound")]
    UnboundScope(usize),
}

/// Values a predicate reads: the record, the principal and, for updates, the
/// post-update record. Absent principal means an anonymous request.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'v> {
    pub record: &'v Value,
    pub principal: Option<&'v Value>,
    pub future: Option<&'v Value>,
}

impl<'v> EvalContext<'v> {
    pub fn new(record: &'v Value) -> Self {
        Self {
            record,
            principal: None,
            future: None,
        }
    }

    pub fn with_principal(mut self, principal: &'v Value) -> Self {
        self.principal = Some(principal);
        self
    }

    pub fn with_future(mut self, future: &'v Value) -> Self {
        self.future = Some(future);
        self
    }
}

impl Predicate {
    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<bool, EvalError> {
        let mut evaluator = Evaluator {
            ctx,
            scopes: vec![ctx.record.clone()],
        };
        evaluator.predicate(self)
    }
}

struct Evaluator<'a, 'v> {
    ctx: &'a EvalContext<'v>,
    scopes: Vec<Value>,
}

impl Evaluator<'_, '_> {
    fn predicate(&mut self, predicate: &Predicate) -> Result<bool, EvalError> {
        Ok(match predicate {
            Predicate::Const { value } => *value,
            Predicate::Test { operand } => self.operand(operand)?.as_bool().unwrap_or(false),
            Predicate::Not { predicate } => !self.predicate(predicate)?,
            Predicate::And { predicates } => {
                for p in predicates {
                    if !self.predicate(p)? {
                        return Ok(false);
                    }
                }
                true
            }
            Predicate::Or { predicates } => {
                for p in predicates {
                    if self.predicate(p)? {
                        return Ok(true);
                    }
                }
                false
            }
            Predicate::Compare { cmp, left, right } => {
                let left = self.operand(left)?;
                let right = self.operand(right)?;
                compare(*cmp, &left, &right)
            }
            Predicate::Exists {
                collection,
                predicate,
            } => {
                let Value::Array(items) = self.operand(collection)? else {
                    return Ok(false);
                };
                for item in items {
                    self.scopes.push(item);
                    let hit = self.predicate(predicate);
                    self.scopes.pop();
                    if hit? {
                        return Ok(true);
                    }
                }
                false
            }
        })
    }

    fn operand(&mut self, operand: &Operand) -> Result<Value, EvalError> {
        Ok(match operand {
            Operand::Value { value } => value.clone(),
            Operand::Field { scope, path } => {
                let base = self.scopes.get(*scope).ok_or(EvalError::UnboundScope(*scope))?;
                walk(base, path)
            }
            Operand::Principal { path } => match self.ctx.principal {
                Some(principal) => walk(principal, path),
                None => Value::Null,
            },
            Operand::Future { path } => walk(self.ctx.future.unwrap_or(self.ctx.record), path),
            Operand::Arithmetic { arith, left, right } => {
                let left = self.operand(left)?;
                let right = self.operand(right)?;
                arithmetic(*arith, &left, &right)
            }
            Operand::Negate { operand } => match self.operand(operand)? {
                Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                    (Some(i), _) => i.checked_neg().map(Value::from).unwrap_or(Value::Null),
                    (None, Some(f)) => Value::from(-f),
                    _ => Value::Null,
                },
                _ => Value::Null,
            },
            Operand::List { items } => Value::Array(
                items
                    .iter()
                    .map(|item| self.operand(item))
                    .collect::<Result<_, _>>()?,
            ),
            Operand::Call { function, args } => {
                let args: Vec<Value> = args
                    .iter()
                    .map(|arg| self.operand(arg))
                    .collect::<Result<_, _>>()?;
                call(function, &args)?
            }
            Operand::Predicate { predicate } => Value::Bool(self.predicate(predicate)?),
        })
    }
}

fn walk(base: &Value, path: &[String]) -> Value {
    let mut current = base;
    for segment in path {
        match current.get(segment) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Integers compare exactly; `f64` only when either side is a float.
fn number_ordering(a: &serde_json::Number, b: &serde_json::Number) -> Option<std::cmp::Ordering> {
    let integer = |n: &serde_json::Number| {
        n.as_i64()
            .map(i128::from)
            .or_else(|| n.as_u64().map(i128::from))
    };
    match (integer(a), integer(b)) {
        (Some(a), Some(b)) => Some(a.cmp(&b)),
        _ => a.as_f64().zip(b.as_f64()).and_then(|(a, b)| a.partial_cmp(&b)),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            number_ordering(a, b) == Some(std::cmp::Ordering::Equal)
        }
        _ => match (timestamp(left), timestamp(right)) {
            (Some(a), Some(b)) => a == b,
            _ => left == right,
        },
    }
}

fn compare(cmp: CompareOp, left: &Value, right: &Value) -> bool {
    use std::cmp::Ordering;

    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => number_ordering(a, b),
        _ => timestamp(left).zip(timestamp(right)).map(|(a, b)| a.cmp(&b)),
    };
    match cmp {
        CompareOp::Eq => values_equal(left, right),
        CompareOp::Ne => !values_equal(left, right),
        CompareOp::Lt => ordering == Some(Ordering::Less),
        CompareOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        CompareOp::Gt => ordering == Some(Ordering::Greater),
        CompareOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
    }
}

fn arithmetic(op: ArithmeticOp, left: &Value, right: &Value) -> Value {
    let (Value::Number(a), Value::Number(b)) = (left, right) else {
        return Value::Null;
    };
    if let (Some(a), Some(b), false) = (a.as_i64(), b.as_i64(), op == ArithmeticOp::Div) {
        let exact = match op {
            ArithmeticOp::Add => a.checked_add(b),
            ArithmeticOp::Sub => a.checked_sub(b),
            _ => a.checked_mul(b),
        };
        if let Some(value) = exact {
            return Value::from(value);
        }
    }
    let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) else {
        return Value::Null;
    };
    let result = match op {
        ArithmeticOp::Add => a + b,
        ArithmeticOp::Sub => a - b,
        ArithmeticOp::Mul => a * b,
        ArithmeticOp::Div if b == 0.0 => return Value::Null,
        ArithmeticOp::Div => a / b,
    };
    serde_json::Number::from_f64(result)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn call(function: &str, args: &[Value]) -> Result<Value, EvalError> {
    let text = |i: usize| args.get(i).and_then(Value::as_str);
    let list = |i: usize| args.get(i).and_then(Value::as_array);
    Ok(match function {
        "contains" | "startsWith" | "endsWith" => {
            let (Some(field), Some(search)) = (text(0), text(1)) else {
                return Ok(Value::Bool(false));
            };
            let fold = args.get(2).and_then(Value::as_bool).unwrap_or(false);
            let (field, search) = if fold {
                (field.to_lowercase(), search.to_lowercase())
            } else {
                (field.to_string(), search.to_string())
            };
            Value::Bool(match function {
                "contains" => field.contains(&search),
                "startsWith" => field.starts_with(&search),
                _ => field.ends_with(&search),
            })
        }
        "has" => {
            let found = match (list(0), args.get(1)) {
                (Some(items), Some(needle)) => items.iter().any(|v| values_equal(v, needle)),
                _ => false,
            };
            Value::Bool(found)
        }
        "hasSome" | "hasEvery" => {
            let (Some(items), Some(needles)) = (list(0), list(1)) else {
                return Ok(Value::Bool(false));
            };
            let contained = |needle: &Value| items.iter().any(|v| values_equal(v, needle));
            Value::Bool(if function == "hasSome" {
                needles.iter().any(contained)
            } else {
                needles.iter().all(contained)
            })
        }
        "isEmpty" => Value::Bool(list(0).is_some_and(|items| items.is_empty())),
        "now" => Value::String(Utc::now().to_rfc3339()),
        other => return Err(EvalError::UnknownFunction(other.to_string())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inheritance::Hierarchy;
    use crate::stdlib::stdlib;
    use crate::symbols::SymbolTable;
    use crate::Diagnostics;
    use serde_json::json;
    use zmodel_dsl::parse_document;

    const SCHEMA: &str = r#"
        enum Role { USER ADMIN }
        model User {
            id    String @id
            role  Role
            posts Post[]
        }
        abstract model Owned {
            ownerId String
            @@allow('all', auth() != null && auth().role == ADMIN)
        }
        model Post extends Owned {
            id        String   @id
            published Boolean
            author    User     @relation(fields: [authorId], references: [id])
            authorId  String
            secret    String   @allow('read', author == auth())
            publishAt DateTime
            @@allow('read', published && publishAt <= now())
            @@allow('update', author == auth() && future().author == auth())
            @@deny('delete', published)
        }
    "#;

    fn bundle() -> PolicyBundle {
        let doc = parse_document(SCHEMA).expect("parse");
        let mut diags = Diagnostics::new();
        let symbols = SymbolTable::build(&doc, stdlib(), &mut diags);
        let hierarchy = Hierarchy::resolve(&symbols, &mut diags);
        compile_policies(Env::new(&symbols, &hierarchy)).expect("compile")
    }

    #[test]
    fn parses_operation_lists() {
        assert_eq!(
            PolicyOperation::parse_list("create, read,read", false),
            Ok(vec![PolicyOperation::Create, PolicyOperation::Read])
        );
        assert_eq!(
            PolicyOperation::parse_list("all", true),
            Ok(vec![PolicyOperation::Read, PolicyOperation::Update])
        );
        assert_eq!(
            PolicyOperation::parse_list("read,delete", true),
            Err("delete".to_string())
        );
        assert_eq!(PolicyOperation::parse_list("write", false), Err("write".to_string()));
    }

    #[test]
    fn inherited_rules_are_compiled_on_concrete_models() {
        let bundle = bundle();
        assert!(bundle.model("Owned").is_none());
        let post = bundle.model("Post").expect("Post policy");
        assert_eq!(post.rules.len(), 4);
        assert_eq!(post.rules[0].source, "auth() != null && auth().role == ADMIN");
        assert_eq!(post.field_rules["secret"].len(), 1);
        let user = bundle.model("User").expect("User policy");
        assert!(user.rules.is_empty());
    }

    #[test]
    fn deny_overrides_allow_and_default_is_deny() {
        let bundle = bundle();
        let post = bundle.model("Post").expect("Post policy");
        let admin = json!({ "id": "u1", "role": "ADMIN" });
        let record = json!({
            "id": "p1",
            "published": true,
            "author": { "id": "u2" },
            "authorId": "u2",
            "publishAt": "2020-01-01T00:00:00Z",
        });
        let anonymous = EvalContext::new(&record);
        assert_eq!(post.is_allowed(PolicyOperation::Read, &anonymous), Ok(true));
        assert_eq!(post.is_allowed(PolicyOperation::Create, &anonymous), Ok(false));

        let as_admin = EvalContext::new(&record).with_principal(&admin);
        assert_eq!(post.is_allowed(PolicyOperation::Create, &as_admin), Ok(true));
        assert_eq!(post.is_allowed(PolicyOperation::Delete, &as_admin), Ok(false));
    }

    #[test]
    fn future_reads_the_post_update_record() {
        let bundle = bundle();
        let post = bundle.model("Post").expect("Post policy");
        let author = json!({ "id": "u2", "role": "USER" });
        let record = json!({ "published": false, "author": { "id": "u2" } });
        let kept = json!({ "published": false, "author": { "id": "u2" } });
        let handed_over = json!({ "published": false, "author": { "id": "u3" } });

        let ctx = EvalContext::new(&record)
            .with_principal(&author)
            .with_future(&kept);
        assert_eq!(post.is_allowed(PolicyOperation::Update, &ctx), Ok(true));
        let ctx = EvalContext::new(&record)
            .with_principal(&author)
            .with_future(&handed_over);
        assert_eq!(post.is_allowed(PolicyOperation::Update, &ctx), Ok(false));
    }

    #[test]
    fn field_rules_default_to_allowed() {
        let bundle = bundle();
        let post = bundle.model("Post").expect("Post policy");
        let record = json!({ "author": { "id": "u2" } });
        let other = json!({ "id": "u9", "role": "USER" });
        let ctx = EvalContext::new(&record).with_principal(&other);
        assert_eq!(post.is_field_allowed("secret", PolicyOperation::Read, &ctx), Ok(false));
        assert_eq!(post.is_field_allowed("secret", PolicyOperation::Update, &ctx), Ok(true));
        assert_eq!(post.is_field_allowed("published", PolicyOperation::Read, &ctx), Ok(true));
    }

    #[test]
    fn values_compare_with_numeric_and_time_normalisation() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert!(values_equal(
            &json!("2024-01-01T00:00:00Z"),
            &json!("2024-01-01T01:00:00+01:00")
        ));
        assert!(compare(CompareOp::Lt, &json!(2), &json!(2.5)));
        assert!(!compare(CompareOp::Lt, &json!("a"), &json!("b")));
        assert_eq!(arithmetic(ArithmeticOp::Div, &json!(1), &json!(0)), Value::Null);
        assert_eq!(arithmetic(ArithmeticOp::Mul, &json!(3), &json!(4)), json!(12));
    }

    #[test]
    fn large_integers_compare_exactly() {
        let a = json!(9007199254740993u64);
        let b = json!(9007199254740992u64);
        assert!(!values_equal(&a, &b));
        assert!(compare(CompareOp::Gt, &a, &b));
        assert!(compare(CompareOp::Ne, &json!(u64::MAX), &json!(i64::MAX)));
        assert!(compare(CompareOp::Lt, &json!(-1), &json!(u64::MAX)));

        let doc = parse_document("model User { id BigInt @id\n owner BigInt }").expect("parse");
        let result = crate::validate_document(&doc);
        let validated = result.validated.expect("validated");
        let expr = zmodel_dsl::parse_expression("owner == auth().id").expect("parse expression");
        let predicate = validated.compile("User", &expr).expect("compile");
        let record = json!({ "owner": 9007199254740993u64 });
        let other = json!({ "id": 9007199254740992u64 });
        let same = json!({ "id": 9007199254740993u64 });
        let ctx = EvalContext::new(&record).with_principal(&other);
        assert_eq!(predicate.evaluate(&ctx), Ok(false));
        let ctx = EvalContext::new(&record).with_principal(&same);
        assert_eq!(predicate.evaluate(&ctx), Ok(true));
    }

    #[test]
    fn builtin_string_and_list_functions() {
        assert_eq!(
            call("contains", &[json!("Hello"), json!("ELL"), json!(true)]),
            Ok(json!(true))
        );
        assert_eq!(call("startsWith", &[json!("abc"), json!("b")]), Ok(json!(false)));
        assert_eq!(
            call("hasEvery", &[json!(["a", "b"]), json!(["a"])]),
            Ok(json!(true))
        );
        assert_eq!(call("isEmpty", &[json!([])]), Ok(json!(true)));
        assert_eq!(
            call("uuid", &[]),
            Err(EvalError::UnknownFunction("uuid".to_string()))
        );
    }
}
