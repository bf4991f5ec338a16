//! Policy-expression compiler.
//!
//! Lowers a type-checked expression to a small serializable predicate IR
//! ([`Predicate`]/[`Operand`]) that can be evaluated without the schema:
//!
//! - field references become scope-indexed paths (scope 0 is the record,
//!   each enclosing collection predicate adds one);
//! - `every` and `none` quantifiers lower to negated existentials;
//! - model-typed equality lowers to a conjunction over the id fields;
//! - user-defined functions are inlined at the call site.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zmodel_dsl::ast::{
    Argument, BinaryOp, Expr, ExprKind, FunctionDecl, Ident, Literal, Quantifier, UnaryOp,
};

use crate::expressions::{infer_type, TyKind};
use crate::resolver::{Binding, Env, Frame, ScopeStack};
use crate::symbols::Origin;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("unresolved reference \"{0}\"")]
    Unresolved(String),
    #[error("function \"{0}\" is recursive and cannot be inlined")]
    RecursiveFunction(String),
    #[error("model \"{0}\" has no identifying fields to compare")]
    NoIdentity(String),
    #[error("invalid number literal \"{0}\"")]
    InvalidNumber(String),
    #[error("\"{0}\" is not a valid member access target")]
    InvalidMemberAccess(String),
    #[error("collection predicate over a non-model list")]
    InvalidCollection,
    #[error("expression does not type-check: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn from_binary(op: BinaryOp) -> Option<Self> {
        Some(match op {
            BinaryOp::Eq => CompareOp::Eq,
            BinaryOp::Ne => CompareOp::Ne,
            BinaryOp::Lt => CompareOp::Lt,
            BinaryOp::Le => CompareOp::Le,
            BinaryOp::Gt => CompareOp::Gt,
            BinaryOp::Ge => CompareOp::Ge,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithmeticOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    Const {
        value: bool,
    },
    /// A Boolean-valued operand.
    Test {
        operand: Operand,
    },
    Not {
        predicate: Box<Predicate>,
    },
    And {
        predicates: Vec<Predicate>,
    },
    Or {
        predicates: Vec<Predicate>,
    },
    Compare {
        cmp: CompareOp,
        left: Operand,
        right: Operand,
    },
    /// Some element of `collection` satisfies `predicate`, which reads the
    /// element through the next scope index.
    Exists {
        collection: Operand,
        predicate: Box<Predicate>,
    },
}

impl Predicate {
    pub fn not(predicate: Predicate) -> Self {
        match predicate {
            Predicate::Not { predicate } => *predicate,
            Predicate::Const { value } => Predicate::Const { value: !value },
            other => Predicate::Not {
                predicate: Box::new(other),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operand {
    Value {
        value: serde_json::Value,
    },
    Field {
        scope: usize,
        path: Vec<String>,
    },
    /// The authenticated principal (`auth()`).
    Principal {
        path: Vec<String>,
    },
    /// The post-update record (`future()`).
    Future {
        path: Vec<String>,
    },
    Arithmetic {
        arith: ArithmeticOp,
        left: Box<Operand>,
        right: Box<Operand>,
    },
    Negate {
        operand: Box<Operand>,
    },
    List {
        items: Vec<Operand>,
    },
    /// A built-in function evaluated at run time.
    Call {
        function: String,
        args: Vec<Operand>,
    },
    Predicate {
        predicate: Box<Predicate>,
    },
}

impl Operand {
    fn member(self, name: &str) -> Result<Operand, CompileError> {
        match self {
            Operand::Field { scope, mut path } => {
                path.push(name.to_string());
                Ok(Operand::Field { scope, path })
            }
            Operand::Principal { mut path } => {
                path.push(name.to_string());
                Ok(Operand::Principal { path })
            }
            Operand::Future { mut path } => {
                path.push(name.to_string());
                Ok(Operand::Future { path })
            }
            _ => Err(CompileError::InvalidMemberAccess(name.to_string())),
        }
    }
}

/// Compile `expr`, evaluated against a record of `scope`'s record model.
pub fn compile_predicate<'d>(
    env: Env<'_, 'd>,
    expr: &'d Expr,
    scope: &mut ScopeStack<'d>,
) -> Result<Predicate, CompileError> {
    let mut compiler = Compiler {
        env,
        inlining: Vec::new(),
        arguments: Vec::new(),
        scope_base: 0,
    };
    compiler.predicate(expr, scope)
}

struct Compiler<'c, 'd> {
    env: Env<'c, 'd>,
    /// Functions currently being inlined, for the recursion guard.
    inlining: Vec<&'d str>,
    /// Compiled arguments of each inlined call, innermost last.
    arguments: Vec<Vec<Operand>>,
    /// Value scopes open at the current inlined call site.
    scope_base: usize,
}

impl<'c, 'd> Compiler<'c, 'd> {
    fn predicate(
        &mut self,
        expr: &'d Expr,
        scope: &mut ScopeStack<'d>,
    ) -> Result<Predicate, CompileError> {
        match &expr.kind {
            ExprKind::Literal(Literal::Boolean(value)) => Ok(Predicate::Const { value: *value }),
            ExprKind::Unary {
                op: UnaryOp::Not,
                operand,
            } => Ok(Predicate::not(self.predicate(operand, scope)?)),
            ExprKind::Binary { op, left, right } if op.is_logical() => {
                let left = self.predicate(left, scope)?;
                let right = self.predicate(right, scope)?;
                Ok(if *op == BinaryOp::And {
                    Predicate::And {
                        predicates: vec![left, right],
                    }
                } else {
                    Predicate::Or {
                        predicates: vec![left, right],
                    }
                })
            }
            ExprKind::Binary { op, left, right } => match CompareOp::from_binary(*op) {
                Some(cmp) => self.comparison(cmp, left, right, scope),
                None => self.test(expr, scope),
            },
            ExprKind::CollectionPredicate {
                collection,
                quantifier,
                condition,
            } => {
                let element = infer_type(self.env, collection, scope);
                let TyKind::Model(model) = element.kind else {
                    return Err(CompileError::InvalidCollection);
                };
                let collection = self.operand(collection, scope)?;
                scope.push(Frame::Element(model));
                let condition = self.predicate(condition, scope);
                scope.pop();
                let condition = condition?;
                let exists = |predicate: Predicate| Predicate::Exists {
                    collection,
                    predicate: Box::new(predicate),
                };
                Ok(match quantifier {
                    Quantifier::Some => exists(condition),
                    Quantifier::Every => Predicate::not(exists(Predicate::not(condition))),
                    Quantifier::None => Predicate::not(exists(condition)),
                })
            }
            _ => self.test(expr, scope),
        }
    }

    fn test(&mut self, expr: &'d Expr, scope: &mut ScopeStack<'d>) -> Result<Predicate, CompileError> {
        Ok(match self.operand(expr, scope)? {
            Operand::Predicate { predicate } => *predicate,
            operand => Predicate::Test { operand },
        })
    }

    fn comparison(
        &mut self,
        cmp: CompareOp,
        left: &'d Expr,
        right: &'d Expr,
        scope: &mut ScopeStack<'d>,
    ) -> Result<Predicate, CompileError> {
        let model = if matches!(cmp, CompareOp::Eq | CompareOp::Ne)
            && !left.is_null()
            && !right.is_null()
        {
            infer_type(self.env, left, scope)
                .as_model()
                .or_else(|| infer_type(self.env, right, scope).as_model())
        } else {
            None
        };
        let left = self.operand(left, scope)?;
        let right = self.operand(right, scope)?;
        let Some(model) = model else {
            return Ok(Predicate::Compare { cmp, left, right });
        };

        let ids = self.env.id_fields(model);
        if ids.is_empty() {
            return Err(CompileError::NoIdentity(model.name.name.clone()));
        }
        let mut predicates = Vec::with_capacity(ids.len());
        for id in ids {
            predicates.push(Predicate::Compare {
                cmp: CompareOp::Eq,
                left: left.clone().member(id.name.as_str())?,
                right: right.clone().member(id.name.as_str())?,
            });
        }
        let same = if predicates.len() == 1 {
            predicates.remove(0)
        } else {
            Predicate::And { predicates }
        };
        Ok(if cmp == CompareOp::Eq {
            same
        } else {
            Predicate::not(same)
        })
    }

    fn operand(&mut self, expr: &'d Expr, scope: &mut ScopeStack<'d>) -> Result<Operand, CompileError> {
        match &expr.kind {
            ExprKind::Literal(literal) => literal_value(literal).map(|value| Operand::Value { value }),
            ExprKind::This => {
                let (frame, _) = scope
                    .this_model()
                    .ok_or_else(|| CompileError::Unresolved("this".to_string()))?;
                Ok(Operand::Field {
                    scope: self.scope_base + scope.value_scope(frame),
                    path: Vec::new(),
                })
            }
            ExprKind::Reference(ident) => self.reference(ident, scope),
            ExprKind::MemberAccess { object, member } => {
                self.operand(object, scope)?.member(member.as_str())
            }
            ExprKind::Unary {
                op: UnaryOp::Negate,
                operand,
            } => Ok(Operand::Negate {
                operand: Box::new(self.operand(operand, scope)?),
            }),
            ExprKind::Binary { op, left, right } if op.is_arithmetic() => {
                let arith = match op {
                    BinaryOp::Add => ArithmeticOp::Add,
                    BinaryOp::Sub => ArithmeticOp::Sub,
                    BinaryOp::Mul => ArithmeticOp::Mul,
                    _ => ArithmeticOp::Div,
                };
                Ok(Operand::Arithmetic {
                    arith,
                    left: Box::new(self.operand(left, scope)?),
                    right: Box::new(self.operand(right, scope)?),
                })
            }
            ExprKind::Invocation { function, args } => self.invocation(function, args, scope),
            ExprKind::Array(items) => Ok(Operand::List {
                items: items
                    .iter()
                    .map(|item| self.operand(item, scope))
                    .collect::<Result<_, _>>()?,
            }),
            ExprKind::Unary { .. } | ExprKind::Binary { .. } | ExprKind::CollectionPredicate { .. } => {
                Ok(Operand::Predicate {
                    predicate: Box::new(self.predicate(expr, scope)?),
                })
            }
        }
    }

    fn reference(&mut self, ident: &Ident, scope: &ScopeStack<'d>) -> Result<Operand, CompileError> {
        match scope.lookup(self.env, ident.as_str()) {
            Some(Binding::Param { index, .. }) => self
                .arguments
                .last()
                .and_then(|args| args.get(index))
                .cloned()
                .ok_or_else(|| CompileError::Unresolved(ident.name.clone())),
            Some(Binding::Field { frame, field, .. }) => Ok(Operand::Field {
                scope: self.scope_base + scope.value_scope(frame),
                path: vec![field.name.name.clone()],
            }),
            Some(Binding::EnumMember { member, .. }) => Ok(Operand::Value {
                value: serde_json::Value::String(member.name.name.clone()),
            }),
            None => Err(CompileError::Unresolved(ident.name.clone())),
        }
    }

    fn invocation(
        &mut self,
        function: &'d Ident,
        args: &'d [Argument],
        scope: &mut ScopeStack<'d>,
    ) -> Result<Operand, CompileError> {
        match function.as_str() {
            "auth" => return Ok(Operand::Principal { path: Vec::new() }),
            "future" => return Ok(Operand::Future { path: Vec::new() }),
            _ => {}
        }
        let compiled: Vec<Operand> = args
            .iter()
            .map(|arg| self.operand(arg.value(), scope))
            .collect::<Result<_, _>>()?;

        let user_defined = self
            .env
            .symbols
            .function(function.as_str())
            .filter(|_| self.env.symbols.origin(function.as_str()) == Some(Origin::Document));
        match user_defined {
            Some(decl) if decl.body.is_some() => self.inline(decl, compiled, scope.value_depth()),
            _ => Ok(Operand::Call {
                function: function.name.clone(),
                args: compiled,
            }),
        }
    }

    fn inline(
        &mut self,
        decl: &'d FunctionDecl,
        args: Vec<Operand>,
        depth: usize,
    ) -> Result<Operand, CompileError> {
        let name = decl.name.as_str();
        if self.inlining.contains(&name) {
            return Err(CompileError::RecursiveFunction(name.to_string()));
        }
        let Some(body) = &decl.body else {
            return Err(CompileError::Unresolved(name.to_string()));
        };
        tracing::trace!(function = name, "inlining function body");

        let saved_base = self.scope_base;
        self.scope_base += depth;
        self.inlining.push(name);
        self.arguments.push(args);
        let mut scope = ScopeStack::with(Frame::Function(&decl.params));
        let result = self.operand(body, &mut scope);
        self.arguments.pop();
        self.inlining.pop();
        self.scope_base = saved_base;
        result
    }
}

fn literal_value(literal: &Literal) -> Result<serde_json::Value, CompileError> {
    Ok(match literal {
        Literal::String(text) => serde_json::Value::String(text.clone()),
        Literal::Boolean(value) => serde_json::Value::Bool(*value),
        Literal::Null => serde_json::Value::Null,
        Literal::Number(text) => {
            if let Ok(int) = text.parse::<i64>() {
                serde_json::Value::from(int)
            } else {
                text.parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(serde_json::Value::Number)
                    .ok_or_else(|| CompileError::InvalidNumber(text.clone()))?
            }
        }
    })
}
