//! Relation inference.
//!
//! Every model-typed field of a concrete model is a relation candidate.
//! Candidates are grouped by the unordered model pair plus the optional
//! relation name from `@relation("name")`, then paired with their opposite
//! field. Each valid pair becomes a [`RelationEdge`] with a cardinality and,
//! unless it is an implicit many-to-many relation, an owning side: the field
//! that declares `fields:`/`references:`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use zmodel_dsl::ast::{AttributeApp, DataModel, Field, Ident};

use crate::attributes::{bind_arguments, field_reference_items};
use crate::diagnostic::{DiagnosticKind, Diagnostics};
use crate::resolver::{field_reference_names, Env};
use crate::symbols::FieldType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    ManyToMany,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationEnd {
    pub model: String,
    pub field: String,
    pub is_array: bool,
    pub is_optional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationEdge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub ends: [RelationEnd; 2],
    pub cardinality: Cardinality,
    /// Index into `ends` of the owning side; `None` for implicit many-to-many.
    pub owner: Option<usize>,
    /// Foreign-key fields on the owning model.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    /// Referenced fields on the other model.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
}

impl RelationEdge {
    pub fn owning_end(&self) -> Option<&RelationEnd> {
        self.owner.map(|i| &self.ends[i])
    }

    pub fn involves(&self, model: &str, field: &str) -> bool {
        self.ends.iter().any(|e| e.model == model && e.field == field)
    }
}

/// The `fields:`/`references:` declaration of one candidate.
#[derive(Debug, Clone)]
enum ForeignKey<'d> {
    Absent,
    /// Only one of the two lists was given; already reported.
    Partial,
    Complete {
        fields: Vec<&'d Ident>,
        references: Vec<&'d Ident>,
    },
}

#[derive(Debug, Clone)]
struct Candidate<'d> {
    model: &'d DataModel,
    field: &'d Field,
    target: &'d DataModel,
    name: Option<&'d str>,
    relation: Option<&'d AttributeApp>,
    foreign_key: ForeignKey<'d>,
}

impl Candidate<'_> {
    fn end(&self) -> RelationEnd {
        RelationEnd {
            model: self.model.name.name.clone(),
            field: self.field.name.name.clone(),
            is_array: self.field.ty.is_array,
            is_optional: self.field.ty.is_optional,
        }
    }
}

type GroupKey<'d> = (&'d str, &'d str, Option<&'d str>);

/// Pair up relation fields and validate each relation.
pub fn infer_relations(env: Env<'_, '_>, diagnostics: &mut Diagnostics) -> Vec<RelationEdge> {
    let before = diagnostics.len();
    let mut engine = RelationEngine { env, diagnostics };

    let mut order: Vec<GroupKey<'_>> = Vec::new();
    let mut groups: HashMap<GroupKey<'_>, Vec<Candidate<'_>>> = HashMap::new();
    for candidate in engine.candidates() {
        let (a, b) = (candidate.model.name.as_str(), candidate.target.name.as_str());
        let key = if a <= b { (a, b, candidate.name) } else { (b, a, candidate.name) };
        groups
            .entry(key)
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(candidate);
    }

    let mut edges = Vec::new();
    for key in order {
        let members = groups.remove(&key).unwrap_or_default();
        if let Some(edge) = engine.check_group(key, members) {
            edges.push(edge);
        }
    }
    tracing::debug!(
        relations = edges.len(),
        diagnostics = engine.diagnostics.len() - before,
        "inferred relations"
    );
    edges
}

struct RelationEngine<'c, 'd> {
    env: Env<'c, 'd>,
    diagnostics: &'c mut Diagnostics,
}

impl<'c, 'd> RelationEngine<'c, 'd> {
    fn error(&mut self, span: zmodel_dsl::ast::Span, message: impl Into<String>) {
        self.diagnostics
            .error(DiagnosticKind::Relation, span, message);
    }

    fn candidates(&mut self) -> Vec<Candidate<'d>> {
        let mut out = Vec::new();
        let relation_decl = self.env.symbols.attribute("@relation");
        for &model in self.env.hierarchy.models() {
            if model.is_abstract {
                continue;
            }
            for field_ref in self.env.fields(model) {
                if field_ref.via_delegate {
                    continue;
                }
                let field = field_ref.field;
                let FieldType::Model(target) = self.env.field_type(field) else {
                    continue;
                };
                // Abstract targets are rejected by the structural pass.
                if target.is_abstract {
                    continue;
                }
                let relation = field.attribute("@relation");
                let bound = relation
                    .zip(relation_decl)
                    .and_then(|(app, decl)| bind_arguments(decl, app).ok());
                let name = bound
                    .as_ref()
                    .and_then(|b| b.get("name"))
                    .and_then(|e| e.as_string_literal());
                let fields = bound.as_ref().and_then(|b| b.get("fields"));
                let references = bound.as_ref().and_then(|b| b.get("references"));
                let foreign_key = match (fields, references) {
                    (None, None) => ForeignKey::Absent,
                    (Some(fields), Some(references)) => ForeignKey::Complete {
                        fields: field_reference_items(fields).into_iter().map(|i| i.field).collect(),
                        references: field_reference_items(references)
                            .into_iter()
                            .map(|i| i.field)
                            .collect(),
                    },
                    _ => {
                        let span = relation.map(|r| r.span).unwrap_or(field.name.span);
                        self.error(span, "Both \"fields\" and \"references\" must be provided");
                        ForeignKey::Partial
                    }
                };
                out.push(Candidate {
                    model,
                    field,
                    target,
                    name,
                    relation,
                    foreign_key,
                });
            }
        }
        out
    }

    fn check_group(&mut self, key: GroupKey<'d>, members: Vec<Candidate<'d>>) -> Option<RelationEdge> {
        let (low, high, _) = key;
        if low == high {
            // Self-relation: both ends live on the same model.
            return match members.as_slice() {
                [single] => {
                    self.missing_opposite(single);
                    None
                }
                [a, b] => self.check_pair(a, b),
                _ => {
                    self.ambiguous(&members);
                    None
                }
            };
        }
        let (left, right): (Vec<_>, Vec<_>) =
            members.into_iter().partition(|c| c.model.name.as_str() == low);
        let mut ambiguous = false;
        for side in [&left, &right] {
            if side.len() > 1 {
                self.ambiguous(side);
                ambiguous = true;
            }
        }
        if ambiguous {
            return None;
        }
        match (left.first(), right.first()) {
            (Some(a), Some(b)) => self.check_pair(a, b),
            (Some(single), None) | (None, Some(single)) => {
                self.missing_opposite(single);
                None
            }
            (None, None) => None,
        }
    }

    fn ambiguous(&mut self, side: &[Candidate<'d>]) {
        let Some(first) = side.first() else {
            return;
        };
        let names: Vec<String> = side.iter().map(|c| format!("\"{}\"", c.field.name)).collect();
        self.error(
            first.field.name.span,
            format!(
                "Fields {} on model \"{}\" refer to the same relation to model \"{}\"",
                names.join(", "),
                first.model.name,
                first.target.name
            ),
        );
    }

    fn missing_opposite(&mut self, candidate: &Candidate<'d>) {
        self.error(
            candidate.field.name.span,
            format!(
                "The relation field \"{}\" on model \"{}\" is missing an opposite relation field on model \"{}\"",
                candidate.field.name, candidate.model.name, candidate.target.name
            ),
        );
    }

    fn check_pair(&mut self, a: &Candidate<'d>, b: &Candidate<'d>) -> Option<RelationEdge> {
        let name = a.name.map(str::to_string);
        let ends = [a.end(), b.end()];
        let (owner, other, owner_index) = match (&a.foreign_key, &b.foreign_key) {
            (ForeignKey::Partial, _) | (_, ForeignKey::Partial) => return None,
            (ForeignKey::Complete { .. }, ForeignKey::Complete { .. }) => {
                let span = b.relation.map(|r| r.span).unwrap_or(b.field.name.span);
                self.error(
                    span,
                    "\"fields\" and \"references\" must be provided only on one side of relation field",
                );
                return None;
            }
            (ForeignKey::Absent, ForeignKey::Absent) => {
                if a.field.ty.is_array && b.field.ty.is_array {
                    return Some(RelationEdge {
                        name,
                        ends,
                        cardinality: Cardinality::ManyToMany,
                        owner: None,
                        fields: Vec::new(),
                        references: Vec::new(),
                    });
                }
                let scalar_side = if a.field.ty.is_array { b } else { a };
                self.error(
                    scalar_side.field.name.span,
                    format!(
                        "Both \"fields\" and \"references\" must be provided on one side of the relation between \"{}.{}\" and \"{}.{}\"",
                        a.model.name, a.field.name, b.model.name, b.field.name
                    ),
                );
                return None;
            }
            (ForeignKey::Complete { .. }, ForeignKey::Absent) => (a, b, 0),
            (ForeignKey::Absent, ForeignKey::Complete { .. }) => (b, a, 1),
        };
        let ForeignKey::Complete { fields, references } = &owner.foreign_key else {
            return None;
        };

        if owner.field.ty.is_array {
            let message = if other.field.ty.is_array {
                format!(
                    "Many-to-many relation field \"{}\" cannot declare \"fields\" and \"references\"",
                    owner.field.name
                )
            } else {
                format!(
                    "\"fields\" and \"references\" must be declared on the non-list side of the relation, not on \"{}\"",
                    owner.field.name
                )
            };
            self.error(owner.field.name.span, message);
            return None;
        }

        let valid = self.check_foreign_key(owner, fields, references);
        let cardinality = if other.field.ty.is_array {
            Cardinality::OneToMany
        } else {
            if valid {
                self.check_one_to_one(owner, other, fields);
            }
            Cardinality::OneToOne
        };
        Some(RelationEdge {
            name,
            ends,
            cardinality,
            owner: Some(owner_index),
            fields: fields.iter().map(|i| i.name.clone()).collect(),
            references: references.iter().map(|i| i.name.clone()).collect(),
        })
    }

    /// Length and pairwise type agreement of `fields` and `references`.
    /// Unknown names were already reported by the attribute checker.
    fn check_foreign_key(&mut self, owner: &Candidate<'d>, fields: &[&'d Ident], references: &[&'d Ident]) -> bool {
        let span = owner.relation.map(|r| r.span).unwrap_or(owner.field.name.span);
        if fields.len() != references.len() {
            self.error(span, "\"references\" and \"fields\" must have the same length");
            return false;
        }
        for (fk, pk) in fields.iter().zip(references) {
            let (Some(fk_field), Some(pk_field)) = (
                self.env.field(owner.model, fk.as_str()),
                self.env.field(owner.target, pk.as_str()),
            ) else {
                return false;
            };
            let fk_ty = self.env.field_type(fk_field.field);
            let pk_ty = self.env.field_type(pk_field.field);
            if !fk_ty.same_scalar_as(&pk_ty) {
                self.error(
                    fk.span,
                    format!(
                        "values of \"references\" and \"fields\" must have the same type: \"{}\" is {} but \"{}\" is {}",
                        fk,
                        fk_ty.describe(),
                        pk,
                        pk_ty.describe()
                    ),
                );
                return false;
            }
        }
        true
    }

    fn check_one_to_one(&mut self, owner: &Candidate<'d>, other: &Candidate<'d>, fields: &[&'d Ident]) {
        if !other.field.ty.is_optional {
            self.error(
                other.field.name.span,
                format!(
                    "The relation field \"{}\" on model \"{}\" is the non-owning side of a one-to-one relation and must be optional",
                    other.field.name, other.model.name
                ),
            );
        }

        let single_unique = match fields {
            [only] => self.env.field(owner.model, only.as_str()).is_some_and(|f| {
                f.field.has_attribute("@unique") || f.field.has_attribute("@id")
            }),
            _ => false,
        };
        let covered = self
            .env
            .hierarchy
            .attributes(owner.model.name.as_str())
            .iter()
            .filter(|a| matches!(a.attribute.name.as_str(), "@@unique" | "@@id"))
            .map(|a| field_reference_names(a.attribute))
            .any(|unique| {
                !unique.is_empty()
                    && unique
                        .iter()
                        .all(|u| fields.iter().any(|f| f.as_str() == u.as_str()))
            });
        if !single_unique && !covered {
            if let Some(first) = fields.first() {
                self.error(
                    first.span,
                    format!(
                        "Field \"{first}\" is part of a one-to-one relation and must be marked as @unique or be part of a model-level @@unique attribute"
                    ),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inheritance::Hierarchy;
    use crate::stdlib::stdlib;
    use crate::symbols::SymbolTable;
    use zmodel_dsl::parse_document;

    fn infer(src: &str) -> (Vec<RelationEdge>, Vec<String>) {
        let doc = parse_document(src).expect("parse");
        let mut diags = Diagnostics::new();
        let symbols = SymbolTable::build(&doc, stdlib(), &mut diags);
        let hierarchy = Hierarchy::resolve(&symbols, &mut diags);
        let mut out = Diagnostics::new();
        let edges = infer_relations(Env::new(&symbols, &hierarchy), &mut out);
        let messages = out.iter().map(|d| d.message.clone()).collect();
        (edges, messages)
    }

    #[test]
    fn infers_one_to_many_with_owner() {
        let (edges, messages) = infer(
            r#"
            model User { id String @id
                posts Post[] }
            model Post { id String @id
                author User @relation(fields: [authorId], references: [id])
                authorId String }
            "#,
        );
        assert!(messages.is_empty(), "{messages:?}");
        assert_eq!(edges.len(), 1);
        let edge = &edges[0];
        assert_eq!(edge.cardinality, Cardinality::OneToMany);
        let owner = edge.owning_end().expect("owner");
        assert_eq!((owner.model.as_str(), owner.field.as_str()), ("Post", "author"));
        assert_eq!(edge.fields, vec!["authorId"]);
        assert_eq!(edge.references, vec!["id"]);
        assert!(edge.involves("User", "posts"));
    }

    #[test]
    fn reports_missing_opposite_field() {
        let (edges, messages) = infer(
            r#"
            model User { id String @id }
            model Post { id String @id
                author User @relation(fields: [authorId], references: [id])
                authorId String }
            "#,
        );
        assert!(edges.is_empty());
        assert_eq!(
            messages,
            vec!["The relation field \"author\" on model \"Post\" is missing an opposite relation field on model \"User\""]
        );
    }

    #[test]
    fn unnamed_parallel_relations_are_ambiguous() {
        let (_, messages) = infer(
            r#"
            model User { id String @id
                posts Post[] }
            model Post { id String @id
                author User @relation(fields: [authorId], references: [id])
                authorId String
                editor User @relation(fields: [editorId], references: [id])
                editorId String }
            "#,
        );
        assert_eq!(
            messages,
            vec!["Fields \"author\", \"editor\" on model \"Post\" refer to the same relation to model \"User\""]
        );
    }

    #[test]
    fn relation_names_disambiguate() {
        let (edges, messages) = infer(
            r#"
            model User { id String @id
                written Post[] @relation("written")
                edited  Post[] @relation("edited") }
            model Post { id String @id
                author User @relation("written", fields: [authorId], references: [id])
                authorId String
                editor User @relation(name: "edited", fields: [editorId], references: [id])
                editorId String }
            "#,
        );
        assert!(messages.is_empty(), "{messages:?}");
        let mut names: Vec<_> = edges.iter().filter_map(|e| e.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["edited", "written"]);
    }

    #[test]
    fn ownership_must_be_on_exactly_one_side() {
        let (_, messages) = infer(
            r#"
            model A { id Int @id
                b B? @relation(fields: [bId], references: [id])
                bId Int? @unique }
            model B { id Int @id
                a A @relation(fields: [aId], references: [id])
                aId Int @unique }
            "#,
        );
        assert_eq!(
            messages,
            vec!["\"fields\" and \"references\" must be provided only on one side of relation field"]
        );

        let (_, messages) = infer(
            r#"
            model A { id Int @id
                b B? }
            model B { id Int @id
                a A }
            "#,
        );
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("Both \"fields\" and \"references\" must be provided"));
    }

    #[test]
    fn implicit_many_to_many_needs_no_attributes() {
        let (edges, messages) = infer(
            r#"
            model Post { id Int @id
                tags Tag[] }
            model Tag { id Int @id
                posts Post[] }
            "#,
        );
        assert!(messages.is_empty(), "{messages:?}");
        assert_eq!(edges[0].cardinality, Cardinality::ManyToMany);
        assert_eq!(edges[0].owner, None);
    }

    #[test]
    fn foreign_key_shapes_are_checked() {
        let (_, messages) = infer(
            r#"
            model User { id String @id
                posts Post[] }
            model Post { id String @id
                author User @relation(fields: [authorId], references: [id])
                authorId Int }
            "#,
        );
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("values of \"references\" and \"fields\" must have the same type"));

        let (_, messages) = infer(
            r#"
            model User { id String @id
                posts Post[] }
            model Post { id String @id
                author User @relation(fields: [authorId, id], references: [id])
                authorId String }
            "#,
        );
        assert_eq!(messages, vec!["\"references\" and \"fields\" must have the same length"]);
    }

    #[test]
    fn one_to_one_requires_a_unique_foreign_key() {
        let schema = |fk_attr: &str| {
            format!(
                r#"
                model User {{ id String @id
                    profile Profile? }}
                model Profile {{ id String @id
                    user User @relation(fields: [userId], references: [id])
                    userId String {fk_attr} }}
                "#
            )
        };
        let (edges, messages) = infer(&schema(""));
        assert_eq!(
            messages,
            vec!["Field \"userId\" is part of a one-to-one relation and must be marked as @unique or be part of a model-level @@unique attribute"]
        );
        assert_eq!(edges[0].cardinality, Cardinality::OneToOne);

        let (_, messages) = infer(&schema("@unique"));
        assert!(messages.is_empty(), "{messages:?}");
    }

    #[test]
    fn self_relations_pair_by_name() {
        let (edges, messages) = infer(
            r#"
            model Person { id Int @id
                mentor   Person?  @relation("mentoring", fields: [mentorId], references: [id])
                mentorId Int?
                mentees  Person[] @relation("mentoring") }
            "#,
        );
        assert!(messages.is_empty(), "{messages:?}");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].cardinality, Cardinality::OneToMany);
        assert_eq!(edges[0].owning_end().map(|e| e.field.as_str()), Some("mentor"));
    }

    #[test]
    fn inherited_relation_fields_need_opposites_on_each_concrete_model() {
        let (_, messages) = infer(
            r#"
            model User { id String @id
                posts Post[] }
            abstract model Owned {
                owner User @relation(fields: [ownerId], references: [id])
                ownerId String }
            model Post extends Owned { id String @id }
            model Comment extends Owned { id String @id }
            "#,
        );
        assert_eq!(
            messages,
            vec!["The relation field \"owner\" on model \"Comment\" is missing an opposite relation field on model \"User\""]
        );
    }
}
