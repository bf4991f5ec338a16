//! `extends` resolution.
//!
//! - classifies every `extends` edge as an abstract mixin or a delegate edge,
//!   rejecting bases that are neither,
//! - detects cycles with a path-tracking depth-first walk started from every
//!   model, so each model that reaches a cycle gets its own diagnostic,
//! - flattens inherited fields and model-level attributes (bases first, in
//!   `extends` order) and reports field-name clashes.
//!
//! The flattened view is computed once per compile unit and is what every
//! later pass reads fields through.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use zmodel_dsl::ast::{AttributeApp, DataModel, Field};

use crate::diagnostic::{DiagnosticKind, Diagnostics};
use crate::symbols::SymbolTable;

/// Model-level attributes that stay on the declaring model.
const NON_INHERITED_ATTRIBUTES: [&str; 2] = ["@@delegate", "@@map"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InheritanceKind {
    AbstractMixin,
    Delegate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InheritanceEdge {
    pub model: String,
    pub base: String,
    pub kind: InheritanceKind,
}

/// A field as seen from a (possibly inheriting) model.
#[derive(Debug, Clone, Copy)]
pub struct FieldRef<'d> {
    pub field: &'d Field,
    pub declared_in: &'d DataModel,
    pub inherited: bool,
    /// Reached through at least one delegate edge.
    pub via_delegate: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct AttributeRef<'d> {
    pub attribute: &'d AttributeApp,
    pub declared_in: &'d DataModel,
}

#[derive(Debug, Default)]
pub struct Hierarchy<'d> {
    models: Vec<&'d DataModel>,
    index: HashMap<&'d str, usize>,
    /// Resolved `extends` targets; `None` marks an illegal base.
    bases: Vec<Vec<(usize, Option<InheritanceKind>)>>,
    edges: Vec<InheritanceEdge>,
    fields: Vec<Vec<FieldRef<'d>>>,
    attributes: Vec<Vec<AttributeRef<'d>>>,
}

impl<'d> Hierarchy<'d> {
    pub fn resolve(symbols: &SymbolTable<'d>, diagnostics: &mut Diagnostics) -> Self {
        let models: Vec<&'d DataModel> = symbols.models().collect();
        let mut index = HashMap::new();
        for (i, model) in models.iter().enumerate() {
            index.entry(model.name.as_str()).or_insert(i);
        }
        let mut hierarchy = Self {
            models,
            index,
            ..Default::default()
        };
        hierarchy.classify_edges(diagnostics);
        hierarchy.detect_cycles(diagnostics);
        hierarchy.flatten(diagnostics);
        tracing::debug!(
            models = hierarchy.models.len(),
            edges = hierarchy.edges.len(),
            "resolved inheritance"
        );
        hierarchy
    }

    fn classify_edges(&mut self, diagnostics: &mut Diagnostics) {
        let mut bases = Vec::with_capacity(self.models.len());
        let mut edges = Vec::new();
        for model in &self.models {
            let mut resolved = Vec::new();
            let mut delegates = 0usize;
            for base_name in &model.extends {
                // Unknown names are reported by the link pass.
                let Some(&b) = self.index.get(base_name.as_str()) else {
                    continue;
                };
                let base = self.models[b];
                let kind = if base.is_abstract {
                    Some(InheritanceKind::AbstractMixin)
                } else if is_delegate_base(base) {
                    Some(InheritanceKind::Delegate)
                } else {
                    diagnostics.error(
                        DiagnosticKind::Inheritance,
                        base_name.span,
                        format!(
                            "Model \"{base_name}\" cannot be extended because it's neither abstract nor marked as \"@@delegate\""
                        ),
                    );
                    None
                };
                if let Some(kind) = kind {
                    if kind == InheritanceKind::Delegate {
                        delegates += 1;
                    }
                    edges.push(InheritanceEdge {
                        model: model.name.name.clone(),
                        base: base.name.name.clone(),
                        kind,
                    });
                }
                resolved.push((b, kind));
            }
            if delegates > 1 {
                diagnostics.error(
                    DiagnosticKind::Inheritance,
                    model.name.span,
                    "Extending from multiple delegate models is not supported",
                );
            }
            bases.push(resolved);
        }
        self.bases = bases;
        self.edges = edges;
    }

    fn detect_cycles(&self, diagnostics: &mut Diagnostics) {
        for root in 0..self.models.len() {
            if let Some(cycle) = self.find_cycle_from(root) {
                let path: Vec<&str> = cycle
                    .iter()
                    .map(|&i| self.models[i].name.as_str())
                    .collect();
                diagnostics.error(
                    DiagnosticKind::Inheritance,
                    self.models[root].name.span,
                    format!("Circular inheritance detected: {}", path.join(" -> ")),
                );
            }
        }
    }

    /// First back edge reachable from `root`, as the path `root -> ... -> repeated`.
    fn find_cycle_from(&self, root: usize) -> Option<Vec<usize>> {
        let mut path = vec![root];
        let mut cursors = vec![0usize];
        let mut on_path: HashSet<usize> = HashSet::from([root]);
        let mut finished: HashSet<usize> = HashSet::new();

        while let Some(&node) = path.last() {
            let Some(cursor) = cursors.last_mut() else {
                break;
            };
            let next = self.bases[node].get(*cursor).map(|(child, _)| *child);
            *cursor += 1;
            match next {
                Some(child) if on_path.contains(&child) => {
                    path.push(child);
                    return Some(path);
                }
                Some(child) if finished.contains(&child) => {}
                Some(child) => {
                    path.push(child);
                    cursors.push(0);
                    on_path.insert(child);
                }
                None => {
                    path.pop();
                    cursors.pop();
                    on_path.remove(&node);
                    finished.insert(node);
                }
            }
        }
        None
    }

    fn flatten(&mut self, diagnostics: &mut Diagnostics) {
        let mut fields = Vec::with_capacity(self.models.len());
        let mut attributes = Vec::with_capacity(self.models.len());
        for i in 0..self.models.len() {
            let model = self.models[i];
            let mut visited = HashSet::from([i]);
            let mut collected_fields = Vec::new();
            let mut collected_attributes = Vec::new();
            self.collect_inherited(
                i,
                false,
                &mut visited,
                &mut collected_fields,
                &mut collected_attributes,
            );
            collected_fields.extend(model.fields.iter().map(|field| FieldRef {
                field,
                declared_in: model,
                inherited: false,
                via_delegate: false,
            }));
            collected_attributes.extend(model.attributes.iter().map(|attribute| AttributeRef {
                attribute,
                declared_in: model,
            }));
            fields.push(dedupe_fields(model, collected_fields, diagnostics));
            attributes.push(collected_attributes);
        }
        self.fields = fields;
        self.attributes = attributes;
    }

    fn collect_inherited(
        &self,
        model: usize,
        via_delegate: bool,
        visited: &mut HashSet<usize>,
        fields: &mut Vec<FieldRef<'d>>,
        attributes: &mut Vec<AttributeRef<'d>>,
    ) {
        for &(base, kind) in &self.bases[model] {
            if !visited.insert(base) {
                continue;
            }
            let Some(kind) = kind else {
                continue;
            };
            let through_delegate = via_delegate || kind == InheritanceKind::Delegate;
            self.collect_inherited(base, through_delegate, visited, fields, attributes);

            let base_model = self.models[base];
            fields.extend(base_model.fields.iter().map(|field| FieldRef {
                field,
                declared_in: base_model,
                inherited: true,
                via_delegate: through_delegate,
            }));
            attributes.extend(
                base_model
                    .attributes
                    .iter()
                    .filter(|a| !NON_INHERITED_ATTRIBUTES.contains(&a.name.as_str()))
                    .map(|attribute| AttributeRef {
                        attribute,
                        declared_in: base_model,
                    }),
            );
        }
    }

    pub fn models(&self) -> &[&'d DataModel] {
        &self.models
    }

    pub fn model(&self, name: &str) -> Option<&'d DataModel> {
        self.index.get(name).map(|&i| self.models[i])
    }

    /// Own and inherited fields of the named model, bases first.
    pub fn fields(&self, model: &str) -> &[FieldRef<'d>] {
        self.index
            .get(model)
            .map(|&i| self.fields[i].as_slice())
            .unwrap_or(&[])
    }

    /// Own and inherited model-level attributes of the named model.
    pub fn attributes(&self, model: &str) -> &[AttributeRef<'d>] {
        self.index
            .get(model)
            .map(|&i| self.attributes[i].as_slice())
            .unwrap_or(&[])
    }

    pub fn edges(&self) -> &[InheritanceEdge] {
        &self.edges
    }

    /// The delegate base `model` directly extends, if any.
    pub fn delegate_base(&self, model: &str) -> Option<&'d DataModel> {
        let &i = self.index.get(model)?;
        self.bases[i]
            .iter()
            .find(|(_, kind)| *kind == Some(InheritanceKind::Delegate))
            .map(|&(b, _)| self.models[b])
    }
}

pub fn is_delegate_base(model: &DataModel) -> bool {
    model.has_attribute("@@delegate")
}

fn dedupe_fields<'d>(
    model: &'d DataModel,
    collected: Vec<FieldRef<'d>>,
    diagnostics: &mut Diagnostics,
) -> Vec<FieldRef<'d>> {
    let mut seen: HashMap<&'d str, FieldRef<'d>> = HashMap::new();
    let mut out = Vec::with_capacity(collected.len());
    for field_ref in collected {
        let name = field_ref.field.name.as_str();
        let Some(previous) = seen.get(name) else {
            seen.insert(name, field_ref);
            out.push(field_ref);
            continue;
        };
        match (previous.inherited, field_ref.inherited) {
            (_, false) if !previous.inherited => diagnostics.error(
                DiagnosticKind::Structural,
                field_ref.field.name.span,
                format!("Duplicated declaration name \"{name}\""),
            ),
            (true, false) => diagnostics.error(
                DiagnosticKind::Structural,
                field_ref.field.name.span,
                format!(
                    "Field \"{name}\" is already inherited from model \"{}\"",
                    previous.declared_in.name
                ),
            ),
            // Clashes inside one base were reported on that base.
            _ if previous.declared_in.name == field_ref.declared_in.name => {}
            _ => diagnostics.error(
                DiagnosticKind::Structural,
                model.name.span,
                format!(
                    "Field \"{name}\" is inherited from both \"{}\" and \"{}\"",
                    previous.declared_in.name, field_ref.declared_in.name
                ),
            ),
        }
    }
    out
}
