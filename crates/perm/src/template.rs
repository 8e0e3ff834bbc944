//! Permission templates: declared operation surfaces.
//!
//! A template names the operations a service exposes, the shape of each
//! operation's result and the privilege required to invoke it. Templates
//! can embed other templates; see [`Template::resolve`] for how the
//! combined slot set is computed.

use crate::{Privilege, TemplateError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

/// Declaration marking a slot as outside the permission system.
pub const EXCLUDED: &str = "-";

/// Result shape of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    /// Returns only an error position.
    Unit,
    /// Returns a value and an error position.
    Value,
    /// Returns an open stream of values and an error position.
    Stream,
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Shape::Unit => "unit",
            Shape::Value => "value",
            Shape::Stream => "stream",
        })
    }
}

/// What a slot's declaration asks of the binder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// No declaration, or an empty one. Binding fails.
    Missing,
    /// The slot is carved out and never bound.
    Excluded,
    /// Callers need this privilege.
    Privilege(Privilege),
}

/// A single slot declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    /// Raw privilege declaration, `"-"` for excluded slots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perm: Option<String>,

    pub shape: Shape,
}

impl Slot {
    pub fn requirement(&self) -> Requirement {
        match self.perm.as_deref() {
            None | Some("") => Requirement::Missing,
            Some(EXCLUDED) => Requirement::Excluded,
            Some(p) => Requirement::Privilege(Privilege::new(p)),
        }
    }
}

/// Declarative description of a checked operation surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    slots: BTreeMap<String, Slot>,

    #[serde(skip)]
    embeds: Vec<Template>,
}

impl Template {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Load a template from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TemplateError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse a template from a TOML string.
    ///
    /// Declarations are not validated here; that happens at bind time.
    pub fn parse(toml: &str) -> Result<Self, TemplateError> {
        toml::from_str(toml).map_err(|e| TemplateError::Parse(e.to_string()))
    }

    /// Declare a slot requiring `perm`. An empty string is kept as-is and
    /// rejected when binding.
    pub fn slot(mut self, name: impl Into<String>, shape: Shape, perm: impl Into<String>) -> Self {
        self.slots.insert(
            name.into(),
            Slot {
                perm: Some(perm.into()),
                shape,
            },
        );
        self
    }

    /// Declare a slot that is never bound.
    pub fn excluded(self, name: impl Into<String>, shape: Shape) -> Self {
        self.slot(name, shape, EXCLUDED)
    }

    /// Declare a slot with no privilege declaration at all.
    pub fn undeclared(mut self, name: impl Into<String>, shape: Shape) -> Self {
        self.slots.insert(name.into(), Slot { perm: None, shape });
        self
    }

    /// Embed `inner`. Its slots become reachable from this template unless a
    /// slot of the same name is declared at a shallower level.
    pub fn embed(mut self, inner: Template) -> Self {
        self.embeds.push(inner);
        self
    }

    /// Slots declared directly on this template.
    pub fn slots(&self) -> impl Iterator<Item = (&str, &Slot)> {
        self.slots.iter().map(|(name, slot)| (name.as_str(), slot))
    }

    /// The full transitive slot set.
    ///
    /// Templates are visited level by level, outermost first. A name seen at
    /// a shallower level shadows every deeper declaration of that name; at
    /// the same depth the earlier embedding wins.
    pub fn resolve(&self) -> Vec<(&str, &Slot)> {
        let mut seen = HashSet::new();
        let mut resolved = Vec::new();
        let mut level = vec![self];

        while !level.is_empty() {
            let mut claimed = Vec::new();
            let mut next = Vec::new();
            for template in level {
                for (name, slot) in template.slots() {
                    if !seen.contains(name) && !claimed.iter().any(|(n, _)| *n == name) {
                        claimed.push((name, slot));
                    }
                }
                next.extend(template.embeds.iter());
            }
            seen.extend(claimed.iter().map(|(n, _)| *n));
            resolved.extend(claimed);
            level = next;
        }

        resolved
    }
}
