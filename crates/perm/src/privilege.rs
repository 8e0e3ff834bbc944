//! Privilege identifiers and privilege sets.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque capability identifier, compared by equality only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Privilege(String);

impl Privilege {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Privilege {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Privilege {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Privilege {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Ordered list of privileges held by a caller.
///
/// Duplicates are allowed. Membership is the only meaningful query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrivilegeSet(Vec<Privilege>);

impl PrivilegeSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Linear scan; the first match wins.
    pub fn contains(&self, privilege: impl AsRef<str>) -> bool {
        let wanted = privilege.as_ref();
        self.0.iter().any(|p| p.as_str() == wanted)
    }

    pub fn push(&mut self, privilege: impl Into<Privilege>) {
        self.0.push(privilege.into());
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Privilege> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<P: Into<Privilege>> FromIterator<P> for PrivilegeSet {
    fn from_iter<I: IntoIterator<Item = P>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl From<Vec<Privilege>> for PrivilegeSet {
    fn from(privileges: Vec<Privilege>) -> Self {
        Self(privileges)
    }
}

impl<'a> IntoIterator for &'a PrivilegeSet {
    type Item = &'a Privilege;
    type IntoIter = std::slice::Iter<'a, Privilege>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
