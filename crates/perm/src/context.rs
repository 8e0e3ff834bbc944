//! Per-call context carrying the caller's privilege set.

use crate::{Privilege, PrivilegeSet};
use std::sync::Arc;

/// Context passed explicitly alongside every call.
///
/// A context either carries a privilege set override (resolved once per
/// request or connection) or nothing, in which case the bound operation's
/// default set applies. Contexts are cheap to clone; the set is shared and
/// never mutated.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    privileges: Option<Arc<PrivilegeSet>>,
}

impl CallContext {
    /// A context without a privilege override.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a context carrying `privileges` as the caller's set.
    pub fn with_privileges(&self, privileges: PrivilegeSet) -> Self {
        Self {
            privileges: Some(Arc::new(privileges)),
        }
    }

    /// The privilege override, if any.
    pub fn privileges(&self) -> Option<&PrivilegeSet> {
        self.privileges.as_deref()
    }

    /// The override if present, else `default`.
    pub fn effective<'a>(&'a self, default: &'a PrivilegeSet) -> &'a PrivilegeSet {
        self.privileges.as_deref().unwrap_or(default)
    }

    pub fn has_perm(&self, default: &PrivilegeSet, privilege: &Privilege) -> bool {
        has_perm(self, default, privilege)
    }
}

/// Returns true iff `privilege` is in the context's override set, or in
/// `default` when the context carries none.
pub fn has_perm(ctx: &CallContext, default: &PrivilegeSet, privilege: &Privilege) -> bool {
    ctx.effective(default).contains(privilege)
}
