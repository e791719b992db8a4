//! Actions the differ can decide on

use crate::resource::ResourceSpec;
use std::fmt;

/// The single step that moves a resource towards its desired state
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    NoOp,
    Create(ResourceSpec),
    /// Replace an immutable object
    Recreate {
        old_id: String,
        spec: ResourceSpec,
    },
    Remove {
        id: String,
    },
    /// Update a mutable object in place
    Redeploy {
        old_id: String,
        spec: ResourceSpec,
    },
}

impl Action {
    pub fn verb(&self) -> &'static str {
        match self {
            Action::NoOp => "noop",
            Action::Create(_) => "create",
            Action::Recreate { .. } => "recreate",
            Action::Remove { .. } => "remove",
            Action::Redeploy { .. } => "redeploy",
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Action::NoOp)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::NoOp | Action::Create(_) => f.write_str(self.verb()),
            Action::Recreate { old_id, .. }
            | Action::Remove { id: old_id }
            | Action::Redeploy { old_id, .. } => write!(f, "{} {}", self.verb(), old_id),
        }
    }
}
