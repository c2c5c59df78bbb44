//! Change types for watched resources
use std::fmt;

/// Kind of change observed on a watched resource or propagated through
/// the service lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceChange {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for ResourceChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceChange::Added => write!(f, "ADDED"),
            ResourceChange::Modified => write!(f, "MODIFIED"),
            ResourceChange::Deleted => write!(f, "DELETED"),
        }
    }
}
