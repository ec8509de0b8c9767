use thiserror::Error;

use crate::ids::{BranchId, VersionId};

/// Structural failures reported by the tree's mutation primitives.
///
/// A primitive that returns one of these has not modified the tree.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("branch not found: {0}")]
    BranchNotFound(BranchId),

    #[error("version {version_id} not found on branch {branch_id}")]
    VersionNotFound {
        branch_id: BranchId,
        version_id: VersionId,
    },

    #[error(
        "stale parent version for branch {parent_branch_id}: got {given}, current is {current}"
    )]
    StaleParentVersion {
        parent_branch_id: BranchId,
        given: VersionId,
        current: VersionId,
    },

    #[error("branch {0} has a single version left")]
    LastVersion(BranchId),

    #[error("tree invariant violated: {0}")]
    Invariant(String),
}

/// Failures while turning a transport value back into a tree.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("expected a JSON object for the conversation tree, found {0}")]
    NotAnObject(&'static str),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TreeError>;
