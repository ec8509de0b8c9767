//! ConversationTree - branches, versions and the currently displayed path
//!
//! A branch is one conversational turn. Each branch holds one or more
//! versions (edits, regenerations) and children hang off a specific
//! *version*, never off the branch as a whole: switching a branch's version
//! also switches which replies are reachable below it.

mod path;
mod stream;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

use crate::error::{Result, TreeError};
use crate::ids::{BranchId, VersionId};
use crate::message::{ContentPart, Role};

pub use path::{PathMessage, PathMessages};
pub use stream::{ReasoningFragment, StreamHandle, StreamSummary, TokenUsage};

/// Opaque side-channel data attached to a version (usage, reasoning, error flags).
pub type Metadata = Map<String, Value>;

/// One concrete payload for a branch.
#[derive(Clone, Debug, PartialEq)]
pub struct Version {
    pub(crate) id: VersionId,
    pub(crate) parts: Vec<ContentPart>,
    pub(crate) timestamp: DateTime<Utc>,
    pub(crate) child_branch_ids: Vec<BranchId>,
    pub(crate) metadata: Option<Metadata>,
}

impl Version {
    fn new(parts: Vec<ContentPart>, child_branch_ids: Vec<BranchId>) -> Self {
        Self {
            id: VersionId::new(),
            parts,
            timestamp: Utc::now(),
            child_branch_ids,
            metadata: None,
        }
    }

    pub fn id(&self) -> &VersionId {
        &self.id
    }

    pub fn parts(&self) -> &[ContentPart] {
        &self.parts
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Branches spawned from this specific version.
    pub fn child_branch_ids(&self) -> &[BranchId] {
        &self.child_branch_ids
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }
}

/// A node of the conversation tree.
#[derive(Clone, Debug, PartialEq)]
pub struct Branch {
    pub(crate) branch_id: BranchId,
    pub(crate) role: Role,
    pub(crate) parent_branch_id: Option<BranchId>,
    pub(crate) parent_version_id: Option<VersionId>,
    pub(crate) versions: Vec<Version>,
    pub(crate) current_version_index: usize,
}

impl Branch {
    pub fn branch_id(&self) -> &BranchId {
        &self.branch_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn parent_branch_id(&self) -> Option<&BranchId> {
        self.parent_branch_id.as_ref()
    }

    pub fn parent_version_id(&self) -> Option<&VersionId> {
        self.parent_version_id.as_ref()
    }

    pub fn versions(&self) -> &[Version] {
        &self.versions
    }

    pub fn current_version_index(&self) -> usize {
        self.current_version_index
    }

    pub fn current_version(&self) -> &Version {
        &self.versions[self.current_version_index]
    }

    fn current_version_mut(&mut self) -> &mut Version {
        let index = self.current_version_index;
        &mut self.versions[index]
    }

    pub fn version(&self, version_id: &VersionId) -> Option<&Version> {
        self.versions.iter().find(|v| &v.id == version_id)
    }

    fn version_position(&self, version_id: &VersionId) -> Option<usize> {
        self.versions.iter().position(|v| &v.id == version_id)
    }
}

/// Exact parent version a new branch is spawned from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParentRef {
    pub branch_id: BranchId,
    pub version_id: VersionId,
}

impl ParentRef {
    pub fn new(branch_id: BranchId, version_id: VersionId) -> Self {
        Self {
            branch_id,
            version_id,
        }
    }
}

/// Direction for [`ConversationTree::switch_version`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionStep {
    Previous,
    Next,
}

/// The versioned branch/version data structure for one conversation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConversationTree {
    pub(crate) branches: HashMap<BranchId, Branch>,
    pub(crate) root_branch_ids: Vec<BranchId>,
    pub(crate) current_path: Vec<BranchId>,
}

impl ConversationTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn branch(&self, branch_id: &BranchId) -> Option<&Branch> {
        self.branches.get(branch_id)
    }

    pub fn branches(&self) -> impl Iterator<Item = &Branch> {
        self.branches.values()
    }

    pub fn root_branch_ids(&self) -> &[BranchId] {
        &self.root_branch_ids
    }

    pub fn current_path(&self) -> &[BranchId] {
        &self.current_path
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Last branch of the displayed path, if any.
    pub fn leaf(&self) -> Option<&Branch> {
        self.current_path.last().and_then(|id| self.branches.get(id))
    }

    fn branch_ref(&self, branch_id: &BranchId) -> Result<&Branch> {
        self.branches
            .get(branch_id)
            .ok_or_else(|| TreeError::BranchNotFound(branch_id.clone()))
    }

    fn branch_mut(&mut self, branch_id: &BranchId) -> Result<&mut Branch> {
        self.branches
            .get_mut(branch_id)
            .ok_or_else(|| TreeError::BranchNotFound(branch_id.clone()))
    }

    /// Create a branch with a single version.
    ///
    /// Without a parent the branch becomes a new root and the displayed path
    /// restarts at it. With a parent, `parent.version_id` must be the parent's
    /// current version; the new branch is listed under that version and the
    /// displayed path is cut after the parent and continued with the new branch.
    pub fn add_branch(
        &mut self,
        role: Role,
        parts: Vec<ContentPart>,
        parent: Option<ParentRef>,
    ) -> Result<BranchId> {
        let Some(parent) = parent else {
            return Ok(self.add_root_branch(role, parts));
        };

        let parent_branch = self.branch_ref(&parent.branch_id)?;
        let current = parent_branch.current_version().id.clone();
        if current != parent.version_id {
            tracing::warn!(
                parent_branch_id = %parent.branch_id,
                given = %parent.version_id,
                current = %current,
                "ConversationTree: rejected child of stale parent version"
            );
            return Err(TreeError::StaleParentVersion {
                parent_branch_id: parent.branch_id,
                given: parent.version_id,
                current,
            });
        }
        let chain = match self.path_position(&parent.branch_id) {
            Some(_) => None,
            None => Some(self.path_to(&parent.branch_id)?),
        };

        let branch_id = BranchId::new();
        self.branches.insert(
            branch_id.clone(),
            Branch {
                branch_id: branch_id.clone(),
                role,
                parent_branch_id: Some(parent.branch_id.clone()),
                parent_version_id: Some(parent.version_id.clone()),
                versions: vec![Version::new(parts, Vec::new())],
                current_version_index: 0,
            },
        );
        if let Some(parent_branch) = self.branches.get_mut(&parent.branch_id) {
            parent_branch
                .current_version_mut()
                .child_branch_ids
                .push(branch_id.clone());
        }

        match (chain, self.path_position(&parent.branch_id)) {
            (Some(chain), _) => self.activate_chain(chain),
            (None, Some(pos)) => self.current_path.truncate(pos + 1),
            (None, None) => {}
        }
        self.current_path.push(branch_id.clone());

        tracing::debug!(
            branch_id = %branch_id,
            parent_branch_id = %parent.branch_id,
            role = %role,
            path_len = self.current_path.len(),
            "ConversationTree: added child branch"
        );
        Ok(branch_id)
    }

    /// Shorthand for a root branch.
    pub fn add_root_branch(&mut self, role: Role, parts: Vec<ContentPart>) -> BranchId {
        let branch_id = BranchId::new();
        self.branches.insert(
            branch_id.clone(),
            Branch {
                branch_id: branch_id.clone(),
                role,
                parent_branch_id: None,
                parent_version_id: None,
                versions: vec![Version::new(parts, Vec::new())],
                current_version_index: 0,
            },
        );
        self.root_branch_ids.push(branch_id.clone());
        self.current_path = vec![branch_id.clone()];
        tracing::debug!(branch_id = %branch_id, role = %role, "ConversationTree: added root branch");
        branch_id
    }

    /// Shorthand for a child of `parent_branch_id`'s current version.
    pub fn add_reply(
        &mut self,
        parent_branch_id: &BranchId,
        role: Role,
        parts: Vec<ContentPart>,
    ) -> Result<BranchId> {
        let version_id = self.branch_ref(parent_branch_id)?.current_version().id.clone();
        self.add_branch(
            role,
            parts,
            Some(ParentRef::new(parent_branch_id.clone(), version_id)),
        )
    }

    /// Append a version to a branch and make it current.
    ///
    /// With `inherit_children` the new version starts with the previous
    /// current version's children (metadata-only changes). Otherwise it starts
    /// childless, which is what an edit wants: replies to the old content stay
    /// with the old version.
    pub fn add_version(
        &mut self,
        branch_id: &BranchId,
        parts: Vec<ContentPart>,
        inherit_children: bool,
    ) -> Result<VersionId> {
        let branch = self.branch_mut(branch_id)?;
        let children = if inherit_children {
            branch.current_version().child_branch_ids.clone()
        } else {
            Vec::new()
        };
        let version = Version::new(parts, children);
        let version_id = version.id.clone();
        branch.versions.push(version);
        branch.current_version_index = branch.versions.len() - 1;
        let version_count = branch.versions.len();

        self.adopt_children(branch_id);
        self.repair_path_after(branch_id);

        tracing::debug!(
            branch_id = %branch_id,
            version_id = %version_id,
            version_count,
            inherit_children,
            "ConversationTree: added version"
        );
        Ok(version_id)
    }

    /// Move the branch's current version one step; `false` at either boundary
    /// or for an unknown branch.
    pub fn switch_version(&mut self, branch_id: &BranchId, step: VersionStep) -> bool {
        let Some(branch) = self.branches.get_mut(branch_id) else {
            tracing::warn!(branch_id = %branch_id, "ConversationTree: switch_version on unknown branch");
            return false;
        };

        let index = branch.current_version_index;
        let next = match step {
            VersionStep::Previous => index.checked_sub(1),
            VersionStep::Next => Some(index + 1).filter(|i| *i < branch.versions.len()),
        };
        let Some(next) = next else {
            return false;
        };
        branch.current_version_index = next;

        self.adopt_children(branch_id);
        self.repair_path_after(branch_id);

        tracing::debug!(
            branch_id = %branch_id,
            from = index,
            to = next,
            "ConversationTree: switched version"
        );
        true
    }

    /// Make a specific version current.
    pub fn select_version(&mut self, branch_id: &BranchId, version_id: &VersionId) -> Result<()> {
        let branch = self.branch_mut(branch_id)?;
        let index = branch
            .version_position(version_id)
            .ok_or_else(|| TreeError::VersionNotFound {
                branch_id: branch_id.clone(),
                version_id: version_id.clone(),
            })?;
        branch.current_version_index = index;

        self.adopt_children(branch_id);
        self.repair_path_after(branch_id);
        Ok(())
    }

    /// Delete a branch (with `all_versions`) or only its current version.
    ///
    /// Deleting the whole branch also deletes everything below it and cuts the
    /// displayed path at the deleted node. Deleting the current version fails
    /// with [`TreeError::LastVersion`] when it is the branch's only one.
    pub fn remove_branch(&mut self, branch_id: &BranchId, all_versions: bool) -> Result<()> {
        let branch = self.branch_ref(branch_id)?;

        if !all_versions {
            if branch.versions.len() == 1 {
                return Err(TreeError::LastVersion(branch_id.clone()));
            }
            let index = branch.current_version_index;
            self.remove_version_at(branch_id, index);
            return Ok(());
        }

        let parent_branch_id = branch.parent_branch_id.clone();
        let subtree = self.collect_subtree(branch_id);

        match parent_branch_id.and_then(|id| self.branches.get_mut(&id)) {
            Some(parent) => {
                for version in &mut parent.versions {
                    version.child_branch_ids.retain(|id| id != branch_id);
                }
            }
            None => self.root_branch_ids.retain(|id| id != branch_id),
        }
        for id in &subtree {
            self.branches.remove(id);
        }
        if let Some(pos) = self.path_position(branch_id) {
            self.current_path.truncate(pos);
        }

        tracing::debug!(
            branch_id = %branch_id,
            removed = subtree.len(),
            path_len = self.current_path.len(),
            "ConversationTree: removed branch"
        );
        Ok(())
    }

    /// Delete one version by identity.
    ///
    /// Targeting by id keeps a version created concurrently (e.g. by a stream)
    /// from being hit through a stale index.
    pub fn remove_version_by_id(&mut self, branch_id: &BranchId, version_id: &VersionId) -> Result<()> {
        let branch = self.branch_ref(branch_id)?;
        let index = branch
            .version_position(version_id)
            .ok_or_else(|| TreeError::VersionNotFound {
                branch_id: branch_id.clone(),
                version_id: version_id.clone(),
            })?;
        if branch.versions.len() == 1 {
            return Err(TreeError::LastVersion(branch_id.clone()));
        }
        self.remove_version_at(branch_id, index);
        Ok(())
    }

    /// Merge the updater's output into the current version's metadata.
    /// Keys the updater does not return are kept.
    pub fn patch_metadata<F>(&mut self, branch_id: &BranchId, updater: F) -> Result<()>
    where
        F: FnOnce(Option<&Metadata>) -> Metadata,
    {
        let version = self.branch_mut(branch_id)?.current_version_mut();
        merge_metadata(version, updater);
        Ok(())
    }

    /// Same as [`patch_metadata`](Self::patch_metadata) but for a version named by id.
    pub fn patch_version_metadata<F>(
        &mut self,
        branch_id: &BranchId,
        version_id: &VersionId,
        updater: F,
    ) -> Result<()>
    where
        F: FnOnce(Option<&Metadata>) -> Metadata,
    {
        let branch = self.branch_mut(branch_id)?;
        let index = branch
            .version_position(version_id)
            .ok_or_else(|| TreeError::VersionNotFound {
                branch_id: branch_id.clone(),
                version_id: version_id.clone(),
            })?;
        merge_metadata(&mut branch.versions[index], updater);
        Ok(())
    }

    /// Branch ids from a root down to `branch_id`, following parent pointers.
    pub fn path_to(&self, branch_id: &BranchId) -> Result<Vec<BranchId>> {
        let mut chain = vec![branch_id.clone()];
        let mut cursor = self.branch_ref(branch_id)?;

        while let Some(parent_id) = &cursor.parent_branch_id {
            if chain.len() > self.branches.len() {
                return Err(TreeError::Invariant(format!(
                    "parent chain of {branch_id} does not reach a root"
                )));
            }
            cursor = self.branch_ref(parent_id)?;
            chain.push(parent_id.clone());
        }

        chain.reverse();
        Ok(chain)
    }

    /// Display `branch_id` and everything above it: the path becomes
    /// `path_to(branch_id)` continued down to a leaf, and every ancestor's
    /// current version is aligned so the path stays connected.
    pub fn set_current_branch(&mut self, branch_id: &BranchId) -> Result<()> {
        self.activate_path_to(branch_id)?;
        self.extend_path();
        Ok(())
    }

    /// Validate every structural invariant of the tree.
    pub fn check_invariants(&self) -> Result<()> {
        let violation = |msg: String| Err(TreeError::Invariant(msg));

        for (key, branch) in &self.branches {
            if key != &branch.branch_id {
                return violation(format!("branch stored under {key} has id {}", branch.branch_id));
            }
            if branch.versions.is_empty() {
                return violation(format!("branch {key} has no versions"));
            }
            if branch.current_version_index >= branch.versions.len() {
                return violation(format!(
                    "branch {key} current index {} out of range {}",
                    branch.current_version_index,
                    branch.versions.len()
                ));
            }
            let mut seen = HashSet::new();
            for version in &branch.versions {
                if !seen.insert(&version.id) {
                    return violation(format!("branch {key} repeats version {}", version.id));
                }
                for child_id in &version.child_branch_ids {
                    match self.branches.get(child_id) {
                        Some(child) if child.parent_branch_id.as_ref() == Some(key) => {}
                        Some(_) => {
                            return violation(format!(
                                "child {child_id} of {key} points at another parent"
                            ))
                        }
                        None => return violation(format!("child {child_id} of {key} is missing")),
                    }
                }
            }

            match (&branch.parent_branch_id, &branch.parent_version_id) {
                (None, None) => {
                    if !self.root_branch_ids.contains(key) {
                        return violation(format!("parentless branch {key} is not a root"));
                    }
                }
                (Some(parent_id), Some(parent_version_id)) => {
                    let Some(parent) = self.branches.get(parent_id) else {
                        return violation(format!("parent {parent_id} of {key} is missing"));
                    };
                    let listed = parent
                        .version(parent_version_id)
                        .map(|v| v.child_branch_ids.contains(key))
                        .unwrap_or(false);
                    if !listed {
                        return violation(format!(
                            "parent version {parent_version_id} does not list {key}"
                        ));
                    }
                }
                _ => return violation(format!("branch {key} has a half-set parent link")),
            }
        }

        for root_id in &self.root_branch_ids {
            match self.branches.get(root_id) {
                Some(root) if root.parent_branch_id.is_none() => {}
                Some(_) => return violation(format!("root {root_id} has a parent")),
                None => return violation(format!("root {root_id} is missing")),
            }
        }

        for (i, id) in self.current_path.iter().enumerate() {
            let Some(branch) = self.branches.get(id) else {
                return violation(format!("path entry {id} is missing"));
            };
            if i == 0 {
                if branch.parent_branch_id.is_some() {
                    return violation(format!("path starts at non-root {id}"));
                }
                continue;
            }
            let prev = &self.branches[&self.current_path[i - 1]];
            if branch.parent_branch_id.as_ref() != Some(&prev.branch_id)
                || branch.parent_version_id.as_ref() != Some(&prev.current_version().id)
            {
                return violation(format!(
                    "path link {} -> {id} does not follow the current version",
                    prev.branch_id
                ));
            }
        }

        Ok(())
    }

    fn path_position(&self, branch_id: &BranchId) -> Option<usize> {
        self.current_path.iter().position(|id| id == branch_id)
    }

    /// Point the current version's children back at it.
    fn adopt_children(&mut self, branch_id: &BranchId) {
        let Some(branch) = self.branches.get(branch_id) else {
            return;
        };
        let version = branch.current_version();
        let version_id = version.id.clone();
        let children = version.child_branch_ids.clone();

        for child_id in children {
            if let Some(child) = self.branches.get_mut(&child_id) {
                if child.parent_branch_id.as_ref() == Some(branch_id) {
                    child.parent_version_id = Some(version_id.clone());
                }
            }
        }
    }

    /// After `branch_id`'s current version changed, keep the displayed
    /// continuation if the new version still lists it, otherwise cut and
    /// follow the new version's children.
    fn repair_path_after(&mut self, branch_id: &BranchId) {
        let Some(pos) = self.path_position(branch_id) else {
            return;
        };

        let still_reachable = match (self.current_path.get(pos + 1), self.branches.get(branch_id)) {
            (Some(next), Some(branch)) => branch.current_version().child_branch_ids.contains(next),
            _ => false,
        };
        if !still_reachable {
            self.current_path.truncate(pos + 1);
            self.extend_path();
        }
    }

    /// Follow the most recent child of each current version down to a leaf.
    fn extend_path(&mut self) {
        while let Some(tail) = self.current_path.last() {
            let next = self
                .branches
                .get(tail)
                .and_then(|b| b.current_version().child_branch_ids.last())
                .filter(|id| self.branches.contains_key(*id))
                .cloned();
            match next {
                Some(id) if self.current_path.len() <= self.branches.len() => {
                    self.current_path.push(id)
                }
                _ => break,
            }
        }
    }

    /// Set the displayed path to `path_to(branch_id)`, switching each
    /// ancestor to the version its path child hangs from.
    fn activate_path_to(&mut self, branch_id: &BranchId) -> Result<()> {
        let chain = self.path_to(branch_id)?;
        self.activate_chain(chain);
        Ok(())
    }

    fn activate_chain(&mut self, chain: Vec<BranchId>) {
        for pair in chain.windows(2) {
            let parent_version_id = self
                .branches
                .get(&pair[1])
                .and_then(|child| child.parent_version_id.clone());
            let Some(parent_version_id) = parent_version_id else {
                continue;
            };
            if let Some(parent) = self.branches.get_mut(&pair[0]) {
                if let Some(index) = parent.version_position(&parent_version_id) {
                    parent.current_version_index = index;
                }
            }
            self.adopt_children(&pair[0]);
        }

        self.current_path = chain;
    }

    /// Every branch below `branch_id` (through all versions), including itself.
    fn collect_subtree(&self, branch_id: &BranchId) -> Vec<BranchId> {
        let mut seen = HashSet::new();
        let mut stack = vec![branch_id.clone()];
        let mut out = Vec::new();

        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(branch) = self.branches.get(&id) {
                for version in &branch.versions {
                    stack.extend(version.child_branch_ids.iter().cloned());
                }
            }
            out.push(id);
        }
        out
    }

    /// Remove the version at `index`; the caller has checked it is not the
    /// branch's only version.
    fn remove_version_at(&mut self, branch_id: &BranchId, index: usize) {
        let Some(branch) = self.branches.get_mut(branch_id) else {
            return;
        };

        let removed = branch.versions.remove(index);
        let current = branch.current_version_index;
        branch.current_version_index = if index < current {
            current - 1
        } else if index == current {
            current.saturating_sub(1)
        } else {
            current
        };
        let current_index = branch.current_version_index;

        // Children still listed by a surviving version are kept and re-homed;
        // the rest go with the removed version.
        let mut orphans = Vec::new();
        let mut rehome = Vec::new();
        for child_id in &removed.child_branch_ids {
            let current_lists = branch.versions[current_index]
                .child_branch_ids
                .contains(child_id);
            let holder = if current_lists {
                Some(branch.versions[current_index].id.clone())
            } else {
                branch
                    .versions
                    .iter()
                    .find(|v| v.child_branch_ids.contains(child_id))
                    .map(|v| v.id.clone())
            };
            match holder {
                Some(holder) => rehome.push((child_id.clone(), holder)),
                None => orphans.push(child_id.clone()),
            }
        }

        for (child_id, holder) in rehome {
            if let Some(child) = self.branches.get_mut(&child_id) {
                if child.parent_version_id.as_ref() == Some(&removed.id) {
                    child.parent_version_id = Some(holder);
                }
            }
        }
        let mut removed_count = 0;
        for orphan in orphans {
            for id in self.collect_subtree(&orphan) {
                if self.branches.remove(&id).is_some() {
                    removed_count += 1;
                }
            }
        }

        self.adopt_children(branch_id);
        self.repair_path_after(branch_id);

        tracing::debug!(
            branch_id = %branch_id,
            version_id = %removed.id,
            removed_descendants = removed_count,
            "ConversationTree: removed version"
        );
    }

    /// Bring a decoded tree back in line with the structural invariants.
    ///
    /// A no-op for any tree built through the mutation primitives.
    pub(crate) fn repair(&mut self) {
        self.branches.retain(|id, branch| {
            if branch.versions.is_empty() {
                tracing::warn!(branch_id = %id, "ConversationTree: dropping branch without versions");
                return false;
            }
            let current = branch
                .versions
                .get(branch.current_version_index)
                .map(|v| v.id.clone());
            let before = branch.versions.len();
            let mut seen = HashSet::new();
            branch.versions.retain(|v| seen.insert(v.id.clone()));
            if branch.versions.len() < before {
                tracing::warn!(
                    branch_id = %id,
                    dropped = before - branch.versions.len(),
                    "ConversationTree: dropping repeated version ids"
                );
                if let Some(index) = current.and_then(|c| branch.version_position(&c)) {
                    branch.current_version_index = index;
                }
            }
            if branch.current_version_index >= branch.versions.len() {
                branch.current_version_index = branch.versions.len() - 1;
            }
            true
        });

        // Parent links: unknown parents make the branch a root, parents that
        // exist but do not list the branch get it listed again.
        let ids: Vec<BranchId> = self.branches.keys().cloned().collect();
        for id in &ids {
            let (parent_id, parent_version_id) = match self.branches.get(id) {
                Some(b) => (b.parent_branch_id.clone(), b.parent_version_id.clone()),
                None => continue,
            };
            let Some(parent_id) = parent_id else {
                if let Some(b) = self.branches.get_mut(id) {
                    b.parent_version_id = None;
                }
                continue;
            };
            if parent_id == *id || !self.branches.contains_key(&parent_id) {
                if let Some(b) = self.branches.get_mut(id) {
                    b.parent_branch_id = None;
                    b.parent_version_id = None;
                }
                continue;
            }

            let mut home = None;
            if let Some(parent) = self.branches.get_mut(&parent_id) {
                let listing = parent
                    .versions
                    .iter()
                    .find(|v| v.child_branch_ids.contains(id))
                    .map(|v| v.id.clone());
                home = match parent_version_id.and_then(|pv| parent.version_position(&pv)) {
                    Some(index) => {
                        let version = &mut parent.versions[index];
                        if !version.child_branch_ids.contains(id) {
                            version.child_branch_ids.push(id.clone());
                        }
                        Some(version.id.clone())
                    }
                    None => match listing {
                        Some(version_id) => Some(version_id),
                        None => {
                            let version = parent.current_version_mut();
                            version.child_branch_ids.push(id.clone());
                            Some(version.id.clone())
                        }
                    },
                };
            }
            if let Some(b) = self.branches.get_mut(id) {
                b.parent_version_id = home;
            }
        }

        // Child lists only name existing branches that point back.
        let parents: HashMap<BranchId, Option<BranchId>> = self
            .branches
            .iter()
            .map(|(id, b)| (id.clone(), b.parent_branch_id.clone()))
            .collect();
        for (id, branch) in self.branches.iter_mut() {
            for version in &mut branch.versions {
                let mut seen = HashSet::new();
                version.child_branch_ids.retain(|child| {
                    parents.get(child).and_then(|p| p.as_ref()) == Some(id)
                        && seen.insert(child.clone())
                });
            }
        }

        let mut seen = HashSet::new();
        self.root_branch_ids.retain(|id| {
            parents.get(id).map(|p| p.is_none()).unwrap_or(false) && seen.insert(id.clone())
        });
        let mut missing_roots: Vec<BranchId> = parents
            .iter()
            .filter(|(id, parent)| parent.is_none() && !self.root_branch_ids.contains(id))
            .map(|(id, _)| id.clone())
            .collect();
        missing_roots.sort();
        self.root_branch_ids.extend(missing_roots);

        for id in &ids {
            self.adopt_path_link(id);
        }

        let mut valid = 0;
        for (i, id) in self.current_path.iter().enumerate() {
            let Some(branch) = self.branches.get(id) else {
                break;
            };
            let linked = if i == 0 {
                branch.parent_branch_id.is_none()
            } else {
                let prev = &self.branches[&self.current_path[i - 1]];
                branch.parent_branch_id.as_ref() == Some(&prev.branch_id)
                    && branch.parent_version_id.as_ref() == Some(&prev.current_version().id)
            };
            if !linked {
                break;
            }
            valid = i + 1;
        }
        if valid < self.current_path.len() {
            tracing::warn!(
                kept = valid,
                dropped = self.current_path.len() - valid,
                "ConversationTree: truncated broken current path"
            );
            self.current_path.truncate(valid);
        }
    }

    /// A child listed by its parent's current version belongs to that version.
    fn adopt_path_link(&mut self, branch_id: &BranchId) {
        let Some(parent_id) = self
            .branches
            .get(branch_id)
            .and_then(|b| b.parent_branch_id.clone())
        else {
            return;
        };
        let current = self.branches.get(&parent_id).and_then(|parent| {
            let version = parent.current_version();
            version
                .child_branch_ids
                .contains(branch_id)
                .then(|| version.id.clone())
        });
        if let (Some(current), Some(branch)) = (current, self.branches.get_mut(branch_id)) {
            branch.parent_version_id = Some(current);
        }
    }
}

fn merge_metadata<F>(version: &mut Version, updater: F)
where
    F: FnOnce(Option<&Metadata>) -> Metadata,
{
    let patch = updater(version.metadata.as_ref());
    version
        .metadata
        .get_or_insert_with(Metadata::new)
        .extend(patch);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Vec<ContentPart> {
        vec![ContentPart::text(s)]
    }

    #[test]
    fn test_root_branch_starts_path() {
        let mut tree = ConversationTree::new();
        let root = tree.add_root_branch(Role::User, text("hi"));

        assert_eq!(tree.root_branch_ids(), &[root.clone()]);
        assert_eq!(tree.current_path(), &[root]);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_child_prunes_previous_suffix() {
        let mut tree = ConversationTree::new();
        let u1 = tree.add_root_branch(Role::User, text("hi"));
        let a1 = tree.add_reply(&u1, Role::Assistant, text("hello")).unwrap();
        let _u2 = tree.add_reply(&a1, Role::User, text("more")).unwrap();

        let regen = tree.add_reply(&u1, Role::Assistant, text("again")).unwrap();

        assert_eq!(tree.current_path(), &[u1.clone(), regen.clone()]);
        let u1_children = tree.branch(&u1).unwrap().current_version().child_branch_ids();
        assert_eq!(u1_children, &[a1, regen]);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_stale_parent_is_rejected_without_changes() {
        let mut tree = ConversationTree::new();
        let u1 = tree.add_root_branch(Role::User, text("hi"));
        let old_version = tree.branch(&u1).unwrap().current_version().id().clone();
        tree.add_version(&u1, text("hi, edited"), false).unwrap();
        let before = tree.clone();

        let result = tree.add_branch(
            Role::Assistant,
            text("late"),
            Some(ParentRef::new(u1.clone(), old_version)),
        );

        assert!(matches!(result, Err(TreeError::StaleParentVersion { .. })));
        assert_eq!(tree, before);
    }

    #[test]
    fn test_unknown_parent() {
        let mut tree = ConversationTree::new();
        let result = tree.add_reply(&BranchId::from("nope"), Role::User, text("x"));
        assert_eq!(result, Err(TreeError::BranchNotFound(BranchId::from("nope"))));
    }

    #[test]
    fn test_switch_version_clamps() {
        let mut tree = ConversationTree::new();
        let u1 = tree.add_root_branch(Role::User, text("v1"));
        tree.add_version(&u1, text("v2"), false).unwrap();

        assert!(!tree.switch_version(&u1, VersionStep::Next));
        assert!(tree.switch_version(&u1, VersionStep::Previous));
        assert!(!tree.switch_version(&u1, VersionStep::Previous));
        assert_eq!(tree.branch(&u1).unwrap().current_version_index(), 0);
    }

    #[test]
    fn test_inherited_children_follow_current_version() {
        let mut tree = ConversationTree::new();
        let u1 = tree.add_root_branch(Role::User, text("hi"));
        let a1 = tree.add_reply(&u1, Role::Assistant, text("hello")).unwrap();

        let v2 = tree.add_version(&u1, text("hi"), true).unwrap();

        assert_eq!(tree.current_path(), &[u1.clone(), a1.clone()]);
        assert_eq!(tree.branch(&a1).unwrap().parent_version_id(), Some(&v2));
        tree.check_invariants().unwrap();

        assert!(tree.switch_version(&u1, VersionStep::Previous));
        assert_eq!(tree.current_path(), &[u1, a1]);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_only_version_fails() {
        let mut tree = ConversationTree::new();
        let u1 = tree.add_root_branch(Role::User, text("hi"));
        assert_eq!(
            tree.remove_branch(&u1, false),
            Err(TreeError::LastVersion(u1.clone()))
        );
        assert_eq!(tree.branch(&u1).unwrap().versions().len(), 1);
    }

    #[test]
    fn test_remove_branch_drops_subtree() {
        let mut tree = ConversationTree::new();
        let u1 = tree.add_root_branch(Role::User, text("hi"));
        let a1 = tree.add_reply(&u1, Role::Assistant, text("hello")).unwrap();
        let u2 = tree.add_reply(&a1, Role::User, text("and?")).unwrap();

        tree.remove_branch(&a1, true).unwrap();

        assert!(tree.branch(&a1).is_none());
        assert!(tree.branch(&u2).is_none());
        assert_eq!(tree.current_path(), &[u1.clone()]);
        assert!(tree.branch(&u1).unwrap().current_version().child_branch_ids().is_empty());
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_patch_metadata_merges() {
        let mut tree = ConversationTree::new();
        let u1 = tree.add_root_branch(Role::User, text("hi"));
        tree.patch_metadata(&u1, |_| {
            let mut m = Metadata::new();
            m.insert("model".into(), Value::from("gpt-4"));
            m
        })
        .unwrap();
        tree.patch_metadata(&u1, |old| {
            assert_eq!(old.and_then(|m| m.get("model")), Some(&Value::from("gpt-4")));
            let mut m = Metadata::new();
            m.insert("tokens".into(), Value::from(12));
            m
        })
        .unwrap();

        let metadata = tree.branch(&u1).unwrap().current_version().metadata().unwrap();
        assert_eq!(metadata.get("model"), Some(&Value::from("gpt-4")));
        assert_eq!(metadata.get("tokens"), Some(&Value::from(12)));
    }

    #[test]
    fn test_path_to_walks_to_root() {
        let mut tree = ConversationTree::new();
        let u1 = tree.add_root_branch(Role::User, text("hi"));
        let a1 = tree.add_reply(&u1, Role::Assistant, text("hello")).unwrap();
        let u2 = tree.add_reply(&a1, Role::User, text("and?")).unwrap();

        assert_eq!(tree.path_to(&u2).unwrap(), vec![u1, a1, u2]);
    }
}
