use super::{ConversationTree, Metadata};
use crate::ids::{BranchId, VersionId};
use crate::message::{ContentPart, Role};

/// One displayed turn: a branch read through its current version.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PathMessage<'a> {
    pub branch_id: &'a BranchId,
    pub version_id: &'a VersionId,
    pub role: Role,
    pub parts: &'a [ContentPart],
    pub metadata: Option<&'a Metadata>,
}

/// Lazy walk over the current path. Cloning restarts from the same position.
#[derive(Clone, Debug)]
pub struct PathMessages<'a> {
    tree: &'a ConversationTree,
    ids: std::slice::Iter<'a, BranchId>,
}

impl<'a> Iterator for PathMessages<'a> {
    type Item = PathMessage<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.ids.next()?;
        let branch = self.tree.branches.get(id)?;
        let version = branch.current_version();
        Some(PathMessage {
            branch_id: &branch.branch_id,
            version_id: &version.id,
            role: branch.role,
            parts: &version.parts,
            metadata: version.metadata.as_ref(),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.ids.len()))
    }
}

impl ConversationTree {
    /// The displayed conversation, root to leaf.
    pub fn path_messages(&self) -> PathMessages<'_> {
        PathMessages {
            tree: self,
            ids: self.current_path.iter(),
        }
    }

    /// The displayed conversation without its last entry, which is the
    /// in-progress turn when building a provider request.
    pub fn request_history(&self) -> PathMessages<'_> {
        let end = self.current_path.len().saturating_sub(1);
        PathMessages {
            tree: self,
            ids: self.current_path[..end].iter(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::parts_text;

    #[test]
    fn test_path_messages_follow_current_versions() {
        let mut tree = ConversationTree::new();
        let u1 = tree.add_root_branch(Role::User, vec![ContentPart::text("first")]);
        tree.add_version(&u1, vec![ContentPart::text("edited")], false)
            .unwrap();
        let _a1 = tree
            .add_reply(&u1, Role::Assistant, vec![ContentPart::text("reply")])
            .unwrap();

        let texts: Vec<String> = tree.path_messages().map(|m| parts_text(m.parts)).collect();
        assert_eq!(texts, vec!["edited", "reply"]);

        let walk = tree.path_messages();
        assert_eq!(walk.clone().count(), 2);
        assert_eq!(walk.count(), 2);
    }

    #[test]
    fn test_request_history_skips_last_entry() {
        let mut tree = ConversationTree::new();
        let u1 = tree.add_root_branch(Role::User, vec![ContentPart::text("q")]);
        tree.add_reply(&u1, Role::Assistant, Vec::new()).unwrap();

        let roles: Vec<Role> = tree.request_history().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User]);
        assert_eq!(ConversationTree::new().request_history().count(), 0);
    }
}
