//! Tests for branch/version structure edits

use chat_tree::{
    parts_text, BranchId, ContentPart, ConversationTree, ParentRef, Role, TreeError, VersionStep,
};

fn text(s: &str) -> Vec<ContentPart> {
    vec![ContentPart::text(s)]
}

fn current_text(tree: &ConversationTree, branch_id: &BranchId) -> String {
    parts_text(tree.branch(branch_id).unwrap().current_version().parts())
}

#[test]
fn test_hello_scenario() {
    let mut tree = ConversationTree::new();
    let u1 = tree.add_branch(Role::User, text("hi"), None).unwrap();
    let u1_version = tree.branch(&u1).unwrap().current_version().id().clone();
    let a1 = tree
        .add_branch(
            Role::Assistant,
            text(""),
            Some(ParentRef::new(u1.clone(), u1_version)),
        )
        .unwrap();
    let follow_up = tree.add_reply(&a1, Role::User, text("thanks")).unwrap();

    let handle = tree.begin_stream(&a1).unwrap();
    tree.stream_append_text(&handle, "He").unwrap();
    tree.stream_append_text(&handle, "llo").unwrap();
    assert_eq!(current_text(&tree, &a1), "Hello");

    tree.add_version(&a1, text("Hi there"), false).unwrap();

    let a1_branch = tree.branch(&a1).unwrap();
    assert_eq!(a1_branch.versions().len(), 2);
    assert_eq!(a1_branch.current_version_index(), 1);
    assert!(a1_branch.versions()[1].child_branch_ids().is_empty());
    assert_eq!(a1_branch.versions()[0].child_branch_ids(), &[follow_up]);
    assert_eq!(tree.current_path(), &[u1, a1]);
    tree.check_invariants().unwrap();
}

#[test]
fn test_version_isolation() {
    let mut tree = ConversationTree::new();
    let x = tree.add_root_branch(Role::User, text("question"));
    let a = tree.add_reply(&x, Role::Assistant, text("answer A")).unwrap();
    let b = tree.add_reply(&x, Role::Assistant, text("answer B")).unwrap();

    tree.add_version(&x, text("question, edited"), false).unwrap();
    assert!(tree
        .branch(&x)
        .unwrap()
        .current_version()
        .child_branch_ids()
        .is_empty());
    assert_eq!(tree.current_path(), &[x.clone()]);

    assert!(tree.switch_version(&x, VersionStep::Previous));

    let restored = tree.branch(&x).unwrap().current_version().child_branch_ids();
    assert_eq!(restored, &[a.clone(), b.clone()]);
    assert_eq!(current_text(&tree, &a), "answer A");
    assert_eq!(current_text(&tree, &b), "answer B");
    assert_eq!(tree.current_path(), &[x, b]);
    tree.check_invariants().unwrap();
}

#[test]
fn test_switch_keeps_path_when_child_still_listed() {
    let mut tree = ConversationTree::new();
    let u1 = tree.add_root_branch(Role::User, text("hi"));
    let a1 = tree.add_reply(&u1, Role::Assistant, text("hello")).unwrap();
    let u2 = tree.add_reply(&a1, Role::User, text("more")).unwrap();

    tree.add_version(&a1, text("hello"), true).unwrap();
    assert_eq!(tree.current_path(), &[u1.clone(), a1.clone(), u2.clone()]);

    assert!(tree.switch_version(&a1, VersionStep::Previous));
    assert_eq!(tree.current_path(), &[u1, a1, u2]);
    tree.check_invariants().unwrap();
}

#[test]
fn test_switch_on_unknown_branch_is_false() {
    let mut tree = ConversationTree::new();
    assert!(!tree.switch_version(&BranchId::from("missing"), VersionStep::Next));
}

#[test]
fn test_remove_current_version_decrements_index() {
    let mut tree = ConversationTree::new();
    let u1 = tree.add_root_branch(Role::User, text("v1"));
    tree.add_version(&u1, text("v2"), false).unwrap();
    tree.add_version(&u1, text("v3"), false).unwrap();

    tree.remove_branch(&u1, false).unwrap();

    let branch = tree.branch(&u1).unwrap();
    assert_eq!(branch.versions().len(), 2);
    assert_eq!(branch.current_version_index(), 1);
    assert_eq!(current_text(&tree, &u1), "v2");
    tree.check_invariants().unwrap();
}

#[test]
fn test_remove_version_by_id_keeps_other_versions() {
    let mut tree = ConversationTree::new();
    let a1 = tree.add_root_branch(Role::Assistant, text("ok"));
    let failed = tree.add_version(&a1, text("error placeholder"), false).unwrap();
    let retry = tree.add_version(&a1, text("retry"), false).unwrap();

    tree.remove_version_by_id(&a1, &failed).unwrap();

    let branch = tree.branch(&a1).unwrap();
    assert_eq!(branch.versions().len(), 2);
    assert_eq!(branch.current_version().id(), &retry);
    assert_eq!(
        tree.remove_version_by_id(&a1, &failed),
        Err(TreeError::VersionNotFound {
            branch_id: a1.clone(),
            version_id: failed,
        })
    );
    tree.check_invariants().unwrap();
}

#[test]
fn test_remove_version_drops_its_replies() {
    let mut tree = ConversationTree::new();
    let u1 = tree.add_root_branch(Role::User, text("hi"));
    let old_reply = tree.add_reply(&u1, Role::Assistant, text("old")).unwrap();
    let edited = tree.add_version(&u1, text("hi!"), false).unwrap();
    let new_reply = tree.add_reply(&u1, Role::Assistant, text("new")).unwrap();

    let first = tree.branch(&u1).unwrap().versions()[0].id().clone();
    tree.remove_version_by_id(&u1, &first).unwrap();

    assert!(tree.branch(&old_reply).is_none());
    assert!(tree.branch(&new_reply).is_some());
    assert_eq!(tree.branch(&u1).unwrap().current_version().id(), &edited);
    assert_eq!(tree.current_path(), &[u1, new_reply]);
    tree.check_invariants().unwrap();
}

#[test]
fn test_remove_root_clears_path() {
    let mut tree = ConversationTree::new();
    let u1 = tree.add_root_branch(Role::User, text("hi"));
    tree.add_reply(&u1, Role::Assistant, text("hello")).unwrap();

    tree.remove_branch(&u1, true).unwrap();

    assert!(tree.is_empty());
    assert!(tree.root_branch_ids().is_empty());
    assert!(tree.current_path().is_empty());
    tree.check_invariants().unwrap();
}

#[test]
fn test_add_child_off_path_realigns_ancestors() {
    let mut tree = ConversationTree::new();
    let u1 = tree.add_root_branch(Role::User, text("hi"));
    let a1 = tree.add_reply(&u1, Role::Assistant, text("first")).unwrap();
    tree.add_version(&u1, text("hi again"), false).unwrap();
    assert_eq!(tree.current_path(), &[u1.clone()]);

    let a1_version = tree.branch(&a1).unwrap().current_version().id().clone();
    let u2 = tree
        .add_branch(
            Role::User,
            text("follow-up"),
            Some(ParentRef::new(a1.clone(), a1_version)),
        )
        .unwrap();

    assert_eq!(tree.current_path(), &[u1.clone(), a1, u2]);
    assert_eq!(tree.branch(&u1).unwrap().current_version_index(), 0);
    tree.check_invariants().unwrap();
}

#[test]
fn test_set_current_branch_extends_to_leaf() {
    let mut tree = ConversationTree::new();
    let u1 = tree.add_root_branch(Role::User, text("hi"));
    let a1 = tree.add_reply(&u1, Role::Assistant, text("one")).unwrap();
    let u2 = tree.add_reply(&a1, Role::User, text("two")).unwrap();
    let a2 = tree.add_reply(&u1, Role::Assistant, text("other")).unwrap();
    assert_eq!(tree.current_path(), &[u1.clone(), a2]);

    tree.set_current_branch(&a1).unwrap();
    assert_eq!(tree.current_path(), &[u1, a1, u2]);
    tree.check_invariants().unwrap();
}

#[test]
fn test_failed_primitives_leave_tree_untouched() {
    let mut tree = ConversationTree::new();
    let u1 = tree.add_root_branch(Role::User, text("hi"));
    let before = tree.clone();
    let ghost = BranchId::from("ghost");

    assert!(tree.add_version(&ghost, text("x"), false).is_err());
    assert!(tree.remove_branch(&ghost, true).is_err());
    assert!(tree.remove_branch(&u1, false).is_err());
    assert!(tree.patch_metadata(&ghost, |_| Default::default()).is_err());
    assert!(tree.path_to(&ghost).is_err());

    assert_eq!(tree, before);
}
