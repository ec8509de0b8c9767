//! Tests for the plain-value codec

use chat_tree::codec::{decode, encode, from_value, normalize, to_value};
use chat_tree::{parts_text, BranchId, ContentPart, ConversationTree, ImageSource, Role};
use serde_json::{json, Value};

fn sample_tree() -> ConversationTree {
    let mut tree = ConversationTree::new();
    let u1 = tree.add_root_branch(
        Role::User,
        vec![
            ContentPart::text("describe this"),
            ContentPart::image_url("https://example.com/cat.png"),
        ],
    );
    let a1 = tree
        .add_reply(&u1, Role::Assistant, vec![ContentPart::text("a cat")])
        .unwrap();
    tree.patch_metadata(&a1, |_| {
        let mut m = chat_tree::Metadata::new();
        m.insert("model".into(), json!("gpt-4o"));
        m
    })
    .unwrap();
    tree.add_version(&a1, vec![ContentPart::text("a small cat")], false)
        .unwrap();
    tree.add_reply(&a1, Role::User, vec![ContentPart::text("thanks")])
        .unwrap();
    tree
}

#[test]
fn test_round_trip_is_deep_equal() {
    let tree = sample_tree();
    let restored = decode(encode(&tree));
    assert_eq!(restored, tree);
    restored.check_invariants().unwrap();

    let value = to_value(&tree).unwrap();
    assert_eq!(from_value(&value).unwrap(), tree);
}

#[test]
fn test_encoded_value_is_detached_from_live_tree() {
    let mut tree = sample_tree();
    let plain = encode(&tree);
    let value = to_value(&tree).unwrap();

    let leaf = tree.leaf().unwrap().branch_id().clone();
    let handle = tree.begin_stream(&leaf).unwrap();
    tree.stream_append_text(&handle, " a lot").unwrap();
    tree.patch_metadata(&leaf, |_| {
        let mut m = chat_tree::Metadata::new();
        m.insert("late".into(), json!(true));
        m
    })
    .unwrap();

    let before = decode(plain);
    let leaf_version = before.branch(&leaf).unwrap().current_version();
    assert_eq!(parts_text(leaf_version.parts()), "thanks");
    assert!(leaf_version.metadata().is_none());
    assert_eq!(from_value(&value).unwrap(), before);
}

#[test]
fn test_normalize_is_idempotent() {
    let value = to_value(&sample_tree()).unwrap();
    let once = normalize(&value).unwrap();
    let twice = normalize(&once).unwrap();
    assert_eq!(once, value);
    assert_eq!(twice, once);
}

#[test]
fn test_map_shaped_branches_are_accepted() {
    let value = json!({
        "branches": {
            "u1": {
                "branchId": "u1",
                "role": "user",
                "versions": [{
                    "id": "v1",
                    "parts": [{ "type": "text", "text": "hi" }],
                    "timestamp": "2024-05-01T10:00:00Z",
                    "childBranchIds": ["a1"]
                }],
                "currentVersionIndex": 0
            },
            "a1": {
                "branchId": "a1",
                "role": "assistant",
                "parentBranchId": "u1",
                "parentVersionId": "v1",
                "versions": [{
                    "id": "v2",
                    "parts": [{ "type": "text", "text": "hello" }],
                    "timestamp": "2024-05-01T10:00:01Z"
                }]
            }
        },
        "rootBranchIds": ["u1"],
        "currentPath": ["u1", "a1"]
    });

    let tree = from_value(&value).unwrap();
    tree.check_invariants().unwrap();
    assert_eq!(
        tree.current_path(),
        &[BranchId::from("u1"), BranchId::from("a1")]
    );

    let normalized = normalize(&value).unwrap();
    assert!(normalized["branches"].is_array());
    assert_eq!(normalized["branches"][0][0], "a1");
}

#[test]
fn test_key_value_entries_and_missing_lists() {
    let value = json!({
        "branches": [
            { "key": "u1", "value": {
                "branchId": "u1",
                "role": "user",
                "versions": [{ "id": "v1", "parts": [] }]
            }}
        ]
    });

    let tree = from_value(&value).unwrap();
    assert_eq!(tree.root_branch_ids(), &[BranchId::from("u1")]);
    assert!(tree.current_path().is_empty());
    tree.check_invariants().unwrap();
}

#[test]
fn test_damaged_links_are_repaired() {
    let value = json!({
        "branches": [
            ["u1", {
                "branchId": "u1",
                "role": "user",
                "versions": [{ "id": "v1", "parts": [], "childBranchIds": ["ghost", "a1"] }],
                "currentVersionIndex": 7
            }],
            ["a1", {
                "branchId": "a1",
                "role": "assistant",
                "parentBranchId": "u1",
                "parentVersionId": "gone",
                "versions": [{ "id": "v2", "parts": [] }]
            }],
            ["orphan", {
                "branchId": "orphan",
                "role": "user",
                "parentBranchId": "missing",
                "versions": [{ "id": "v3", "parts": [] }]
            }],
            ["empty", { "branchId": "empty", "role": "user", "versions": [] }]
        ],
        "rootBranchIds": ["u1", "u1"],
        "currentPath": ["u1", "a1", "ghost"]
    });

    let tree = from_value(&value).unwrap();
    tree.check_invariants().unwrap();

    assert!(tree.branch(&BranchId::from("empty")).is_none());
    let u1 = tree.branch(&BranchId::from("u1")).unwrap();
    assert_eq!(u1.current_version_index(), 0);
    assert_eq!(u1.current_version().child_branch_ids(), &[BranchId::from("a1")]);
    assert_eq!(
        tree.root_branch_ids(),
        &[BranchId::from("u1"), BranchId::from("orphan")]
    );
    assert_eq!(
        tree.current_path(),
        &[BranchId::from("u1"), BranchId::from("a1")]
    );
}

#[test]
fn test_repeated_version_ids_are_dropped() {
    let value = json!({
        "branches": [
            ["u1", {
                "branchId": "u1",
                "role": "user",
                "versions": [
                    { "id": "v1", "parts": [{ "type": "text", "text": "first" }] },
                    { "id": "v2", "parts": [{ "type": "text", "text": "second" }] },
                    { "id": "v1", "parts": [{ "type": "text", "text": "copy" }], "childBranchIds": ["a1"] }
                ],
                "currentVersionIndex": 2
            }],
            ["a1", {
                "branchId": "a1",
                "role": "assistant",
                "parentBranchId": "u1",
                "parentVersionId": "v1",
                "versions": [{ "id": "v3", "parts": [] }]
            }]
        ],
        "rootBranchIds": ["u1"],
        "currentPath": ["u1", "a1"]
    });

    let tree = from_value(&value).unwrap();
    tree.check_invariants().unwrap();

    let u1 = tree.branch(&BranchId::from("u1")).unwrap();
    let ids: Vec<&str> = u1.versions().iter().map(|v| v.id().as_str()).collect();
    assert_eq!(ids, vec!["v1", "v2"]);
    assert_eq!(u1.current_version_index(), 0);
    assert_eq!(parts_text(u1.current_version().parts()), "first");
    assert_eq!(u1.current_version().child_branch_ids(), &[BranchId::from("a1")]);
    assert_eq!(
        tree.current_path(),
        &[BranchId::from("u1"), BranchId::from("a1")]
    );
}

#[test]
fn test_non_object_values_are_rejected() {
    for value in [Value::Null, json!("tree"), json!(3), json!([])] {
        assert!(from_value(&value).is_err());
    }
}

#[test]
fn test_content_parts_survive_transport() {
    let mut tree = ConversationTree::new();
    tree.add_root_branch(
        Role::User,
        vec![
            ContentPart::image_base64("aGVsbG8=", "image/png"),
            ContentPart::File {
                path: "/tmp/report.pdf".into(),
                display_name: Some("report.pdf".into()),
                mime_type: None,
            },
        ],
    );
    let restored = from_value(&to_value(&tree).unwrap()).unwrap();
    let parts = restored.leaf().unwrap().current_version().parts();
    assert!(matches!(
        &parts[0],
        ContentPart::Image {
            source: ImageSource::Base64 { media_type, .. },
            ..
        } if media_type == "image/png"
    ));
    assert!(matches!(&parts[1], ContentPart::File { .. }));
}
