//! Plain-value codec for [`ConversationTree`].
//!
//! Every value that leaves the process (worker message, file, database row)
//! goes through [`encode`]. The plain form owns deep copies of every branch,
//! version, part and metadata blob; mutating the live tree afterwards never
//! shows up in an encoded value. The branch mapping travels as an ordered
//! sequence of `[id, branch]` pairs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::CodecError;
use crate::ids::{BranchId, VersionId};
use crate::message::{ContentPart, Role};
use crate::tree::{Branch, ConversationTree, Metadata, Version};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlainTree {
    pub branches: Vec<(BranchId, PlainBranch)>,
    #[serde(default, alias = "root_branch_ids")]
    pub root_branch_ids: Vec<BranchId>,
    #[serde(default, alias = "current_path")]
    pub current_path: Vec<BranchId>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlainBranch {
    #[serde(alias = "branch_id")]
    pub branch_id: BranchId,
    pub role: Role,
    #[serde(default, alias = "parent_branch_id")]
    pub parent_branch_id: Option<BranchId>,
    #[serde(default, alias = "parent_version_id")]
    pub parent_version_id: Option<VersionId>,
    #[serde(default)]
    pub versions: Vec<PlainVersion>,
    #[serde(default, alias = "current_version_index")]
    pub current_version_index: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlainVersion {
    pub id: VersionId,
    #[serde(default)]
    pub parts: Vec<ContentPart>,
    #[serde(default, deserialize_with = "timestamp::deserialize")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, alias = "child_branch_ids")]
    pub child_branch_ids: Vec<BranchId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// Deep-copy a live tree into its plain form. Pairs are sorted by branch id.
pub fn encode(tree: &ConversationTree) -> PlainTree {
    let mut branches: Vec<(BranchId, PlainBranch)> = tree
        .branches
        .iter()
        .map(|(id, branch)| (id.clone(), encode_branch(branch)))
        .collect();
    branches.sort_by(|a, b| a.0.cmp(&b.0));

    PlainTree {
        branches,
        root_branch_ids: tree.root_branch_ids.clone(),
        current_path: tree.current_path.clone(),
    }
}

fn encode_branch(branch: &Branch) -> PlainBranch {
    PlainBranch {
        branch_id: branch.branch_id.clone(),
        role: branch.role,
        parent_branch_id: branch.parent_branch_id.clone(),
        parent_version_id: branch.parent_version_id.clone(),
        versions: branch.versions.iter().map(encode_version).collect(),
        current_version_index: branch.current_version_index,
    }
}

fn encode_version(version: &Version) -> PlainVersion {
    PlainVersion {
        id: version.id.clone(),
        parts: version.parts.clone(),
        timestamp: version.timestamp,
        child_branch_ids: version.child_branch_ids.clone(),
        metadata: version.metadata.clone(),
    }
}

/// Rebuild a live tree. Structural damage (dangling ids, bad indices) is
/// repaired rather than rejected.
pub fn decode(plain: PlainTree) -> ConversationTree {
    let mut branches = HashMap::with_capacity(plain.branches.len());
    for (id, branch) in plain.branches {
        branches.insert(id.clone(), decode_branch(id, branch));
    }

    let mut tree = ConversationTree {
        branches,
        root_branch_ids: plain.root_branch_ids,
        current_path: plain.current_path,
    };
    tree.repair();
    tree
}

fn decode_branch(id: BranchId, branch: PlainBranch) -> Branch {
    if id != branch.branch_id {
        tracing::warn!(key = %id, branch_id = %branch.branch_id, "codec: branch id differs from its key, keeping key");
    }
    Branch {
        branch_id: id,
        role: branch.role,
        parent_branch_id: branch.parent_branch_id,
        parent_version_id: branch.parent_version_id,
        versions: branch
            .versions
            .into_iter()
            .map(|v| Version {
                id: v.id,
                parts: v.parts,
                timestamp: v.timestamp,
                child_branch_ids: v.child_branch_ids,
                metadata: v.metadata,
            })
            .collect(),
        current_version_index: branch.current_version_index,
    }
}

/// Transport form of a tree.
pub fn to_value(tree: &ConversationTree) -> Result<Value, CodecError> {
    Ok(serde_json::to_value(encode(tree))?)
}

/// Read a tree back from its transport form.
///
/// `branches` may be a pair sequence, a sequence of `{key, value}` entries or
/// an id-keyed mapping (a value that was never encoded). Missing or malformed
/// `rootBranchIds` / `currentPath` become empty; unreadable branches are
/// skipped. Only a non-object top level is an error.
pub fn from_value(value: &Value) -> Result<ConversationTree, CodecError> {
    let object = value
        .as_object()
        .ok_or_else(|| CodecError::NotAnObject(kind_of(value)))?;

    let mut branches = Vec::new();
    match object.get("branches") {
        Some(Value::Array(entries)) => {
            for entry in entries {
                match split_entry(entry) {
                    Some((id, raw)) => push_branch(&mut branches, id, raw),
                    None => tracing::warn!("codec: skipping malformed branch entry"),
                }
            }
        }
        Some(Value::Object(map)) => {
            for (id, raw) in map {
                push_branch(&mut branches, id, raw);
            }
        }
        Some(other) => {
            tracing::warn!(kind = kind_of(other), "codec: unexpected branches shape, treating as empty")
        }
        None => {}
    }

    Ok(decode(PlainTree {
        branches,
        root_branch_ids: id_list(object.get("rootBranchIds").or_else(|| object.get("root_branch_ids"))),
        current_path: id_list(object.get("currentPath").or_else(|| object.get("current_path"))),
    }))
}

/// `encode` for a value that may already be in plain form.
pub fn normalize(value: &Value) -> Result<Value, CodecError> {
    to_value(&from_value(value)?)
}

fn split_entry(entry: &Value) -> Option<(&str, &Value)> {
    match entry {
        Value::Array(pair) if pair.len() == 2 => Some((pair[0].as_str()?, &pair[1])),
        Value::Object(map) => {
            let id = map.get("key").or_else(|| map.get("id"))?.as_str()?;
            let raw = map.get("value").or_else(|| map.get("branch"))?;
            Some((id, raw))
        }
        _ => None,
    }
}

fn push_branch(branches: &mut Vec<(BranchId, PlainBranch)>, id: &str, raw: &Value) {
    match PlainBranch::deserialize(raw) {
        Ok(branch) => branches.push((BranchId::from(id), branch)),
        Err(err) => tracing::warn!(branch_id = id, error = %err, "codec: skipping unreadable branch"),
    }
}

fn id_list(value: Option<&Value>) -> Vec<BranchId> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str().map(BranchId::from))
            .collect(),
        _ => Vec::new(),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Timestamps are RFC 3339 strings; older payloads stored epoch milliseconds.
mod timestamp {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Millis(i64),
        Fractional(f64),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = match Raw::deserialize(deserializer)? {
            Raw::Text(text) => {
                return DateTime::parse_from_rfc3339(&text)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(D::Error::custom)
            }
            Raw::Millis(ms) => ms,
            Raw::Fractional(ms) => ms as i64,
        };
        Utc.timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| D::Error::custom(format!("timestamp {millis} out of range")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pairs_are_sorted_and_plain() {
        let mut tree = ConversationTree::new();
        let u1 = tree.add_root_branch(Role::User, vec![ContentPart::text("hi")]);
        tree.add_reply(&u1, Role::Assistant, vec![ContentPart::text("yo")])
            .unwrap();

        let value = to_value(&tree).unwrap();
        let pairs = value["branches"].as_array().unwrap();
        assert_eq!(pairs.len(), 2);
        assert!(pairs[0][0].as_str().unwrap() < pairs[1][0].as_str().unwrap());
        assert_eq!(value["currentPath"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_legacy_millisecond_timestamp() {
        let value = json!({
            "branches": [["b1", {
                "branchId": "b1",
                "role": "user",
                "versions": [{ "id": "v1", "parts": [], "timestamp": 1700000000000i64 }],
                "currentVersionIndex": 0
            }]],
            "rootBranchIds": ["b1"]
        });

        let tree = from_value(&value).unwrap();
        let version = tree.branch(&BranchId::from("b1")).unwrap().current_version();
        assert_eq!(version.timestamp().timestamp_millis(), 1_700_000_000_000);
        assert!(tree.current_path().is_empty());
    }

    #[test]
    fn test_non_object_is_rejected() {
        assert!(matches!(
            from_value(&json!([1, 2])),
            Err(CodecError::NotAnObject("array"))
        ));
    }
}
