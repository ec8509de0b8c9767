//! Streaming primitives.
//!
//! A stream targets the version that was current when it started. The
//! handle carries that identity, so switching or adding versions while tokens
//! are still arriving never redirects fragments into another version.

use chrono::Utc;
use serde_json::{json, Value};

use super::{ConversationTree, Metadata, Version};
use crate::error::{Result, TreeError};
use crate::ids::{BranchId, VersionId};
use crate::message::{ContentPart, ImageSource};

/// Identity of the version a stream writes into.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamHandle {
    branch_id: BranchId,
    version_id: VersionId,
    // Position at stream start; re-resolved by id if versions were removed since.
    position: usize,
}

impl StreamHandle {
    pub fn branch_id(&self) -> &BranchId {
        &self.branch_id
    }

    pub fn version_id(&self) -> &VersionId {
        &self.version_id
    }
}

/// A piece of a provider's reasoning trace.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReasoningFragment {
    pub text: String,
    pub signature: Option<String>,
}

impl ReasoningFragment {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            signature: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

/// End-of-stream summary recorded into the version's metadata.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamSummary {
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
    pub error: Option<String>,
}

impl ConversationTree {
    /// Start streaming into the branch's current version.
    pub fn begin_stream(&self, branch_id: &BranchId) -> Result<StreamHandle> {
        let branch = self.branch_ref(branch_id)?;
        let position = branch.current_version_index;

        tracing::debug!(
            branch_id = %branch_id,
            version_id = %branch.versions[position].id,
            "ConversationTree: stream started"
        );
        Ok(StreamHandle {
            branch_id: branch_id.clone(),
            version_id: branch.versions[position].id.clone(),
            position,
        })
    }

    /// Regenerate: append an empty childless version and stream into it.
    pub fn begin_stream_version(&mut self, branch_id: &BranchId) -> Result<StreamHandle> {
        self.add_version(branch_id, Vec::new(), false)?;
        self.begin_stream(branch_id)
    }

    fn stream_target(&mut self, handle: &StreamHandle) -> Result<&mut Version> {
        let branch = self.branch_mut(&handle.branch_id)?;

        let position = match branch.versions.get(handle.position) {
            Some(v) if v.id == handle.version_id => Some(handle.position),
            _ => branch.version_position(&handle.version_id),
        };
        match position {
            Some(position) => Ok(&mut branch.versions[position]),
            None => Err(TreeError::VersionNotFound {
                branch_id: handle.branch_id.clone(),
                version_id: handle.version_id.clone(),
            }),
        }
    }

    /// Append a text token. Extends the trailing text part when there is one.
    pub fn stream_append_text(&mut self, handle: &StreamHandle, delta: &str) -> Result<()> {
        if delta.is_empty() {
            return Ok(());
        }
        let version = self.stream_target(handle)?;
        match version.parts.last_mut() {
            Some(ContentPart::Text { text }) => text.push_str(delta),
            _ => version.parts.push(ContentPart::text(delta)),
        }

        tracing::trace!(
            branch_id = %handle.branch_id,
            version_id = %handle.version_id,
            delta_len = delta.len(),
            "ConversationTree: stream text"
        );
        Ok(())
    }

    pub fn stream_append_image(
        &mut self,
        handle: &StreamHandle,
        source: ImageSource,
        alt_text: Option<String>,
    ) -> Result<()> {
        let version = self.stream_target(handle)?;
        version.parts.push(ContentPart::Image { source, alt_text });
        Ok(())
    }

    /// Append to `metadata.reasoning.text`; a signature, when present,
    /// replaces the stored one.
    pub fn stream_append_reasoning(
        &mut self,
        handle: &StreamHandle,
        fragment: ReasoningFragment,
    ) -> Result<()> {
        let version = self.stream_target(handle)?;
        let metadata = version.metadata.get_or_insert_with(Metadata::new);

        let reasoning = metadata
            .entry("reasoning")
            .or_insert_with(|| json!({ "text": "" }));
        if !reasoning.is_object() {
            *reasoning = json!({ "text": "" });
        }
        if let Value::Object(reasoning) = reasoning {
            match reasoning.get_mut("text") {
                Some(Value::String(text)) => text.push_str(&fragment.text),
                _ => {
                    reasoning.insert("text".into(), Value::String(fragment.text));
                }
            }
            if let Some(signature) = fragment.signature {
                reasoning.insert("signature".into(), Value::String(signature));
            }
        }
        Ok(())
    }

    /// Record the end-of-stream summary.
    pub fn stream_finish(&mut self, handle: &StreamHandle, summary: StreamSummary) -> Result<()> {
        let version = self.stream_target(handle)?;
        let metadata = version.metadata.get_or_insert_with(Metadata::new);

        if let Some(reason) = summary.finish_reason {
            metadata.insert("finishReason".into(), Value::String(reason));
        }
        if let Some(usage) = summary.usage {
            metadata.insert(
                "usage".into(),
                json!({
                    "promptTokens": usage.prompt_tokens,
                    "completionTokens": usage.completion_tokens,
                }),
            );
        }
        if let Some(error) = &summary.error {
            metadata.insert("error".into(), Value::String(error.clone()));
        }
        metadata.insert("completedAt".into(), Value::String(Utc::now().to_rfc3339()));

        tracing::debug!(
            branch_id = %handle.branch_id,
            version_id = %handle.version_id,
            failed = summary.error.is_some(),
            "ConversationTree: stream finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{parts_text, Role};

    #[test]
    fn test_text_tokens_accumulate() {
        let mut tree = ConversationTree::new();
        let u1 = tree.add_root_branch(Role::User, vec![ContentPart::text("hi")]);
        let a1 = tree
            .add_reply(&u1, Role::Assistant, vec![ContentPart::text("")])
            .unwrap();

        let handle = tree.begin_stream(&a1).unwrap();
        tree.stream_append_text(&handle, "He").unwrap();
        tree.stream_append_text(&handle, "").unwrap();
        tree.stream_append_text(&handle, "llo").unwrap();

        let parts = tree.branch(&a1).unwrap().current_version().parts();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts_text(parts), "Hello");
    }

    #[test]
    fn test_text_after_image_starts_new_part() {
        let mut tree = ConversationTree::new();
        let a1 = tree.add_root_branch(Role::Assistant, Vec::new());
        let handle = tree.begin_stream(&a1).unwrap();

        tree.stream_append_text(&handle, "see:").unwrap();
        tree.stream_append_image(
            &handle,
            ImageSource::Url {
                url: "https://example.com/a.png".into(),
            },
            None,
        )
        .unwrap();
        tree.stream_append_text(&handle, "done").unwrap();

        assert_eq!(tree.branch(&a1).unwrap().current_version().parts().len(), 3);
    }

    #[test]
    fn test_reasoning_and_summary_land_in_metadata() {
        let mut tree = ConversationTree::new();
        let a1 = tree.add_root_branch(Role::Assistant, Vec::new());
        let handle = tree.begin_stream(&a1).unwrap();

        tree.stream_append_reasoning(&handle, ReasoningFragment::text("think"))
            .unwrap();
        tree.stream_append_reasoning(
            &handle,
            ReasoningFragment {
                text: "ing".into(),
                signature: Some("sig".into()),
            },
        )
        .unwrap();
        tree.stream_finish(
            &handle,
            StreamSummary {
                finish_reason: Some("stop".into()),
                usage: Some(TokenUsage {
                    prompt_tokens: Some(3),
                    completion_tokens: Some(5),
                }),
                error: None,
            },
        )
        .unwrap();

        let metadata = tree.branch(&a1).unwrap().current_version().metadata().unwrap();
        assert_eq!(metadata["reasoning"]["text"], "thinking");
        assert_eq!(metadata["reasoning"]["signature"], "sig");
        assert_eq!(metadata["finishReason"], "stop");
        assert_eq!(metadata["usage"]["completionTokens"], 5);
        assert!(metadata.contains_key("completedAt"));
    }

    #[test]
    fn test_removed_stream_target_reports_missing_version() {
        let mut tree = ConversationTree::new();
        let a1 = tree.add_root_branch(Role::Assistant, Vec::new());
        let handle = tree.begin_stream_version(&a1).unwrap();
        tree.remove_version_by_id(&a1, handle.version_id()).unwrap();

        let result = tree.stream_append_text(&handle, "late");
        assert!(matches!(result, Err(TreeError::VersionNotFound { .. })));
    }
}
