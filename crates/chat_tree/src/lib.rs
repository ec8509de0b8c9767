//! chat_tree - the branching, multi-version conversation tree
//!
//! - `tree` - branches, versions, mutation primitives, streaming, path walking
//! - `codec` - plain-value form used at every persistence boundary
//! - `message` - content parts and roles
//! - `ids` - opaque identifiers

pub mod codec;
pub mod error;
pub mod ids;
pub mod message;
pub mod tree;

pub use codec::{PlainBranch, PlainTree, PlainVersion};
pub use error::{CodecError, Result, TreeError};
pub use ids::{BranchId, ConversationId, VersionId};
pub use message::{parts_text, ContentPart, ImageSource, Role};
pub use tree::{
    Branch, ConversationTree, Metadata, ParentRef, PathMessage, PathMessages, ReasoningFragment,
    StreamHandle, StreamSummary, TokenUsage, Version, VersionStep,
};
