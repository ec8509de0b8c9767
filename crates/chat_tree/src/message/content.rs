//! ContentPart - Message content types
//!
//! Defines the different types of content that can appear in a version's payload.

use serde::{Deserialize, Serialize};

/// A part of message content (text, image, file placeholder)
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Text content
    Text { text: String },

    /// Image content (base64 or URL)
    Image {
        source: ImageSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alt_text: Option<String>,
    },

    /// File placeholder; the bytes live outside the tree
    File {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
}

impl ContentPart {
    /// Create a text content part
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create an image content part from base64
    pub fn image_base64(data: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self::Image {
            source: ImageSource::Base64 {
                data: data.into(),
                media_type: media_type.into(),
            },
            alt_text: None,
        }
    }

    /// Create an image content part from a URL
    pub fn image_url(url: impl Into<String>) -> Self {
        Self::Image {
            source: ImageSource::Url { url: url.into() },
            alt_text: None,
        }
    }

    /// Create a file placeholder part
    pub fn file(path: impl Into<String>) -> Self {
        Self::File {
            path: path.into(),
            display_name: None,
            mime_type: None,
        }
    }

    /// Get text content if this is a text part
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Image source (base64 or URL)
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    Base64 { data: String, media_type: String },
    Url { url: String },
}

/// Concatenate the text parts of a payload.
pub fn parts_text(parts: &[ContentPart]) -> String {
    parts
        .iter()
        .filter_map(|p| p.as_text())
        .collect::<Vec<_>>()
        .join("")
}

/// Who produced a branch. Fixed for the lifetime of the branch.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    Notice,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
            Role::Notice => write!(f, "notice"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parts_text_skips_non_text() {
        let parts = vec![
            ContentPart::text("Hello "),
            ContentPart::image_url("https://example.com/cat.png"),
            ContentPart::text("world!"),
        ];
        assert_eq!(parts_text(&parts), "Hello world!");
    }

    #[test]
    fn test_part_wire_shape() {
        let json = serde_json::to_value(ContentPart::file("/tmp/report.pdf")).unwrap();
        assert_eq!(json["type"], "file");
        assert_eq!(json["path"], "/tmp/report.pdf");
        assert!(json.get("display_name").is_none());
    }

    #[test]
    fn test_role_serialization() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }
}
