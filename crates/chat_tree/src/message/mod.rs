//! Message module - payload types carried by versions

mod content;

pub use content::{parts_text, ContentPart, ImageSource, Role};
