//! Files and directories as seen through the read APIs.

use serde::{Deserialize, Serialize};

use crate::model::revision::Revision;

/// The type of an [`Entry`]. Determined solely by the path suffix:
/// `.json` files hold JSON, any other file holds text, and tree nodes are
/// directories.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    /// A UTF-8 encoded JSON file.
    Json,
    /// A UTF-8 encoded text file.
    Text,
    /// A directory.
    Directory,
}

impl EntryType {
    /// Classify a path. Paths ending in `/` (and the root `/`) are
    /// directories; this function never inspects content.
    pub fn guess_from_path(path: &str) -> EntryType {
        if path == "/" || path.ends_with('/') {
            EntryType::Directory
        } else if path.ends_with(".json") {
            EntryType::Json
        } else {
            EntryType::Text
        }
    }
}

/// The content of an [`Entry`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(tag = "type", content = "content")]
pub enum EntryContent {
    /// Content as a parsed JSON value.
    Json(serde_json::Value),
    /// Content as a sanitized string.
    Text(String),
    /// This entry is a directory.
    Directory,
}

/// A file or a directory in a repository at one revision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// Revision this entry was read at.
    pub revision: Revision,
    /// Absolute path of this entry.
    pub path: String,
    /// Content of this entry.
    #[serde(flatten)]
    pub content: EntryContent,
}

impl Entry {
    pub fn json(revision: Revision, path: impl Into<String>, value: serde_json::Value) -> Entry {
        Entry {
            revision,
            path: path.into(),
            content: EntryContent::Json(value),
        }
    }

    pub fn text(revision: Revision, path: impl Into<String>, text: impl Into<String>) -> Entry {
        Entry {
            revision,
            path: path.into(),
            content: EntryContent::Text(text.into()),
        }
    }

    pub fn directory(revision: Revision, path: impl Into<String>) -> Entry {
        Entry {
            revision,
            path: path.into(),
            content: EntryContent::Directory,
        }
    }

    /// An entry of the right type for `path` whose content is a cheap
    /// placeholder, used when the caller opted out of content fetching.
    pub fn placeholder(revision: Revision, path: &str) -> Entry {
        match EntryType::guess_from_path(path) {
            EntryType::Json => Entry::json(revision, path, serde_json::Value::Null),
            EntryType::Text => Entry::text(revision, path, ""),
            EntryType::Directory => Entry::directory(revision, path),
        }
    }

    pub fn entry_type(&self) -> EntryType {
        match self.content {
            EntryContent::Json(_) => EntryType::Json,
            EntryContent::Text(_) => EntryType::Text,
            EntryContent::Directory => EntryType::Directory,
        }
    }
}
