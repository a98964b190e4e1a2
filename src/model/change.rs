//! Modifications of individual entries, batched into commits.

use serde::{Deserialize, Serialize};
use similar::TextDiff;

use crate::errors::{Result, StoreError};

/// Typed content of a [`Change`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(tag = "type", content = "content")]
pub enum ChangeContent {
    /// Adds a new JSON file or replaces an existing file with the provided
    /// JSON value.
    UpsertJson(serde_json::Value),

    /// Adds a new text file or replaces an existing file with the provided
    /// content.
    UpsertText(String),

    /// Applies a JSON patch (RFC 6902 operations plus the `safeReplace`,
    /// `removeIfExists` and `testAbsence` extensions) to an existing JSON
    /// file.
    ApplyJsonPatch(serde_json::Value),

    /// Replaces the full text of an existing text file whose current
    /// sanitized content equals `old`.
    ApplyTextPatch { old: String, new: String },

    /// Renames an existing file to the provided path.
    Rename(String),

    /// Removes an existing file. Fails when the file is missing.
    Remove,

    /// Removes a file when it exists. Never fails.
    RemoveIfExists,
}

/// A modification of an individual entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    /// Path of the file change.
    pub path: String,
    /// Content of the file change.
    #[serde(flatten)]
    pub content: ChangeContent,
}

impl Change {
    pub fn upsert_json(path: impl Into<String>, value: serde_json::Value) -> Change {
        Change {
            path: path.into(),
            content: ChangeContent::UpsertJson(value),
        }
    }

    pub fn upsert_text(path: impl Into<String>, text: impl Into<String>) -> Change {
        Change {
            path: path.into(),
            content: ChangeContent::UpsertText(text.into()),
        }
    }

    pub fn apply_json_patch(path: impl Into<String>, patch: serde_json::Value) -> Change {
        Change {
            path: path.into(),
            content: ChangeContent::ApplyJsonPatch(patch),
        }
    }

    pub fn apply_text_patch(
        path: impl Into<String>,
        old: impl Into<String>,
        new: impl Into<String>,
    ) -> Change {
        Change {
            path: path.into(),
            content: ChangeContent::ApplyTextPatch {
                old: old.into(),
                new: new.into(),
            },
        }
    }

    pub fn rename(from: impl Into<String>, to: impl Into<String>) -> Change {
        Change {
            path: from.into(),
            content: ChangeContent::Rename(to.into()),
        }
    }

    pub fn remove(path: impl Into<String>) -> Change {
        Change {
            path: path.into(),
            content: ChangeContent::Remove,
        }
    }

    pub fn remove_if_exists(path: impl Into<String>) -> Change {
        Change {
            path: path.into(),
            content: ChangeContent::RemoveIfExists,
        }
    }

    /// Validate the change paths before it enters the commit pipeline.
    pub fn validate(&self) -> Result<()> {
        validate_path(&self.path)?;
        if let ChangeContent::Rename(to) = &self.content {
            validate_path(to)?;
        }
        Ok(())
    }

    /// Unified-format rendering of a text patch, for wire serialization.
    /// Returns `None` for any other change type.
    pub fn unified_patch(&self) -> Option<String> {
        match &self.content {
            ChangeContent::ApplyTextPatch { old, new } => {
                let diff = TextDiff::from_lines(old.as_str(), new.as_str());
                Some(
                    diff.unified_diff()
                        .context_radius(3)
                        .header(&format!("a{}", self.path), &format!("b{}", self.path))
                        .to_string(),
                )
            }
            _ => None,
        }
    }
}

/// Validate an entry path: absolute, `/`-rooted, limited character set, no
/// empty or dot-bracketed segments, no trailing slash.
pub fn validate_path(path: &str) -> Result<()> {
    let invalid = |detail: &str| {
        Err(StoreError::InvalidArgument(format!(
            "invalid path `{path}`: {detail}"
        )))
    };
    if path.is_empty() {
        return invalid("empty");
    }
    if !path.starts_with('/') {
        return invalid("must start with /");
    }
    if path.len() > 1 && path.ends_with('/') {
        return invalid("must not end with /");
    }
    if path == "/" {
        return invalid("must name a file");
    }
    for ch in path.chars() {
        if !(ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '/' | '-')) {
            return invalid("disallowed character");
        }
    }
    for segment in path[1..].split('/') {
        if segment.is_empty() {
            return invalid("double slash");
        }
        if segment.starts_with('.') || segment.ends_with('.') {
            return invalid("segment starts or ends with a dot");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_valid_paths() {
        for p in ["/a.json", "/a/b/c.txt", "/under_score-and-dash.yml", "/x"] {
            assert!(validate_path(p).is_ok(), "{p} should be valid");
        }
    }

    #[test]
    fn test_invalid_paths() {
        for p in [
            "", "a.json", "/", "/a//b", "/a/", "/.hidden", "/a/.b/c", "/trail.",
            "/sp ace", "/uni\u{00e9}", "/semi;colon",
        ] {
            assert!(validate_path(p).is_err(), "{p} should be invalid");
        }
    }

    #[test]
    fn test_dot_inside_segment_is_fine() {
        assert!(validate_path("/a.b.json").is_ok());
    }

    #[test]
    fn test_serde_shape() {
        let change = Change::upsert_json("/a.json", json!({"k": "v"}));
        let value = serde_json::to_value(&change).unwrap();
        assert_eq!(value["type"], "UPSERT_JSON");
        assert_eq!(value["path"], "/a.json");
        assert_eq!(value["content"]["k"], "v");

        let rename = Change::rename("/old.txt", "/new.txt");
        let value = serde_json::to_value(&rename).unwrap();
        assert_eq!(value["type"], "RENAME");
        assert_eq!(value["content"], "/new.txt");
    }

    #[test]
    fn test_unified_patch_rendering() {
        let change = Change::apply_text_patch("/f.txt", "a\nb\n", "a\nc\n");
        let patch = change.unified_patch().unwrap();
        assert!(patch.contains("-b"));
        assert!(patch.contains("+c"));
        assert!(patch.contains("a/f.txt"));
        assert!(Change::remove("/f.txt").unified_patch().is_none());
    }
}
