//! Commit metadata: authorship, message, and the JSON message body stored
//! in the object store.
//!
//! The storage layer persists the summary, detail, markup and revision of a
//! commit as a single JSON object in the commit object's message. The
//! revision is therefore always recoverable from the stored commit alone,
//! which is what makes the commit index rebuildable from a plain ref walk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    errors::{Result, StoreError},
    model::revision::Revision,
};

/// Author of a commit. Always supplied by the caller; the engine never
/// invents authorship.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub name: String,
    pub email: String,
}

impl Author {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Author {
        Author {
            name: name.into(),
            email: email.into(),
        }
    }
}

/// Markup language of a commit's detail text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Markup {
    Plaintext,
    Markdown,
}

/// Human-readable description of a commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommitMessage {
    /// One-line summary.
    pub summary: String,
    /// Detailed description; may be empty.
    pub detail: String,
    /// Markup of `detail`.
    pub markup: Markup,
}

impl CommitMessage {
    pub fn new(summary: impl Into<String>) -> CommitMessage {
        CommitMessage {
            summary: summary.into(),
            detail: String::new(),
            markup: Markup::Plaintext,
        }
    }

    pub fn with_detail(
        summary: impl Into<String>,
        detail: impl Into<String>,
        markup: Markup,
    ) -> CommitMessage {
        CommitMessage {
            summary: summary.into(),
            detail: detail.into(),
            markup,
        }
    }
}

/// JSON message body persisted inside a commit object.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageBody {
    summary: String,
    detail: String,
    markup: Markup,
    revision: i64,
}

/// Encode a commit message plus its revision into the stored JSON body.
pub(crate) fn encode_message(message: &CommitMessage, revision: Revision) -> String {
    let body = MessageBody {
        summary: message.summary.clone(),
        detail: message.detail.clone(),
        markup: message.markup,
        revision: revision.as_i64(),
    };
    // A struct of strings and an integer cannot fail to serialize.
    serde_json::to_string(&body).expect("commit message body serialization")
}

/// Decode a stored JSON body back into `(message, revision)`.
pub(crate) fn decode_message(body: &str) -> Result<(CommitMessage, Revision)> {
    let body: MessageBody = serde_json::from_str(body)
        .map_err(|e| StoreError::Storage(format!("malformed commit message body: {e}")))?;
    Ok((
        CommitMessage {
            summary: body.summary,
            detail: body.detail,
            markup: body.markup,
        },
        Revision::from(body.revision),
    ))
}

/// A commit as exposed through the read APIs. Object IDs stay internal to
/// the storage layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    /// Revision of this commit.
    pub revision: Revision,
    /// Author of this commit.
    pub author: Author,
    /// When this commit was pushed.
    pub when: DateTime<Utc>,
    /// Description of this commit.
    pub message: CommitMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_body_round_trip() {
        let message =
            CommitMessage::with_detail("Add flag", "Enables the new router.", Markup::Markdown);
        let encoded = encode_message(&message, Revision::from(42));
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["summary"], "Add flag");
        assert_eq!(value["markup"], "MARKDOWN");
        assert_eq!(value["revision"], 42);

        let (decoded, revision) = decode_message(&encoded).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(revision.as_i64(), 42);
    }

    #[test]
    fn test_malformed_body_is_storage_error() {
        assert!(matches!(
            decode_message("not json"),
            Err(StoreError::Storage(_))
        ));
    }
}
