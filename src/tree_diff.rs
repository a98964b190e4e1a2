//! Tree-vs-tree comparison and change synthesis.
//!
//! The comparison itself is a walk over two flattened snapshots filtered by
//! a path pattern; every divergence becomes an ADD, MODIFY or DELETE entry.
//! Change synthesis then turns entries into the wire-level changes clients
//! consume: JSON files produce safe-replace JSON patches, text files
//! produce whole-content text patches with sanitized line endings, and a
//! modify that also moved emits a rename followed by the content patch at
//! the new path.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::{
    errors::{Result, StoreError},
    hash::ObjectId,
    jsonpatch,
    model::Change,
    pattern::PathPattern,
    storage::store::{ContentSource, TreeSnapshot},
};

/// Strip carriage returns and guarantee a trailing newline. The empty
/// string stays empty so that absent and empty files stay distinguishable.
pub fn sanitize_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let mut out: String = text.chars().filter(|c| *c != '\r').collect();
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiffKind {
    Add,
    Modify,
    Delete,
}

/// One divergence between two trees.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiffEntry {
    pub kind: DiffKind,
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub old_id: Option<ObjectId>,
    pub new_id: Option<ObjectId>,
}

impl DiffEntry {
    /// The representative path used for watcher notification: the new path
    /// for an ADD, the old path otherwise.
    pub fn changed_path(&self) -> &str {
        match self.kind {
            DiffKind::Add => self.new_path.as_deref().expect("ADD carries a new path"),
            DiffKind::Modify | DiffKind::Delete => {
                self.old_path.as_deref().expect("entry carries an old path")
            }
        }
    }
}

/// Compare two snapshots under a filter. Entries come out in path order.
pub fn diff_snapshots(
    old: &TreeSnapshot,
    new: &TreeSnapshot,
    filter: &PathPattern,
) -> Vec<DiffEntry> {
    let mut entries = Vec::new();
    let mut old_iter = old.files.iter().peekable();
    let mut new_iter = new.files.iter().peekable();
    loop {
        let entry = match (old_iter.peek(), new_iter.peek()) {
            (None, None) => break,
            (Some((path, id)), None) => {
                let entry = deleted(path, **id);
                old_iter.next();
                entry
            }
            (None, Some((path, id))) => {
                let entry = added(path, **id);
                new_iter.next();
                entry
            }
            (Some((old_path, old_id)), Some((new_path, new_id))) => {
                match old_path.cmp(new_path) {
                    std::cmp::Ordering::Less => {
                        let entry = deleted(old_path, **old_id);
                        old_iter.next();
                        entry
                    }
                    std::cmp::Ordering::Greater => {
                        let entry = added(new_path, **new_id);
                        new_iter.next();
                        entry
                    }
                    std::cmp::Ordering::Equal => {
                        let entry = if old_id == new_id {
                            None
                        } else {
                            Some(DiffEntry {
                                kind: DiffKind::Modify,
                                old_path: Some((*old_path).clone()),
                                new_path: Some((*new_path).clone()),
                                old_id: Some(**old_id),
                                new_id: Some(**new_id),
                            })
                        };
                        old_iter.next();
                        new_iter.next();
                        entry
                    }
                }
            }
        };
        if let Some(entry) = entry
            && (filter.matches_all() || filter.matches(entry.changed_path()))
        {
            entries.push(entry);
        }
    }
    entries
}

fn added(path: &str, id: ObjectId) -> Option<DiffEntry> {
    Some(DiffEntry {
        kind: DiffKind::Add,
        old_path: None,
        new_path: Some(path.to_string()),
        old_id: None,
        new_id: Some(id),
    })
}

fn deleted(path: &str, id: ObjectId) -> Option<DiffEntry> {
    Some(DiffEntry {
        kind: DiffKind::Delete,
        old_path: Some(path.to_string()),
        new_path: None,
        old_id: Some(id),
        new_id: None,
    })
}

fn parse_stored_json(path: &str, bytes: &[u8]) -> Result<Value> {
    serde_json::from_slice(bytes)
        .map_err(|e| StoreError::Storage(format!("stored entry `{path}` is not JSON: {e}")))
}

fn stored_text(path: &str, bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| StoreError::Storage(format!("stored entry `{path}` is not UTF-8")))
}

/// Synthesize client-facing changes for a list of diff entries. The result
/// maps the affected path (the new path for renames) to its change; a
/// rename with a content change occupies two slots.
pub fn to_changes(
    source: &dyn ContentSource,
    entries: &[DiffEntry],
) -> Result<BTreeMap<String, Change>> {
    let mut changes = BTreeMap::new();
    for entry in entries {
        match entry.kind {
            DiffKind::Add => {
                let path = entry.new_path.clone().expect("ADD carries a new path");
                let content = source.read_content(&entry.new_id.expect("ADD carries a new id"))?;
                let change = if path.ends_with(".json") {
                    Change::upsert_json(&path, parse_stored_json(&path, &content)?)
                } else {
                    Change::upsert_text(&path, sanitize_text(&stored_text(&path, &content)?))
                };
                changes.insert(path, change);
            }
            DiffKind::Delete => {
                let path = entry.old_path.clone().expect("DELETE carries an old path");
                changes.insert(path.clone(), Change::remove(path));
            }
            DiffKind::Modify => {
                let old_path = entry.old_path.clone().expect("MODIFY carries an old path");
                let new_path = entry.new_path.clone().expect("MODIFY carries a new path");
                if old_path != new_path {
                    changes.insert(old_path.clone(), Change::rename(&old_path, &new_path));
                }
                let old_id = entry.old_id.expect("MODIFY carries an old id");
                let new_id = entry.new_id.expect("MODIFY carries a new id");
                if old_id == new_id {
                    continue;
                }
                let old_content = source.read_content(&old_id)?;
                let new_content = source.read_content(&new_id)?;
                let change = if new_path.ends_with(".json") {
                    let old_json = parse_stored_json(&old_path, &old_content)?;
                    let new_json = parse_stored_json(&new_path, &new_content)?;
                    Change::apply_json_patch(&new_path, jsonpatch::generate(&old_json, &new_json))
                } else {
                    Change::apply_text_patch(
                        &new_path,
                        sanitize_text(&stored_text(&old_path, &old_content)?),
                        sanitize_text(&stored_text(&new_path, &new_content)?),
                    )
                };
                changes.insert(new_path, change);
            }
        }
    }
    Ok(changes)
}
