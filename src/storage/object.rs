//! Byte codecs for stored objects.
//!
//! Trees and commits use the classic content-addressed text formats: a tree
//! is a name-sorted sequence of `"<mode> <name>\0<20-byte id>"` records, a
//! commit is a header block (`tree`, optional `parent`, `author`) followed
//! by an empty line and the message body. Blobs are raw bytes. Every codec
//! is deterministic, so equal logical content always produces equal IDs.

use std::collections::BTreeMap;

use bstr::ByteSlice;
use chrono::{DateTime, TimeZone, Utc};

use crate::{
    errors::{Result, StoreError},
    hash::{ObjectId, ObjectKind},
    model::Author,
};

/// File-or-directory discriminator inside a tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryMode {
    File,
    Tree,
}

impl EntryMode {
    const fn mode_str(&self) -> &'static str {
        match self {
            EntryMode::File => "100644",
            EntryMode::Tree => "40000",
        }
    }

    fn from_mode_str(s: &str) -> Result<EntryMode> {
        match s {
            "100644" => Ok(EntryMode::File),
            "40000" => Ok(EntryMode::Tree),
            _ => Err(StoreError::Storage(format!("invalid tree entry mode `{s}`"))),
        }
    }
}

/// One record of a tree object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: EntryMode,
    pub name: String,
    pub id: ObjectId,
}

impl TreeEntry {
    /// Sort key: directories order as if their name ended in `/`.
    fn sort_key(&self) -> Vec<u8> {
        let mut key = self.name.as_bytes().to_vec();
        if self.mode == EntryMode::Tree {
            key.push(b'/');
        }
        key
    }
}

/// An immutable directory listing. Entries are kept in canonical order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tree {
    entries: Vec<TreeEntry>,
}

impl Tree {
    pub fn new(mut entries: Vec<TreeEntry>) -> Tree {
        entries.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        Tree { entries }
    }

    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    pub fn to_data(&self) -> Vec<u8> {
        let mut data = Vec::new();
        for entry in &self.entries {
            data.extend(entry.mode.mode_str().as_bytes());
            data.push(b' ');
            data.extend(entry.name.as_bytes());
            data.push(0x00);
            data.extend(entry.id.as_bytes());
        }
        data
    }

    pub fn from_bytes(data: &[u8]) -> Result<Tree> {
        let mut entries = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let space = rest
                .find_byte(b' ')
                .ok_or_else(|| StoreError::Storage("truncated tree entry mode".to_string()))?;
            let mode = EntryMode::from_mode_str(
                std::str::from_utf8(&rest[..space])
                    .map_err(|e| StoreError::Storage(format!("tree entry mode: {e}")))?,
            )?;
            rest = &rest[space + 1..];
            let nul = rest
                .find_byte(0x00)
                .ok_or_else(|| StoreError::Storage("truncated tree entry name".to_string()))?;
            let name = std::str::from_utf8(&rest[..nul])
                .map_err(|e| StoreError::Storage(format!("tree entry name: {e}")))?
                .to_string();
            rest = &rest[nul + 1..];
            if rest.len() < ObjectId::SIZE {
                return Err(StoreError::Storage("truncated tree entry id".to_string()));
            }
            let id = ObjectId::from_bytes(&rest[..ObjectId::SIZE])?;
            rest = &rest[ObjectId::SIZE..];
            entries.push(TreeEntry { mode, name, id });
        }
        Ok(Tree { entries })
    }

    pub fn id(&self) -> ObjectId {
        ObjectId::from_type_and_data(ObjectKind::Tree, &self.to_data())
    }
}

/// A commit as stored. The message body is the JSON object carrying
/// summary, detail, markup and revision.
#[derive(Clone, Debug, PartialEq)]
pub struct CommitObject {
    pub tree_id: ObjectId,
    /// Absent exactly for the first commit of a sub-repository.
    pub parent_id: Option<ObjectId>,
    pub author: Author,
    pub when: DateTime<Utc>,
    pub body: String,
}

impl CommitObject {
    pub fn to_data(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend(b"tree ");
        data.extend(self.tree_id.to_hex().as_bytes());
        data.push(0x0a);
        if let Some(parent) = &self.parent_id {
            data.extend(b"parent ");
            data.extend(parent.to_hex().as_bytes());
            data.push(0x0a);
        }
        data.extend(
            format!(
                "author {} <{}> {}",
                self.author.name,
                self.author.email,
                self.when.timestamp_millis()
            )
            .as_bytes(),
        );
        data.push(0x0a);
        data.push(0x0a);
        data.extend(self.body.as_bytes());
        data
    }

    pub fn from_bytes(data: &[u8]) -> Result<CommitObject> {
        let malformed = |detail: &str| StoreError::Storage(format!("malformed commit: {detail}"));

        let mut tree_id = None;
        let mut parent_id = None;
        let mut author_line = None;
        let mut rest = data;
        loop {
            let newline = rest
                .find_byte(0x0a)
                .ok_or_else(|| malformed("missing body separator"))?;
            let line = &rest[..newline];
            rest = &rest[newline + 1..];
            if line.is_empty() {
                break;
            }
            let line = std::str::from_utf8(line).map_err(|_| malformed("non-UTF-8 header"))?;
            if let Some(hex) = line.strip_prefix("tree ") {
                tree_id = Some(hex.parse::<ObjectId>()?);
            } else if let Some(hex) = line.strip_prefix("parent ") {
                parent_id = Some(hex.parse::<ObjectId>()?);
            } else if let Some(value) = line.strip_prefix("author ") {
                author_line = Some(value.to_string());
            } else {
                return Err(malformed("unknown header line"));
            }
        }

        let author_line = author_line.ok_or_else(|| malformed("missing author"))?;
        let open = author_line.find('<').ok_or_else(|| malformed("author email"))?;
        let close = author_line.find('>').ok_or_else(|| malformed("author email"))?;
        if close < open {
            return Err(malformed("author email"));
        }
        let name = author_line[..open].trim().to_string();
        let email = author_line[open + 1..close].to_string();
        let millis: i64 = author_line[close + 1..]
            .trim()
            .parse()
            .map_err(|_| malformed("author timestamp"))?;
        let when = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| malformed("author timestamp"))?;

        let body = std::str::from_utf8(rest)
            .map_err(|_| malformed("non-UTF-8 body"))?
            .to_string();
        Ok(CommitObject {
            tree_id: tree_id.ok_or_else(|| malformed("missing tree"))?,
            parent_id,
            author: Author { name, email },
            when,
            body,
        })
    }

    pub fn id(&self) -> ObjectId {
        ObjectId::from_type_and_data(ObjectKind::Commit, &self.to_data())
    }
}

enum Node {
    Blob(ObjectId),
    Dir(BTreeMap<String, Node>),
}

/// Group a flat `path -> blob id` map into a nested directory structure.
/// Paths are absolute and already validated.
fn group(files: &BTreeMap<String, ObjectId>) -> BTreeMap<String, Node> {
    let mut root = BTreeMap::new();
    for (path, id) in files {
        let mut cursor = &mut root;
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        for (i, segment) in segments.iter().enumerate() {
            if i + 1 == segments.len() {
                cursor.insert(segment.to_string(), Node::Blob(*id));
            } else {
                let entry = cursor
                    .entry(segment.to_string())
                    .or_insert_with(|| Node::Dir(BTreeMap::new()));
                cursor = match entry {
                    Node::Dir(map) => map,
                    // A file and a directory cannot share a path; change
                    // application rejects this before trees are built.
                    Node::Blob(_) => unreachable!("file shadowed by directory"),
                };
            }
        }
    }
    root
}

fn build<F>(nodes: &BTreeMap<String, Node>, sink: &mut F) -> Result<ObjectId>
where
    F: FnMut(&Tree) -> Result<ObjectId>,
{
    let mut entries = Vec::with_capacity(nodes.len());
    for (name, node) in nodes {
        let (mode, id) = match node {
            Node::Blob(id) => (EntryMode::File, *id),
            Node::Dir(children) => (EntryMode::Tree, build(children, sink)?),
        };
        entries.push(TreeEntry {
            mode,
            name: name.clone(),
            id,
        });
    }
    sink(&Tree::new(entries))
}

/// Compute the root tree ID of a flat file map without persisting anything.
pub fn tree_id_of(files: &BTreeMap<String, ObjectId>) -> ObjectId {
    let nodes = group(files);
    build(&nodes, &mut |tree: &Tree| Ok(tree.id())).expect("pure tree build cannot fail")
}

/// Build all tree objects for a flat file map, feeding each to `persist`.
/// Returns the root tree ID.
pub fn write_trees<F>(files: &BTreeMap<String, ObjectId>, mut persist: F) -> Result<ObjectId>
where
    F: FnMut(&Tree) -> Result<ObjectId>,
{
    let nodes = group(files);
    build(&nodes, &mut persist)
}
