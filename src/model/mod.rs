//! External data model of the configuration store: revisions, entries,
//! changes, commits, and queries. These are the types the RPC layer
//! serializes; content-addressed object IDs never appear here.

pub mod change;
pub mod commit;
pub mod entry;
pub mod query;
pub mod revision;

pub use change::{Change, ChangeContent, validate_path};
pub use commit::{Author, Commit, CommitMessage, Markup};
pub use entry::{Entry, EntryContent, EntryType};
pub use query::Query;
pub use revision::{Revision, RevisionRange};
