//! Content-addressed persistence: object codecs, the on-disk store, and the
//! revision-to-commit index.

pub mod index;
pub mod object;
pub mod store;
