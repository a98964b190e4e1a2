//! Revision numbers and revision ranges.
//!
//! A revision number is an integer which refers to a specific point of
//! repository history. When a repository is created it starts with an
//! initial commit whose revision is 1; each commit after that increases the
//! head revision by exactly 1.
//!
//! A non-positive revision is relative to the head: `-1` is the head itself
//! and `-N` refers to `head - (N - 1)`. `0` is invalid. Normalization turns
//! any revision into an absolute one for a given `(first, head)` pair; a
//! result below the first retained revision is clamped up to it, which is
//! how reads keep working after history compaction.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, StoreError};

/// A revision number. Positive values are absolute, non-positive values are
/// relative to the repository head.
#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(transparent)]
pub struct Revision(i64);

impl Revision {
    /// Revision `-1`, also known as `HEAD`.
    pub const HEAD: Revision = Revision(-1);
    /// Revision `1`, also known as `INIT`.
    pub const INIT: Revision = Revision(1);

    /// Create a new instance with the specified revision number.
    pub const fn from(i: i64) -> Self {
        Revision(i)
    }

    pub const fn as_i64(&self) -> i64 {
        self.0
    }

    /// Convert to an absolute revision for the given retained range.
    ///
    /// - `0` is rejected as invalid input.
    /// - A positive revision greater than `head` does not exist.
    /// - Any result below `first` is clamped up to `first`.
    pub fn normalize(&self, first: i64, head: i64) -> Result<Revision> {
        let v = self.0;
        if v == 0 {
            return Err(StoreError::InvalidArgument(
                "revision 0 is not allowed".to_string(),
            ));
        }
        if v > 0 {
            if v > head {
                return Err(StoreError::RevisionNotFound(v));
            }
            return Ok(Revision(v.max(first)));
        }
        // -1 is the head itself, -N walks back N - 1 commits.
        let absolute = head + v + 1;
        Ok(Revision(absolute.max(first)))
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A pair of revisions delimiting a range. `from` and `to` normalize
/// independently; most internal consumers then reorder with
/// [`RevisionRange::ascending`].
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct RevisionRange {
    pub from: Revision,
    pub to: Revision,
}

impl RevisionRange {
    pub const fn new(from: Revision, to: Revision) -> Self {
        RevisionRange { from, to }
    }

    /// Normalize both endpoints against the same retained range.
    pub fn normalize(&self, first: i64, head: i64) -> Result<RevisionRange> {
        Ok(RevisionRange {
            from: self.from.normalize(first, head)?,
            to: self.to.normalize(first, head)?,
        })
    }

    /// The same range with `from <= to`.
    pub fn ascending(&self) -> RevisionRange {
        if self.from.as_i64() <= self.to.as_i64() {
            *self
        } else {
            RevisionRange::new(self.to, self.from)
        }
    }

    /// The same range with `from >= to`.
    pub fn descending(&self) -> RevisionRange {
        if self.from.as_i64() >= self.to.as_i64() {
            *self
        } else {
            RevisionRange::new(self.to, self.from)
        }
    }
}
