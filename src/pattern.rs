//! Path pattern matching for queries, diffs, history, and watches.
//!
//! A pattern string is a comma-separated union of globs. Within a glob,
//! `**` matches zero or more whole path segments, `*` matches any run of
//! characters inside one segment and `?` matches a single character. A glob
//! with a leading `/` is anchored at the root; without one it matches at any
//! depth. The bare pattern `/` matches only the root directory. `/**` (or
//! `**`) compiles to a sentinel that matches everything and lets callers
//! short-circuit tree traversal.

use crate::errors::{Result, StoreError};

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    /// `**`: any number of whole segments, including none.
    Any,
    /// One segment matched by a glob with `*` and `?`.
    Name(String),
}

#[derive(Debug, Clone, PartialEq)]
enum SubPattern {
    /// The literal pattern `/`.
    Root,
    Glob(Vec<Segment>),
}

/// A compiled path pattern.
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    subs: Vec<SubPattern>,
    all: bool,
}

impl PathPattern {
    /// The match-everything pattern.
    pub fn all() -> PathPattern {
        PathPattern {
            raw: "/**".to_string(),
            subs: Vec::new(),
            all: true,
        }
    }

    /// Compile a comma-separated union of globs.
    pub fn compile(pattern: &str) -> Result<PathPattern> {
        let mut subs = Vec::new();
        let mut all = false;
        let mut seen_any = false;
        for raw_sub in pattern.split(',') {
            let sub = raw_sub.trim();
            if sub.is_empty() {
                continue;
            }
            seen_any = true;
            if sub == "/**" || sub == "**" {
                all = true;
                continue;
            }
            if sub == "/" {
                subs.push(SubPattern::Root);
                continue;
            }
            subs.push(SubPattern::Glob(compile_glob(pattern, sub)?));
        }
        if !seen_any {
            return Err(StoreError::InvalidArgument(format!(
                "invalid path pattern `{pattern}`: empty"
            )));
        }
        Ok(PathPattern {
            raw: pattern.to_string(),
            subs,
            all,
        })
    }

    /// True when this pattern trivially matches every path, letting tree
    /// traversal skip per-path checks.
    pub fn matches_all(&self) -> bool {
        self.all
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Match an absolute path. The root directory `/` is matched only by
    /// the sentinel or the literal `/` sub-pattern.
    pub fn matches(&self, path: &str) -> bool {
        if self.all {
            return true;
        }
        if path == "/" {
            return self.subs.iter().any(|s| *s == SubPattern::Root);
        }
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        self.subs.iter().any(|sub| match sub {
            SubPattern::Root => false,
            SubPattern::Glob(pattern) => match_segments(pattern, &segments),
        })
    }
}

fn compile_glob(full: &str, sub: &str) -> Result<Vec<Segment>> {
    for ch in sub.chars() {
        if !(ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '/' | '-' | '*' | '?')) {
            return Err(StoreError::InvalidArgument(format!(
                "invalid path pattern `{full}`: disallowed character `{ch}`"
            )));
        }
    }
    if sub.contains("//") {
        return Err(StoreError::InvalidArgument(format!(
            "invalid path pattern `{full}`: double slash"
        )));
    }
    let anchored = sub.starts_with('/');
    let mut segments = Vec::new();
    if !anchored {
        segments.push(Segment::Any);
    }
    for part in sub.split('/').filter(|s| !s.is_empty()) {
        if part == "**" {
            // Collapse consecutive `**` segments.
            if segments.last() != Some(&Segment::Any) {
                segments.push(Segment::Any);
            }
        } else if part.contains("**") {
            return Err(StoreError::InvalidArgument(format!(
                "invalid path pattern `{full}`: `**` must span a whole segment"
            )));
        } else {
            segments.push(Segment::Name(part.to_string()));
        }
    }
    Ok(segments)
}

fn match_segments(pattern: &[Segment], path: &[&str]) -> bool {
    match pattern.first() {
        None => path.is_empty(),
        Some(Segment::Any) => {
            (0..=path.len()).any(|skip| match_segments(&pattern[1..], &path[skip..]))
        }
        Some(Segment::Name(glob)) => {
            !path.is_empty()
                && match_name(glob.as_bytes(), path[0].as_bytes())
                && match_segments(&pattern[1..], &path[1..])
        }
    }
}

/// Classic backtracking glob match over one segment.
fn match_name(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_all_sentinel() {
        for raw in ["/**", "**", " /** ", "/**,/a.json"] {
            let pattern = PathPattern::compile(raw).unwrap();
            assert!(pattern.matches_all(), "{raw}");
            assert!(pattern.matches("/"));
            assert!(pattern.matches("/deep/ly/nested.txt"));
        }
        assert!(!PathPattern::compile("/a/**").unwrap().matches_all());
    }

    #[test]
    fn test_anchored_literal() {
        let pattern = PathPattern::compile("/a.json").unwrap();
        assert!(pattern.matches("/a.json"));
        assert!(!pattern.matches("/b/a.json"));
        assert!(!pattern.matches("/"));
    }

    #[test]
    fn test_star_stays_in_segment() {
        let pattern = PathPattern::compile("/a/*.json").unwrap();
        assert!(pattern.matches("/a/x.json"));
        assert!(!pattern.matches("/a/b/x.json"));
        assert!(!pattern.matches("/x.json"));
    }

    #[test]
    fn test_double_star_spans_segments() {
        let pattern = PathPattern::compile("/a/**/x.json").unwrap();
        assert!(pattern.matches("/a/x.json"));
        assert!(pattern.matches("/a/b/x.json"));
        assert!(pattern.matches("/a/b/c/x.json"));
        assert!(!pattern.matches("/x.json"));

        let tail = PathPattern::compile("/conf/**").unwrap();
        assert!(tail.matches("/conf/a.json"));
        assert!(tail.matches("/conf/deep/b.txt"));
        assert!(!tail.matches("/other/a.json"));
    }

    #[test]
    fn test_unanchored_matches_any_depth() {
        let pattern = PathPattern::compile("*.json").unwrap();
        assert!(pattern.matches("/a.json"));
        assert!(pattern.matches("/x/y/z.json"));
        assert!(!pattern.matches("/a.txt"));
    }

    #[test]
    fn test_comma_union() {
        let pattern = PathPattern::compile("/a.json, /b/*.txt").unwrap();
        assert!(pattern.matches("/a.json"));
        assert!(pattern.matches("/b/note.txt"));
        assert!(!pattern.matches("/c.yml"));
    }

    #[test]
    fn test_root_pattern() {
        let pattern = PathPattern::compile("/").unwrap();
        assert!(pattern.matches("/"));
        assert!(!pattern.matches("/a.json"));
    }

    #[test]
    fn test_question_mark() {
        let pattern = PathPattern::compile("/a?.json").unwrap();
        assert!(pattern.matches("/a1.json"));
        assert!(!pattern.matches("/a12.json"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(PathPattern::compile("").is_err());
        assert!(PathPattern::compile(" , ").is_err());
        assert!(PathPattern::compile("/a b").is_err());
        assert!(PathPattern::compile("/a**b").is_err());
        assert!(PathPattern::compile("/a//b").is_err());
    }

    #[test]
    fn test_directories_match_like_files() {
        let pattern = PathPattern::compile("/conf/*").unwrap();
        assert!(pattern.matches("/conf/sub"));
        assert!(!pattern.matches("/conf"));
    }
}
