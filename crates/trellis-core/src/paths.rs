//! Hierarchical run-spec identifiers.
//!
//! A `PathId` is a slash-separated path, absolute (`/prod/api`) or relative
//! (`api`). Segments may not contain the separator `/`, the instance-id
//! delimiter `.`, or the safe-form sentinel `_`; keeping `_` out of
//! segments makes the safe encoding bijective.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ValidationError;

const RESERVED: [char; 3] = ['/', '.', '_'];

/// A hierarchical identifier for groups and run specs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathId {
    absolute: bool,
    segments: Vec<String>,
}

impl PathId {
    /// The absolute root path `/`.
    pub fn root() -> Self {
        Self {
            absolute: true,
            segments: Vec::new(),
        }
    }

    fn validated(absolute: bool, segments: Vec<String>, raw: &str) -> Result<Self, ValidationError> {
        for segment in &segments {
            if segment.is_empty() {
                return Err(ValidationError::InvalidPath(
                    raw.to_string(),
                    "empty path segment".to_string(),
                ));
            }
            if let Some(c) = segment.chars().find(|c| RESERVED.contains(c)) {
                return Err(ValidationError::InvalidPath(
                    raw.to_string(),
                    format!("reserved character `{c}` in segment `{segment}`"),
                ));
            }
        }
        Ok(Self { absolute, segments })
    }

    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    pub fn is_root(&self) -> bool {
        self.absolute && self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The last path segment, if any.
    pub fn base(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// The first segment of an absolute path. Top-level groups own the
    /// enforce-role flag, so this doubles as the inherited role name.
    pub fn top_level(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// Parent path. The root is its own parent.
    pub fn parent(&self) -> PathId {
        let mut segments = self.segments.clone();
        segments.pop();
        Self {
            absolute: self.absolute,
            segments,
        }
    }

    /// Append a relative path, yielding a path with this one's anchoring.
    pub fn join(&self, other: &PathId) -> PathId {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self {
            absolute: self.absolute,
            segments,
        }
    }

    /// Resolve against a base path: absolute ids stand alone, relative ids
    /// attach to the base. This is the rule that makes `/a` inside an
    /// update of `/parent` mean `/a` rather than `/parent/a`.
    pub fn canonical(&self, base: &PathId) -> PathId {
        if self.absolute {
            self.clone()
        } else {
            base.join(self)
        }
    }

    /// The first `len` segments with the same anchoring.
    pub fn prefix(&self, len: usize) -> PathId {
        Self {
            absolute: self.absolute,
            segments: self.segments[..len.min(self.segments.len())].to_vec(),
        }
    }

    /// True when `self` is a direct child of `parent`.
    pub fn is_child_of(&self, parent: &PathId) -> bool {
        self.segments.len() == parent.segments.len() + 1 && self.has_prefix(parent)
    }

    /// True when `ancestor` is a (non-strict) prefix of this path.
    pub fn has_prefix(&self, ancestor: &PathId) -> bool {
        self.segments.len() >= ancestor.segments.len()
            && self.segments[..ancestor.segments.len()] == ancestor.segments[..]
    }

    /// Safe encoding: `/` becomes `_`, so the id can embed in opaque
    /// strings such as instance ids and persistence keys.
    pub fn safe_path(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            out.push('_');
            out.push_str(segment);
        }
        out
    }

    /// Decode a safe-form id back into an absolute path.
    pub fn from_safe(safe: &str) -> Result<Self, ValidationError> {
        let segments: Vec<String> = safe
            .split('_')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Self::validated(true, segments, safe)
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.absolute {
            if self.segments.is_empty() {
                return write!(f, "/");
            }
            for segment in &self.segments {
                write!(f, "/{segment}")?;
            }
            Ok(())
        } else {
            write!(f, "{}", self.segments.join("/"))
        }
    }
}

impl FromStr for PathId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let absolute = trimmed.starts_with('/');
        let segments: Vec<String> = trimmed
            .trim_matches('/')
            .split('/')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        if !absolute && segments.is_empty() {
            return Err(ValidationError::InvalidPath(
                s.to_string(),
                "empty relative path".to_string(),
            ));
        }
        Self::validated(absolute, segments, s)
    }
}

// Ordering is lexicographic on the canonical form; absolute paths sort
// before relative ones because `/` precedes every segment character.
impl Ord for PathId {
    fn cmp(&self, other: &Self) -> Ordering {
        (!self.absolute, &self.segments).cmp(&(!other.absolute, &other.segments))
    }
}

impl PartialOrd for PathId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for PathId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PathId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(|e: ValidationError| D::Error::custom(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> PathId {
        s.parse().unwrap()
    }

    #[test]
    fn parses_absolute_and_relative() {
        assert!(id("/prod/api").is_absolute());
        assert!(!id("api").is_absolute());
        assert_eq!(id("/prod/api").segments(), ["prod", "api"]);
        assert_eq!(id("/prod/api/").segments(), ["prod", "api"]);
    }

    #[test]
    fn root_round_trips() {
        assert_eq!(PathId::root().to_string(), "/");
        assert_eq!(id("/"), PathId::root());
        assert!(PathId::root().is_root());
    }

    #[test]
    fn rejects_reserved_characters() {
        assert!("/prod/a.b".parse::<PathId>().is_err());
        assert!("/prod/a_b".parse::<PathId>().is_err());
        assert!("".parse::<PathId>().is_err());
    }

    #[test]
    fn canonical_resolution_keeps_absolute_ids_absolute() {
        let base = id("/parent");
        assert_eq!(id("/a").canonical(&base), id("/a"));
        assert_eq!(id("a").canonical(&base), id("/parent/a"));
    }

    #[test]
    fn parent_and_child_relationships() {
        assert_eq!(id("/prod/api").parent(), id("/prod"));
        assert_eq!(PathId::root().parent(), PathId::root());
        assert!(id("/prod/api").is_child_of(&id("/prod")));
        assert!(!id("/prod/api/v2").is_child_of(&id("/prod")));
        assert!(id("/prod/api/v2").has_prefix(&id("/prod")));
    }

    #[test]
    fn safe_encoding_round_trips() {
        let original = id("/prod/sleep/goodnight");
        let safe = original.safe_path();
        assert_eq!(safe, "_prod_sleep_goodnight");
        assert_eq!(PathId::from_safe(&safe).unwrap(), original);
    }

    #[test]
    fn ordering_is_lexicographic_on_canonical_form() {
        let mut ids = vec![id("/b"), id("/a/c"), id("/a"), id("/a/b")];
        ids.sort();
        let rendered: Vec<String> = ids.iter().map(|p| p.to_string()).collect();
        assert_eq!(rendered, ["/a", "/a/b", "/a/c", "/b"]);
    }

    #[test]
    fn serde_as_string() {
        let p = id("/prod/api");
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"/prod/api\"");
        let back: PathId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
