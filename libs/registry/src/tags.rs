//! Node tags and the tag-match predicate.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A tag value: either a bare flag (`true`) or a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Flag(bool),
    Text(String),
}

impl TagValue {
    /// Returns the string value, if this is a text tag.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Flag(_) => None,
        }
    }
}

impl From<bool> for TagValue {
    fn from(flag: bool) -> Self {
        Self::Flag(flag)
    }
}

impl From<&str> for TagValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for TagValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag(b) => write!(f, "{b}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Tags attached to a node.
pub type Tags = BTreeMap<String, TagValue>;

/// Required tags for a query: `None` means "present with any value".
pub type TagFilter = BTreeMap<String, Option<TagValue>>;

/// Check whether `candidate` satisfies every requirement in `required`.
///
/// An empty filter matches everything.
pub fn matches_tags(candidate: &Tags, required: &TagFilter) -> bool {
    required.iter().all(|(name, expected)| match candidate.get(name) {
        None => false,
        Some(actual) => expected.as_ref().is_none_or(|want| want == actual),
    })
}
