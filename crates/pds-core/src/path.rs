//! Dotted field paths.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A path into a document's field tree, e.g. `shipping.address.city`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldPath(pub Vec<String>);

impl FieldPath {
    /// Parse a dotted path. Empty segments are dropped.
    pub fn parse(path: &str) -> Self {
        Self(
            path.split('.')
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect(),
        )
    }

    /// Single-segment path.
    pub fn field(name: impl Into<String>) -> Self {
        Self(vec![name.into()])
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// First segment, if any.
    pub fn head(&self) -> Option<&str> {
        self.0.first().map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl From<&str> for FieldPath {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let p = FieldPath::parse("shipping.address.city");
        assert_eq!(p.len(), 3);
        assert_eq!(p.head(), Some("shipping"));
        assert_eq!(p.to_string(), "shipping.address.city");
    }

    #[test]
    fn test_empty_segments_dropped() {
        let p = FieldPath::parse("a..b.");
        assert_eq!(p.segments(), &["a".to_string(), "b".to_string()]);
    }
}
