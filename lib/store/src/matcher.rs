//! Group matchers for bulk pause, resume, and listing operations.

use serde::{Deserialize, Serialize};

/// Selects key groups by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "operator", content = "value", rename_all = "snake_case")]
pub enum GroupMatcher {
    /// The group name equals the value.
    Equals(String),
    /// The group name starts with the value.
    StartsWith(String),
    /// The group name ends with the value.
    EndsWith(String),
    /// The group name contains the value.
    Contains(String),
    /// Every group.
    Anything,
}

impl GroupMatcher {
    /// Matches exactly one group.
    #[must_use]
    pub fn equals(group: impl Into<String>) -> Self {
        Self::Equals(group.into())
    }

    /// Matches groups with a prefix.
    #[must_use]
    pub fn starts_with(prefix: impl Into<String>) -> Self {
        Self::StartsWith(prefix.into())
    }

    /// Returns whether a group name matches.
    #[must_use]
    pub fn matches(&self, group: &str) -> bool {
        match self {
            Self::Equals(value) => group == value,
            Self::StartsWith(value) => group.starts_with(value.as_str()),
            Self::EndsWith(value) => group.ends_with(value.as_str()),
            Self::Contains(value) => group.contains(value.as_str()),
            Self::Anything => true,
        }
    }

    /// Returns the single group named by an `Equals` matcher.
    ///
    /// Bulk pause records such a group as paused even when it has no members
    /// yet, so that later additions start paused.
    #[must_use]
    pub fn exact_group(&self) -> Option<&str> {
        match self {
            Self::Equals(value) => Some(value),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operators_match_group_names() {
        assert!(GroupMatcher::equals("reports").matches("reports"));
        assert!(!GroupMatcher::equals("reports").matches("reports-eu"));
        assert!(GroupMatcher::starts_with("rep").matches("reports"));
        assert!(GroupMatcher::EndsWith("-eu".into()).matches("reports-eu"));
        assert!(GroupMatcher::Contains("port".into()).matches("reports"));
        assert!(GroupMatcher::Anything.matches(""));
    }

    #[test]
    fn only_equals_names_an_exact_group() {
        assert_eq!(GroupMatcher::equals("g").exact_group(), Some("g"));
        assert_eq!(GroupMatcher::Anything.exact_group(), None);
    }
}
