//! Group-qualified keys naming jobs and triggers.
//!
//! Keys order by group, then name. That order is the final tie-breaker when
//! triggers are sorted for acquisition, so it must stay total and stable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The group used when none is given.
pub const DEFAULT_GROUP: &str = "DEFAULT";

/// Error returned when a `group.name` string cannot be parsed into a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseKeyError {
    /// The input that failed to parse.
    pub input: String,
}

impl fmt::Display for ParseKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected 'group.name', got '{}'", self.input)
    }
}

impl std::error::Error for ParseKeyError {}

macro_rules! define_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name {
            group: String,
            name: String,
        }

        impl $name {
            /// Creates a key in the given group.
            #[must_use]
            pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
                Self {
                    group: group.into(),
                    name: name.into(),
                }
            }

            /// Creates a key in the default group.
            #[must_use]
            pub fn in_default_group(name: impl Into<String>) -> Self {
                Self::new(name, DEFAULT_GROUP)
            }

            /// Returns the name.
            #[must_use]
            pub fn name(&self) -> &str {
                &self.name
            }

            /// Returns the group.
            #[must_use]
            pub fn group(&self) -> &str {
                &self.group
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}.{}", self.group, self.name)
            }
        }

        impl FromStr for $name {
            type Err = ParseKeyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.split_once('.') {
                    Some((group, name)) if !group.is_empty() && !name.is_empty() => {
                        Ok(Self::new(name, group))
                    }
                    _ => Err(ParseKeyError {
                        input: s.to_string(),
                    }),
                }
            }
        }
    };
}

define_key!(
    /// Identifies a job: a unit of work referenced by triggers.
    JobKey
);

define_key!(
    /// Identifies a trigger.
    TriggerKey
);
