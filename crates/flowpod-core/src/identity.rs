//! Run identity
//!
//! A [`RunId`] names one execution attempt's cluster resource. It is chosen
//! before the resource is created, so it doubles as the key under which the
//! run's channel group is registered.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Longest identity accepted, matching a DNS label
pub const MAX_RUN_ID_LEN: usize = 63;

const SUFFIX_LEN: usize = 8;

/// Error type for run identity validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunIdError {
    /// The identity string is empty
    Empty,
    /// The identity exceeds [`MAX_RUN_ID_LEN`]
    TooLong(usize),
    /// The identity contains characters other than `a-z`, `0-9` and `-`
    InvalidCharacters,
    /// The identity starts or ends with `-`
    InvalidBoundary,
}

impl fmt::Display for RunIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "run id cannot be empty"),
            Self::TooLong(len) => write!(
                f,
                "run id is {} characters long, limit is {}",
                len, MAX_RUN_ID_LEN
            ),
            Self::InvalidCharacters => write!(
                f,
                "run id can only contain lowercase alphanumeric characters and hyphens"
            ),
            Self::InvalidBoundary => write!(f, "run id cannot start or end with a hyphen"),
        }
    }
}

impl std::error::Error for RunIdError {}

/// Unique identifier of one run and its cluster resource
///
/// Valid identities are DNS labels: 1 to 63 characters of lowercase
/// alphanumerics and hyphens, not starting or ending with a hyphen.
///
/// # Examples
///
/// ```
/// use flowpod_core::RunId;
///
/// assert!(RunId::parse("nightly-report-1a2b3c4d").is_ok());
/// assert!(RunId::parse("").is_err());
/// assert!(RunId::parse("Upper").is_err());
/// assert!(RunId::parse("-leading").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    /// Parse and validate a run identity
    pub fn parse(id: impl AsRef<str>) -> Result<Self, RunIdError> {
        let s = id.as_ref();

        if s.is_empty() {
            return Err(RunIdError::Empty);
        }
        if s.len() > MAX_RUN_ID_LEN {
            return Err(RunIdError::TooLong(s.len()));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(RunIdError::InvalidCharacters);
        }
        if s.starts_with('-') || s.ends_with('-') {
            return Err(RunIdError::InvalidBoundary);
        }

        Ok(Self(s.to_string()))
    }

    /// Generate a fresh identity for a run of `task`
    ///
    /// The task name is folded into a DNS-safe prefix and followed by eight
    /// random hex characters, e.g. `nightly-report-1a2b3c4d`.
    pub fn generate(task: &str) -> Self {
        let mut prefix: String = task
            .chars()
            .map(|c| {
                let c = c.to_ascii_lowercase();
                if c.is_ascii_lowercase() || c.is_ascii_digit() {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        prefix.truncate(MAX_RUN_ID_LEN - SUFFIX_LEN - 1);
        let prefix = prefix.trim_matches('-');
        let prefix = if prefix.is_empty() { "run" } else { prefix };

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", prefix, &suffix[..SUFFIX_LEN]))
    }

    /// Get the identity as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RunId {
    type Err = RunIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RunId {
    type Error = RunIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.0
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
