//! Runner type, runner name, and the naming scheme that ties them to an
//! environment.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::NameError;

/// Maximum length of a compute instance name.
pub const MAX_NAME_LEN: usize = 63;

/// Length of the random suffix (hyphenated UUID).
const SUFFIX_LEN: usize = 36;

// =============================================================================
// Runner Type
// =============================================================================

/// The kind of runner a VM hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerType {
    /// Serves real CI jobs.
    Default,
    /// Sentinel runner that occupies the pool without accepting jobs.
    Ghost,
}

impl RunnerType {
    /// All runner types, in a stable order.
    pub const ALL: [RunnerType; 2] = [RunnerType::Default, RunnerType::Ghost];

    /// The label/metadata value for this type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            RunnerType::Default => "default",
            RunnerType::Ghost => "ghost",
        }
    }
}

impl fmt::Display for RunnerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunnerType {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(RunnerType::Default),
            "ghost" => Ok(RunnerType::Ghost),
            other => Err(NameError::UnknownType(other.to_string())),
        }
    }
}

// =============================================================================
// Runner Name
// =============================================================================

/// A validated runner name, shared by the VM and its registry entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunnerName(String);

impl RunnerName {
    /// Parses and validates a runner name.
    pub fn parse(s: &str) -> Result<Self, NameError> {
        validate_instance_name(s)?;
        Ok(Self(s.to_string()))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the name and returns the inner string.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for RunnerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RunnerName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for RunnerName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for RunnerName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl Serialize for RunnerName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RunnerName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

fn validate_instance_name(s: &str) -> Result<(), NameError> {
    if s.is_empty() {
        return Err(NameError::Empty);
    }
    if s.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong {
            len: s.len(),
            max: MAX_NAME_LEN,
        });
    }
    if !s.starts_with(|c: char| c.is_ascii_lowercase()) {
        return Err(NameError::InvalidFormat {
            name: s.to_string(),
            message: "must start with a lowercase letter".to_string(),
        });
    }
    if let Some(bad) = s
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(NameError::InvalidFormat {
            name: s.to_string(),
            message: format!("unexpected character '{bad}'"),
        });
    }
    if s.ends_with('-') {
        return Err(NameError::InvalidFormat {
            name: s.to_string(),
            message: "must not end with '-'".to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Naming Scheme
// =============================================================================

/// Naming scheme for one managed environment.
///
/// Prefix matching always includes the trailing dash, so runners of env
/// `prod` never match the filter of env `production` (or the reverse).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerNaming {
    env: String,
}

impl RunnerNaming {
    /// Creates the naming scheme for an environment.
    ///
    /// The environment must be a valid name fragment and short enough that
    /// generated ghost names stay within [`MAX_NAME_LEN`].
    pub fn new(env: impl Into<String>) -> Result<Self, NameError> {
        let env = env.into();
        let naming = Self { env };

        let longest = naming.prefix(RunnerType::Ghost).len() + 1 + SUFFIX_LEN;
        if longest > MAX_NAME_LEN {
            return Err(NameError::InvalidEnv {
                env: naming.env,
                message: format!("generated names would be {longest} characters"),
            });
        }
        if naming.env.is_empty()
            || !naming
                .env
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(NameError::InvalidEnv {
                env: naming.env,
                message: "must be non-empty and contain only [a-z0-9-]".to_string(),
            });
        }

        Ok(naming)
    }

    /// The managed environment name.
    #[must_use]
    pub fn env(&self) -> &str {
        &self.env
    }

    /// The name prefix for a runner type (without the trailing dash).
    #[must_use]
    pub fn prefix(&self, runner_type: RunnerType) -> String {
        match runner_type {
            RunnerType::Default => format!("vm-gcp-{}", self.env),
            RunnerType::Ghost => format!("vm-gcp-ghost-{}", self.env),
        }
    }

    /// Generates a fresh, globally unique name for a runner type.
    #[must_use]
    pub fn generate(&self, runner_type: RunnerType) -> RunnerName {
        RunnerName(format!("{}-{}", self.prefix(runner_type), Uuid::new_v4()))
    }

    /// Returns true if `name` was generated for `runner_type` in this
    /// environment.
    #[must_use]
    pub fn matches(&self, name: &str, runner_type: RunnerType) -> bool {
        name.strip_prefix(&self.prefix(runner_type))
            .is_some_and(|rest| rest.starts_with('-'))
    }

    /// Recovers the runner type from a name, if it belongs to this
    /// environment.
    #[must_use]
    pub fn classify(&self, name: &str) -> Option<RunnerType> {
        // Ghost first: its prefix is the more specific one.
        [RunnerType::Ghost, RunnerType::Default]
            .into_iter()
            .find(|t| self.matches(name, *t))
    }
}
