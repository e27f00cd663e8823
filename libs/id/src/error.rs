//! Error types for runner name parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating runner names.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NameError {
    /// The name string is empty.
    #[error("runner name cannot be empty")]
    Empty,

    /// The name is longer than the compute provider accepts.
    #[error("runner name too long: {len} characters (max {max})")]
    TooLong { len: usize, max: usize },

    /// The name contains a character outside `[a-z0-9-]` or does not start
    /// with a letter.
    #[error("invalid runner name '{name}': {message}")]
    InvalidFormat { name: String, message: String },

    /// The environment name cannot be embedded in runner names.
    #[error("invalid environment name '{env}': {message}")]
    InvalidEnv { env: String, message: String },

    /// The runner type string is not recognized.
    #[error("unknown runner type '{0}'")]
    UnknownType(String),
}
