//! Error model for configuration and header parsing.

use thiserror::Error;

/// Startup configuration failure.
///
/// Always fatal: the process refuses to start with a malformed option set.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable was present but could not be parsed.
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: String, reason: String },

    /// A numeric option must be strictly positive.
    #[error("{name} must be greater than zero")]
    NotPositive { name: String },

    /// Two options that must differ were set to the same value.
    #[error("conflicting configuration: {0}")]
    Conflict(String),
}

impl ConfigError {
    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn not_positive(name: impl Into<String>) -> Self {
        Self::NotPositive { name: name.into() }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

/// A reserved header carried a value that does not parse.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("header {name} is not a valid count: {value:?}")]
    InvalidCount { name: &'static str, value: String },
}
