//! Error types for the console core.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using the crate error.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The engine executable is missing or does not answer at all.
    #[error("Container engine unavailable: {0}")]
    EngineMissing(String),

    /// The engine ran and returned a non-zero exit code.
    #[error("`{command}` failed with exit code {code}: {stderr}")]
    Engine {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("`{command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    /// Output of the engine or of the in-container CLI could not be decoded.
    #[error("Could not parse {context}: {reason}")]
    Parse {
        context: String,
        reason: String,
        raw: String,
    },

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Image pull failed: {0}")]
    Pull(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn parse(context: impl Into<String>, reason: impl ToString, raw: &str) -> Self {
        Error::Parse {
            context: context.into(),
            reason: reason.to_string(),
            raw: raw.to_string(),
        }
    }

    /// Timeouts may succeed on a second attempt; nothing else is worth retrying blindly.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Short hint for the status line.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Error::Timeout { .. } => Some("remote host slow or unreachable"),
            Error::EngineMissing(_) => Some("start the container engine and retry"),
            _ => None,
        }
    }

    /// Raw output attached to parse failures, if any.
    pub fn raw_output(&self) -> Option<&str> {
        match self {
            Error::Parse { raw, .. } => Some(raw),
            _ => None,
        }
    }
}
