// src/error.rs

//! Error types shared across the crate

use thiserror::Error;

/// Errors produced by the package model, the storage layer and the
/// build-action engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing configuration (TOML file, database section)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem or network I/O failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Failed to parse a package file name, .PKGINFO, PKGBUILD or JSON
    #[error("Parse error: {0}")]
    Parse(String),

    /// Package file name does not follow `<name>-<ver>-<rel>-<arch>.pkg.<ext>`
    #[error("Malformed package file name: {0}")]
    MalformedName(String),

    /// Build-action inputs violate the required databases/parameters
    #[error("Validation error: {0}")]
    Validation(String),

    /// A child process could not be spawned or exited with a non-zero code
    #[error("External process error: {0}")]
    External(String),

    /// The build action was aborted at a cancellation point
    #[error("Build action aborted")]
    Aborted,

    /// Cache and backing store disagree; fatal for the affected action
    #[error("Consistency error: {0}")]
    Consistency(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(format!("JSON error: {e}"))
    }
}
