use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the cleaning engine.
///
/// Per-item deletion failures never show up here; they are folded into
/// [`crate::cleaner::ActionReport`] so a batch keeps going.
#[derive(Debug, Error)]
pub enum CleanerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse rule file {path}: {message}")]
    RuleParse { path: PathBuf, message: String },
    #[error("cannot build trigger for scenario '{scenario}': {reason}")]
    TriggerConfig { scenario: String, reason: String },
    #[error("invalid scenario: {0}")]
    InvalidScenario(String),
    #[error("refusing to touch protected path: {}", .0.display())]
    WhitelistViolation(PathBuf),
    #[error("backup error: {0}")]
    Backup(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("runtime error: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, CleanerError>;
