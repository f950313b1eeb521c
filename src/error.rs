// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Error types for logwarden

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for logwarden operations
pub type Result<T> = std::result::Result<T, WardenError>;

/// logwarden error types
#[derive(Error, Debug)]
pub enum WardenError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Folder not found: {}", .0.display())]
    FolderNotFound(PathBuf),

    #[error("No watched folder could be subscribed")]
    NoValidFolders,

    #[error("Invalid routing pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Baseline rejected: {0}")]
    Baseline(String),

    #[error("File locked: {}", .0.display())]
    Locked(PathBuf),

    #[error("Internal state error: {0}")]
    State(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
