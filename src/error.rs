// src/error.rs
//
// Error type shared by the registry, storage, ingestion and framing layers.
// The command surface (buffers.rs, framing.rs) flattens these to strings.

use thiserror::Error;

use crate::buffer_store::BufferKind;

/// Main error type for buffer operations
#[derive(Error, Debug)]
pub enum BufferError {
    /// Operation against an unknown or deleted buffer id
    #[error("Buffer '{id}' not found")]
    NotFound { id: String },

    /// Buffer exists but holds the other kind of item
    #[error("Buffer '{id}' is a {actual} buffer, expected a {expected} buffer")]
    WrongKind {
        id: String,
        expected: BufferKind,
        actual: BufferKind,
    },

    /// Rejected configuration, named by the offending field
    #[error("Invalid {field}: {message}")]
    Config { field: String, message: String },

    /// Source file could not be opened or read as a whole
    #[error("{path}: {message}")]
    File { path: String, message: String },

    /// Structurally broken CSV input (1-based line number)
    #[error("{path}:{line}: {message}")]
    Csv {
        path: String,
        line: usize,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Settings error: {0}")]
    Settings(String),

    /// A lock was poisoned by a panicking writer
    #[error("{0} lock poisoned")]
    Poisoned(&'static str),

    #[error("Operation cancelled")]
    Cancelled,

    /// Target buffer disappeared while a long-running operation was computing
    #[error("Buffer '{id}' was deleted during the operation, result discarded")]
    Discarded { id: String },

    /// Nothing to operate on (empty source buffer, empty CSV)
    #[error("{0}")]
    Empty(String),
}

impl BufferError {
    pub fn not_found(id: &str) -> Self {
        BufferError::NotFound { id: id.to_string() }
    }

    pub fn config(field: &str, message: impl Into<String>) -> Self {
        BufferError::Config {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// Whether this error means the buffer id does not (or no longer) exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BufferError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, BufferError>;
