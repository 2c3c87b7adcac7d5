//! Error taxonomy for the engine — spec.md §7.
//!
//! Kinds, not exceptions: each variant maps to a documented recovery policy.
//! Only `StorageCorrupt` and an embedder load failure are fatal to the
//! process; everything else is recovered locally or surfaced in a structured
//! response.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("file unreadable: {path}: {reason}")]
    FileUnreadable { path: PathBuf, reason: String },

    #[error("file too large: {path} ({size} bytes, ceiling {ceiling} bytes)")]
    FileTooLarge { path: PathBuf, size: u64, ceiling: u64 },

    #[error("embedding failed for chunk {chunk_index} of {path}: {reason}")]
    EmbedFailure { path: PathBuf, chunk_index: usize, reason: String },

    #[error("storage contended after {attempts} attempts: {reason}")]
    StorageContended { attempts: u32, reason: String },

    #[error("storage corrupt: {0}")]
    StorageCorrupt(String),

    #[error("vector index unavailable: {0}")]
    VectorIndexUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid query: {message} (hint: {hint})")]
    InvalidQuery { message: String, hint: String },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// The stable kind string, used in structured log fields and error
    /// responses so callers can branch without string-matching on Display.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::FileUnreadable { .. } => "FileUnreadable",
            EngineError::FileTooLarge { .. } => "FileTooLarge",
            EngineError::EmbedFailure { .. } => "EmbedFailure",
            EngineError::StorageContended { .. } => "StorageContended",
            EngineError::StorageCorrupt(_) => "StorageCorrupt",
            EngineError::VectorIndexUnavailable(_) => "VectorIndexUnavailable",
            EngineError::NotFound(_) => "NotFound",
            EngineError::InvalidQuery { .. } => "InvalidQuery",
            EngineError::Sqlite(_) => "StorageContended",
            EngineError::Pool(_) => "StorageContended",
            EngineError::Io(_) => "FileUnreadable",
        }
    }

    /// Fatal errors stop the owning process; everything else is recovered
    /// locally (scan-local) or surfaced as a structured per-request error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::StorageCorrupt(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
