//! Error types for the ctxguard domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each pipeline stage has its own error enum; [`Error`] wraps them all.

use thiserror::Error;

/// The top-level error type for all ctxguard operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Context tree errors ---
    #[error("Context error: {0}")]
    Node(#[from] NodeError),

    // --- Compression errors ---
    #[error("Compression error: {0}")]
    Compression(#[from] CompressionError),

    // --- Reconstruction errors ---
    #[error("Reconstruction error: {0}")]
    Reconstruction(#[from] ReconstructionError),

    // --- Resistance pipeline errors ---
    #[error("Resistance error: {0}")]
    Resist(#[from] ResistError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Stage errors ---

/// The context tree cannot be turned into plain data.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum NodeError {
    #[error("circular reference through node '{id}'")]
    CircularReference { id: String },

    #[error("nesting deeper than {limit} levels")]
    DepthExceeded { limit: usize },

    #[error("encoding failed: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone, Error)]
pub enum CompressionError {
    /// The input cannot be serialized (for example it references itself).
    #[error("compression failed: {0}")]
    Serialization(#[from] NodeError),

    #[error("encoding failed at {path}: {reason}")]
    Encode { path: String, reason: String },

    /// Strict decoding found entries that were not valid compressed blobs.
    #[error("corrupted compressed entries: {}", paths.join(", "))]
    Corrupted { paths: Vec<String> },
}

#[derive(Debug, Clone, Error)]
pub enum ReconstructionError {
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),

    #[error("recovery point {id} failed checksum verification")]
    ChecksumMismatch { id: String },

    #[error("recovery point not found: {0}")]
    PointNotFound(String),

    #[error("context is not serializable: {0}")]
    Unserializable(#[from] NodeError),

    #[error("salvage failed: {0}")]
    Salvage(String),
}

#[derive(Debug, Clone, Error)]
pub enum ResistError {
    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Compression(#[from] CompressionError),

    #[error(transparent)]
    Reconstruction(#[from] ReconstructionError),
}
