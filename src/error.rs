//! Error taxonomy for capture, merge and offline decoding

use thiserror::Error;

/// Errors produced by the recorder core
#[derive(Error, Debug)]
pub enum RecorderError {
    /// A call signature key does not decode to the argument count it declares.
    /// Aborts the decode of that record only.
    #[error("Malformed call signature key: {0}")]
    MalformedKey(String),

    /// A grammar references a terminal that has no entry in the translation
    /// table. This is a merge logic fault, never a user error.
    #[error("Unknown terminal id {0} during remap")]
    UnknownTerminal(i32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Trace format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: String, found: String },

    /// Truncated or structurally invalid binary payload
    #[error("Corrupt trace data: {0}")]
    Corrupt(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Process group failure (peer gone, unexpected message)
    #[error("Communication failure: {0}")]
    Comm(String),
}

/// Result type for recorder operations
pub type Result<T> = std::result::Result<T, RecorderError>;
