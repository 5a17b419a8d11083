//! Error types for SetDB
//!
//! Provides a unified error type for all operations. Every variant that can
//! reach a client maps onto the `-ERR <message>` it is serialized as.

use thiserror::Error;

/// Result type alias using SetdbError
pub type Result<T> = std::result::Result<T, SetdbError>;

/// Unified error type for SetDB operations
#[derive(Debug, Error)]
pub enum SetdbError {
    // -------------------------------------------------------------------------
    // Data Errors
    // -------------------------------------------------------------------------
    /// The key's metadata tag disagrees with the aggregate the command expects
    #[error("Operation against a key holding the wrong kind of value")]
    WrongType,

    /// A stored record is shorter than its schema or carries an illegal tag
    #[error("Invalid data")]
    InvalidData,

    // -------------------------------------------------------------------------
    // Argument Errors
    // -------------------------------------------------------------------------
    #[error("value is not an integer or out of range")]
    InvalidInt,

    #[error("value is not a valid float")]
    InvalidFloat,

    #[error("syntax error")]
    Syntax,

    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// Argument error with a command-specific message (e.g. a bad weight)
    #[error("{0}")]
    Argument(String),

    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Underlying store failure, surfaced verbatim per command
    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),

    /// MIGRATE-style interaction with a remote instance failed or timed out
    #[error("{0}")]
    Remote(String),

    // -------------------------------------------------------------------------
    // Wire Errors
    // -------------------------------------------------------------------------
    /// Malformed RESP framing; the connection is closed after reporting it
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl SetdbError {
    /// Whether this error should tear down the client connection
    pub fn is_fatal(&self) -> bool {
        matches!(self, SetdbError::Protocol(_))
    }
}
