//! Error types shared by the server, the transfer engine and the client.

use std::io;

/// Errors produced while serving or driving a ferry connection.
#[derive(Debug, thiserror::Error)]
pub enum FerryError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A file on this side could not be opened, read or written. Says
    /// nothing about the connection.
    #[error("local file error: {0}")]
    LocalIo(io::Error),

    /// Malformed or truncated envelope. Ends the session loop.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// Known action with missing or mistyped fields.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not logged in")]
    NotAuthenticated,

    /// Attempted traversal outside the home directory or an unusable name.
    #[error("path violation: {0}")]
    PathViolation(String),

    #[error("remote file does not exist: {0}")]
    NotFound(String),

    /// Peer closed the connection before the announced byte count arrived.
    #[error("short transfer: expected {expected} bytes, received {received}")]
    ShortRead { expected: u64, received: u64 },

    /// The receiver already holds more bytes than the sender has.
    #[error("resume offset {offset} is beyond end of file ({size} bytes)")]
    OffsetBeyondEnd { offset: u64, size: u64 },

    #[error("transfer rejected by peer (status {0})")]
    Rejected(i64),

    #[error("not enough free space: need {needed_mb:.2} MB, {free_mb:.2} MB left")]
    QuotaExceeded { needed_mb: f64, free_mb: f64 },

    #[error("credential store: {0}")]
    Credentials(String),
}

impl FerryError {
    /// Network failures worth another attempt once the connection is
    /// re-established. Local file errors would just fail again.
    pub fn is_transient(&self) -> bool {
        matches!(self, FerryError::Io(_) | FerryError::ShortRead { .. })
    }
}

impl From<serde_json::Error> for FerryError {
    fn from(e: serde_json::Error) -> Self {
        FerryError::Protocol(format!("invalid envelope payload: {e}"))
    }
}

pub type Result<T, E = FerryError> = std::result::Result<T, E>;
