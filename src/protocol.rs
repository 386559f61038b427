//! Shared protocol constants and message types for the ferry wire format

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{FerryError, Result};

/// Decoded envelope payload: a JSON object keyed by field name.
pub type Envelope = Map<String, Value>;

// Envelope header: 4-byte little-endian signed payload length
pub const HEADER_LEN: usize = 4;

// Maximum envelope payload (1MB). The wire format itself has no cap;
// commands are tiny so this only ever stops a hostile peer.
pub const MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

// Raw payload bytes are streamed in fixed chunks after the resume handshake
pub const CHUNK_SIZE: usize = 1024;

// Upper bound for a single unframed reply read
pub const REPLY_BUF: usize = 1024;
// Upper bound for a whole directory listing, which may span many reads
pub const LIST_REPLY_BUF: usize = 4 * 1024 * 1024;

// Dash rule opening and closing a directory listing
pub const LISTING_RULE_WIDTH: usize = 30;

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_THREADS: usize = 20;

// Field separator inside the credential file
pub const RECORD_SEPARATOR: char = ':';

// Client get retries after the first attempt
pub const GET_RETRIES: usize = 3;

// Unframed status replies
pub mod status {
    pub const OK: &str = "0";
    /// login failure, cd already at top, mk_dir exists, remove not found
    pub const FAILED: &str = "-1";
    /// input error (invalid path or name)
    pub const INVALID: &str = "-2";
    /// unknown action or missing fields
    pub const BAD_REQUEST: &str = "-3";
    /// command needs a prior login on this connection
    pub const NOT_LOGGED_IN: &str = "-4";
}

/// Every command a client can send. The `action` field selects the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    Signup {
        username: String,
        password: String,
        size: u64,
    },
    Login {
        username: String,
        password: String,
    },
    Get {
        file_name: String,
    },
    Put {
        file_name: String,
        file_size: u64,
        md5: String,
    },
    Ls,
    Cd {
        target_path: String,
    },
    MkDir {
        dir_name: String,
    },
    Remove {
        dir_name: String,
    },
    GetFreeSize,
}

impl Command {
    pub const ACTIONS: [&'static str; 9] = [
        "signup",
        "login",
        "get",
        "put",
        "ls",
        "cd",
        "mk_dir",
        "remove",
        "get_free_size",
    ];

    /// Interpret a decoded envelope.
    ///
    /// Unknown actions and known actions with missing fields are reported
    /// separately so the dispatcher can answer them instead of dropping them.
    pub fn from_envelope(envelope: Envelope) -> Result<Command> {
        let action = match envelope.get("action") {
            Some(Value::String(a)) => a.clone(),
            Some(other) => return Err(FerryError::BadRequest(format!("action is not a string: {other}"))),
            None => return Err(FerryError::BadRequest("missing action".into())),
        };
        if !Self::ACTIONS.contains(&action.as_str()) {
            return Err(FerryError::UnknownAction(action));
        }
        serde_json::from_value(Value::Object(envelope))
            .map_err(|e| FerryError::BadRequest(format!("{action}: {e}")))
    }

    pub fn action(&self) -> &'static str {
        match self {
            Command::Signup { .. } => "signup",
            Command::Login { .. } => "login",
            Command::Get { .. } => "get",
            Command::Put { .. } => "put",
            Command::Ls => "ls",
            Command::Cd { .. } => "cd",
            Command::MkDir { .. } => "mk_dir",
            Command::Remove { .. } => "remove",
            Command::GetFreeSize => "get_free_size",
        }
    }
}

/// Metadata the server sends in answer to `get`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    pub file_name: String,
    pub is_file: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
}

impl FileMeta {
    pub fn missing(file_name: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            is_file: false,
            file_size: None,
            md5: None,
        }
    }
}

/// Where a transfer should start, as negotiated by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeStatus {
    /// Send everything (no local copy, or a same-size copy that is corrupt).
    Fresh,
    /// Receiver already holds an identical copy.
    Skip,
    /// Receiver holds this many bytes; send the rest.
    Resume(u64),
}

impl ResumeStatus {
    /// Byte offset to start sending from, `None` when nothing is sent.
    pub fn offset(self) -> Option<u64> {
        match self {
            ResumeStatus::Fresh => Some(0),
            ResumeStatus::Skip => None,
            ResumeStatus::Resume(n) => Some(n),
        }
    }

    pub fn to_wire(self) -> String {
        match self {
            ResumeStatus::Fresh => "0".to_string(),
            ResumeStatus::Skip => "-1".to_string(),
            ResumeStatus::Resume(n) => n.to_string(),
        }
    }

    /// Parse a decimal status. Negative values other than -1 are refusals
    /// from the peer and come back as `Rejected`.
    pub fn parse(s: &str) -> Result<ResumeStatus> {
        let v: i64 = s
            .trim()
            .parse()
            .map_err(|_| FerryError::Protocol(format!("invalid resume status: {s:?}")))?;
        match v {
            0 => Ok(ResumeStatus::Fresh),
            -1 => Ok(ResumeStatus::Skip),
            n if n > 0 => Ok(ResumeStatus::Resume(n as u64)),
            n => Err(FerryError::Rejected(n)),
        }
    }
}
