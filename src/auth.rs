//! Flat-file credential and quota store
//!
//! One record per line, `username:md5(password):quota_mb`. Records are only
//! ever appended. Appends go through a mutex so concurrent signups cannot
//! interleave partial lines.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use walkdir::WalkDir;

use crate::checksum::md5_hex;
use crate::error::{FerryError, Result};
use crate::protocol::RECORD_SEPARATOR;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub username: String,
    pub password_hash: String,
    pub quota_mb: u64,
}

impl CredentialRecord {
    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.trim().split(RECORD_SEPARATOR);
        let username = fields.next()?.to_string();
        let password_hash = fields.next()?.to_string();
        let quota_mb = fields.next()?.trim().parse().ok()?;
        if fields.next().is_some() || username.is_empty() {
            return None;
        }
        Some(Self {
            username,
            password_hash,
            quota_mb,
        })
    }

    fn to_line(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}\n",
            self.username,
            self.password_hash,
            self.quota_mb,
            sep = RECORD_SEPARATOR
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignupOutcome {
    Created,
    InvalidName,
    Taken,
}

impl SignupOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            SignupOutcome::Created => "Signup successful!",
            SignupOutcome::InvalidName => "Username must not contain special characters!",
            SignupOutcome::Taken => "Username already taken!",
        }
    }
}

/// Reply when signup could not write the home or the record.
pub const SIGNUP_FAILED: &str = "Signup failed!";

pub fn hash_password(password: &str) -> String {
    md5_hex(password.as_bytes())
}

#[derive(Debug)]
pub struct CredentialStore {
    user_info: PathBuf,
    users_root: PathBuf,
    write_lock: Mutex<()>,
}

impl CredentialStore {
    /// Open (creating if needed) the credential file. Home directories live
    /// under `users_root`.
    pub fn open(user_info: impl Into<PathBuf>, users_root: impl Into<PathBuf>) -> Result<Self> {
        let user_info = user_info.into();
        let users_root = users_root.into();
        fs::create_dir_all(&users_root)?;
        if let Some(parent) = user_info.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&user_info)?;
        Ok(Self {
            user_info,
            users_root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn users_root(&self) -> &Path {
        &self.users_root
    }

    pub fn home_of(&self, username: &str) -> PathBuf {
        self.users_root.join(username)
    }

    pub fn records(&self) -> Result<Vec<CredentialRecord>> {
        let f = fs::File::open(&self.user_info)?;
        let mut out = Vec::new();
        for line in BufReader::new(f).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Some(rec) = CredentialRecord::parse(&line) {
                out.push(rec);
            }
        }
        Ok(out)
    }

    pub fn find(&self, username: &str) -> Result<Option<CredentialRecord>> {
        Ok(self.records()?.into_iter().find(|r| r.username == username))
    }

    pub fn signup(&self, username: &str, password: &str, quota_mb: u64) -> Result<SignupOutcome> {
        if !is_valid_username(username) {
            return Ok(SignupOutcome::InvalidName);
        }
        let _guard = self.write_lock.lock();
        if self.find(username)?.is_some() {
            return Ok(SignupOutcome::Taken);
        }

        fs::create_dir_all(self.home_of(username))?;
        let record = CredentialRecord {
            username: username.to_string(),
            password_hash: hash_password(password),
            quota_mb,
        };
        let mut f = OpenOptions::new().append(true).open(&self.user_info)?;
        f.write_all(record.to_line().as_bytes())?;
        f.flush()?;
        Ok(SignupOutcome::Created)
    }

    /// Exact `(username, md5(password))` match.
    pub fn login(&self, username: &str, password: &str) -> Result<Option<CredentialRecord>> {
        let hash = hash_password(password);
        Ok(self
            .records()?
            .into_iter()
            .find(|r| r.username == username && r.password_hash == hash))
    }

    pub fn quota_mb(&self, username: &str) -> Result<u64> {
        self.find(username)?
            .map(|r| r.quota_mb)
            .ok_or_else(|| FerryError::Credentials(format!("no record for {}", username)))
    }

    /// Quota minus everything under the user's home, in MiB. A point in time
    /// estimate; uploads racing on another connection are not accounted for.
    pub fn free_size_mb(&self, username: &str) -> Result<f64> {
        let quota = self.quota_mb(username)? as f64;
        let used = dir_size(&self.home_of(username));
        Ok(quota - used as f64 / BYTES_PER_MB)
    }
}

/// Usernames double as directory names under the data root.
pub fn is_valid_username(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(RECORD_SEPARATOR)
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
        && !name.contains('\n')
}

/// Total size of regular files below `root`
pub fn dir_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}
