//! Per-connection session state: who is logged in and where they are.
//!
//! A `Session` is created when a connection is accepted and dropped when it
//! closes. It is owned by the worker serving that connection and handed to
//! every command handler, so there is never any lookup by thread.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{FerryError, Result};
use crate::protocol::{status, LISTING_RULE_WIDTH};
use crate::protocol_core::confine_under;

/// Identity and working directory of an authenticated connection.
#[derive(Debug, Clone)]
pub struct UserContext {
    pub username: String,
    home: PathBuf,
    cwd: PathBuf,
}

impl UserContext {
    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Current directory relative to home, rendered as `/a/b`.
    pub fn display_cwd(&self) -> String {
        let rel = self.cwd.strip_prefix(&self.home).unwrap_or(Path::new(""));
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        format!("/{}", parts.join("/"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdOutcome {
    Changed,
    AtTop,
    Invalid,
}

impl CdOutcome {
    pub fn code(self) -> &'static str {
        match self {
            CdOutcome::Changed => status::OK,
            CdOutcome::AtTop => status::FAILED,
            CdOutcome::Invalid => status::INVALID,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MkdirOutcome {
    Created,
    Exists,
    Invalid,
}

impl MkdirOutcome {
    pub fn code(self) -> &'static str {
        match self {
            MkdirOutcome::Created => status::OK,
            MkdirOutcome::Exists => status::FAILED,
            MkdirOutcome::Invalid => status::INVALID,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    NotFound,
    Invalid,
}

impl RemoveOutcome {
    pub fn code(self) -> &'static str {
        match self {
            RemoveOutcome::Removed => status::OK,
            RemoveOutcome::NotFound => status::FAILED,
            RemoveOutcome::Invalid => status::INVALID,
        }
    }
}

#[derive(Debug)]
pub struct Session {
    peer: String,
    user: Option<UserContext>,
}

impl Session {
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            user: None,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    pub fn user(&self) -> Result<&UserContext> {
        self.user.as_ref().ok_or(FerryError::NotAuthenticated)
    }

    /// Bind the connection to `username`. The current directory starts at home.
    pub fn login(&mut self, username: &str, home: &Path) -> Result<()> {
        let home = home.canonicalize()?;
        self.user = Some(UserContext {
            username: username.to_string(),
            cwd: home.clone(),
            home,
        });
        Ok(())
    }

    /// Resolve a plain name inside the current directory.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        let user = self.user()?;
        confine_under(&user.home, &user.cwd, name)
    }

    pub fn cd(&mut self, target: &str) -> Result<CdOutcome> {
        let user = self.user.as_mut().ok_or(FerryError::NotAuthenticated)?;

        if target == ".." {
            if user.cwd == user.home {
                return Ok(CdOutcome::AtTop);
            }
            let parent = user.cwd.parent().map(Path::to_path_buf);
            return Ok(match parent {
                Some(parent) if parent.is_dir() && parent.starts_with(&user.home) => {
                    user.cwd = parent;
                    CdOutcome::Changed
                }
                _ => CdOutcome::Invalid,
            });
        }

        if target.starts_with('.') {
            return Ok(CdOutcome::Invalid);
        }
        match confine_under(&user.home, &user.cwd, target) {
            Ok(path) if path.is_dir() => {
                user.cwd = path;
                Ok(CdOutcome::Changed)
            }
            Ok(_) | Err(FerryError::PathViolation(_)) => Ok(CdOutcome::Invalid),
            Err(e) => Err(e),
        }
    }

    pub fn mk_dir(&self, name: &str) -> Result<MkdirOutcome> {
        if name.starts_with('.') {
            return Ok(MkdirOutcome::Invalid);
        }
        let target = match self.resolve(name) {
            Ok(p) => p,
            Err(FerryError::PathViolation(_)) => return Ok(MkdirOutcome::Invalid),
            Err(e) => return Err(e),
        };
        if target.exists() {
            return Ok(MkdirOutcome::Exists);
        }
        let created = if name.contains('/') || name.contains(std::path::MAIN_SEPARATOR) {
            fs::create_dir_all(&target)
        } else {
            fs::create_dir(&target)
        };
        Ok(match created {
            Ok(()) => MkdirOutcome::Created,
            Err(_) => MkdirOutcome::Invalid,
        })
    }

    /// Delete a file or a whole directory tree under the current directory.
    /// Only the parent is resolved, so a symlink is unlinked, never followed.
    pub fn remove(&self, name: &str) -> Result<RemoveOutcome> {
        if name.starts_with('.') || name.contains('\0') {
            return Ok(RemoveOutcome::Invalid);
        }
        let user = self.user()?;
        let rel = Path::new(name);
        let file_name = match rel.file_name() {
            Some(file_name) => file_name,
            None => return Ok(RemoveOutcome::Invalid),
        };
        let parent = match rel.parent().filter(|p| !p.as_os_str().is_empty()) {
            None => user.cwd.clone(),
            Some(p) => match confine_under(&user.home, &user.cwd, &p.to_string_lossy()) {
                Ok(p) => p,
                Err(FerryError::PathViolation(_)) => return Ok(RemoveOutcome::Invalid),
                Err(e) => return Err(e),
            },
        };
        if !parent.starts_with(&user.cwd) {
            return Ok(RemoveOutcome::Invalid);
        }

        let target = parent.join(file_name);
        let md = match fs::symlink_metadata(&target) {
            Ok(md) => md,
            Err(_) => return Ok(RemoveOutcome::NotFound),
        };
        if md.is_dir() {
            fs::remove_dir_all(&target)?;
        } else {
            fs::remove_file(&target)?;
        }
        Ok(RemoveOutcome::Removed)
    }

    pub fn ls(&self) -> Result<String> {
        let user = self.user()?;
        let mut entries: Vec<(String, bool)> = fs::read_dir(&user.cwd)?
            .filter_map(|e| e.ok())
            .map(|e| {
                let is_dir = e.file_type().map(|t| t.is_dir()).unwrap_or(false);
                (e.file_name().to_string_lossy().into_owned(), is_dir)
            })
            .collect();
        entries.sort();

        let rule = "-".repeat(LISTING_RULE_WIDTH);
        let mut lines = Vec::with_capacity(entries.len() + 2);
        lines.push(rule.clone());
        for (name, is_dir) in &entries {
            if *is_dir {
                lines.push(format!("[directory] {}", name));
            } else {
                lines.push(format!("[file] {}", name));
            }
        }
        if entries.is_empty() {
            lines.push("<Empty directory>".to_string());
        }
        lines.push(rule);
        Ok(lines.join("\n"))
    }
}
