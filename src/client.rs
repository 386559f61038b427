//! Client side of every command
//!
//! One `Client` wraps one connection. Commands are strictly request/reply, so
//! the connection is never shared and every method takes `&mut self`.
//!
//! A transfer that fails with payload still on the wire leaves the stream out
//! of step. The client then marks itself broken and the next request opens a
//! fresh connection, logs in again and walks back to the remote directory.

use std::fs::{self, File};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};

use crate::checksum::md5_file;
use crate::error::{FerryError, Result};
use crate::progress::ProgressSink;
use crate::protocol::{
    status, Command, FileMeta, ResumeStatus, GET_RETRIES, LIST_REPLY_BUF, REPLY_BUF,
};
use crate::protocol_core::{
    ensure_dir_exists, read_listing, read_message, read_reply, send_reply, validate_file_name,
    write_envelope,
};
use crate::session::{CdOutcome, MkdirOutcome, RemoveOutcome};
use crate::transfer::{receive_into, resume_status, send_range};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The receiving side already held an identical copy.
    AlreadyPresent,
    /// `bytes` moved, starting at `offset`.
    Transferred { offset: u64, bytes: u64 },
}

/// Result of a multi-file `put` or `get`.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// Local files that did not exist and were passed over
    pub skipped: Vec<String>,
}

impl BatchReport {
    pub fn summary(&self) -> String {
        format!(
            "Done! {} Success, {} fail.",
            self.succeeded.len(),
            self.failed.len()
        )
    }
}

pub struct Client {
    stream: TcpStream,
    peer: SocketAddr,
    download_dir: PathBuf,
    username: Option<String>,
    /// Kept for logging in again after a reconnect
    credentials: Option<(String, String)>,
    remote_path: Vec<String>,
    broken: bool,
}

impl Client {
    pub fn connect<A: ToSocketAddrs>(addr: A, download_dir: impl Into<PathBuf>) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        let _ = stream.set_nodelay(true);
        let peer = stream.peer_addr()?;
        Ok(Self {
            stream,
            peer,
            download_dir: download_dir.into(),
            username: None,
            credentials: None,
            remote_path: Vec::new(),
            broken: false,
        })
    }

    /// Replace the connection, restoring the login and remote directory the
    /// old one had.
    pub fn reconnect(&mut self) -> Result<()> {
        let stream = TcpStream::connect(self.peer)?;
        let _ = stream.set_nodelay(true);
        self.stream = stream;
        self.broken = false;

        let path = std::mem::take(&mut self.remote_path);
        let (username, password) = match self.credentials.clone() {
            Some(creds) => creds,
            None => return Ok(()),
        };
        if !self.login(&username, &password)? {
            self.broken = true;
            return Err(FerryError::NotAuthenticated);
        }
        for dir in path {
            if self.cd(&dir)? != CdOutcome::Changed {
                return Err(FerryError::NotFound(format!("remote directory {}", dir)));
            }
        }
        Ok(())
    }

    /// True while the stream is out of step and must be replaced.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Remote current directory relative to home, as `/a/b`.
    pub fn remote_cwd(&self) -> String {
        format!("/{}", self.remote_path.join("/"))
    }

    fn request(&mut self, cmd: &Command) -> Result<()> {
        if self.broken {
            self.reconnect()?;
        }
        let sent = write_envelope(&mut self.stream, cmd);
        self.check(sent)
    }

    fn reply(&mut self) -> Result<String> {
        let reply = read_reply(&mut self.stream, REPLY_BUF);
        let reply = self.check(reply)?;
        refusal(&reply)?;
        Ok(reply)
    }

    /// Mark the connection broken when `res` failed on the stream itself.
    fn check<T>(&mut self, res: Result<T>) -> Result<T> {
        if let Err(e) = &res {
            if e.is_transient() || matches!(e, FerryError::Protocol(_)) {
                self.broken = true;
            }
        }
        res
    }

    pub fn signup(&mut self, username: &str, password: &str, quota_mb: u64) -> Result<String> {
        self.request(&Command::Signup {
            username: username.to_string(),
            password: password.to_string(),
            size: quota_mb,
        })?;
        self.reply()
    }

    pub fn login(&mut self, username: &str, password: &str) -> Result<bool> {
        self.request(&Command::Login {
            username: username.to_string(),
            password: password.to_string(),
        })?;
        let ok = self.reply()? == status::OK;
        if ok {
            self.username = Some(username.to_string());
            self.credentials = Some((username.to_string(), password.to_string()));
            self.remote_path.clear();
        }
        Ok(ok)
    }

    /// Remaining quota in MiB; negative when over quota.
    pub fn free_size(&mut self) -> Result<f64> {
        self.request(&Command::GetFreeSize)?;
        let reply = self.reply()?;
        reply
            .trim()
            .parse()
            .map_err(|_| FerryError::Protocol(format!("invalid free size: {:?}", reply)))
    }

    pub fn ls(&mut self) -> Result<String> {
        self.request(&Command::Ls)?;
        let listing = read_listing(&mut self.stream, LIST_REPLY_BUF);
        let listing = self.check(listing)?;
        refusal(&listing)?;
        Ok(listing)
    }

    /// Slashes are dropped from `target`, so only one level moves at a time.
    pub fn cd(&mut self, target: &str) -> Result<CdOutcome> {
        let target: String = target.chars().filter(|c| *c != '/' && *c != '\\').collect();
        self.request(&Command::Cd {
            target_path: target.clone(),
        })?;
        let outcome = match self.reply()?.as_str() {
            status::OK => CdOutcome::Changed,
            status::FAILED => CdOutcome::AtTop,
            _ => CdOutcome::Invalid,
        };
        if outcome == CdOutcome::Changed {
            if target == ".." {
                self.remote_path.pop();
            } else {
                self.remote_path.push(target);
            }
        }
        Ok(outcome)
    }

    pub fn mkdir(&mut self, name: &str) -> Result<MkdirOutcome> {
        if name.contains('.') {
            return Ok(MkdirOutcome::Invalid);
        }
        self.request(&Command::MkDir {
            dir_name: name.to_string(),
        })?;
        Ok(match self.reply()?.as_str() {
            status::OK => MkdirOutcome::Created,
            status::FAILED => MkdirOutcome::Exists,
            _ => MkdirOutcome::Invalid,
        })
    }

    pub fn remove(&mut self, name: &str) -> Result<RemoveOutcome> {
        if name.starts_with('.') {
            return Ok(RemoveOutcome::Invalid);
        }
        self.request(&Command::Remove {
            dir_name: name.to_string(),
        })?;
        Ok(match self.reply()?.as_str() {
            status::OK => RemoveOutcome::Removed,
            status::FAILED => RemoveOutcome::NotFound,
            _ => RemoveOutcome::Invalid,
        })
    }

    /// Upload one local file into the remote current directory.
    pub fn upload_file(
        &mut self,
        local: &Path,
        progress: &mut dyn ProgressSink,
    ) -> Result<TransferOutcome> {
        let md = fs::metadata(local).map_err(FerryError::LocalIo)?;
        if !md.is_file() {
            return Err(FerryError::NotFound(local.display().to_string()));
        }
        let size = md.len();
        let file_name = local
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| FerryError::PathViolation(format!("no usable file name in {}", local.display())))?
            .to_string();

        // Advisory only; another connection may fill the quota meanwhile
        let free_mb = self.free_size()?;
        let needed_mb = size as f64 / BYTES_PER_MB;
        if free_mb <= needed_mb {
            return Err(FerryError::QuotaExceeded { needed_mb, free_mb });
        }

        let md5 = md5_file(local).map_err(local_error)?;
        self.request(&Command::Put {
            file_name: file_name.clone(),
            file_size: size,
            md5,
        })?;
        let reply = read_reply(&mut self.stream, REPLY_BUF);
        let reply = self.check(reply)?;
        let status = match ResumeStatus::parse(&reply) {
            Err(FerryError::Rejected(-4)) => return Err(FerryError::NotAuthenticated),
            other => other?,
        };
        let offset = match status.offset() {
            Some(offset) => offset,
            None => return Ok(TransferOutcome::AlreadyPresent),
        };

        // The server now waits for `size - offset` bytes
        let mut file = match File::open(local) {
            Ok(file) => file,
            Err(e) => {
                self.broken = true;
                return Err(FerryError::LocalIo(e));
            }
        };
        progress.start(&file_name, size, offset.min(size));
        let sent = send_range(&mut file, offset, size, &mut self.stream, progress);
        progress.finish();
        let sent = self.after_payload(sent)?;
        Ok(TransferOutcome::Transferred {
            offset,
            bytes: sent,
        })
    }

    /// Upload several files. Missing local files are passed over; running out
    /// of quota ends the batch.
    pub fn put(&mut self, paths: &[PathBuf], progress: &mut dyn ProgressSink) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        for path in paths {
            let name = path.display().to_string();
            if !path.is_file() {
                report.skipped.push(name);
                continue;
            }
            match self.upload_file(path, progress) {
                Ok(_) => report.succeeded.push(name),
                Err(e @ FerryError::QuotaExceeded { .. }) => {
                    report.failed.push((name, e.to_string()));
                    break;
                }
                Err(
                    e @ (FerryError::Rejected(_)
                    | FerryError::PathViolation(_)
                    | FerryError::OffsetBeyondEnd { .. }
                    | FerryError::LocalIo(_)),
                ) => report.failed.push((name, e.to_string())),
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    /// Download one remote file from the current directory into the download
    /// directory, resuming a partial local copy.
    pub fn download_file(
        &mut self,
        name: &str,
        progress: &mut dyn ProgressSink,
    ) -> Result<TransferOutcome> {
        self.request(&Command::Get {
            file_name: name.to_string(),
        })?;
        let meta: Result<FileMeta> = read_message(&mut self.stream);
        let meta = self.check(meta)?;
        if !meta.is_file {
            return Err(FerryError::NotFound(name.to_string()));
        }
        let (size, md5) = match (meta.file_size, meta.md5.as_deref()) {
            (Some(size), Some(md5)) => (size, md5.to_string()),
            _ => {
                return Err(FerryError::Protocol(format!(
                    "metadata for {} lacks size or md5",
                    meta.file_name
                )))
            }
        };

        // The server is now waiting for a status; answer it even when we
        // cannot take the file, so the connection stays usable.
        let local = self.local_target(&meta.file_name);
        let (local, status) = match local.and_then(|p| resume_status(&p, size, &md5).map(|s| (p, s))) {
            Ok(pair) => pair,
            Err(e) => {
                let sent = send_reply(&mut self.stream, &ResumeStatus::Skip.to_wire());
                self.check(sent)?;
                return Err(local_error(e));
            }
        };
        let sent = send_reply(&mut self.stream, &status.to_wire());
        self.check(sent)?;
        let offset = match status.offset() {
            Some(offset) => offset,
            None => return Ok(TransferOutcome::AlreadyPresent),
        };

        progress.start(&meta.file_name, size, offset.min(size));
        let received = receive_into(&local, status, size, &mut self.stream, progress);
        progress.finish();
        let received = self.after_payload(received)?;
        Ok(TransferOutcome::Transferred {
            offset,
            bytes: received,
        })
    }

    /// Any payload failure except a refused offset leaves bytes unaccounted
    /// for on the wire.
    fn after_payload(&mut self, res: Result<u64>) -> Result<u64> {
        match res {
            Err(e @ FerryError::OffsetBeyondEnd { .. }) => Err(e),
            Err(e) => {
                self.broken = true;
                Err(e)
            }
            ok => ok,
        }
    }

    fn local_target(&self, file_name: &str) -> Result<PathBuf> {
        validate_file_name(file_name)
            .map_err(|_| FerryError::Protocol(format!("server sent unusable file name {:?}", file_name)))?;
        ensure_dir_exists(&self.download_dir)?;
        Ok(self.download_dir.join(file_name))
    }

    /// Download several files. Each gets one attempt plus up to
    /// `GET_RETRIES` more when the failure is transient. A retry goes out on
    /// a new connection and resumes from whatever already landed on disk.
    pub fn get(&mut self, names: &[String], progress: &mut dyn ProgressSink) -> BatchReport {
        let mut report = BatchReport::default();
        for name in names {
            let mut retries = 0;
            loop {
                match self.download_file(name, progress) {
                    Ok(_) => {
                        report.succeeded.push(name.clone());
                        break;
                    }
                    Err(e) if e.is_transient() && retries < GET_RETRIES => retries += 1,
                    Err(e) => {
                        report.failed.push((name.clone(), e.to_string()));
                        break;
                    }
                }
            }
        }
        report
    }
}

/// Errors reading or writing files on this machine are not connection errors.
fn local_error(e: FerryError) -> FerryError {
    match e {
        FerryError::Io(e) => FerryError::LocalIo(e),
        other => other,
    }
}

/// Replies that mean the server refused the request outright.
fn refusal(reply: &str) -> Result<()> {
    match reply {
        status::NOT_LOGGED_IN => Err(FerryError::NotAuthenticated),
        status::BAD_REQUEST => Err(FerryError::BadRequest("rejected by server".into())),
        _ => Ok(()),
    }
}
