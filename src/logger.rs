use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Direction of a completed transfer, seen from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

pub trait Logger: Send + Sync {
    fn listen(&self, _addr: &str, _root: &Path) {}
    fn connect(&self, _peer: &str) {}
    fn disconnect(&self, _peer: &str) {}
    fn signup(&self, _user: &str) {}
    fn login(&self, _user: &str, _ok: bool) {}
    fn transfer(&self, _user: &str, _dir: Direction, _path: &Path, _bytes: u64) {}
    fn error(&self, _context: &str, _msg: &str) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
    echo: bool,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P, echo: bool) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
            echo,
        })
    }

    fn line(&self, s: &str) {
        let stamped = format!("[{}] {}", Utc::now().to_rfc3339(), s);
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "{}", stamped);
        }
        if self.echo {
            eprintln!("{}", stamped);
        }
    }
}

impl Logger for TextLogger {
    fn listen(&self, addr: &str, root: &Path) {
        self.line(&format!("LISTEN addr={} root={}", addr, root.display()));
    }
    fn connect(&self, peer: &str) {
        self.line(&format!("CONNECT peer={}", peer));
    }
    fn disconnect(&self, peer: &str) {
        self.line(&format!("DISCONNECT peer={}", peer));
    }
    fn signup(&self, user: &str) {
        self.line(&format!("SIGNUP user={}", user));
    }
    fn login(&self, user: &str, ok: bool) {
        self.line(&format!("LOGIN user={} ok={}", user, ok));
    }
    fn transfer(&self, user: &str, dir: Direction, path: &Path, bytes: u64) {
        let tag = match dir {
            Direction::Upload => "PUT",
            Direction::Download => "GET",
        };
        self.line(&format!("{} user={} path={} bytes={}", tag, user, path.display(), bytes));
    }
    fn error(&self, context: &str, msg: &str) {
        self.line(&format!("ERROR ctx={} msg={}", context, msg));
    }
}
