//! Server configuration: TOML file first, command-line flags on top.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::protocol::{DEFAULT_PORT, DEFAULT_THREADS};

pub const USER_INFO_FILE: &str = "user_info.dat";
pub const LOG_FILE: &str = "ferryd.log";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub ip: String,
    pub port: u16,
    /// Data root; user homes live directly below it
    pub root: PathBuf,
    /// Credential file, `<root>/user_info.dat` when unset
    pub user_info: Option<PathBuf>,
    pub threads: usize,
    /// Event log directory; no event log when unset
    pub log_dir: Option<PathBuf>,
    pub echo_log: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            root: PathBuf::from("./db"),
            user_info: None,
            threads: DEFAULT_THREADS,
            log_dir: None,
            echo_log: false,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg: ServerConfig =
            toml::from_str(&data).with_context(|| format!("parse config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn user_info_path(&self) -> PathBuf {
        self.user_info
            .clone()
            .unwrap_or_else(|| self.root.join(USER_INFO_FILE))
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        self.log_dir.as_ref().map(|d| d.join(LOG_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("ferryd.toml");
        std::fs::write(&p, "port = 9100\nroot = \"/srv/ferry\"\nlog_dir = \"/var/log/ferry\"\n").unwrap();

        let cfg = ServerConfig::load(&p).unwrap();
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.ip, "0.0.0.0");
        assert_eq!(cfg.threads, DEFAULT_THREADS);
        assert_eq!(cfg.bind_addr(), "0.0.0.0:9100");
        assert_eq!(cfg.user_info_path(), PathBuf::from("/srv/ferry/user_info.dat"));
        assert_eq!(cfg.log_path(), Some(PathBuf::from("/var/log/ferry/ferryd.log")));
    }

    #[test]
    fn bad_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("ferryd.toml");
        std::fs::write(&p, "port = \"not a port\"").unwrap();
        assert!(ServerConfig::load(&p).is_err());
        assert!(ServerConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
