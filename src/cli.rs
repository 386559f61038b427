//! Command-line options for `ferryd` and `ferry`

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::config::ServerConfig;

/// Daemon options. Flags given on the command line win over the config file.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "ferry file transfer daemon")]
pub struct DaemonOpts {
    /// Address to listen on
    #[arg(long)]
    pub ip: Option<String>,

    /// Port to listen on
    #[arg(short = 'p', long, value_parser = clap::value_parser!(u16).range(1..65535))]
    pub port: Option<u16>,

    /// Data root holding user homes and the credential file
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Credential file (default: <root>/user_info.dat)
    #[arg(long)]
    pub user_info: Option<PathBuf>,

    /// Maximum concurrent connections served
    #[arg(short = 't', long)]
    pub threads: Option<usize>,

    /// Write event log to <dir>/ferryd.log
    #[arg(long = "log-dir")]
    pub log_dir: Option<PathBuf>,

    /// Echo event log lines to stderr
    #[arg(short, long)]
    pub verbose: bool,

    /// TOML config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

impl DaemonOpts {
    pub fn apply(&self, mut cfg: ServerConfig) -> ServerConfig {
        if let Some(ip) = &self.ip {
            cfg.ip = ip.clone();
        }
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(root) = &self.root {
            cfg.root = root.clone();
        }
        if let Some(user_info) = &self.user_info {
            cfg.user_info = Some(user_info.clone());
        }
        if let Some(threads) = self.threads {
            cfg.threads = threads;
        }
        if let Some(log_dir) = &self.log_dir {
            cfg.log_dir = Some(log_dir.clone());
        }
        cfg.echo_log |= self.verbose;
        cfg
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ClientAction {
    Signup,
    Login,
}

#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "ferry file transfer client")]
pub struct ClientOpts {
    /// Server host
    #[arg(short = 's', long)]
    pub server: String,

    /// Server port
    #[arg(short = 'P', long, value_parser = clap::value_parser!(u16).range(1..65535))]
    pub port: u16,

    #[arg(short = 'u', long)]
    pub user: Option<String>,

    #[arg(short = 'p', long)]
    pub password: Option<String>,

    /// Where downloaded files land
    #[arg(long = "download-dir", default_value = "./download")]
    pub download_dir: PathBuf,

    #[arg(value_enum)]
    pub action: ClientAction,
}
