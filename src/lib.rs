//! ferry: a small multi-user file transfer service
//!
//! Length-prefixed JSON commands over plain TCP, resumable md5-checked
//! transfers, one pooled worker thread per connection.

pub mod auth;
pub mod checksum;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod logger;
pub mod pool;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod server;
pub mod session;
pub mod transfer;

pub use error::{FerryError, Result};
