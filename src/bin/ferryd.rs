use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use ferry::cli::DaemonOpts;
use ferry::config::ServerConfig;
use ferry::logger::{Logger, NoopLogger, TextLogger};
use ferry::server::Server;

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted. Exiting (Ctrl-C)...");
        std::process::exit(130);
    })
    .expect("Error setting Ctrl-C handler");

    let opts = DaemonOpts::parse();
    let base = match &opts.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    let config = opts.apply(base);

    let logger: Arc<dyn Logger> = match config.log_path() {
        Some(path) => Arc::new(
            TextLogger::new(&path, config.echo_log)
                .with_context(|| format!("open log file {}", path.display()))?,
        ),
        None => Arc::new(NoopLogger),
    };

    let server = Server::bind(&config, logger)?;

    println!("Starting ferry daemon:");
    println!("  Root: {}", server.root().display());
    println!("  Bind: {}", server.local_addr()?);
    println!("  Credentials: {}", config.user_info_path().display());
    println!("  Workers: {}", config.threads.max(1));
    if let Some(path) = config.log_path() {
        println!("  Log: {}", path.display());
    }

    if config.ip == "0.0.0.0" {
        eprintln!("WARNING: Binding to 0.0.0.0 exposes the daemon to all network interfaces");
        eprintln!("   Traffic, including passwords, is NOT encrypted");
        eprintln!("   Only use on trusted networks (LAN)");
        eprintln!();
    }

    server.run()
}
