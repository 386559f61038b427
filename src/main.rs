//! ferry client: sign up, or log in and drive the server from a prompt.

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::style::{Color, Stylize};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use ferry::cli::{ClientAction, ClientOpts};
use ferry::client::{BatchReport, Client};
use ferry::progress::TransferBar;
use ferry::session::{CdOutcome, MkdirOutcome, RemoveOutcome};
use ferry::FerryError;

const DEFAULT_QUOTA_MB: u64 = 500;

const HELP: &str = "\
Commands:
  get <file>...     download into the download directory
  put <file>...     upload into the current remote directory
  ls                list the current remote directory
  cd <dir>|..       change remote directory
  mkdir <dir>       create a remote directory
  remove <name>     delete a remote file or directory
  free              show remaining quota
  help              this text
  exit              leave";

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        std::process::exit(130);
    })
    .expect("Error setting Ctrl-C handler");

    let opts = ClientOpts::parse();
    let addr = format!("{}:{}", opts.server, opts.port);
    let mut client = Client::connect(addr.as_str(), &opts.download_dir)
        .with_context(|| format!("connect to {}", addr))?;

    match opts.action {
        ClientAction::Signup => signup(&mut client, &opts),
        ClientAction::Login => login(&mut client, &opts),
    }
}

/// Print `msg` and read one trimmed line. `None` at end of input.
fn prompt(msg: &str) -> Result<Option<String>> {
    print!("{}", msg);
    io::stdout().flush()?;
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

fn require(msg: &str) -> Result<String> {
    prompt(msg)?.ok_or_else(|| anyhow::anyhow!("input closed"))
}

fn signup(client: &mut Client, opts: &ClientOpts) -> Result<()> {
    let (username, password) = loop {
        let username = match &opts.user {
            Some(u) => u.clone(),
            None => require("Username: ")?,
        };
        let (password, repeat) = match &opts.password {
            Some(p) => (p.clone(), p.clone()),
            None => (require("Password: ")?, require("Repeat password: ")?),
        };
        if username.is_empty() || password.is_empty() {
            println!("Please enter a valid username and password");
            continue;
        }
        if password != repeat {
            println!("Passwords do not match!");
            continue;
        }
        break (username, password);
    };
    let quota = require("Disk quota (MB): ")?
        .parse()
        .unwrap_or(DEFAULT_QUOTA_MB);

    let message = client.signup(&username, &password, quota)?;
    println!("{}", message);
    Ok(())
}

fn login(client: &mut Client, opts: &ClientOpts) -> Result<()> {
    let username = match &opts.user {
        Some(u) => u.clone(),
        None => require("Username: ")?,
    };
    let password = match &opts.password {
        Some(p) => p.clone(),
        None => require("Password: ")?,
    };
    if !client.login(&username, &password)? {
        println!("{}", "Unknown user or wrong password!".with(Color::Red));
        return Ok(());
    }
    println!("{}", "Login successful".with(Color::Green).bold());

    loop {
        let line = match prompt(&format!("[{}]@{} # ", username, client.remote_cwd()))? {
            Some(line) => line,
            None => break,
        };
        let mut words = line.split_whitespace();
        let cmd = match words.next() {
            Some(cmd) => cmd,
            None => continue,
        };
        let args: Vec<&str> = words.collect();
        if cmd == "exit" || cmd == "quit" {
            break;
        }
        if let Err(e) = run_command(client, cmd, &args) {
            println!("{} {}", "Error:".with(Color::Red).bold(), e);
            if matches!(e, FerryError::Io(_) | FerryError::Protocol(_)) || client.is_broken() {
                client.reconnect().context("connection to server lost")?;
            }
        }
    }
    Ok(())
}

fn run_command(client: &mut Client, cmd: &str, args: &[&str]) -> ferry::Result<()> {
    match cmd {
        "get" => {
            let names: Vec<String> = args.iter().map(|s| s.to_string()).collect();
            let mut bar = TransferBar::new();
            let report = client.get(&names, &mut bar);
            print_report(&report);
        }
        "put" => {
            let paths: Vec<PathBuf> = args.iter().map(PathBuf::from).collect();
            let mut bar = TransferBar::new();
            let report = client.put(&paths, &mut bar)?;
            for name in &report.skipped {
                bar.note("Missing", name);
            }
            print_report(&report);
        }
        "ls" => println!("{}", client.ls()?),
        "cd" => {
            if args.len() != 1 {
                println!("Wrong input!");
                return Ok(());
            }
            match client.cd(args[0])? {
                CdOutcome::Changed => {}
                CdOutcome::AtTop => println!("Already at the top!"),
                CdOutcome::Invalid => println!("Wrong input!"),
            }
        }
        "mkdir" => {
            let name = match args.first() {
                Some(name) => *name,
                None => {
                    println!("Wrong input!");
                    return Ok(());
                }
            };
            match client.mkdir(name)? {
                MkdirOutcome::Created => println!("Success!"),
                MkdirOutcome::Exists => println!("Dir already exists!"),
                MkdirOutcome::Invalid => println!("Wrong input! (names must not contain '.')"),
            }
        }
        "remove" => {
            let name = match args.first() {
                Some(name) => *name,
                None => {
                    println!("Wrong input!");
                    return Ok(());
                }
            };
            match client.remove(name)? {
                RemoveOutcome::Removed => println!("Remove success!"),
                RemoveOutcome::NotFound => println!("File or directory does not exist!"),
                RemoveOutcome::Invalid => println!("Wrong input!"),
            }
        }
        "free" => println!("{:.2} MB free", client.free_size()?),
        "help" => println!("{}", HELP),
        _ => println!("Unknown command! Type 'help' for a list."),
    }
    Ok(())
}

fn print_report(report: &BatchReport) {
    for (name, reason) in &report.failed {
        println!("  {} {}: {}", "Failed".with(Color::Red).bold(), name, reason);
    }
    println!("{}", report.summary());
}
