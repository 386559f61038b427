//! Transfer progress display
//!
//! The transfer engine reports into a `ProgressSink`. The server uses
//! `NoProgress`; the interactive client draws an indicatif bar that starts at
//! the resume offset so a resumed transfer shows what is already there.

use crossterm::style::{Color, Stylize};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Instant;

pub trait ProgressSink {
    /// Called once before any payload moves. `done` is the resume offset.
    fn start(&mut self, _name: &str, _total: u64, _done: u64) {}
    fn advance(&mut self, _bytes: u64) {}
    fn finish(&mut self) {}
}

pub struct NoProgress;
impl ProgressSink for NoProgress {}

pub struct TransferBar {
    bar: Option<ProgressBar>,
    start_time: Instant,
    moved: u64,
}

impl TransferBar {
    pub fn new() -> Self {
        Self {
            bar: None,
            start_time: Instant::now(),
            moved: 0,
        }
    }

    /// Print a status line above the bar (or plainly when no bar is active).
    pub fn note(&self, operation: &str, name: &str) {
        let line = format!("  {} {}", operation.with(Color::Green).bold(), name.with(Color::Cyan));
        match &self.bar {
            Some(bar) => bar.suspend(|| println!("{}", line)),
            None => println!("{}", line),
        }
    }
}

impl Default for TransferBar {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for TransferBar {
    fn start(&mut self, name: &str, total: u64, done: u64) {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} eta {eta}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.set_message(name.to_string());
        bar.set_position(done.min(total));
        self.bar = Some(bar);
        self.start_time = Instant::now();
        self.moved = 0;
    }

    fn advance(&mut self, bytes: u64) {
        self.moved += bytes;
        if let Some(bar) = &self.bar {
            bar.inc(bytes);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            let elapsed = self.start_time.elapsed().as_secs_f64();
            let throughput = if elapsed > 0.1 {
                format!(" @ {:.1} MB/s", self.moved as f64 / elapsed / 1_048_576.0)
            } else {
                String::new()
            };
            bar.finish_with_message(format!(
                "{} {:.1} MB in {:.1}s{}",
                "Done".with(Color::Green).bold(),
                self.moved as f64 / 1_048_576.0,
                elapsed,
                throughput
            ));
        }
    }
}
