//! Console reporting with TTY detection.
//!
//! On a TTY, engine progress rides an indicatif spinner; warnings and
//! errors print above it so they survive the redraw. Without a TTY the
//! reporter falls back to plain line output.

use std::io::IsTerminal;

use indicatif::{ProgressBar, ProgressStyle};

use confship::engine::Reporter;

/// Detects whether stderr is connected to a TTY.
pub fn is_tty() -> bool {
    std::io::stderr().is_terminal()
}

/// Reporter that shows a spinner in TTY mode and plain lines otherwise.
pub struct ConsoleReporter {
    bar: Option<ProgressBar>,
}

impl ConsoleReporter {
    pub fn new() -> Self {
        let bar = if is_tty() {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            Some(bar)
        } else {
            None
        };
        Self { bar }
    }

    /// Clear the spinner before the summary prints.
    pub fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

impl Default for ConsoleReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for ConsoleReporter {
    fn info(&mut self, msg: &str) {
        match &self.bar {
            Some(bar) => bar.set_message(msg.to_string()),
            None => eprintln!("[info] {msg}"),
        }
    }

    fn warn(&mut self, msg: &str) {
        match &self.bar {
            Some(bar) => bar.println(format!("[warn] {msg}")),
            None => eprintln!("[warn] {msg}"),
        }
    }

    fn error(&mut self, msg: &str) {
        match &self.bar {
            Some(bar) => bar.println(format!("[error] {msg}")),
            None => eprintln!("[error] {msg}"),
        }
    }
}
