//! Per-host status sink.
//!
//! Receives step begin/end/fail events from the workers and streamed
//! remote output from the SSH clients, and renders both with ANSI-styled
//! step indicators. Kept deliberately dumb: it formats and prints, and
//! nothing in the orchestrator depends on what it shows.

use chrono::Local;
use colored::Colorize;

use runner_ssh::OutputSink;

/// Terminal reporter shared by all workers.
#[derive(Default)]
pub struct StatusReporter {
    /// Suppress streamed remote output, keeping only step events.
    quiet: bool,
}

impl StatusReporter {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }

    pub fn step_started(&self, host: &str, step: &str) {
        println!("{} {} {}", "➜".cyan(), step, format!("({host})").dimmed());
    }

    pub fn step_completed(&self, host: &str, step: &str) {
        println!("{} {} {}", "✔".green(), step, format!("({host})").dimmed());
    }

    pub fn step_failed(&self, host: &str, step: &str, error: &str) {
        eprintln!(
            "{} {}",
            "✖".red(),
            format!("error during {step} on {host}: {error}").red()
        );
    }

    pub fn announce(&self, message: &str) {
        println!("{message}");
    }

    fn remote_line(&self, host: &str, line: &str, is_stderr: bool) {
        if self.quiet {
            return;
        }
        let timestamp = Local::now().format("%H:%M:%S");
        let prefix = format!("[{timestamp}] {host}:");
        if is_stderr {
            eprintln!("{} {}", prefix.dimmed(), line.dimmed());
        } else {
            println!("{} {}", prefix.dimmed(), line.dimmed());
        }
    }
}

impl OutputSink for StatusReporter {
    fn stdout_line(&self, host: &str, line: &str) {
        self.remote_line(host, line, false);
    }

    fn stderr_line(&self, host: &str, line: &str) {
        self.remote_line(host, line, true);
    }
}
